//! Dialing: turning [`RabbitMqSettings`] into live `lapin` connections.

use crate::amqp::configuration::RabbitMqSettings;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// All the information required to connect to a RabbitMq broker.
///
/// The factory itself is cheap to clone and holds no sockets; every call to
/// [`new_connection`](Self::new_connection) dials from scratch. The pools own the
/// resulting connections and decide when to dial again.
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<TlsConfig>>,
}

struct TlsConfig {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// If the connection timeout is left unspecified, it will be defaulted to 10
    /// seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = match &settings.tls {
            None => None,
            Some(tls_settings) => {
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.uri.clone());
                let mut builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    builder.add_root_certificate(certificate);
                }
                let connector = builder.build().expect("TLS configuration failed");
                Some(Arc::new(TlsConfig {
                    connector,
                    domain_name,
                }))
            }
        };
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings
                .connection_timeout()
                .unwrap_or_else(|| Duration::from_secs(10)),
            tls,
        })
    }

    /// Replaces the TLS connector, along with the expected domain name for the server
    /// certificate.
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: String,
    ) {
        self.tls = Some(Arc::new(TlsConfig {
            connector,
            domain_name,
        }));
    }

    /// Dial a new connection to the RabbitMq broker, encrypted iff TLS was
    /// configured.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        timeout(self.connection_timeout, self.connect(properties))
            .await
            .map_err(|_| anyhow::anyhow!("Timed out while trying to connect to RabbitMQ."))?
            .map_err(anyhow::Error::from)
    }

    async fn connect(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        match &self.tls {
            None => lapin::Connection::connect_uri(self.uri.clone(), properties).await,
            Some(tls) => {
                let tls = Arc::clone(tls);
                lapin::Connection::connector(
                    self.uri.clone(),
                    Box::new(move |uri| {
                        // Establish a plain TCP connection first, then run the TLS
                        // handshake with the configured connector and expected domain.
                        let mut amqp_uri = uri.clone();
                        amqp_uri.scheme = AMQPScheme::AMQP;
                        amqp_uri
                            .connect()
                            .and_then(|tcp| {
                                tcp.into_native_tls(&tls.connector, &tls.domain_name)
                            })
                    }),
                    properties,
                )
                .await
            }
        }
    }
}
