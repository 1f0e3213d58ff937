//! A fixed set of pre-opened connections handed out round-robin, with transparent
//! replacement of dead ones.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::amqp::{ConnectionFactory, HealthStatus};
use crate::configuration::PoolSettings;
use crate::pool::PoolError;
use crate::streams::BoundedQueue;

/// One pool slot's worth of broker connection: the `lapin` object plus the identity the
/// pool tracks it by.
pub struct ConnectionHost {
    connection: lapin::Connection,
    connection_id: u64,
}

impl ConnectionHost {
    /// Wrap a freshly dialed connection and register its close notification: a broken
    /// connection pushes a single sick event onto the owning pool's error stream.
    fn new(
        connection: lapin::Connection,
        connection_id: u64,
        errors: &Arc<BoundedQueue<PoolError>>,
    ) -> Self {
        let errors = Arc::clone(errors);
        connection.on_error(move |e| {
            warn!(connection_id, error = ?e, "RabbitMQ broken connection");
            errors.force_push(PoolError::ConnectionClosed {
                connection_id,
                source: e,
            });
        });
        Self {
            connection,
            connection_id,
        }
    }

    /// The pool-assigned identity of this connection. Replacements get a fresh one.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn status(&self) -> HealthStatus {
        if self.connection.status().connected() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Get access to the underlying raw connection.
    pub fn raw(&self) -> &lapin::Connection {
        &self.connection
    }

    async fn close(&self) {
        // The connection may already be gone; shutdown is best-effort.
        let _ = self.connection.close(200, "pool shutdown").await;
    }
}

/// A fixed-size pool of [`ConnectionHost`]s.
///
/// Slots are selected round-robin; a slot whose connection has died is re-dialed in
/// place before being handed out again. The pool owns its hosts: callers receive
/// borrowed `Arc` references whose slot may be replaced behind their back once the
/// host is observed sick.
pub struct ConnectionPool {
    factory: ConnectionFactory,
    settings: PoolSettings,
    slots: Mutex<Vec<Option<Arc<ConnectionHost>>>>,
    next_slot: AtomicUsize,
    next_id: AtomicU64,
    live: AtomicI64,
    initialized: AtomicBool,
    stopped: AtomicBool,
    errors: Arc<BoundedQueue<PoolError>>,
}

impl ConnectionPool {
    /// Construct the pool and eagerly open every slot.
    pub async fn new(
        factory: ConnectionFactory,
        settings: PoolSettings,
    ) -> Result<Self, PoolError> {
        let pool = Self::new_uninitialized(factory, settings);
        pool.initialize().await?;
        Ok(pool)
    }

    /// Construct the pool without dialing anything yet. Slots fill on
    /// [`initialize`](Self::initialize) or lazily on the first lease.
    pub fn new_uninitialized(factory: ConnectionFactory, settings: PoolSettings) -> Self {
        let error_buffer = settings.error_buffer;
        Self {
            factory,
            settings,
            slots: Mutex::new(Vec::new()),
            next_slot: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            live: AtomicI64::new(0),
            initialized: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            errors: Arc::new(BoundedQueue::new(error_buffer)),
        }
    }

    /// Open connections until every slot is filled. Idempotent: a second call after a
    /// successful pass opens nothing.
    ///
    /// A slot that exhausts its dial retries is left empty and the failure is pushed
    /// onto the error stream; `break_on_initialize_error` and
    /// `max_initialize_error_count` turn failures into an aborted pass.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }
        let mut slots = self.slots.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        if slots.is_empty() {
            // Round-robin needs at least one slot.
            slots.resize_with(self.settings.connection_count.max(1), || None);
        }

        let mut failures = 0;
        for slot in slots.iter_mut() {
            if slot.is_some() {
                continue;
            }
            match self.dial().await {
                Ok(host) => {
                    *slot = Some(Arc::new(host));
                    self.live.fetch_add(1, Ordering::SeqCst);
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    self.errors.force_push(e);
                    if self.settings.break_on_initialize_error
                        || failures >= self.settings.max_initialize_error_count
                    {
                        return Err(PoolError::InitializeAborted { failures });
                    }
                }
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Lease the next live connection, round-robin over the slots.
    ///
    /// A dead or empty slot is replaced in place (fresh dial, fresh `connection_id`)
    /// before the host is returned.
    pub async fn get_connection(&self) -> Result<Arc<ConnectionHost>, PoolError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }
        let mut slots = self.slots.lock().await;
        // Re-check: a concurrent shutdown may have won the lock first.
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }
        if slots.is_empty() {
            slots.resize_with(self.settings.connection_count.max(1), || None);
        }
        let idx = self.next_slot.fetch_add(1, Ordering::Relaxed) % slots.len();

        if let Some(host) = &slots[idx] {
            if host.status() == HealthStatus::Healthy {
                return Ok(Arc::clone(host));
            }
        }
        if slots[idx].take().is_some() {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        match self.dial().await {
            Ok(host) => {
                let host = Arc::new(host);
                slots[idx] = Some(Arc::clone(&host));
                self.live.fetch_add(1, Ordering::SeqCst);
                Ok(host)
            }
            Err(e) => {
                // The slot stays empty; the next lease of it dials again.
                if let PoolError::Unreachable { attempts, source } = &e {
                    self.errors.force_push(PoolError::Unreachable {
                        attempts: *attempts,
                        source: anyhow::anyhow!("{source:#}"),
                    });
                }
                Err(e)
            }
        }
    }

    /// Dial one connection, honouring the configured retry count and inter-attempt
    /// sleep.
    async fn dial(&self) -> Result<ConnectionHost, PoolError> {
        let attempts = self.settings.connection_retry_count.saturating_add(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.settings.sleep_on_error_interval()).await;
            }
            match self.factory.new_connection().await {
                Ok(connection) => {
                    let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    return Ok(ConnectionHost::new(connection, connection_id, &self.errors));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(PoolError::Unreachable {
            attempts,
            source: last_error.expect("at least one dial attempt was made"),
        })
    }

    /// The number of currently open connections.
    pub fn connection_count(&self) -> i64 {
        self.live.load(Ordering::SeqCst)
    }

    /// The stream of connection-level failures: broken connections and exhausted
    /// dials. Bounded; overflow evicts the oldest entry.
    pub fn errors(&self) -> &BoundedQueue<PoolError> {
        &self.errors
    }

    /// Throw away everything buffered on the error stream.
    pub fn flush_errors(&self) {
        self.errors.drain();
    }

    /// Close every connection and refuse further leases. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut slots = self.slots.lock().await;
        for slot in slots.iter_mut() {
            if let Some(host) = slot.take() {
                host.close().await;
            }
        }
        slots.clear();
        self.live.store(0, Ordering::SeqCst);
    }
}
