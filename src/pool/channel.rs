//! A fixed set of pre-opened channels multiplexed over the connection pool, split into
//! a plain sub-pool and a publisher-confirm ("ackable") sub-pool.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use lapin::options::{BasicAckOptions, BasicNackOptions, ConfirmSelectOptions};
use tracing::debug;

use crate::amqp::{ConnectionFactory, HealthStatus};
use crate::configuration::PoolSettings;
use crate::pool::{ConnectionPool, PoolError};
use crate::streams::BoundedQueue;

/// One pool slot's worth of broker channel: the `lapin` object, the identity the pool
/// tracks it by, and whether the channel is in publisher-confirm mode.
pub struct ChannelHost {
    channel: lapin::Channel,
    channel_id: u64,
    connection_id: u64,
    ackable: bool,
}

impl ChannelHost {
    /// The pool-assigned identity of this channel. Replacements get a fresh one.
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// The identity of the connection this channel was opened on.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether the channel is in publisher-confirm mode.
    pub fn is_ackable(&self) -> bool {
        self.ackable
    }

    pub fn status(&self) -> HealthStatus {
        if self.channel.status().connected() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Get access to the underlying raw channel.
    pub fn raw(&self) -> &lapin::Channel {
        &self.channel
    }

    async fn close(&self) {
        let _ = self.channel.close(200, "pool shutdown").await;
    }
}

/// A fixed-size pool of [`ChannelHost`]s on top of a [`ConnectionPool`].
///
/// Plain and confirm-mode channels live in separate sub-pools, each selected
/// round-robin. A slot whose channel has died is reopened on a pooled connection
/// before being handed out again; confirm-mode slots re-run `confirm.select` on every
/// replacement.
pub struct ChannelPool {
    settings: PoolSettings,
    connections: Arc<ConnectionPool>,
    owns_connections: bool,
    plain: tokio::sync::Mutex<Vec<Option<Arc<ChannelHost>>>>,
    ackable: tokio::sync::Mutex<Vec<Option<Arc<ChannelHost>>>>,
    next_plain: AtomicUsize,
    next_ackable: AtomicUsize,
    next_id: AtomicU64,
    live: AtomicI64,
    initialized: AtomicBool,
    stopped: AtomicBool,
    errors: Arc<BoundedQueue<PoolError>>,
}

impl ChannelPool {
    /// Construct the pool over an existing connection pool and eagerly open every
    /// slot.
    pub async fn new(
        settings: PoolSettings,
        connections: Arc<ConnectionPool>,
    ) -> Result<Self, PoolError> {
        let pool = Self::new_uninitialized(settings, connections);
        pool.initialize().await?;
        Ok(pool)
    }

    /// Construct the pool without opening anything yet. Slots fill on
    /// [`initialize`](Self::initialize) or lazily on the first lease.
    pub fn new_uninitialized(settings: PoolSettings, connections: Arc<ConnectionPool>) -> Self {
        let error_buffer = settings.error_buffer;
        Self {
            settings,
            connections,
            owns_connections: false,
            plain: tokio::sync::Mutex::new(Vec::new()),
            ackable: tokio::sync::Mutex::new(Vec::new()),
            next_plain: AtomicUsize::new(0),
            next_ackable: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            live: AtomicI64::new(0),
            initialized: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            errors: Arc::new(BoundedQueue::new(error_buffer)),
        }
    }

    /// Construct a pool that builds and owns its own connection pool.
    ///
    /// [`shutdown`](Self::shutdown) also shuts the private connection pool down.
    pub async fn standalone(
        factory: ConnectionFactory,
        settings: PoolSettings,
    ) -> Result<Self, PoolError> {
        let connections = Arc::new(ConnectionPool::new(factory, settings.clone()).await?);
        let mut pool = Self::new_uninitialized(settings, connections);
        pool.owns_connections = true;
        pool.initialize().await?;
        Ok(pool)
    }

    /// Open channels until both sub-pools are full. Idempotent: a second call after a
    /// successful pass opens nothing.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }
        // Hold both sub-pool locks so a concurrent lease cannot observe a half-filled
        // pass and so the initialized flag flips exactly once.
        let mut plain = self.plain.lock().await;
        let mut ackable = self.ackable.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        if plain.is_empty() {
            // Round-robin needs at least one slot per sub-pool.
            plain.resize_with(self.settings.channel_count.max(1), || None);
        }
        if ackable.is_empty() {
            ackable.resize_with(self.settings.ack_channel_count.max(1), || None);
        }

        let mut failures = 0;
        for (slots, confirm_mode) in [(&mut *plain, false), (&mut *ackable, true)] {
            for slot in slots.iter_mut() {
                if slot.is_some() {
                    continue;
                }
                match self.open_channel(confirm_mode).await {
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
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Lease the next live plain channel.
    pub async fn get_channel(&self) -> Result<Arc<ChannelHost>, PoolError> {
        self.lease(&self.plain, &self.next_plain, false).await
    }

    /// Lease the next live publisher-confirm channel.
    pub async fn get_ackable_channel(&self) -> Result<Arc<ChannelHost>, PoolError> {
        self.lease(&self.ackable, &self.next_ackable, true).await
    }

    async fn lease(
        &self,
        sub_pool: &tokio::sync::Mutex<Vec<Option<Arc<ChannelHost>>>>,
        cursor: &AtomicUsize,
        confirm_mode: bool,
    ) -> Result<Arc<ChannelHost>, PoolError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }
        let mut slots = sub_pool.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }
        if slots.is_empty() {
            let size = if confirm_mode {
                self.settings.ack_channel_count
            } else {
                self.settings.channel_count
            };
            slots.resize_with(size.max(1), || None);
        }
        let idx = cursor.fetch_add(1, Ordering::Relaxed) % slots.len();

        if let Some(host) = &slots[idx] {
            if host.status() == HealthStatus::Healthy {
                return Ok(Arc::clone(host));
            }
        }
        if slots[idx].take().is_some() {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        let host = Arc::new(self.open_channel(confirm_mode).await?);
        slots[idx] = Some(Arc::clone(&host));
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(host)
    }

    /// Open one channel on a pooled connection, putting it in confirm mode when asked.
    async fn open_channel(&self, confirm_mode: bool) -> Result<ChannelHost, PoolError> {
        let connection = self.connections.get_connection().await?;
        let channel = connection
            .raw()
            .create_channel()
            .await
            .map_err(|e| PoolError::ChannelOpen {
                connection_id: connection.connection_id(),
                source: e,
            })?;
        if confirm_mode {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
                .map_err(|e| PoolError::ChannelOpen {
                    connection_id: connection.connection_id(),
                    source: e,
                })?;
        }
        let channel_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            channel_id,
            connection_id = connection.connection_id(),
            confirm_mode,
            "opened pooled channel"
        );
        Ok(ChannelHost {
            channel,
            channel_id,
            connection_id: connection.connection_id(),
            ackable: confirm_mode,
        })
    }

    /// Signal that a leased channel was observed sick. Its slot is emptied right away
    /// and replaced on the next lease; the close reason, if known, is forwarded on the
    /// error stream.
    pub async fn retire(&self, channel_id: u64, reason: Option<lapin::Error>) {
        for sub_pool in [&self.plain, &self.ackable] {
            let mut slots = sub_pool.lock().await;
            for slot in slots.iter_mut() {
                if slot.as_ref().map(|h| h.channel_id()) == Some(channel_id) {
                    *slot = None;
                    self.live.fetch_sub(1, Ordering::SeqCst);
                    if let Some(source) = reason {
                        self.errors
                            .force_push(PoolError::ChannelClosed { channel_id, source });
                    }
                    return;
                }
            }
        }
    }

    /// Acknowledge a delivery through the exact channel it arrived on.
    ///
    /// Fails with [`PoolError::ChannelGone`] when that channel has been retired or
    /// replaced; the broker will redeliver, so the ack must not be rerouted.
    pub(crate) async fn ack(
        &self,
        channel_id: u64,
        delivery_tag: u64,
        multiple: bool,
    ) -> Result<(), PoolError> {
        let host = self.find(channel_id).await?;
        host.raw()
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| PoolError::ChannelClosed {
                channel_id,
                source: e,
            })
    }

    /// Negatively acknowledge a delivery through the exact channel it arrived on.
    pub(crate) async fn nack(
        &self,
        channel_id: u64,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), PoolError> {
        let host = self.find(channel_id).await?;
        host.raw()
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| PoolError::ChannelClosed {
                channel_id,
                source: e,
            })
    }

    async fn find(&self, channel_id: u64) -> Result<Arc<ChannelHost>, PoolError> {
        for sub_pool in [&self.plain, &self.ackable] {
            let slots = sub_pool.lock().await;
            for slot in slots.iter().flatten() {
                if slot.channel_id() == channel_id {
                    if slot.status() == HealthStatus::Unhealthy {
                        return Err(PoolError::ChannelGone { channel_id });
                    }
                    return Ok(Arc::clone(slot));
                }
            }
        }
        Err(PoolError::ChannelGone { channel_id })
    }

    /// The number of currently open channels across both sub-pools.
    pub fn channel_count(&self) -> i64 {
        self.live.load(Ordering::SeqCst)
    }

    /// The stream of channel-level failures. Bounded; overflow evicts the oldest
    /// entry.
    pub fn errors(&self) -> &BoundedQueue<PoolError> {
        &self.errors
    }

    /// Throw away everything buffered on the error stream.
    pub fn flush_errors(&self) {
        self.errors.drain();
    }

    pub(crate) fn sleep_on_error_interval(&self) -> std::time::Duration {
        self.settings.sleep_on_error_interval()
    }

    /// Close every channel and refuse further leases. Idempotent, and safe to call
    /// after the connection pool has already gone down: channels are dead by then but
    /// local resources still need releasing.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for sub_pool in [&self.plain, &self.ackable] {
            let mut slots = sub_pool.lock().await;
            for slot in slots.iter_mut() {
                if let Some(host) = slot.take() {
                    host.close().await;
                }
            }
            slots.clear();
        }
        self.live.store(0, Ordering::SeqCst);
        if self.owns_connections {
            self.connections.shutdown().await;
        }
    }
}
