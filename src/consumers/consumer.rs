//! A long-lived subscription on one queue that survives channel and connection loss.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicQosOptions};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::configuration::{ConsumerSettings, Settings};
use crate::consumers::{ConsumerError, Message};
use crate::pool::{ChannelHost, ChannelPool};
use crate::streams::BoundedQueue;

/// How a running consumer should wind down.
#[derive(Debug, Clone, Copy, Default)]
struct StopMode {
    /// Exit after the current iteration without draining buffered deliveries.
    immediate: bool,
    /// Forward deliveries the client has already buffered before exiting.
    drain: bool,
}

/// Handles to a running consume task.
struct Running {
    stop: watch::Sender<Option<StopMode>>,
    task: JoinHandle<()>,
}

/// A supervised consumer for one queue.
///
/// `Consumer` leases a channel from the pool, subscribes, and forwards every delivery
/// onto a bounded message stream. When the channel or its connection dies, the
/// subscription is re-established on a fresh lease; reconnection attempts continue
/// until [`stop_consuming`](Consumer::stop_consuming) is called. Failures along the
/// way surface on a bounded error stream.
pub struct Consumer {
    core: Arc<ConsumerCore>,
    running: tokio::sync::Mutex<Option<Running>>,
}

struct ConsumerCore {
    settings: ConsumerSettings,
    channels: Arc<ChannelPool>,
    messages: BoundedQueue<Message>,
    errors: BoundedQueue<ConsumerError>,
}

impl Consumer {
    /// Construct a consumer over `channels`, shaped by `settings`.
    pub fn new(settings: ConsumerSettings, channels: Arc<ChannelPool>) -> Self {
        let message_buffer = settings.message_buffer;
        let error_buffer = settings.error_buffer;
        Self {
            core: Arc::new(ConsumerCore {
                settings,
                channels,
                messages: BoundedQueue::new(message_buffer),
                errors: BoundedQueue::new(error_buffer),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Construct a consumer from a named entry in [`Settings::consumers`].
    ///
    /// A missing name is a synchronous contract error, never silently ignored.
    pub fn from_config(
        settings: &Settings,
        name: &str,
        channels: Arc<ChannelPool>,
    ) -> Result<Self, ConsumerError> {
        let consumer_settings = settings
            .consumer(name)
            .ok_or_else(|| ConsumerError::MissingConfig(name.to_owned()))?;
        Ok(Self::new(consumer_settings.clone(), channels))
    }

    /// Start the consume task. Fails with [`ConsumerError::AlreadyConsuming`] if the
    /// consumer is already running.
    pub async fn start_consuming(&self) -> Result<(), ConsumerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ConsumerError::AlreadyConsuming);
        }
        let (stop, stop_rx) = watch::channel(None);
        let core = Arc::clone(&self.core);
        let task = tokio::spawn(async move {
            core.run(stop_rx).await;
        });
        info!(queue_name = %self.core.settings.queue_name, "consumer started");
        *running = Some(Running { stop, task });
        Ok(())
    }

    /// Stop the consume task and join it. Idempotent: stopping an idle consumer is a
    /// no-op.
    ///
    /// With `drain`, deliveries the client has already buffered are forwarded onto the
    /// message stream before the task exits; `immediate` skips that regardless.
    pub async fn stop_consuming(&self, immediate: bool, drain: bool) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.stop.send(Some(StopMode { immediate, drain }));
        let _ = running.task.await;
        info!(queue_name = %self.core.settings.queue_name, "consumer stopped");
    }

    /// Fetch a single message from `queue` with `basic.get`. Returns `None` when the
    /// queue is empty.
    pub async fn get(
        &self,
        queue: &str,
        auto_ack: bool,
    ) -> Result<Option<Message>, ConsumerError> {
        let host = self.core.lease_for(auto_ack).await?;
        self.core.get_on(&host, queue, auto_ack).await
    }

    /// Fetch up to `count` messages from `queue`, stopping early once it is empty.
    ///
    /// `count == 0` is a contract error.
    pub async fn get_batch(
        &self,
        queue: &str,
        count: usize,
        auto_ack: bool,
    ) -> Result<Vec<Message>, ConsumerError> {
        if count == 0 {
            return Err(ConsumerError::EmptyBatch);
        }
        let host = self.core.lease_for(auto_ack).await?;
        let mut batch = Vec::with_capacity(count);
        while batch.len() < count {
            match self.core.get_on(&host, queue, auto_ack).await? {
                Some(message) => batch.push(message),
                None => break,
            }
        }
        Ok(batch)
    }

    /// The stream of delivered messages. Bounded: when it fills up, the consume task
    /// blocks and back-pressure reaches the broker through the prefetch window.
    pub fn messages(&self) -> &BoundedQueue<Message> {
        &self.core.messages
    }

    /// The stream of subscription and delivery failures. Bounded; overflow evicts the
    /// oldest entry.
    pub fn errors(&self) -> &BoundedQueue<ConsumerError> {
        &self.core.errors
    }

    /// Throw away everything buffered on the error stream.
    pub fn flush_errors(&self) {
        self.core.errors.drain();
    }
}

impl ConsumerCore {
    /// Ack-capable work needs a confirm-mode channel; auto-ack work does not.
    async fn lease_for(&self, auto_ack: bool) -> Result<Arc<ChannelHost>, ConsumerError> {
        let lease = if auto_ack {
            self.channels.get_channel().await
        } else {
            self.channels.get_ackable_channel().await
        };
        lease.map_err(ConsumerError::Lease)
    }

    async fn get_on(
        &self,
        host: &Arc<ChannelHost>,
        queue: &str,
        auto_ack: bool,
    ) -> Result<Option<Message>, ConsumerError> {
        let fetched = host
            .raw()
            .basic_get(queue, BasicGetOptions { no_ack: auto_ack })
            .await;
        match fetched {
            Ok(Some(get_message)) => Ok(Some(Message::new(
                get_message.delivery,
                !auto_ack,
                host.channel_id(),
                Arc::clone(&self.channels),
            ))),
            Ok(None) => Ok(None),
            Err(e) => {
                // A failed get (e.g. a missing queue) takes the whole channel down.
                self.channels
                    .retire(host.channel_id(), Some(e.clone()))
                    .await;
                Err(ConsumerError::Fetch {
                    queue: queue.to_owned(),
                    source: e,
                })
            }
        }
    }

    /// The supervised consume loop: subscribe, forward, and re-lease on failure until
    /// a stop is signalled.
    async fn run(&self, mut stop: watch::Receiver<Option<StopMode>>) {
        loop {
            if stop.borrow().is_some() {
                return;
            }
            let host = match self.lease_for(self.settings.auto_ack).await {
                Ok(host) => host,
                Err(e) => {
                    self.errors.force_push(e);
                    if self.pause(&mut stop, self.settings.sleep_on_error_interval()).await {
                        return;
                    }
                    continue;
                }
            };
            if let Some(prefetch) = self.settings.qos_count_override {
                if let Err(e) = host
                    .raw()
                    .basic_qos(prefetch, BasicQosOptions { global: false })
                    .await
                {
                    self.channels
                        .retire(host.channel_id(), Some(e.clone()))
                        .await;
                    self.errors.force_push(ConsumerError::Subscribe {
                        queue: self.settings.queue_name.clone(),
                        source: e,
                    });
                    if self.pause(&mut stop, self.settings.sleep_on_error_interval()).await {
                        return;
                    }
                    continue;
                }
            }
            let consumer = match host
                .raw()
                .basic_consume(
                    &self.settings.queue_name,
                    &self.consumer_tag(),
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: self.settings.auto_ack,
                        exclusive: self.settings.exclusive,
                        nowait: self.settings.no_wait,
                    },
                    self.settings.args.clone(),
                )
                .await
            {
                Ok(consumer) => consumer,
                Err(e) => {
                    self.channels
                        .retire(host.channel_id(), Some(e.clone()))
                        .await;
                    self.errors.force_push(ConsumerError::Subscribe {
                        queue: self.settings.queue_name.clone(),
                        source: e,
                    });
                    if self.pause(&mut stop, self.settings.sleep_on_error_interval()).await {
                        return;
                    }
                    continue;
                }
            };
            debug!(
                queue_name = %self.settings.queue_name,
                channel_id = host.channel_id(),
                "subscribed"
            );

            match self.forward(consumer, &host, &mut stop).await {
                SubscriptionEnd::Stopped => return,
                SubscriptionEnd::Cancelled => {
                    // The broker ended the subscription without an error (e.g. the
                    // queue was deleted); take a breath before subscribing again.
                    if self.pause(&mut stop, self.settings.sleep_on_idle_interval()).await {
                        return;
                    }
                }
                SubscriptionEnd::Failed => {
                    if self.pause(&mut stop, self.settings.sleep_on_error_interval()).await {
                        return;
                    }
                }
            }
        }
    }

    /// Forward deliveries until the subscription dies or a stop is signalled.
    async fn forward(
        &self,
        mut consumer: lapin::Consumer,
        host: &Arc<ChannelHost>,
        stop: &mut watch::Receiver<Option<StopMode>>,
    ) -> SubscriptionEnd {
        loop {
            tokio::select! {
                biased;

                _ = stop.changed() => {
                    let mode = stop.borrow().unwrap_or_default();
                    return self.wind_down(consumer, host, mode, None).await;
                }
                event = consumer.next() => {
                    match event {
                        Some(Ok(delivery)) => {
                            let mut message = Message::new(
                                delivery,
                                !self.settings.auto_ack,
                                host.channel_id(),
                                Arc::clone(&self.channels),
                            );
                            // A full message stream blocks us here, which stalls the
                            // prefetch window and pushes back on the broker. Stay
                            // responsive to stop requests while blocked, without
                            // losing the delivery already in hand.
                            loop {
                                match self.messages.try_push(message) {
                                    Ok(()) => break,
                                    Err(rejected) => {
                                        message = rejected;
                                        tokio::select! {
                                            biased;
                                            _ = stop.changed() => {
                                                let mode = stop.borrow().unwrap_or_default();
                                                return self
                                                    .wind_down(consumer, host, mode, Some(message))
                                                    .await;
                                            }
                                            _ = self.messages.space() => {}
                                        }
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(
                                queue_name = %self.settings.queue_name,
                                error = ?e,
                                "subscription failed"
                            );
                            self.channels
                                .retire(host.channel_id(), Some(e.clone()))
                                .await;
                            self.errors.force_push(ConsumerError::Delivery(e));
                            return SubscriptionEnd::Failed;
                        }
                        None => return SubscriptionEnd::Cancelled,
                    }
                }
            }
        }
    }

    /// Cancel the subscription and, when draining, forward everything the client
    /// already buffered: a delivery that was mid-hand-off when the stop arrived,
    /// then whatever the stream still yields before the cancel-ok terminates it.
    async fn wind_down(
        &self,
        mut consumer: lapin::Consumer,
        host: &Arc<ChannelHost>,
        mode: StopMode,
        pending: Option<Message>,
    ) -> SubscriptionEnd {
        let _ = host
            .raw()
            .basic_cancel(consumer.tag().as_str(), BasicCancelOptions::default())
            .await;
        if mode.drain && !mode.immediate {
            if let Some(message) = pending {
                self.messages.push(message).await;
            }
            while let Some(Ok(delivery)) = consumer.next().await {
                self.messages
                    .push(Message::new(
                        delivery,
                        !self.settings.auto_ack,
                        host.channel_id(),
                        Arc::clone(&self.channels),
                    ))
                    .await;
            }
        }
        SubscriptionEnd::Stopped
    }

    /// Sleep, but wake early on a stop signal. Returns `true` when stopped.
    async fn pause(
        &self,
        stop: &mut watch::Receiver<Option<StopMode>>,
        interval: Duration,
    ) -> bool {
        tokio::select! {
            biased;
            _ = stop.changed() => true,
            _ = tokio::time::sleep(interval) => false,
        }
    }

    fn consumer_tag(&self) -> String {
        if self.settings.consumer_name.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            self.settings.consumer_name.clone()
        }
    }
}

/// Why one subscription's forwarding loop ended.
enum SubscriptionEnd {
    Stopped,
    Cancelled,
    Failed,
}
