//! A queue-fed, concurrency-limited publish engine with confirm handling and
//! per-letter retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tracing_error::SpanTrace;

use crate::configuration::PublisherSettings;
use crate::pool::{ChannelHost, ChannelPool, PoolError};
use crate::publishers::{Letter, Notification, PublisherError};
use crate::streams::BoundedQueue;

// Reply code the broker attaches to returned unroutable messages.
// See https://www.rabbitmq.com/amqp-0-9-1-reference.html
const NO_ROUTE: u16 = 312;

/// A high-throughput publisher over a [`ChannelPool`].
///
/// Letters are accepted on a bounded input queue and fanned across a fixed number of
/// worker tasks; every letter eventually produces exactly one [`Notification`] on the
/// notification stream, whether it was confirmed, returned as unroutable, or failed
/// after its retry budget ran out.
///
/// # Fault tolerance
///
/// Workers lease a fresh channel per attempt. A channel that errors mid-publish is
/// retired from the pool, so the next attempt lands on a replacement.
pub struct Publisher {
    core: Arc<PublisherCore>,
    auto: tokio::sync::Mutex<Option<AutoPublish>>,
}

/// State shared between the publisher handle and its workers.
struct PublisherCore {
    settings: PublisherSettings,
    channels: Arc<ChannelPool>,
    letters: BoundedQueue<Letter>,
    notifications: Arc<BoundedQueue<Notification>>,
    letter_seq: AtomicU64,
}

/// Handles to a running auto-publish fleet.
struct AutoPublish {
    stop: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    confirm_mode: bool,
}

impl Publisher {
    /// Construct a publisher over `channels`, with buffers sized from `settings`.
    pub fn new(settings: PublisherSettings, channels: Arc<ChannelPool>) -> Self {
        let sink = Arc::new(BoundedQueue::new(settings.notification_buffer));
        Self::new_with_sink(settings, channels, sink)
    }

    /// Construct a publisher that emits its notifications onto an externally owned
    /// sink, e.g. one shared with other publishers.
    pub fn new_with_sink(
        settings: PublisherSettings,
        channels: Arc<ChannelPool>,
        sink: Arc<BoundedQueue<Notification>>,
    ) -> Self {
        let input_capacity = settings.input_capacity();
        Self {
            core: Arc::new(PublisherCore {
                settings,
                channels,
                letters: BoundedQueue::new(input_capacity),
                notifications: sink,
                letter_seq: AtomicU64::new(0),
            }),
            auto: tokio::sync::Mutex::new(None),
        }
    }

    /// Publish one letter synchronously, retrying up to its `retry_count`.
    ///
    /// The assigned letter id is returned and the terminal outcome is also emitted on
    /// the notification stream.
    pub async fn publish(&self, letter: Letter) -> Result<u64, PublisherError> {
        self.publish_with_retry(letter).await
    }

    /// Publish one letter synchronously, retrying up to its `retry_count`.
    pub async fn publish_with_retry(&self, mut letter: Letter) -> Result<u64, PublisherError> {
        letter.validate()?;
        letter.letter_id = self.core.next_letter_id();
        let letter_id = letter.letter_id;
        let notification = self.core.deliver(letter, true).await;
        self.core.notifications.force_push(notification);
        Ok(letter_id)
    }

    /// Enqueue a letter for the auto-publish workers without blocking.
    ///
    /// Returns the assigned letter id, or [`PublisherError::QueueFull`] once the input
    /// queue holds `letter_buffer + max_over_buffer` letters.
    pub fn queue_letter(&self, mut letter: Letter) -> Result<u64, PublisherError> {
        letter.validate()?;
        letter.letter_id = self.core.next_letter_id();
        let letter_id = letter.letter_id;
        self.core
            .letters
            .try_push(letter)
            .map_err(|_| PublisherError::QueueFull)?;
        Ok(letter_id)
    }

    /// Start the auto-publish workers. Idempotent: a second call while running is a
    /// no-op.
    ///
    /// With `use_confirm_channels` the workers lease from the confirm-mode sub-pool
    /// and wait for broker confirms before emitting a success notification.
    pub async fn start_auto_publish(&self, use_confirm_channels: bool) {
        let mut auto = self.auto.lock().await;
        if auto.is_some() {
            return;
        }
        let (stop, _) = watch::channel(false);
        let concurrency = self.core.settings.auto_publish_concurrency.max(1);
        let workers = (0..concurrency)
            .map(|worker| {
                let core = Arc::clone(&self.core);
                let stop = stop.subscribe();
                tokio::spawn(async move {
                    core.run_worker(worker, stop, use_confirm_channels).await;
                })
            })
            .collect();
        info!(concurrency, use_confirm_channels, "auto-publish started");
        *auto = Some(AutoPublish {
            stop,
            workers,
            confirm_mode: use_confirm_channels,
        });
    }

    /// Stop the auto-publish workers and join them. Idempotent.
    ///
    /// Letters still sitting in the input queue are discarded when `discard_queued` is
    /// set; otherwise they are published inline (same retry and notification handling
    /// as the workers) before this returns.
    pub async fn stop_auto_publish(&self, discard_queued: bool) {
        let Some(auto) = self.auto.lock().await.take() else {
            return;
        };
        let _ = auto.stop.send(true);
        for worker in auto.workers {
            let _ = worker.await;
        }
        if discard_queued {
            let discarded = self.core.letters.drain().len();
            if discarded > 0 {
                debug!(discarded, "discarded queued letters on stop");
            }
        } else {
            while let Some(letter) = self.core.letters.try_pop() {
                let notification = self.core.deliver(letter, auto.confirm_mode).await;
                self.core.notifications.force_push(notification);
            }
        }
        info!("auto-publish stopped");
    }

    /// The stream of terminal outcomes, one per accepted letter. Bounded; overflow
    /// evicts the oldest entry and bumps the stream's eviction counter.
    pub fn notifications(&self) -> &BoundedQueue<Notification> {
        &self.core.notifications
    }

    /// How many letters are waiting in the input queue.
    pub fn queued_letters(&self) -> usize {
        self.core.letters.len()
    }
}

impl PublisherCore {
    fn next_letter_id(&self) -> u64 {
        self.letter_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// One auto-publish worker: drain the input queue until told to stop.
    async fn run_worker(&self, worker: usize, mut stop: watch::Receiver<bool>, confirm: bool) {
        loop {
            tokio::select! {
                biased;

                _ = stop.changed() => {
                    debug!(worker, "publish worker stopping");
                    break;
                }
                letter = self.letters.pop() => {
                    let notification = self.deliver(letter, confirm).await;
                    self.notifications.force_push(notification);
                }
            }
        }
    }

    /// Drive one letter to its terminal state: lease, publish, wait for the confirm
    /// when asked, burn retries on failure.
    async fn deliver(&self, letter: Letter, confirm: bool) -> Notification {
        let attempts = letter.retry_count.saturating_add(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            let host = match self.lease(confirm).await {
                Ok(host) => host,
                Err(PoolError::Shutdown) => {
                    // No channel is ever coming back; fail terminally now.
                    return Notification::failure(
                        letter.letter_id,
                        PublisherError::Lease(PoolError::Shutdown),
                    );
                }
                Err(e) => {
                    last_error = Some(PublisherError::Lease(e));
                    tokio::time::sleep(self.channels.sleep_on_error_interval()).await;
                    continue;
                }
            };
            match self.attempt(&host, &letter, confirm).await {
                Ok(()) => return Notification::success(letter.letter_id),
                Err(e) => {
                    if let PublisherError::Transport(source, _) = &e {
                        self.channels
                            .retire(host.channel_id(), Some(source.clone()))
                            .await;
                    } else if matches!(e, PublisherError::ConfirmTimeout) {
                        // A confirm that never arrived leaves the channel's confirm
                        // sequence in doubt; replace it rather than reuse it.
                        self.channels.retire(host.channel_id(), None).await;
                    }
                    error!(
                        letter_id = letter.letter_id,
                        attempt,
                        error = %e,
                        "publish attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        let error = last_error.expect("at least one publish attempt was made");
        Notification::failure(letter.letter_id, error)
    }

    async fn lease(&self, confirm: bool) -> Result<Arc<ChannelHost>, PoolError> {
        if confirm {
            self.channels.get_ackable_channel().await
        } else {
            self.channels.get_channel().await
        }
    }

    /// One `basic.publish` on one leased channel.
    async fn attempt(
        &self,
        host: &ChannelHost,
        letter: &Letter,
        confirm: bool,
    ) -> Result<(), PublisherError> {
        let options = BasicPublishOptions {
            mandatory: letter.envelope.mandatory,
            immediate: letter.envelope.immediate,
        };
        let confirmation = host
            .raw()
            .basic_publish(
                &letter.envelope.exchange,
                &letter.envelope.routing_key,
                options,
                &letter.body,
                letter.envelope.properties(),
            )
            .await
            .map_err(|e| PublisherError::Transport(e, SpanTrace::capture()))?;

        if !confirm {
            // Without publisher confirms the broker never replies; a successful write
            // is the terminal state.
            let _ = confirmation
                .await
                .map_err(|e| PublisherError::Transport(e, SpanTrace::capture()))?;
            return Ok(());
        }

        let confirmation =
            tokio::time::timeout(self.settings.confirm_timeout(), confirmation)
                .await
                .map_err(|_| PublisherError::ConfirmTimeout)?
                .map_err(|e| PublisherError::Transport(e, SpanTrace::capture()))?;
        match confirmation {
            Confirmation::Ack(None) => Ok(()),
            Confirmation::Ack(Some(return_message)) => {
                if return_message.reply_code == NO_ROUTE {
                    Err(PublisherError::UnroutableMessage(return_message))
                } else {
                    Ok(())
                }
            }
            Confirmation::Nack(return_message) => {
                Err(PublisherError::NegativeAck(return_message))
            }
            Confirmation::NotRequested => Ok(()),
        }
    }
}
