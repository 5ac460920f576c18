use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use health::{HealthHandle, HealthRegistry};
use mail_common::pgqueue::{Mail, MailQueue};
use mail_common::retry::{RetryDecision, RetryPolicy};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DeliveryError, WorkerError};
use crate::message::MailComposer;
use crate::transport::Transport;

/// Slack given to a polling loop on top of one full send before it is reported as stalled.
const LIVENESS_MARGIN: time::Duration = time::Duration::from_secs(10);

/// What happened to the mail claimed by one `process_one` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// Nothing was eligible.
    Empty,
    Delivered(Uuid),
    /// The recipient no longer exists, the mail was dropped.
    Discarded(Uuid),
    Requeued {
        id: Uuid,
        attempt_count: i16,
        not_before: DateTime<Utc>,
    },
    Expired(Uuid),
}

enum Delivery {
    Sent,
    Discarded,
}

/// Decrements the in-flight counter when a claim is resolved, however that happens.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    capacity: usize,
}

impl<'a> InFlight<'a> {
    fn start(counter: &'a AtomicUsize, capacity: usize) -> Self {
        let in_flight = counter.fetch_add(1, Ordering::SeqCst) + 1;
        report_saturation(in_flight, capacity);
        Self { counter, capacity }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let in_flight = self.counter.fetch_sub(1, Ordering::SeqCst) - 1;
        report_saturation(in_flight, self.capacity);
    }
}

fn report_saturation(in_flight: usize, capacity: usize) {
    metrics::gauge!("mail_worker_saturation_percent").set(in_flight as f64 / capacity as f64);
}

/// A worker to poll `MailQueue` and deliver mails as they become eligible.
pub struct MailWorker<'p> {
    /// An identifier for this worker, used to name its liveness components.
    name: String,
    /// The queue we will be claiming mails from.
    queue: &'p MailQueue,
    /// The interval for polling the queue once it has been drained.
    poll_interval: time::Duration,
    /// Upper bound on composing and sending one mail.
    send_timeout: time::Duration,
    /// Number of polling loops, and so of mails being delivered at once.
    max_concurrent_jobs: usize,
    retry_policy: RetryPolicy,
    composer: MailComposer,
    transport: Arc<dyn Transport>,
    liveness: HealthRegistry,
    in_flight: AtomicUsize,
}

impl<'p> MailWorker<'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: &'p MailQueue,
        poll_interval: time::Duration,
        send_timeout: time::Duration,
        max_concurrent_jobs: usize,
        retry_policy: RetryPolicy,
        composer: MailComposer,
        transport: Arc<dyn Transport>,
        liveness: HealthRegistry,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            poll_interval,
            send_timeout,
            max_concurrent_jobs,
            retry_policy,
            composer,
            transport,
            liveness,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Claim and resolve at most one mail.
    pub async fn process_one(&self) -> Result<Processed, WorkerError> {
        self.process_one_at(Utc::now()).await
    }

    /// Claim and resolve at most one mail, using `now` for eligibility and retry scheduling.
    ///
    /// Delivery failures never surface here: the mail is requeued or expired instead.
    /// Only database errors are returned, in which case the claim is rolled back.
    pub async fn process_one_at(&self, now: DateTime<Utc>) -> Result<Processed, WorkerError> {
        let Some(claimed) = self.queue.claim(now).await? else {
            return Ok(Processed::Empty);
        };
        let _in_flight = InFlight::start(&self.in_flight, self.max_concurrent_jobs);
        debug!(
            "claimed mail {} to user {} (attempt {})",
            claimed.mail.id,
            claimed.mail.to_user_id,
            claimed.mail.attempt_count + 1
        );

        let labels = [("source", claimed.mail.source.as_str().to_owned())];
        metrics::counter!("mail_jobs_total", &labels).increment(1);

        let start = tokio::time::Instant::now();
        let result = self.deliver(&claimed.mail).await;
        metrics::histogram!("mail_send_duration_seconds", &labels)
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(Delivery::Sent) => {
                let completed = claimed.complete().await?;
                metrics::counter!("mail_jobs_delivered", &labels).increment(1);
                info!("delivered mail {}", completed.id);
                Ok(Processed::Delivered(completed.id))
            }
            Ok(Delivery::Discarded) => {
                let completed = claimed.complete().await?;
                metrics::counter!("mail_jobs_discarded", &labels).increment(1);
                Ok(Processed::Discarded(completed.id))
            }
            Err(delivery_error) => {
                let decision = self.retry_policy.decide(
                    claimed.mail.failed_attempts(),
                    claimed.mail.created_at,
                    now,
                );

                match decision {
                    RetryDecision::RetryAt(not_before) => {
                        let requeued = claimed.requeue(not_before).await?;
                        metrics::counter!("mail_jobs_requeued", &labels).increment(1);
                        info!(
                            "failed to deliver mail {} (attempt {}), retrying at {}: {}",
                            requeued.id, requeued.attempt_count, requeued.not_before, delivery_error
                        );
                        Ok(Processed::Requeued {
                            id: requeued.id,
                            attempt_count: requeued.attempt_count,
                            not_before: requeued.not_before,
                        })
                    }
                    RetryDecision::Expire => {
                        let expired = claimed.expire().await?;
                        metrics::counter!("mail_jobs_expired", &labels).increment(1);
                        warn!(
                            "giving up on mail {} created at {} after {} failed attempts: {}",
                            expired.id,
                            expired.created_at,
                            expired.attempt_count + 1,
                            delivery_error
                        );
                        Ok(Processed::Expired(expired.id))
                    }
                }
            }
        }
    }

    /// Compose and send `mail`, giving up after `send_timeout`.
    async fn deliver(&self, mail: &Mail) -> Result<Delivery, DeliveryError> {
        let attempt = async {
            let Some(outbound) = self.composer.compose(mail).await? else {
                return Ok(Delivery::Discarded);
            };
            self.transport.send(&outbound).await?;
            Ok(Delivery::Sent)
        };

        match tokio::time::timeout(self.send_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
        }
    }

    /// Run this worker to continuously deliver any mails that become available.
    /// One polling loop is started per concurrent job slot.
    pub async fn run(&self) {
        info!(
            "starting mail worker {} with {} polling loops",
            self.name, self.max_concurrent_jobs
        );
        report_saturation(0, self.max_concurrent_jobs);

        let loops = (0..self.max_concurrent_jobs).map(|slot| self.poll(slot));
        join_all(loops).await;
    }

    async fn poll(&self, slot: usize) {
        let liveness = self
            .liveness
            .register(format!("{}-{}", self.name, slot), self.liveness_deadline())
            .await;

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            liveness.report_healthy().await;
            self.drain(&liveness).await;
        }
    }

    /// Keep processing until the queue has nothing eligible left.
    async fn drain(&self, liveness: &HealthHandle) {
        loop {
            match self.process_one().await {
                Ok(Processed::Empty) => return,
                Ok(_) => liveness.report_healthy().await,
                Err(err) => {
                    error!("error while processing mail: {}", err);
                    return;
                }
            }
        }
    }

    fn liveness_deadline(&self) -> ::time::Duration {
        let deadline = self.poll_interval + self.send_timeout + LIVENESS_MARGIN;
        ::time::Duration::try_from(deadline).unwrap_or(::time::Duration::MAX)
    }
}
