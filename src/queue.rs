//! Per-channel delivery queues.
//!
//! Every enqueued job becomes its own task. A delayed job waits for its
//! delivery time, then claims itself; until it is claimed it can be
//! cancelled. Claimed jobs run their attempts to completion under a
//! per-channel concurrency limit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Channel, DeliveryUpdate};
use crate::store::Store;
use crate::transport::{Content, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Doubles after every failed attempt, starting from `initial`.
    Exponential { initial: Duration },
    Fixed(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn for_channel(channel: Channel) -> Self {
        match channel {
            Channel::Email | Channel::Sms => RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::Exponential {
                    initial: Duration::from_secs(2),
                },
            },
            Channel::InApp => RetryPolicy {
                max_attempts: 2,
                backoff: Backoff::Fixed(Duration::from_millis(500)),
            },
        }
    }

    /// Wait before the attempt following failed attempt number `attempt`
    /// (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Exponential { initial } => {
                initial.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            }
            Backoff::Fixed(delay) => delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub channel: Channel,
    pub destination: String,
    pub content: Content,
    pub deliver_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { provider_id: String, attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
    /// The channel entry was already sent when the job was claimed.
    AlreadySent,
    Cancelled,
    /// The worker task panicked or was aborted.
    Aborted(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            DeliveryOutcome::Delivered { .. } | DeliveryOutcome::AlreadySent
        )
    }
}

pub struct DeliveryHandle {
    pub job_id: Uuid,
    pub channel: Channel,
    join: JoinHandle<DeliveryOutcome>,
}

impl DeliveryHandle {
    pub async fn outcome(self) -> DeliveryOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => DeliveryOutcome::Aborted(err.to_string()),
        }
    }
}

struct Inner {
    channel: Channel,
    policy: RetryPolicy,
    transport: Option<Arc<dyn Transport>>,
    store: Arc<dyn Store>,
    permits: Semaphore,
    // Job id to notification id, for jobs no worker has claimed yet.
    unclaimed: Mutex<HashMap<Uuid, Uuid>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<Inner>,
}

impl DeliveryQueue {
    /// A queue without a transport is unconfigured and refuses jobs.
    pub fn new(
        channel: Channel,
        policy: RetryPolicy,
        transport: Option<Arc<dyn Transport>>,
        store: Arc<dyn Store>,
        concurrency: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                policy,
                transport,
                store,
                permits: Semaphore::new(concurrency.max(1)),
                unclaimed: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.transport.is_some()
    }

    pub fn enqueue(&self, job: DeliveryJob) -> Result<DeliveryHandle> {
        let Some(transport) = self.inner.transport.clone() else {
            return Err(Error::Configuration(self.inner.channel));
        };

        self.inner.unclaimed.lock().insert(job.id, job.notification_id);
        tracing::debug!(
            channel = %self.inner.channel,
            job_id = %job.id,
            notification_id = %job.notification_id,
            deliver_at = ?job.deliver_at,
            "enqueued delivery job"
        );

        let job_id = job.id;
        let inner = self.inner.clone();
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let join = tokio::spawn(async move {
            let outcome = inner.work(transport, job).await;
            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
            outcome
        });

        Ok(DeliveryHandle {
            job_id,
            channel: self.inner.channel,
            join,
        })
    }

    /// Resolves once no job of this queue is waiting or running.
    pub async fn drain(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    pub fn cancel_notification(&self, notification_id: Uuid) -> usize {
        let mut unclaimed = self.inner.unclaimed.lock();
        let before = unclaimed.len();
        unclaimed.retain(|_, owner| *owner != notification_id);
        before - unclaimed.len()
    }
}

impl Inner {
    async fn work(&self, transport: Arc<dyn Transport>, job: DeliveryJob) -> DeliveryOutcome {
        if let Some(deliver_at) = job.deliver_at {
            // A delivery time in the past converts to an error: send now.
            if let Ok(wait) = (deliver_at - Utc::now()).to_std() {
                tokio::time::sleep(wait).await;
            }
        }

        let Ok(_permit) = self.permits.acquire().await else {
            return DeliveryOutcome::Cancelled;
        };
        if self.unclaimed.lock().remove(&job.id).is_none() {
            tracing::info!(channel = %self.channel, job_id = %job.id, "delivery job was cancelled");
            return DeliveryOutcome::Cancelled;
        }

        let mut attempts = 0;
        let mut last_error = String::new();
        while attempts < self.policy.max_attempts {
            // Another job for the same channel may have delivered, or the
            // notification been deleted, while this one was backing off.
            if let Some(outcome) = self.superseded(&job).await {
                return outcome;
            }
            attempts += 1;

            match transport.send(job.id, &job.destination, &job.content).await {
                Ok(receipt) => {
                    tracing::info!(
                        channel = %self.channel,
                        notification_id = %job.notification_id,
                        provider_id = %receipt.provider_id,
                        attempts,
                        "delivered notification"
                    );
                    self.report(
                        &job,
                        DeliveryUpdate::Sent {
                            at: Utc::now(),
                            provider_id: receipt.provider_id.clone(),
                        },
                    )
                    .await;
                    return DeliveryOutcome::Delivered {
                        provider_id: receipt.provider_id,
                        attempts,
                    };
                }
                Err(err) => {
                    let terminal = attempts >= self.policy.max_attempts || !err.is_retryable();
                    last_error = err.to_string();
                    tracing::warn!(
                        channel = %self.channel,
                        notification_id = %job.notification_id,
                        attempts,
                        terminal,
                        %err,
                        "delivery attempt failed"
                    );

                    let error = if terminal {
                        format!("giving up after {attempts} attempt(s): {err}")
                    } else {
                        last_error.clone()
                    };
                    self.report(
                        &job,
                        DeliveryUpdate::Failed {
                            at: Utc::now(),
                            error,
                            terminal,
                        },
                    )
                    .await;

                    if terminal {
                        break;
                    }
                    tokio::time::sleep(self.policy.delay_after(attempts)).await;
                }
            }
        }

        DeliveryOutcome::Exhausted {
            attempts,
            last_error,
        }
    }

    async fn superseded(&self, job: &DeliveryJob) -> Option<DeliveryOutcome> {
        match self.store.notification(job.notification_id).await {
            Ok(Some(notification)) if notification.deleted_at.is_some() => {
                Some(DeliveryOutcome::Cancelled)
            }
            Ok(Some(notification))
                if notification
                    .channels
                    .get(&self.channel)
                    .is_some_and(|state| state.sent) =>
            {
                Some(DeliveryOutcome::AlreadySent)
            }
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(
                    %err,
                    job_id = %job.id,
                    "could not load notification before delivery"
                );
                None
            }
        }
    }

    async fn report(&self, job: &DeliveryJob, update: DeliveryUpdate) {
        if let Err(err) = self
            .store
            .record_delivery(job.notification_id, self.channel, update)
            .await
        {
            tracing::error!(
                %err,
                channel = %self.channel,
                notification_id = %job.notification_id,
                "failed to record delivery status"
            );
        }
    }
}

/// The three channel queues, built once and shared by the dispatcher.
#[derive(Clone)]
pub struct ChannelQueues {
    pub email: DeliveryQueue,
    pub sms: DeliveryQueue,
    pub in_app: DeliveryQueue,
}

impl ChannelQueues {
    pub fn get(&self, channel: Channel) -> &DeliveryQueue {
        match channel {
            Channel::Email => &self.email,
            Channel::Sms => &self.sms,
            Channel::InApp => &self.in_app,
        }
    }

    pub async fn drain(&self) {
        futures::join!(self.email.drain(), self.sms.drain(), self.in_app.drain());
    }

    pub fn cancel_notification(&self, notification_id: Uuid) -> usize {
        Channel::ALL
            .iter()
            .map(|channel| self.get(*channel).cancel_notification(notification_id))
            .sum()
    }
}
