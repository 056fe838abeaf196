//! Notification creation and fan-out to the channel queues.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    Channel, ChannelState, Notification, NotificationKind, NotificationPreferences,
    NotificationStatus, Priority, Recipient,
};
use crate::queue::{ChannelQueues, DeliveryHandle, DeliveryJob, DeliveryOutcome};
use crate::store::Store;
use crate::transport::Content;

/// Longest message a length-constrained channel accepts.
pub const SHORT_MESSAGE_LIMIT: usize = 160;
const ELLIPSIS: &str = "...";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub recipient_id: Uuid,
    pub kind: NotificationKind,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub short_message: Option<String>,
    pub related_student: Option<Uuid>,
    pub channels: Vec<Channel>,
    pub created_by: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Why a requested channel is on or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Enabled,
    OptedOut,
    QuietHours,
}

/// Applies recipient preferences and quiet hours to the requested channels.
/// Critical priority bypasses quiet hours but never an opt-out.
pub fn resolve_channels(
    requested: &[Channel],
    preferences: &NotificationPreferences,
    priority: Priority,
    at: DateTime<Utc>,
) -> BTreeMap<Channel, Resolution> {
    let quiet = priority != Priority::Critical && preferences.in_quiet_hours(at);

    requested
        .iter()
        .map(|channel| {
            let resolution = if !preferences.allows(*channel) {
                Resolution::OptedOut
            } else if quiet && matches!(channel, Channel::Email | Channel::Sms) {
                Resolution::QuietHours
            } else {
                Resolution::Enabled
            };
            (*channel, resolution)
        })
        .collect()
}

/// Truncates to 157 characters plus an ellipsis when the message does not
/// fit in `SHORT_MESSAGE_LIMIT` characters.
pub fn short_message(message: &str) -> String {
    if message.chars().count() <= SHORT_MESSAGE_LIMIT {
        return message.to_string();
    }
    let keep = SHORT_MESSAGE_LIMIT - ELLIPSIS.len();
    let mut short: String = message.chars().take(keep).collect();
    short.push_str(ELLIPSIS);
    short
}

fn content_for(notification: &Notification, channel: Channel) -> Content {
    match channel {
        Channel::Email => Content {
            subject: notification.title.clone(),
            body: notification.message.clone(),
        },
        Channel::Sms => Content {
            subject: String::new(),
            body: notification.short_message.clone(),
        },
        Channel::InApp => Content {
            subject: notification.title.clone(),
            body: notification.short_message.clone(),
        },
    }
}

/// A persisted notification and the delivery jobs started for it.
pub struct Dispatched {
    pub notification: Notification,
    pub deliveries: Vec<DeliveryHandle>,
}

impl Dispatched {
    /// Waits for every delivery job, whatever the outcome of the others.
    pub async fn settle(self) -> Vec<(Channel, DeliveryOutcome)> {
        join_all(self.deliveries.into_iter().map(|handle| async move {
            let channel = handle.channel;
            (channel, handle.outcome().await)
        }))
        .await
    }
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    queues: ChannelQueues,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, queues: ChannelQueues, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            queues,
            clock,
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(recipient_id = %request.recipient_id, kind = ?request.kind)
    )]
    pub async fn create_notification(&self, request: NotificationRequest) -> Result<Dispatched> {
        let recipient = self
            .store
            .recipient(request.recipient_id)
            .await?
            .ok_or_else(|| Error::not_found("recipient", request.recipient_id))?;
        let preferences = self.store.preferences(recipient.id).await?;

        let now = self.clock.now();
        let scheduled_for = request.scheduled_for.filter(|at| *at > now);
        let resolutions = resolve_channels(
            &request.channels,
            &preferences,
            request.priority,
            scheduled_for.unwrap_or(now),
        );

        let channels = resolutions
            .into_iter()
            .map(|(channel, resolution)| {
                let state = match resolution {
                    Resolution::OptedOut => {
                        ChannelState::disabled("recipient disabled this channel", now)
                    }
                    Resolution::QuietHours => {
                        ChannelState::disabled("suppressed during quiet hours", now)
                    }
                    Resolution::Enabled if recipient.destination(channel).is_none() => {
                        ChannelState::disabled(format!("recipient has no {channel} address"), now)
                    }
                    Resolution::Enabled if !self.queues.get(channel).is_configured() => {
                        tracing::warn!(%channel, "channel transport unavailable, disabling");
                        ChannelState::disabled(Error::Configuration(channel).to_string(), now)
                    }
                    Resolution::Enabled => ChannelState::enabled(),
                };
                (channel, state)
            })
            .collect();

        let short = short_message(request.short_message.as_deref().unwrap_or(&request.message));
        let notification = Notification {
            id: Uuid::new_v4(),
            recipient_id: recipient.id,
            kind: request.kind,
            priority: request.priority,
            title: request.title,
            message: request.message,
            short_message: short,
            channels,
            related_student: request.related_student,
            status: NotificationStatus::Pending,
            created_by: request.created_by,
            scheduled_for,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.store.insert_notification(&notification).await?;

        let enabled: Vec<Channel> = notification
            .channels
            .iter()
            .filter(|(_, state)| state.enabled)
            .map(|(channel, _)| *channel)
            .collect();
        let deliveries = self.enqueue(&notification, &recipient, &enabled, scheduled_for);

        tracing::info!(
            notification_id = %notification.id,
            priority = ?notification.priority,
            channels = ?enabled,
            "created notification"
        );
        Ok(Dispatched {
            notification,
            deliveries,
        })
    }

    /// Manually retries every channel that exhausted its retries. Channels
    /// whose job is still running are not touched.
    pub async fn resend(&self, id: Uuid) -> Result<Dispatched> {
        let mut notification = self
            .store
            .notification(id)
            .await?
            .filter(|notification| notification.deleted_at.is_none())
            .ok_or_else(|| Error::not_found("notification", id))?;
        let recipient = self
            .store
            .recipient(notification.recipient_id)
            .await?
            .ok_or_else(|| Error::not_found("recipient", notification.recipient_id))?;

        let channels = notification.reopen_failed_channels();
        notification.updated_at = self.clock.now();
        self.store.update_notification(&notification).await?;

        let deliveries = self.enqueue(&notification, &recipient, &channels, None);
        tracing::info!(notification_id = %id, ?channels, "resending notification");
        Ok(Dispatched {
            notification,
            deliveries,
        })
    }

    /// Re-enqueues channels of pending notifications that were neither
    /// delivered nor given up on, e.g. after a restart.
    pub async fn resume_pending(&self) -> Result<usize> {
        let mut resumed = 0;
        for notification in self.store.pending_notifications().await? {
            let channels = notification.resumable_channels();
            if channels.is_empty() {
                continue;
            }
            let Some(recipient) = self.store.recipient(notification.recipient_id).await? else {
                tracing::warn!(
                    notification_id = %notification.id,
                    "recipient vanished, not resuming"
                );
                continue;
            };
            resumed += self
                .enqueue(
                    &notification,
                    &recipient,
                    &channels,
                    notification.scheduled_for,
                )
                .len();
        }
        if resumed > 0 {
            tracing::info!(jobs = resumed, "resumed pending deliveries");
        }
        Ok(resumed)
    }

    /// Cancels delayed jobs of the notification that no worker has claimed.
    pub fn cancel_scheduled(&self, id: Uuid) -> usize {
        self.queues.cancel_notification(id)
    }

    pub async fn soft_delete(&self, id: Uuid) -> Result<()> {
        let cancelled = self.cancel_scheduled(id);
        if !self.store.soft_delete_notification(id, self.clock.now()).await? {
            return Err(Error::not_found("notification", id));
        }
        tracing::info!(notification_id = %id, cancelled, "soft-deleted notification");
        Ok(())
    }

    fn enqueue(
        &self,
        notification: &Notification,
        recipient: &Recipient,
        channels: &[Channel],
        deliver_at: Option<DateTime<Utc>>,
    ) -> Vec<DeliveryHandle> {
        channels
            .iter()
            .filter_map(|channel| {
                let destination = recipient.destination(*channel)?;
                let job = DeliveryJob {
                    id: Uuid::new_v4(),
                    notification_id: notification.id,
                    channel: *channel,
                    destination,
                    content: content_for(notification, *channel),
                    deliver_at,
                };
                match self.queues.get(*channel).enqueue(job) {
                    Ok(handle) => {
                        tracing::debug!(
                            job_id = %handle.job_id,
                            channel = %handle.channel,
                            notification_id = %notification.id,
                            "delivery enqueued"
                        );
                        Some(handle)
                    }
                    Err(err) => {
                        tracing::warn!(
                            %err,
                            notification_id = %notification.id,
                            "could not enqueue delivery"
                        );
                        None
                    }
                }
            })
            .collect()
    }
}
