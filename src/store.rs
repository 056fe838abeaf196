use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Channel, DeliveryUpdate, Notification, NotificationPreferences, RapidIncreaseFlag, Recipient,
    RiskProfile, RiskSnapshot, Student,
};

/// Document store holding students, risk history, recipients and
/// notifications. Each pipeline step owns the records it writes.
#[async_trait]
pub trait Store: Send + Sync {
    async fn active_student_ids(&self) -> Result<Vec<Uuid>>;

    async fn student(&self, id: Uuid) -> Result<Option<Student>>;

    async fn student_by_email(&self, email: &str) -> Result<Option<Student>>;

    async fn risk_profile(&self, student_id: Uuid) -> Result<Option<RiskProfile>>;

    /// Overwrites the current profile of the student.
    async fn save_risk_profile(&self, profile: &RiskProfile) -> Result<()>;

    async fn insert_snapshot(&self, snapshot: &RiskSnapshot) -> Result<()>;

    /// Snapshots calculated at or after `since`, oldest first.
    async fn snapshots_since(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<RiskSnapshot>>;

    /// Returns false if a flag for the same later snapshot already exists.
    async fn record_rapid_increase(&self, flag: &RapidIncreaseFlag) -> Result<bool>;

    async fn recipient(&self, id: Uuid) -> Result<Option<Recipient>>;

    /// Guardians and staff who are alerted about the student.
    async fn recipients_for_student(&self, student_id: Uuid) -> Result<Vec<Recipient>>;

    /// Stored preferences, or the defaults when the recipient never set any.
    async fn preferences(&self, recipient_id: Uuid) -> Result<NotificationPreferences>;

    async fn insert_notification(&self, notification: &Notification) -> Result<()>;

    async fn notification(&self, id: Uuid) -> Result<Option<Notification>>;

    /// Applies a worker's report to one channel entry atomically and returns
    /// the updated notification.
    async fn record_delivery(
        &self,
        id: Uuid,
        channel: Channel,
        update: DeliveryUpdate,
    ) -> Result<Notification>;

    /// Replaces a notification document wholesale. Used by manual resend.
    async fn update_notification(&self, notification: &Notification) -> Result<()>;

    /// Pending notifications that have not been deleted.
    async fn pending_notifications(&self) -> Result<Vec<Notification>>;

    async fn soft_delete_notification(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;
}
