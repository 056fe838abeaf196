//! In-memory collaborators and fixtures shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::dispatcher::Clock;
use crate::error::{Error, Result};
use crate::models::{
    AcademicTrend, Channel, ChannelState, DeliveryUpdate, IncomeTier, Notification,
    NotificationKind, NotificationPreferences, NotificationStatus, Priority, RapidIncreaseFlag,
    Recipient, RecipientRole, RiskProfile, RiskSnapshot, Student, StudentSignals, TransportMode,
};
use crate::queue::{ChannelQueues, DeliveryQueue, RetryPolicy};
use crate::store::Store;
use crate::transport::{Content, Receipt, Transport};

#[derive(Default)]
struct State {
    roster: Vec<Uuid>,
    students: HashMap<Uuid, Student>,
    recipients: HashMap<Uuid, Recipient>,
    preferences: HashMap<Uuid, NotificationPreferences>,
    links: HashMap<Uuid, Vec<Uuid>>,
    profiles: HashMap<Uuid, RiskProfile>,
    snapshots: Vec<RiskSnapshot>,
    flags: Vec<RapidIncreaseFlag>,
    notifications: HashMap<Uuid, Notification>,
    // Notification inserts left before every further insert fails.
    insert_budget: Option<usize>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn add_student(&self, student: Student, recipients: &[Uuid]) {
        let mut state = self.state.lock();
        if student.active {
            state.roster.push(student.id);
        }
        state.links.insert(student.id, recipients.to_vec());
        state.students.insert(student.id, student);
    }

    /// Lists a student on the active roster without a backing record.
    pub fn add_dangling_student(&self, id: Uuid) {
        self.state.lock().roster.push(id);
    }

    pub fn add_recipient(&self, recipient: Recipient, preferences: NotificationPreferences) {
        let mut state = self.state.lock();
        state.preferences.insert(recipient.id, preferences);
        state.recipients.insert(recipient.id, recipient);
    }

    pub fn set_signals(&self, student_id: Uuid, signals: StudentSignals) {
        if let Some(student) = self.state.lock().students.get_mut(&student_id) {
            student.signals = signals;
        }
    }

    /// Lets `count` more notification inserts succeed, then fails the rest.
    pub fn fail_notification_inserts_after(&self, count: usize) {
        self.state.lock().insert_budget = Some(count);
    }

    pub fn snapshots(&self) -> Vec<RiskSnapshot> {
        self.state.lock().snapshots.clone()
    }

    pub fn flags(&self) -> Vec<RapidIncreaseFlag> {
        self.state.lock().flags.clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn active_student_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self.state.lock().roster.clone())
    }

    async fn student(&self, id: Uuid) -> Result<Option<Student>> {
        Ok(self.state.lock().students.get(&id).cloned())
    }

    async fn student_by_email(&self, email: &str) -> Result<Option<Student>> {
        Ok(self
            .state
            .lock()
            .students
            .values()
            .find(|student| student.email == email)
            .cloned())
    }

    async fn risk_profile(&self, student_id: Uuid) -> Result<Option<RiskProfile>> {
        Ok(self.state.lock().profiles.get(&student_id).cloned())
    }

    async fn save_risk_profile(&self, profile: &RiskProfile) -> Result<()> {
        self.state
            .lock()
            .profiles
            .insert(profile.student_id, profile.clone());
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &RiskSnapshot) -> Result<()> {
        self.state.lock().snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn snapshots_since(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<RiskSnapshot>> {
        let mut snapshots: Vec<RiskSnapshot> = self
            .state
            .lock()
            .snapshots
            .iter()
            .filter(|s| s.student_id == student_id && s.calculated_at >= since)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.calculated_at);
        Ok(snapshots)
    }

    async fn record_rapid_increase(&self, flag: &RapidIncreaseFlag) -> Result<bool> {
        let mut state = self.state.lock();
        if state.flags.iter().any(|f| f.to_snapshot == flag.to_snapshot) {
            return Ok(false);
        }
        state.flags.push(flag.clone());
        Ok(true)
    }

    async fn recipient(&self, id: Uuid) -> Result<Option<Recipient>> {
        Ok(self.state.lock().recipients.get(&id).cloned())
    }

    async fn recipients_for_student(&self, student_id: Uuid) -> Result<Vec<Recipient>> {
        let state = self.state.lock();
        Ok(state
            .links
            .get(&student_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.recipients.get(id).cloned())
            .collect())
    }

    async fn preferences(&self, recipient_id: Uuid) -> Result<NotificationPreferences> {
        Ok(self
            .state
            .lock()
            .preferences
            .get(&recipient_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        let mut state = self.state.lock();
        match state.insert_budget {
            Some(0) => return Err(Error::Database(sqlx::Error::PoolTimedOut)),
            Some(left) => state.insert_budget = Some(left - 1),
            None => {}
        }
        state
            .notifications
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn notification(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self.state.lock().notifications.get(&id).cloned())
    }

    async fn record_delivery(
        &self,
        id: Uuid,
        channel: Channel,
        update: DeliveryUpdate,
    ) -> Result<Notification> {
        let mut state = self.state.lock();
        let notification = state
            .notifications
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("notification", id))?;
        notification.apply_delivery(channel, update);
        Ok(notification.clone())
    }

    async fn update_notification(&self, notification: &Notification) -> Result<()> {
        self.state
            .lock()
            .notifications
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn pending_notifications(&self) -> Result<Vec<Notification>> {
        Ok(self
            .state
            .lock()
            .notifications
            .values()
            .filter(|n| n.status == NotificationStatus::Pending && n.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn soft_delete_notification(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        match self.state.lock().notifications.get_mut(&id) {
            Some(notification) if notification.deleted_at.is_none() => {
                notification.deleted_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Transport that fails its first `fail_first` sends, then succeeds.
pub struct FakeTransport {
    fail_first: usize,
    calls: AtomicUsize,
    sent: Mutex<Vec<(String, Content)>>,
}

impl FakeTransport {
    pub fn succeeding() -> Self {
        Self::failing_first(0)
    }

    pub fn failing_first(fail_first: usize) -> Self {
        Self {
            fail_first,
            calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent_bodies(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|(_, content)| content.body.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, _job_id: Uuid, destination: &str, content: &Content) -> Result<Receipt> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(Error::Transport("simulated provider outage".to_string()));
        }
        self.sent
            .lock()
            .push((destination.to_string(), content.clone()));
        Ok(Receipt {
            provider_id: format!("fake-{call}"),
        })
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn queues(
    store: Arc<dyn Store>,
    email: Option<Arc<FakeTransport>>,
    sms: Option<Arc<FakeTransport>>,
    in_app: Option<Arc<FakeTransport>>,
) -> ChannelQueues {
    let queue = |channel: Channel, transport: Option<Arc<FakeTransport>>| {
        DeliveryQueue::new(
            channel,
            RetryPolicy::for_channel(channel),
            transport.map(|t| t as Arc<dyn Transport>),
            store.clone(),
            4,
        )
    };
    ChannelQueues {
        email: queue(Channel::Email, email),
        sms: queue(Channel::Sms, sms),
        in_app: queue(Channel::InApp, in_app),
    }
}

pub fn guardian() -> Recipient {
    Recipient {
        id: Uuid::new_v4(),
        full_name: "Jordan Lee".to_string(),
        role: RecipientRole::Guardian,
        email: Some("jordan.lee@example.com".to_string()),
        phone: Some("+15550100".to_string()),
    }
}

pub fn student(signals: StudentSignals) -> Student {
    let id = Uuid::new_v4();
    Student {
        id,
        full_name: "Avery Lee".to_string(),
        email: format!("avery.{}@example.com", id.simple()),
        cohort: "2026".to_string(),
        active: true,
        signals,
    }
}

pub fn notification(channels: &[Channel], priority: Priority) -> Notification {
    let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
    Notification {
        id: Uuid::new_v4(),
        recipient_id: Uuid::new_v4(),
        kind: NotificationKind::RiskEscalation,
        priority,
        title: "Dropout risk escalated".to_string(),
        message: "Risk rose to High.".to_string(),
        short_message: "Risk rose to High.".to_string(),
        channels: channels
            .iter()
            .map(|channel| (*channel, ChannelState::enabled()))
            .collect(),
        related_student: None,
        status: NotificationStatus::Pending,
        created_by: None,
        scheduled_for: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

/// Scores 38: Medium.
pub fn medium_signals() -> StudentSignals {
    StudentSignals {
        attendance_percentage: Some(50.0),
        academic_percentage: Some(30.0),
        ..StudentSignals::default()
    }
}

/// Scores 65: High.
pub fn high_signals() -> StudentSignals {
    StudentSignals {
        attendance_percentage: Some(40.0),
        consecutive_absences: Some(6),
        academic_percentage: Some(20.0),
        failed_subjects: Some(4),
        academic_trend: Some(AcademicTrend::Declining),
        income_tier: Some(IncomeTier::BelowPoverty),
        economic_distress: Some(true),
        parent_low_education: Some(true),
        ..StudentSignals::default()
    }
}

/// Scores 90: Critical.
pub fn critical_signals() -> StudentSignals {
    StudentSignals {
        behavioral_issues: Some(true),
        late_arrivals: Some(12),
        health_issues: Some(true),
        distance_km: Some(12.0),
        transport_mode: Some(TransportMode::Walking),
        family_problems: Some(true),
        sibling_count: Some(5),
        ..high_signals()
    }
}
