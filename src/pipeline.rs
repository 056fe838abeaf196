//! One student's recalculation: aggregate, combine, detect, dispatch.
//!
//! The previous profile is read before anything is computed and the new
//! profile is written last, all under a per-student lock, so concurrent
//! recalculations of the same student cannot lose an escalation or send
//! it twice.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::dispatcher::{Clock, Dispatcher, NotificationRequest};
use crate::error::{Error, Result};
use crate::escalation;
use crate::factors;
use crate::models::{
    Channel, NotificationKind, Priority, Recipient, RiskLevel, RiskProfile, RiskSnapshot,
    Student,
};
use crate::risk;
use crate::store::Store;

const ALERT_RECOMMENDATION_COUNT: usize = 3;
const PIPELINE_AUTHOR: &str = "risk-pipeline";

#[derive(Default)]
pub struct StudentLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl StudentLocks {
    pub async fn lock(&self, student_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().entry(student_id).or_default().clone();
        lock.lock_owned().await
    }
}

/// Scores one student against the previous profile. Pure: nothing is
/// persisted.
pub fn build_snapshot(
    student: &Student,
    previous: Option<&RiskProfile>,
    academic_period: String,
    at: DateTime<Utc>,
) -> RiskSnapshot {
    let aggregate = factors::aggregate(&student.signals);
    if !aggregate.rejected.is_empty() {
        tracing::info!(
            student_id = %student.id,
            rejected = aggregate.rejected.len(),
            "scored with malformed signals treated as missing"
        );
    }
    let assessment = risk::assess(&aggregate);
    let previous_score = previous.map(|profile| profile.total_score);

    RiskSnapshot {
        id: Uuid::new_v4(),
        student_id: student.id,
        academic_period,
        total_score: assessment.total_score,
        level: assessment.level,
        factors: aggregate.factors,
        recommendations: assessment.recommendations,
        trend: escalation::trend(previous_score, assessment.total_score),
        previous_score,
        percent_change: escalation::percent_change(previous_score, assessment.total_score),
        data_completeness_percent: aggregate.data_completeness_percent,
        calculated_at: at,
    }
}

pub fn escalation_request(
    student: &Student,
    snapshot: &RiskSnapshot,
    previous_level: Option<RiskLevel>,
    recipient_id: Uuid,
) -> NotificationRequest {
    let band = risk::timeline_band(snapshot.total_score);
    let actions: Vec<&str> = snapshot
        .recommendations
        .iter()
        .take(ALERT_RECOMMENDATION_COUNT)
        .map(|recommendation| recommendation.action.as_str())
        .collect();
    let from = previous_level.unwrap_or(RiskLevel::Low);

    NotificationRequest {
        recipient_id,
        kind: NotificationKind::RiskEscalation,
        priority: Priority::for_level(snapshot.level),
        title: format!(
            "Dropout risk alert: {} is now at {} risk",
            student.full_name, snapshot.level
        ),
        message: format!(
            "{}'s dropout risk rose from {} to {} (score {}/100, likely timeline {}). \
             Recommended: {}.",
            student.full_name,
            from,
            snapshot.level,
            snapshot.total_score,
            band.timeline,
            actions.join("; ")
        ),
        short_message: Some(format!(
            "{}: dropout risk now {} ({}/100). Please contact the school.",
            student.full_name, snapshot.level, snapshot.total_score
        )),
        related_student: Some(student.id),
        channels: Channel::ALL.to_vec(),
        created_by: Some(PIPELINE_AUTHOR.to_string()),
        scheduled_for: None,
    }
}

#[derive(Debug, Clone)]
pub struct Recalculation {
    pub snapshot: RiskSnapshot,
    pub previous_level: Option<RiskLevel>,
    pub escalated: bool,
    pub notifications: Vec<Uuid>,
    /// Recipients whose notification could not be created.
    pub failed_recipients: usize,
}

/// Notifications created for one escalation.
#[derive(Debug, Default)]
struct Fanout {
    created: Vec<Uuid>,
    failed: usize,
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    locks: StudentLocks,
    academic_period: Option<String>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<Dispatcher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            locks: StudentLocks::default(),
            academic_period: None,
        }
    }

    /// Pins the academic period instead of deriving it from the date.
    pub fn with_academic_period(mut self, academic_period: Option<String>) -> Self {
        self.academic_period = academic_period;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn period(&self, at: DateTime<Utc>) -> String {
        self.academic_period
            .clone()
            .unwrap_or_else(|| risk::academic_period(at))
    }

    /// Scores a student without persisting or alerting.
    pub async fn preview(&self, student: &Student) -> Result<RiskSnapshot> {
        let previous = self.store.risk_profile(student.id).await?;
        let now = self.clock.now();
        Ok(build_snapshot(
            student,
            previous.as_ref(),
            self.period(now),
            now,
        ))
    }

    #[tracing::instrument(skip(self))]
    pub async fn recalculate(&self, student_id: Uuid) -> Result<Recalculation> {
        let _guard = self.locks.lock(student_id).await;

        let previous = self.store.risk_profile(student_id).await?;
        let student = self
            .store
            .student(student_id)
            .await?
            .ok_or_else(|| Error::not_found("student", student_id))?;

        let now = self.clock.now();
        let snapshot = build_snapshot(&student, previous.as_ref(), self.period(now), now);
        let previous_level = previous.as_ref().map(|profile| profile.level);
        let escalated = escalation::should_escalate(previous_level, snapshot.level);

        // Everything that can fail before anyone is alerted happens first:
        // once the first notification exists the profile must be written.
        let recipients = if escalated {
            self.store.recipients_for_student(student_id).await?
        } else {
            Vec::new()
        };
        self.store.insert_snapshot(&snapshot).await?;

        let fanout = if escalated {
            self.alert(&student, &snapshot, previous_level, recipients).await
        } else {
            Fanout::default()
        };

        self.store
            .save_risk_profile(&risk::profile_from_snapshot(&snapshot))
            .await?;

        tracing::debug!(
            score = snapshot.total_score,
            level = %snapshot.level,
            trend = ?snapshot.trend,
            completeness = snapshot.data_completeness_percent,
            escalated,
            "recalculated risk"
        );
        Ok(Recalculation {
            snapshot,
            previous_level,
            escalated,
            notifications: fanout.created,
            failed_recipients: fanout.failed,
        })
    }

    /// One notification per recipient. A recipient that cannot be notified
    /// is logged and counted; the others are still alerted.
    async fn alert(
        &self,
        student: &Student,
        snapshot: &RiskSnapshot,
        previous_level: Option<RiskLevel>,
        recipients: Vec<Recipient>,
    ) -> Fanout {
        if recipients.is_empty() {
            tracing::warn!(
                student_id = %student.id,
                level = %snapshot.level,
                "risk escalated but nobody is subscribed"
            );
        }

        let mut fanout = Fanout::default();
        for recipient in recipients {
            let request = escalation_request(student, snapshot, previous_level, recipient.id);
            match self.dispatcher.create_notification(request).await {
                Ok(dispatched) => fanout.created.push(dispatched.notification.id),
                Err(err) => {
                    fanout.failed += 1;
                    tracing::error!(
                        %err,
                        student_id = %student.id,
                        recipient_id = %recipient.id,
                        "could not alert escalation recipient"
                    );
                }
            }
        }

        tracing::info!(
            student_id = %student.id,
            from = ?previous_level,
            to = %snapshot.level,
            notifications = fanout.created.len(),
            failed = fanout.failed,
            "risk escalated"
        );
        fanout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Factor, NotificationPreferences, StudentSignals};
    use crate::testing::{
        self, critical_signals, high_signals, medium_signals, FakeTransport, FixedClock,
        MemoryStore,
    };
    use chrono::TimeZone;

    fn setup() -> (Arc<MemoryStore>, Pipeline) {
        let store = Arc::new(MemoryStore::default());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap(),
        ));
        let queues = testing::queues(
            store.clone(),
            Some(Arc::new(FakeTransport::succeeding())),
            Some(Arc::new(FakeTransport::succeeding())),
            Some(Arc::new(FakeTransport::succeeding())),
        );
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), queues, clock.clone()));
        let pipeline = Pipeline::new(store.clone(), dispatcher, clock);
        (store, pipeline)
    }

    fn enroll(store: &MemoryStore, signals: StudentSignals) -> Uuid {
        let guardian = testing::guardian();
        store.add_recipient(guardian.clone(), NotificationPreferences::default());
        let student = testing::student(signals);
        let id = student.id;
        store.add_student(student, &[guardian.id]);
        id
    }

    #[tokio::test]
    async fn medium_to_critical_alerts_once() {
        let (store, pipeline) = setup();
        let id = enroll(&store, medium_signals());

        let first = pipeline.recalculate(id).await.unwrap();
        assert_eq!(first.snapshot.total_score, 38);
        assert_eq!(first.snapshot.level, RiskLevel::Medium);
        // A first calculation above Low counts as an escalation from Low.
        assert!(first.escalated);

        store.set_signals(id, critical_signals());
        let second = pipeline.recalculate(id).await.unwrap();
        assert_eq!(second.snapshot.level, RiskLevel::Critical);
        assert_eq!(second.previous_level, Some(RiskLevel::Medium));
        assert!(second.escalated);
        assert_eq!(second.notifications.len(), 1);
        assert_eq!(second.snapshot.trend, crate::models::Trend::Worsening);
        assert_eq!(second.snapshot.previous_score, Some(38));

        let repeat = pipeline.recalculate(id).await.unwrap();
        assert!(!repeat.escalated);
        assert!(repeat.notifications.is_empty());

        assert_eq!(store.notifications().len(), 2);
        assert_eq!(store.snapshots().len(), 3);
        let profile = store.risk_profile(id).await.unwrap().unwrap();
        assert_eq!(profile.level, RiskLevel::Critical);
        assert_eq!(profile.predicted_timeline, "1-3 months");
    }

    #[tokio::test]
    async fn low_to_high_alerts_exactly_once() {
        let (store, pipeline) = setup();
        let id = enroll(&store, StudentSignals::default());

        let low = pipeline.recalculate(id).await.unwrap();
        assert_eq!(low.snapshot.level, RiskLevel::Low);
        assert!(!low.escalated);

        store.set_signals(id, high_signals());
        let high = pipeline.recalculate(id).await.unwrap();
        assert_eq!(high.snapshot.level, RiskLevel::High);
        assert_eq!(high.notifications.len(), 1);

        let notification = &store.notifications()[0];
        assert_eq!(notification.priority, Priority::High);
        assert_eq!(notification.related_student, Some(id));
        assert!(notification.title.contains("High"));
    }

    #[tokio::test]
    async fn decreases_never_alert() {
        let (store, pipeline) = setup();
        let id = enroll(&store, critical_signals());
        pipeline.recalculate(id).await.unwrap();

        store.set_signals(id, medium_signals());
        let lower = pipeline.recalculate(id).await.unwrap();
        assert!(!lower.escalated);
        assert_eq!(lower.snapshot.trend, crate::models::Trend::Improving);
        assert_eq!(store.notifications().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_recalculations_of_one_student_alert_once() {
        let (store, pipeline) = setup();
        let id = enroll(&store, high_signals());
        let pipeline = Arc::new(pipeline);

        let runs = (0..8).map(|_| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.recalculate(id).await })
        });
        let results = futures::future::join_all(runs).await;

        let escalations = results
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(|run| run.escalated)
            .count();
        assert_eq!(escalations, 1);
        assert_eq!(store.notifications().len(), 1);
    }

    #[tokio::test]
    async fn a_failed_recipient_does_not_block_the_profile_update() {
        let (store, pipeline) = setup();
        let first = testing::guardian();
        let second = testing::guardian();
        store.add_recipient(first.clone(), NotificationPreferences::default());
        store.add_recipient(second.clone(), NotificationPreferences::default());
        let student = testing::student(high_signals());
        let id = student.id;
        store.add_student(student, &[first.id, second.id]);
        store.fail_notification_inserts_after(1);

        let run = pipeline.recalculate(id).await.unwrap();
        assert!(run.escalated);
        assert_eq!(run.notifications.len(), 1);
        assert_eq!(run.failed_recipients, 1);
        let profile = store.risk_profile(id).await.unwrap().unwrap();
        assert_eq!(profile.level, RiskLevel::High);

        let again = pipeline.recalculate(id).await.unwrap();
        assert!(!again.escalated);
        assert_eq!(again.snapshot.previous_score, Some(65));
        assert_eq!(store.notifications().len(), 1);
        assert_eq!(store.snapshots().len(), 2);
    }

    #[tokio::test]
    async fn unknown_students_are_not_found() {
        let (_store, pipeline) = setup();
        let err = pipeline.recalculate(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "student", .. }));
    }

    #[tokio::test]
    async fn stored_snapshots_keep_rejected_signals() {
        let (store, pipeline) = setup();
        let id = enroll(
            &store,
            StudentSignals {
                attendance_percentage: Some(130.0),
                ..medium_signals()
            },
        );

        pipeline.recalculate(id).await.unwrap();
        let snapshots = store.snapshots();
        let attendance = snapshots[0]
            .factors
            .iter()
            .find(|score| score.factor == Factor::Attendance)
            .unwrap();
        assert_eq!(
            attendance.details["rejected"],
            serde_json::json!(["130 is not a percentage"])
        );
    }

    #[tokio::test]
    async fn preview_does_not_persist() {
        let (store, pipeline) = setup();
        let student = testing::student(high_signals());
        let snapshot = pipeline.preview(&student).await.unwrap();
        assert_eq!(snapshot.level, RiskLevel::High);
        assert_eq!(snapshot.academic_period, "2025-2026");
        assert!(store.snapshots().is_empty());
    }

    #[test]
    fn escalation_message_fits_the_sms_limit() {
        let student = testing::student(critical_signals());
        let snapshot = build_snapshot(
            &student,
            None,
            "2025-2026".to_string(),
            Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap(),
        );
        let request =
            escalation_request(&student, &snapshot, Some(RiskLevel::Medium), Uuid::new_v4());
        assert_eq!(request.priority, Priority::Critical);
        assert!(request.message.contains("from Medium to Critical"));
        assert!(request.short_message.unwrap().chars().count() <= 160);
    }
}
