use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    AcademicTrend, Channel, DeliveryUpdate, IncomeTier, Notification, NotificationPreferences,
    NotificationStatus, QuietHours, RapidIncreaseFlag, Recipient, RecipientRole, RiskProfile,
    RiskSnapshot, Student, StudentSignals, TransportMode,
};
use crate::store::Store;
use crate::transport::{Content, Receipt, Transport};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Serialized form of a unit enum, e.g. `RecipientRole::Guardian` -> "guardian".
fn label<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(label) => Ok(label),
        other => Ok(other.to_string()),
    }
}

fn from_label<T: DeserializeOwned>(label: String) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(label))?)
}

fn doc<T: DeserializeOwned>(row: &PgRow) -> Result<T> {
    let Json(value) = row.try_get::<Json<T>, _>("doc")?;
    Ok(value)
}

fn student_from_row(row: &PgRow) -> Result<Student> {
    let Json(signals) = row.try_get::<Json<StudentSignals>, _>("signals")?;
    Ok(Student {
        id: row.try_get("id")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        cohort: row.try_get("cohort")?,
        active: row.try_get("active")?,
        signals,
    })
}

fn recipient_from_row(row: &PgRow) -> Result<Recipient> {
    Ok(Recipient {
        id: row.try_get("id")?,
        full_name: row.try_get("full_name")?,
        role: from_label(row.try_get("role")?)?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
    })
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_notification(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Notification> {
        let row = sqlx::query(
            "SELECT doc FROM dropout_alerts.notifications WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| Error::not_found("notification", id))?;
        doc(&row)
    }

    async fn write_notification<'e, E>(executor: E, notification: &Notification) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO dropout_alerts.notifications
            (id, recipient_id, status, created_at, deleted_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, deleted_at = EXCLUDED.deleted_at, doc = EXCLUDED.doc
            "#,
        )
        .bind(notification.id)
        .bind(notification.recipient_id)
        .bind(label(&notification.status)?)
        .bind(notification.created_at)
        .bind(notification.deleted_at)
        .bind(Json(notification))
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn active_student_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT id FROM dropout_alerts.students WHERE active ORDER BY full_name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("id").map_err(Error::from))
            .collect()
    }

    async fn student(&self, id: Uuid) -> Result<Option<Student>> {
        sqlx::query(
            "SELECT id, full_name, email, cohort, active, signals \
             FROM dropout_alerts.students WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(student_from_row)
        .transpose()
    }

    async fn student_by_email(&self, email: &str) -> Result<Option<Student>> {
        sqlx::query(
            "SELECT id, full_name, email, cohort, active, signals \
             FROM dropout_alerts.students WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(student_from_row)
        .transpose()
    }

    async fn risk_profile(&self, student_id: Uuid) -> Result<Option<RiskProfile>> {
        sqlx::query("SELECT doc FROM dropout_alerts.risk_profiles WHERE student_id = $1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(doc)
            .transpose()
    }

    async fn save_risk_profile(&self, profile: &RiskProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dropout_alerts.risk_profiles (student_id, doc, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (student_id) DO UPDATE
            SET doc = EXCLUDED.doc, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(profile.student_id)
        .bind(Json(profile))
        .bind(profile.last_calculated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &RiskSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dropout_alerts.risk_snapshots (id, student_id, calculated_at, doc)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.student_id)
        .bind(snapshot.calculated_at)
        .bind(Json(snapshot))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn snapshots_since(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<RiskSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM dropout_alerts.risk_snapshots
            WHERE student_id = $1 AND calculated_at >= $2
            ORDER BY calculated_at
            "#,
        )
        .bind(student_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(doc).collect()
    }

    async fn record_rapid_increase(&self, flag: &RapidIncreaseFlag) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO dropout_alerts.rapid_increase_flags
            (to_snapshot, student_id, detected_at, doc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (to_snapshot) DO NOTHING
            "#,
        )
        .bind(flag.to_snapshot)
        .bind(flag.student_id)
        .bind(flag.detected_at)
        .bind(Json(flag))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn recipient(&self, id: Uuid) -> Result<Option<Recipient>> {
        sqlx::query(
            "SELECT id, full_name, role, email, phone FROM dropout_alerts.recipients WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(recipient_from_row)
        .transpose()
    }

    async fn recipients_for_student(&self, student_id: Uuid) -> Result<Vec<Recipient>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.full_name, r.role, r.email, r.phone
            FROM dropout_alerts.recipients r
            JOIN dropout_alerts.student_recipients sr ON sr.recipient_id = r.id
            WHERE sr.student_id = $1
            ORDER BY r.full_name
            "#,
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(recipient_from_row).collect()
    }

    async fn preferences(&self, recipient_id: Uuid) -> Result<NotificationPreferences> {
        let stored = sqlx::query(
            "SELECT doc FROM dropout_alerts.notification_preferences WHERE recipient_id = $1",
        )
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await?;
        match stored {
            Some(row) => doc(&row),
            None => Ok(NotificationPreferences::default()),
        }
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        Self::write_notification(&self.pool, notification).await
    }

    async fn notification(&self, id: Uuid) -> Result<Option<Notification>> {
        sqlx::query("SELECT doc FROM dropout_alerts.notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(doc)
            .transpose()
    }

    async fn record_delivery(
        &self,
        id: Uuid,
        channel: Channel,
        update: DeliveryUpdate,
    ) -> Result<Notification> {
        let mut tx = self.pool.begin().await?;
        let mut notification = Self::lock_notification(&mut tx, id).await?;
        if notification.apply_delivery(channel, update) {
            Self::write_notification(&mut *tx, &notification).await?;
        }
        tx.commit().await?;
        Ok(notification)
    }

    async fn update_notification(&self, notification: &Notification) -> Result<()> {
        Self::write_notification(&self.pool, notification).await
    }

    async fn pending_notifications(&self) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM dropout_alerts.notifications
            WHERE status = $1 AND deleted_at IS NULL
            ORDER BY created_at
            "#,
        )
        .bind(label(&NotificationStatus::Pending)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(doc).collect()
    }

    async fn soft_delete_notification(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let mut notification = match Self::lock_notification(&mut tx, id).await {
            Ok(notification) => notification,
            Err(Error::NotFound { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };
        if notification.deleted_at.is_some() {
            return Ok(false);
        }
        notification.deleted_at = Some(at);
        notification.updated_at = at;
        Self::write_notification(&mut *tx, &notification).await?;
        tx.commit().await?;
        Ok(true)
    }
}

/// In-app transport: drops the message into the recipient's inbox table.
/// Replaying the same job returns the message written the first time.
pub struct PgInbox {
    pool: PgPool,
}

impl PgInbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Transport for PgInbox {
    async fn send(&self, job_id: Uuid, destination: &str, content: &Content) -> Result<Receipt> {
        let recipient_id = Uuid::parse_str(destination).map_err(|err| Error::Validation {
            field: "destination",
            reason: err.to_string(),
        })?;

        let message_id: Uuid = sqlx::query(
            r#"
            INSERT INTO dropout_alerts.in_app_messages (id, recipient_id, job_id, subject, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id) DO UPDATE SET job_id = EXCLUDED.job_id
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(recipient_id)
        .bind(job_id)
        .bind(&content.subject)
        .bind(&content.body)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| Error::Transport(err.to_string()))?
        .try_get("id")?;

        Ok(Receipt {
            provider_id: message_id.to_string(),
        })
    }
}

async fn upsert_student(
    pool: &PgPool,
    full_name: &str,
    email: &str,
    cohort: &str,
    signals: &StudentSignals,
) -> anyhow::Result<Uuid> {
    let id = sqlx::query(
        r#"
        INSERT INTO dropout_alerts.students (id, full_name, email, cohort, signals)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (email) DO UPDATE
        SET full_name = EXCLUDED.full_name, cohort = EXCLUDED.cohort,
            signals = EXCLUDED.signals, updated_at = now()
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(full_name)
    .bind(email)
    .bind(cohort)
    .bind(Json(signals))
    .fetch_one(pool)
    .await?
    .try_get("id")?;
    Ok(id)
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let students = vec![
        (
            "Avery Lee",
            "avery.lee@groupscholar.com",
            "2026",
            StudentSignals {
                attendance_percentage: Some(50.0),
                academic_percentage: Some(30.0),
                ..StudentSignals::default()
            },
        ),
        (
            "Jules Moreno",
            "jules.moreno@groupscholar.com",
            "2025",
            StudentSignals {
                attendance_percentage: Some(68.0),
                consecutive_absences: Some(6),
                academic_percentage: Some(45.0),
                failed_subjects: Some(3),
                academic_trend: Some(AcademicTrend::Declining),
                income_tier: Some(IncomeTier::BelowPoverty),
                economic_distress: Some(true),
                late_arrivals: Some(7),
                distance_km: Some(9.5),
                transport_mode: Some(TransportMode::Walking),
                ..StudentSignals::default()
            },
        ),
        (
            "Kiara Patel",
            "kiara.patel@groupscholar.com",
            "2026",
            StudentSignals {
                attendance_percentage: Some(96.0),
                consecutive_absences: Some(0),
                academic_percentage: Some(88.0),
                failed_subjects: Some(0),
                academic_trend: Some(AcademicTrend::Improving),
                income_tier: Some(IncomeTier::Middle),
                transport_mode: Some(TransportMode::Bus),
                ..StudentSignals::default()
            },
        ),
    ];

    let recipients = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "Morgan Lee",
            RecipientRole::Guardian,
            Some("morgan.lee@example.com"),
            Some("+15550101"),
            "avery.lee@groupscholar.com",
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "Rosa Moreno",
            RecipientRole::Guardian,
            None,
            Some("+15550102"),
            "jules.moreno@groupscholar.com",
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "Dana Whitfield",
            RecipientRole::Counselor,
            Some("dana.whitfield@groupscholar.com"),
            None,
            "kiara.patel@groupscholar.com",
        ),
    ];

    let mut student_ids = std::collections::HashMap::new();
    for (name, email, cohort, signals) in &students {
        let id = upsert_student(pool, name, email, cohort, signals).await?;
        student_ids.insert(*email, id);
    }

    let counselor_id = recipients
        .iter()
        .find(|recipient| recipient.2 == RecipientRole::Counselor)
        .map(|recipient| recipient.0)
        .context("seed data has no counselor")?;

    for (id, name, role, email, phone, student_email) in recipients {
        sqlx::query(
            r#"
            INSERT INTO dropout_alerts.recipients (id, full_name, role, email, phone)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET full_name = EXCLUDED.full_name, role = EXCLUDED.role,
                email = EXCLUDED.email, phone = EXCLUDED.phone
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(label(&role)?)
        .bind(email)
        .bind(phone)
        .execute(pool)
        .await?;

        let student_id = student_ids
            .get(student_email)
            .copied()
            .context("seed recipient references an unknown student")?;
        link_recipient(pool, student_id, id).await?;
    }

    // The counselor follows the whole seeded roster, outside office hours
    // only by email.
    for student_id in student_ids.values() {
        link_recipient(pool, *student_id, counselor_id).await?;
    }
    let counselor_preferences = NotificationPreferences {
        sms: false,
        quiet_hours: Some(QuietHours {
            start: NaiveTime::from_hms_opt(21, 0, 0).context("invalid time")?,
            end: NaiveTime::from_hms_opt(7, 0, 0).context("invalid time")?,
        }),
        timezone: chrono_tz::America::Chicago,
        ..NotificationPreferences::default()
    };
    sqlx::query(
        r#"
        INSERT INTO dropout_alerts.notification_preferences (recipient_id, doc)
        VALUES ($1, $2)
        ON CONFLICT (recipient_id) DO UPDATE SET doc = EXCLUDED.doc
        "#,
    )
    .bind(counselor_id)
    .bind(Json(&counselor_preferences))
    .execute(pool)
    .await?;

    Ok(())
}

async fn link_recipient(pool: &PgPool, student_id: Uuid, recipient_id: Uuid) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO dropout_alerts.student_recipients (student_id, recipient_id)
        VALUES ($1, $2)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(student_id)
    .bind(recipient_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// One student per row. Empty signal cells are treated as missing data.
#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    full_name: String,
    email: String,
    cohort: String,
    attendance_percentage: Option<f64>,
    consecutive_absences: Option<u32>,
    academic_percentage: Option<f64>,
    failed_subjects: Option<u32>,
    academic_trend: Option<AcademicTrend>,
    income_tier: Option<IncomeTier>,
    economic_distress: Option<bool>,
    parent_low_education: Option<bool>,
    behavioral_issues: Option<bool>,
    late_arrivals: Option<u32>,
    dropout_attempts: Option<u32>,
    health_issues: Option<bool>,
    distance_km: Option<f64>,
    transport_mode: Option<TransportMode>,
    family_problems: Option<bool>,
    sibling_count: Option<u32>,
}

impl CsvRow {
    fn signals(&self) -> StudentSignals {
        StudentSignals {
            attendance_percentage: self.attendance_percentage,
            consecutive_absences: self.consecutive_absences,
            academic_percentage: self.academic_percentage,
            failed_subjects: self.failed_subjects,
            academic_trend: self.academic_trend,
            income_tier: self.income_tier,
            economic_distress: self.economic_distress,
            parent_low_education: self.parent_low_education,
            behavioral_issues: self.behavioral_issues,
            late_arrivals: self.late_arrivals,
            dropout_attempts: self.dropout_attempts,
            health_issues: self.health_issues,
            distance_km: self.distance_km,
            transport_mode: self.transport_mode,
            family_problems: self.family_problems,
            sibling_count: self.sibling_count,
        }
    }
}

fn read_signal_rows<R: std::io::Read>(reader: R) -> anyhow::Result<Vec<CsvRow>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        rows.push(result.with_context(|| format!("invalid signal row {}", line + 1))?);
    }
    Ok(rows)
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let rows = read_signal_rows(file)?;

    for row in &rows {
        upsert_student(pool, &row.full_name, &row.email, &row.cohort, &row.signals()).await?;
    }

    Ok(rows.len())
}
