use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub cohort: String,
    pub active: bool,
    pub signals: StudentSignals,
}

/// Raw inputs supplied by the student data provider. Every field may be
/// missing; missing fields lower the data completeness of a calculation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudentSignals {
    pub attendance_percentage: Option<f64>,
    pub consecutive_absences: Option<u32>,
    pub academic_percentage: Option<f64>,
    pub failed_subjects: Option<u32>,
    pub academic_trend: Option<AcademicTrend>,
    pub income_tier: Option<IncomeTier>,
    pub economic_distress: Option<bool>,
    pub parent_low_education: Option<bool>,
    pub behavioral_issues: Option<bool>,
    pub late_arrivals: Option<u32>,
    pub dropout_attempts: Option<u32>,
    pub health_issues: Option<bool>,
    pub distance_km: Option<f64>,
    pub transport_mode: Option<TransportMode>,
    pub family_problems: Option<bool>,
    pub sibling_count: Option<u32>,
}

impl StudentSignals {
    pub const FIELD_COUNT: u32 = 16;

    pub fn provided_fields(&self) -> u32 {
        [
            self.attendance_percentage.is_some(),
            self.consecutive_absences.is_some(),
            self.academic_percentage.is_some(),
            self.failed_subjects.is_some(),
            self.academic_trend.is_some(),
            self.income_tier.is_some(),
            self.economic_distress.is_some(),
            self.parent_low_education.is_some(),
            self.behavioral_issues.is_some(),
            self.late_arrivals.is_some(),
            self.dropout_attempts.is_some(),
            self.health_issues.is_some(),
            self.distance_km.is_some(),
            self.transport_mode.is_some(),
            self.family_problems.is_some(),
            self.sibling_count.is_some(),
        ]
        .iter()
        .filter(|provided| **provided)
        .count() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcademicTrend {
    Improving,
    Stable,
    Declining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncomeTier {
    BelowPoverty,
    Low,
    Middle,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Walking,
    Bicycle,
    Bus,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    Attendance,
    Academic,
    Financial,
    Behavioral,
    Health,
    Distance,
    Family,
}

impl Factor {
    pub const ALL: [Factor; 7] = [
        Factor::Attendance,
        Factor::Academic,
        Factor::Financial,
        Factor::Behavioral,
        Factor::Health,
        Factor::Distance,
        Factor::Family,
    ];

    /// Fixed weight of the factor in the total score. Weights sum to 1.0.
    pub fn weight(self) -> f64 {
        match self {
            Factor::Attendance => 0.25,
            Factor::Academic => 0.25,
            Factor::Financial => 0.15,
            Factor::Behavioral => 0.10,
            Factor::Health => 0.10,
            Factor::Distance => 0.10,
            Factor::Family => 0.05,
        }
    }
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Factor::Attendance => "attendance",
            Factor::Academic => "academic",
            Factor::Financial => "financial",
            Factor::Behavioral => "behavioral",
            Factor::Health => "health",
            Factor::Distance => "distance",
            Factor::Family => "family",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub factor: Factor,
    pub score: u32,
    pub weight: f64,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=29 => RiskLevel::Low,
            30..=59 => RiskLevel::Medium,
            60..=79 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    /// Severity ordinal used by the escalation gate.
    pub fn rank(self) -> u8 {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
            RiskLevel::Critical => 3,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
            RiskLevel::Critical => "Critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Worsening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationPriority {
    Urgent,
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: RecommendationPriority,
    pub factor: Option<Factor>,
    pub action: String,
}

/// Current risk of one student: the projection of the latest snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub student_id: Uuid,
    pub total_score: u32,
    pub level: RiskLevel,
    pub factor_scores: BTreeMap<Factor, u32>,
    pub last_calculated_at: DateTime<Utc>,
    pub dropout_probability_band: String,
    pub predicted_timeline: String,
}

/// Immutable record of one risk calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub id: Uuid,
    pub student_id: Uuid,
    pub academic_period: String,
    pub total_score: u32,
    pub level: RiskLevel,
    pub factors: Vec<FactorScore>,
    pub recommendations: Vec<Recommendation>,
    pub trend: Trend,
    pub previous_score: Option<u32>,
    pub percent_change: f64,
    pub data_completeness_percent: u32,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    InApp,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::InApp];
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::InApp => "in_app",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn for_level(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Critical => Priority::Critical,
            RiskLevel::High => Priority::High,
            RiskLevel::Low | RiskLevel::Medium => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RiskEscalation,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Read,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelError {
    pub at: DateTime<Utc>,
    pub message: String,
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub enabled: bool,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub provider_id: Option<String>,
    pub attempts: u32,
    /// Retries were exhausted. Only a manual resend clears this.
    pub failed: bool,
    pub errors: Vec<ChannelError>,
}

impl ChannelState {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            sent: false,
            sent_at: None,
            provider_id: None,
            attempts: 0,
            failed: false,
            errors: Vec::new(),
        }
    }

    pub fn disabled(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            enabled: false,
            errors: vec![ChannelError {
                at,
                message: reason.into(),
                terminal: true,
            }],
            ..Self::enabled()
        }
    }
}

/// Outcome of one delivery attempt, as reported by a channel worker.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryUpdate {
    Sent {
        at: DateTime<Utc>,
        provider_id: String,
    },
    Failed {
        at: DateTime<Utc>,
        error: String,
        terminal: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub kind: NotificationKind,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub short_message: String,
    pub channels: BTreeMap<Channel, ChannelState>,
    pub related_student: Option<Uuid>,
    pub status: NotificationStatus,
    pub created_by: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Applies a worker's delivery report. Returns false when the report was
    /// ignored because the channel is disabled or already sent.
    pub fn apply_delivery(&mut self, channel: Channel, update: DeliveryUpdate) -> bool {
        let Some(state) = self.channels.get_mut(&channel) else {
            return false;
        };
        if !state.enabled || state.sent {
            return false;
        }

        let at = match update {
            DeliveryUpdate::Sent { at, provider_id } => {
                state.attempts += 1;
                state.sent = true;
                state.sent_at = Some(at);
                state.provider_id = Some(provider_id);
                state.failed = false;
                at
            }
            DeliveryUpdate::Failed {
                at,
                error,
                terminal,
            } => {
                state.attempts += 1;
                state.failed = terminal;
                state.errors.push(ChannelError {
                    at,
                    message: error,
                    terminal,
                });
                at
            }
        };

        self.updated_at = at;
        self.refresh_status();
        true
    }

    /// Sent only once every enabled channel has delivered. A read
    /// notification stays read.
    pub fn refresh_status(&mut self) {
        if self.status == NotificationStatus::Read {
            return;
        }
        let mut enabled = self.channels.values().filter(|state| state.enabled).peekable();
        let all_sent = enabled.peek().is_some() && enabled.all(|state| state.sent);
        self.status = if all_sent {
            NotificationStatus::Sent
        } else {
            NotificationStatus::Pending
        };
    }

    /// Enabled channels that have neither delivered nor given up.
    pub fn resumable_channels(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .filter(|(_, state)| state.enabled && !state.sent && !state.failed)
            .map(|(channel, _)| *channel)
            .collect()
    }

    /// Clears the terminal flag on every channel that gave up, so that a
    /// manual resend can retry it. Channels still being retried are left to
    /// their running job. The error log is kept.
    pub fn reopen_failed_channels(&mut self) -> Vec<Channel> {
        let mut reopened = Vec::new();
        for (channel, state) in self.channels.iter_mut() {
            if state.enabled && !state.sent && state.failed {
                state.failed = false;
                reopened.push(*channel);
            }
        }
        reopened
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    /// The window is half-open, `[start, end)`, and wraps midnight when
    /// `start > end`. An empty window (`start == end`) never matches.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPreferences {
    pub email: bool,
    pub sms: bool,
    pub in_app: bool,
    pub quiet_hours: Option<QuietHours>,
    pub timezone: Tz,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            email: true,
            sms: true,
            in_app: true,
            quiet_hours: None,
            timezone: Tz::UTC,
        }
    }
}

impl NotificationPreferences {
    pub fn allows(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.email,
            Channel::Sms => self.sms,
            Channel::InApp => self.in_app,
        }
    }

    pub fn in_quiet_hours(&self, at: DateTime<Utc>) -> bool {
        self.quiet_hours
            .map(|window| window.contains(at.with_timezone(&self.timezone).time()))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRole {
    Guardian,
    Teacher,
    Counselor,
    Administrator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,
    pub full_name: String,
    pub role: RecipientRole,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Recipient {
    /// Address a transport delivers to. In-app messages go to the
    /// recipient's own inbox.
    pub fn destination(&self, channel: Channel) -> Option<String> {
        match channel {
            Channel::Email => self.email.clone().filter(|email| !email.is_empty()),
            Channel::Sms => self.phone.clone().filter(|phone| !phone.is_empty()),
            Channel::InApp => Some(self.id.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RapidIncreaseFlag {
    pub student_id: Uuid,
    pub from_snapshot: Uuid,
    pub to_snapshot: Uuid,
    pub from_score: u32,
    pub to_score: u32,
    pub days_between: i64,
    pub detected_at: DateTime<Utc>,
}

impl RapidIncreaseFlag {
    pub fn delta(&self) -> i64 {
        i64::from(self.to_score) - i64::from(self.from_score)
    }
}
