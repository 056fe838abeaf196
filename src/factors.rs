//! Rule tables for the seven risk factors.
//!
//! Every rule is an ordered table of tiers evaluated by [`lookup`]: the first
//! tier whose threshold matches wins, and a table may carry a fallback for
//! values matching no tier. Missing signals contribute nothing to a factor
//! and lower the data completeness of the calculation instead.

use serde_json::json;

use crate::error::Error;
use crate::models::{
    AcademicTrend, Factor, FactorScore, IncomeTier, StudentSignals, TransportMode,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cmp {
    AtLeast,
    Above,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tier {
    pub cmp: Cmp,
    pub threshold: f64,
    pub points: i32,
}

const fn at_least(threshold: f64, points: i32) -> Tier {
    Tier {
        cmp: Cmp::AtLeast,
        threshold,
        points,
    }
}

const fn above(threshold: f64, points: i32) -> Tier {
    Tier {
        cmp: Cmp::Above,
        threshold,
        points,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Table {
    pub tiers: &'static [Tier],
    pub fallback: i32,
}

pub const ATTENDANCE: Table = Table {
    tiers: &[
        at_least(95.0, 0),
        at_least(85.0, 15),
        at_least(75.0, 35),
        at_least(50.0, 60),
    ],
    fallback: 85,
};

pub const CONSECUTIVE_ABSENCES: Table = Table {
    tiers: &[at_least(5.0, 15), at_least(3.0, 8)],
    fallback: 0,
};

pub const ACADEMIC: Table = Table {
    tiers: &[
        at_least(75.0, 0),
        at_least(60.0, 20),
        at_least(50.0, 40),
        at_least(40.0, 60),
        at_least(33.0, 75),
    ],
    fallback: 90,
};

pub const FAILED_SUBJECTS: Table = Table {
    tiers: &[at_least(3.0, 10), at_least(1.0, 5)],
    fallback: 0,
};

pub const LATE_ARRIVALS: Table = Table {
    tiers: &[at_least(10.0, 20), at_least(5.0, 10)],
    fallback: 0,
};

pub const DISTANCE_KM: Table = Table {
    tiers: &[above(10.0, 50), above(5.0, 30), above(2.0, 15)],
    fallback: 0,
};

pub const SIBLINGS: Table = Table {
    tiers: &[above(4.0, 15), above(2.0, 10)],
    fallback: 0,
};

const ECONOMIC_DISTRESS_POINTS: i32 = 20;
const LOW_PARENT_EDUCATION_POINTS: i32 = 10;
const BEHAVIORAL_ISSUE_POINTS: i32 = 60;
const DROPOUT_ATTEMPT_POINTS: i32 = 20;
const HEALTH_ISSUE_POINTS: i32 = 60;
const WALKING_PENALTY_KM: f64 = 3.0;
const WALKING_PENALTY_POINTS: i32 = 20;
const FAMILY_PROBLEM_POINTS: i32 = 70;

/// Points for the first tier matching `value`, or the table's fallback.
pub fn lookup(table: &Table, value: f64) -> i32 {
    table
        .tiers
        .iter()
        .find(|tier| match tier.cmp {
            Cmp::AtLeast => value >= tier.threshold,
            Cmp::Above => value > tier.threshold,
        })
        .map(|tier| tier.points)
        .unwrap_or(table.fallback)
}

pub fn income_points(tier: IncomeTier) -> i32 {
    match tier {
        IncomeTier::BelowPoverty => 80,
        IncomeTier::Low => 50,
        IncomeTier::Middle => 20,
        IncomeTier::High => 0,
    }
}

pub fn trend_points(trend: AcademicTrend) -> i32 {
    match trend {
        AcademicTrend::Declining => 10,
        AcademicTrend::Stable => 0,
        AcademicTrend::Improving => -5,
    }
}

fn flag_points(flag: Option<bool>, points: i32) -> i32 {
    if flag.unwrap_or(false) {
        points
    } else {
        0
    }
}

fn clamp(points: i32) -> u32 {
    points.clamp(0, 100) as u32
}

/// All seven factor scores plus the share of inputs that were usable.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub factors: Vec<FactorScore>,
    pub data_completeness_percent: u32,
    pub rejected: Vec<Rejection>,
}

impl Aggregate {
    pub fn score(&self, factor: Factor) -> u32 {
        self.factors
            .iter()
            .find(|score| score.factor == factor)
            .map(|score| score.score)
            .unwrap_or(0)
    }
}

/// A signal value dropped before scoring, with the factor it would have fed.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub factor: Factor,
    pub field: &'static str,
    pub reason: String,
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        Error::Validation {
            field: rejection.field,
            reason: rejection.reason,
        }
    }
}

/// Drops values that cannot be scored. Each rejected value is treated as
/// missing and reported back with the factor it belongs to.
pub fn sanitize(signals: &StudentSignals) -> (StudentSignals, Vec<Rejection>) {
    let mut clean = signals.clone();
    let mut rejected = Vec::new();

    let mut check_percentage =
        |factor: Factor, field: &'static str, value: &mut Option<f64>| {
            if let Some(v) = *value {
                if !v.is_finite() || !(0.0..=100.0).contains(&v) {
                    rejected.push(Rejection {
                        factor,
                        field,
                        reason: format!("{v} is not a percentage"),
                    });
                    *value = None;
                }
            }
        };
    check_percentage(
        Factor::Attendance,
        "attendance_percentage",
        &mut clean.attendance_percentage,
    );
    check_percentage(
        Factor::Academic,
        "academic_percentage",
        &mut clean.academic_percentage,
    );

    if let Some(km) = clean.distance_km {
        if !km.is_finite() || km < 0.0 {
            rejected.push(Rejection {
                factor: Factor::Distance,
                field: "distance_km",
                reason: format!("{km} is not a distance"),
            });
            clean.distance_km = None;
        }
    }

    (clean, rejected)
}

/// Scores every factor for one student's signals. Rejected values are listed
/// under `rejected` in the details of the factor they belong to.
pub fn aggregate(signals: &StudentSignals) -> Aggregate {
    let (signals, rejected) = sanitize(signals);
    for rejection in &rejected {
        let err = Error::from(rejection.clone());
        tracing::warn!(%err, "substituting default for malformed signal");
    }

    let mut factors: Vec<FactorScore> = Factor::ALL
        .iter()
        .map(|factor| evaluate(*factor, &signals))
        .collect();
    for score in &mut factors {
        let reasons: Vec<&str> = rejected
            .iter()
            .filter(|rejection| rejection.factor == score.factor)
            .map(|rejection| rejection.reason.as_str())
            .collect();
        if reasons.is_empty() {
            continue;
        }
        if let Some(details) = score.details.as_object_mut() {
            details.insert("rejected".to_string(), json!(reasons));
        }
    }

    let provided = signals.provided_fields();
    let data_completeness_percent =
        (f64::from(provided) / f64::from(StudentSignals::FIELD_COUNT) * 100.0).round() as u32;

    Aggregate {
        factors,
        data_completeness_percent,
        rejected,
    }
}

/// Runs the rule for one factor.
pub fn evaluate(factor: Factor, signals: &StudentSignals) -> FactorScore {
    match factor {
        Factor::Attendance => attendance(signals),
        Factor::Academic => academic(signals),
        Factor::Financial => financial(signals),
        Factor::Behavioral => behavioral(signals),
        Factor::Health => health(signals),
        Factor::Distance => distance(signals),
        Factor::Family => family(signals),
    }
}

fn factor_score(factor: Factor, points: i32, details: serde_json::Value) -> FactorScore {
    FactorScore {
        factor,
        score: clamp(points),
        weight: factor.weight(),
        details,
    }
}

pub fn attendance(signals: &StudentSignals) -> FactorScore {
    let base = signals
        .attendance_percentage
        .map(|pct| lookup(&ATTENDANCE, pct))
        .unwrap_or(0);
    let absences = signals
        .consecutive_absences
        .map(|days| lookup(&CONSECUTIVE_ABSENCES, f64::from(days)))
        .unwrap_or(0);

    factor_score(
        Factor::Attendance,
        base + absences,
        json!({
            "attendance_percentage": signals.attendance_percentage,
            "consecutive_absences": signals.consecutive_absences,
            "base_points": base,
            "absence_points": absences,
        }),
    )
}

pub fn academic(signals: &StudentSignals) -> FactorScore {
    let base = signals
        .academic_percentage
        .map(|pct| lookup(&ACADEMIC, pct))
        .unwrap_or(0);
    let failed = signals
        .failed_subjects
        .map(|count| lookup(&FAILED_SUBJECTS, f64::from(count)))
        .unwrap_or(0);
    let trend = signals.academic_trend.map(trend_points).unwrap_or(0);

    factor_score(
        Factor::Academic,
        base + failed + trend,
        json!({
            "academic_percentage": signals.academic_percentage,
            "failed_subjects": signals.failed_subjects,
            "trend": signals.academic_trend,
            "base_points": base,
            "failed_points": failed,
            "trend_points": trend,
        }),
    )
}

pub fn financial(signals: &StudentSignals) -> FactorScore {
    let income = signals.income_tier.map(income_points).unwrap_or(0);
    let distress = flag_points(signals.economic_distress, ECONOMIC_DISTRESS_POINTS);
    let education = flag_points(signals.parent_low_education, LOW_PARENT_EDUCATION_POINTS);

    factor_score(
        Factor::Financial,
        income + distress + education,
        json!({
            "income_tier": signals.income_tier,
            "economic_distress": signals.economic_distress,
            "parent_low_education": signals.parent_low_education,
        }),
    )
}

pub fn behavioral(signals: &StudentSignals) -> FactorScore {
    let issues = flag_points(signals.behavioral_issues, BEHAVIORAL_ISSUE_POINTS);
    let lateness = signals
        .late_arrivals
        .map(|count| lookup(&LATE_ARRIVALS, f64::from(count)))
        .unwrap_or(0);
    let attempts = signals.dropout_attempts.unwrap_or(0).min(5) as i32 * DROPOUT_ATTEMPT_POINTS;

    factor_score(
        Factor::Behavioral,
        issues + lateness + attempts,
        json!({
            "behavioral_issues": signals.behavioral_issues,
            "late_arrivals": signals.late_arrivals,
            "dropout_attempts": signals.dropout_attempts,
        }),
    )
}

pub fn health(signals: &StudentSignals) -> FactorScore {
    factor_score(
        Factor::Health,
        flag_points(signals.health_issues, HEALTH_ISSUE_POINTS),
        json!({ "health_issues": signals.health_issues }),
    )
}

pub fn distance(signals: &StudentSignals) -> FactorScore {
    let km = signals.distance_km;
    let tiers = km.map(|km| lookup(&DISTANCE_KM, km)).unwrap_or(0);
    let walking = match (km, signals.transport_mode) {
        (Some(km), Some(TransportMode::Walking)) if km > WALKING_PENALTY_KM => {
            WALKING_PENALTY_POINTS
        }
        _ => 0,
    };

    factor_score(
        Factor::Distance,
        tiers + walking,
        json!({
            "distance_km": km,
            "transport_mode": signals.transport_mode,
            "walking_penalty": walking,
        }),
    )
}

pub fn family(signals: &StudentSignals) -> FactorScore {
    let problems = flag_points(signals.family_problems, FAMILY_PROBLEM_POINTS);
    let siblings = signals
        .sibling_count
        .map(|count| lookup(&SIBLINGS, f64::from(count)))
        .unwrap_or(0);

    factor_score(
        Factor::Family,
        problems + siblings,
        json!({
            "family_problems": signals.family_problems,
            "sibling_count": signals.sibling_count,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attendance_brackets_and_absence_add_on() {
        for (pct, expected) in [
            (98.0, 0),
            (95.0, 0),
            (90.0, 15),
            (80.0, 35),
            (60.0, 60),
            (50.0, 60),
            (49.9, 85),
        ] {
            assert_eq!(lookup(&ATTENDANCE, pct), expected, "attendance {pct}");
        }

        let signals = StudentSignals {
            attendance_percentage: Some(45.0),
            consecutive_absences: Some(6),
            ..StudentSignals::default()
        };
        assert_eq!(attendance(&signals).score, 100);

        let signals = StudentSignals {
            attendance_percentage: Some(80.0),
            consecutive_absences: Some(3),
            ..StudentSignals::default()
        };
        assert_eq!(attendance(&signals).score, 43);
    }

    #[test]
    fn academic_clamps_to_valid_range() {
        let struggling = StudentSignals {
            academic_percentage: Some(20.0),
            failed_subjects: Some(4),
            academic_trend: Some(AcademicTrend::Declining),
            ..StudentSignals::default()
        };
        assert_eq!(academic(&struggling).score, 100);

        let improving = StudentSignals {
            academic_percentage: Some(88.0),
            failed_subjects: Some(0),
            academic_trend: Some(AcademicTrend::Improving),
            ..StudentSignals::default()
        };
        assert_eq!(academic(&improving).score, 0);

        let borderline = StudentSignals {
            academic_percentage: Some(45.0),
            failed_subjects: Some(1),
            ..StudentSignals::default()
        };
        assert_eq!(academic(&borderline).score, 65);
    }

    #[test]
    fn financial_combines_income_and_flags() {
        let signals = StudentSignals {
            income_tier: Some(IncomeTier::BelowPoverty),
            economic_distress: Some(true),
            parent_low_education: Some(true),
            ..StudentSignals::default()
        };
        assert_eq!(financial(&signals).score, 100);

        let signals = StudentSignals {
            income_tier: Some(IncomeTier::Middle),
            parent_low_education: Some(true),
            ..StudentSignals::default()
        };
        assert_eq!(financial(&signals).score, 30);
    }

    #[test]
    fn behavioral_counts_each_dropout_attempt() {
        let signals = StudentSignals {
            late_arrivals: Some(6),
            dropout_attempts: Some(2),
            ..StudentSignals::default()
        };
        assert_eq!(behavioral(&signals).score, 50);

        let signals = StudentSignals {
            behavioral_issues: Some(true),
            late_arrivals: Some(12),
            dropout_attempts: Some(1),
            ..StudentSignals::default()
        };
        assert_eq!(behavioral(&signals).score, 100);
    }

    #[test]
    fn distance_tiers_are_strictly_greater_than() {
        assert_eq!(lookup(&DISTANCE_KM, 10.0), 30);
        assert_eq!(lookup(&DISTANCE_KM, 10.5), 50);
        assert_eq!(lookup(&DISTANCE_KM, 2.0), 0);

        let walking = StudentSignals {
            distance_km: Some(4.0),
            transport_mode: Some(TransportMode::Walking),
            ..StudentSignals::default()
        };
        assert_eq!(distance(&walking).score, 35);

        let bus = StudentSignals {
            distance_km: Some(4.0),
            transport_mode: Some(TransportMode::Bus),
            ..StudentSignals::default()
        };
        assert_eq!(distance(&bus).score, 15);
    }

    #[test]
    fn family_and_health_flags() {
        let signals = StudentSignals {
            family_problems: Some(true),
            sibling_count: Some(5),
            health_issues: Some(true),
            ..StudentSignals::default()
        };
        assert_eq!(family(&signals).score, 85);
        assert_eq!(health(&signals).score, 60);
    }

    #[test]
    fn missing_signals_score_zero_and_lower_completeness() {
        let result = aggregate(&StudentSignals::default());
        assert!(result.factors.iter().all(|factor| factor.score == 0));
        assert_eq!(result.data_completeness_percent, 0);
        let order: Vec<Factor> = result.factors.iter().map(|score| score.factor).collect();
        assert_eq!(order, Factor::ALL.to_vec());
    }

    #[test]
    fn malformed_values_are_treated_as_missing() {
        let signals = StudentSignals {
            attendance_percentage: Some(130.0),
            academic_percentage: Some(55.0),
            distance_km: Some(-1.0),
            ..StudentSignals::default()
        };
        let result = aggregate(&signals);
        assert_eq!(result.score(Factor::Attendance), 0);
        assert_eq!(result.score(Factor::Academic), 40);
        assert_eq!(result.score(Factor::Distance), 0);
        assert_eq!(result.rejected.len(), 2);
        // Only the academic percentage survives validation: 1 of 16 fields.
        assert_eq!(result.data_completeness_percent, 6);
    }

    #[test]
    fn rejected_values_are_listed_on_their_factor() {
        let signals = StudentSignals {
            attendance_percentage: Some(130.0),
            distance_km: Some(-1.0),
            ..StudentSignals::default()
        };
        let result = aggregate(&signals);
        let details = |factor: Factor| {
            result
                .factors
                .iter()
                .find(|score| score.factor == factor)
                .map(|score| score.details.clone())
                .unwrap()
        };

        assert_eq!(
            details(Factor::Attendance)["rejected"],
            json!(["130 is not a percentage"])
        );
        assert_eq!(
            details(Factor::Distance)["rejected"],
            json!(["-1 is not a distance"])
        );
        assert!(details(Factor::Academic).get("rejected").is_none());
        assert_eq!(result.rejected[0].field, "attendance_percentage");
    }
}
