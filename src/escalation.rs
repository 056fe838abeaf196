//! Trend, escalation gate, and rapid-increase detection.

use chrono::{DateTime, Duration, Utc};

use crate::models::{RapidIncreaseFlag, RiskLevel, RiskSnapshot, Trend};

/// Score movement within this many points either way is Stable.
pub const TREND_TOLERANCE: i64 = 5;

pub const RAPID_INCREASE_LOOKBACK_DAYS: i64 = 30;
pub const RAPID_INCREASE_MIN_DELTA: i64 = 15;
pub const RAPID_INCREASE_MAX_GAP_DAYS: i64 = 7;

pub fn trend(previous: Option<u32>, current: u32) -> Trend {
    let Some(previous) = previous else {
        return Trend::Stable;
    };
    let delta = i64::from(current) - i64::from(previous);
    if delta > TREND_TOLERANCE {
        Trend::Worsening
    } else if delta < -TREND_TOLERANCE {
        Trend::Improving
    } else {
        Trend::Stable
    }
}

/// Percent change from the previous score, to two decimals. Zero when
/// there is nothing to compare against.
pub fn percent_change(previous: Option<u32>, current: u32) -> f64 {
    match previous {
        Some(previous) if previous > 0 => {
            let change =
                (f64::from(current) - f64::from(previous)) / f64::from(previous) * 100.0;
            (change * 100.0).round() / 100.0
        }
        _ => 0.0,
    }
}

/// An alert fires iff the new level is strictly more severe than the
/// previous one. A student without a previous profile is treated as Low.
pub fn should_escalate(previous: Option<RiskLevel>, current: RiskLevel) -> bool {
    current.rank() > previous.unwrap_or(RiskLevel::Low).rank()
}

pub fn lookback_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(RAPID_INCREASE_LOOKBACK_DAYS)
}

/// Flags consecutive snapshot pairs whose score rose by more than
/// `RAPID_INCREASE_MIN_DELTA` within `RAPID_INCREASE_MAX_GAP_DAYS`.
/// Snapshots older than the lookback window are ignored.
pub fn detect_rapid_increases(
    snapshots: &[RiskSnapshot],
    now: DateTime<Utc>,
) -> Vec<RapidIncreaseFlag> {
    let since = lookback_start(now);
    let mut recent: Vec<&RiskSnapshot> = snapshots
        .iter()
        .filter(|snapshot| snapshot.calculated_at >= since)
        .collect();
    recent.sort_by_key(|snapshot| snapshot.calculated_at);

    recent
        .windows(2)
        .filter_map(|pair| {
            let (from, to) = (pair[0], pair[1]);
            let delta = i64::from(to.total_score) - i64::from(from.total_score);
            let gap = to.calculated_at - from.calculated_at;
            let within_window = gap <= Duration::days(RAPID_INCREASE_MAX_GAP_DAYS);
            if delta > RAPID_INCREASE_MIN_DELTA && within_window {
                Some(RapidIncreaseFlag {
                    student_id: to.student_id,
                    from_snapshot: from.id,
                    to_snapshot: to.id,
                    from_score: from.total_score,
                    to_score: to.total_score,
                    days_between: gap.num_days(),
                    detected_at: now,
                })
            } else {
                None
            }
        })
        .collect()
}
