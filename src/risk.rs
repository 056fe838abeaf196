use chrono::{DateTime, Datelike, Utc};

use crate::factors::Aggregate;
use crate::models::{
    Factor, FactorScore, Recommendation, RecommendationPriority, RiskLevel, RiskProfile,
    RiskSnapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineBand {
    pub timeline: &'static str,
    pub probability: &'static str,
    pub level: RiskLevel,
}

const TIMELINE_BANDS: [(u32, TimelineBand); 3] = [
    (
        80,
        TimelineBand {
            timeline: "1-3 months",
            probability: "85-95%",
            level: RiskLevel::Critical,
        },
    ),
    (
        60,
        TimelineBand {
            timeline: "3-6 months",
            probability: "60-85%",
            level: RiskLevel::High,
        },
    ),
    (
        40,
        TimelineBand {
            timeline: "6-12 months",
            probability: "20-60%",
            level: RiskLevel::Medium,
        },
    ),
];

const LOW_RISK_BAND: TimelineBand = TimelineBand {
    timeline: "low risk",
    probability: "<20%",
    level: RiskLevel::Low,
};

/// A recommendation rule fires when its factor scores strictly above the
/// threshold.
struct RecommendationRule {
    factor: Factor,
    above: u32,
    priority: RecommendationPriority,
    actions: &'static [&'static str],
}

const RECOMMENDATION_RULES: &[RecommendationRule] = &[
    RecommendationRule {
        factor: Factor::Attendance,
        above: 50,
        priority: RecommendationPriority::Urgent,
        actions: &[
            "Schedule an urgent parent meeting",
            "Monitor attendance daily",
        ],
    },
    RecommendationRule {
        factor: Factor::Academic,
        above: 50,
        priority: RecommendationPriority::High,
        actions: &["Enroll in remedial classes", "Assign a peer tutor"],
    },
    RecommendationRule {
        factor: Factor::Financial,
        above: 50,
        priority: RecommendationPriority::High,
        actions: &["Assess eligibility for financial aid"],
    },
    RecommendationRule {
        factor: Factor::Behavioral,
        above: 40,
        priority: RecommendationPriority::High,
        actions: &["Refer to the school counselor"],
    },
    RecommendationRule {
        factor: Factor::Health,
        above: 40,
        priority: RecommendationPriority::Medium,
        actions: &["Refer for a medical assessment"],
    },
    RecommendationRule {
        factor: Factor::Distance,
        above: 50,
        priority: RecommendationPriority::Medium,
        actions: &["Arrange transport assistance"],
    },
    RecommendationRule {
        factor: Factor::Family,
        above: 50,
        priority: RecommendationPriority::Medium,
        actions: &["Schedule a home visit by a social worker"],
    },
];

/// Weighted sum of the factor scores, rounded half away from zero.
pub fn total_score(factors: &[FactorScore]) -> u32 {
    let weighted: f64 = factors
        .iter()
        .map(|factor| f64::from(factor.score) * factor.factor.weight())
        .sum();
    (weighted.round() as u32).min(100)
}

pub fn timeline_band(score: u32) -> TimelineBand {
    TIMELINE_BANDS
        .iter()
        .find(|(floor, _)| score >= *floor)
        .map(|(_, band)| *band)
        .unwrap_or(LOW_RISK_BAND)
}

pub fn recommendations(aggregate: &Aggregate) -> Vec<Recommendation> {
    let mut recommendations: Vec<Recommendation> = RECOMMENDATION_RULES
        .iter()
        .filter(|rule| aggregate.score(rule.factor) > rule.above)
        .flat_map(|rule| {
            rule.actions.iter().map(|action| Recommendation {
                priority: rule.priority,
                factor: Some(rule.factor),
                action: action.to_string(),
            })
        })
        .collect();

    if recommendations.is_empty() {
        recommendations.push(Recommendation {
            priority: RecommendationPriority::Medium,
            factor: None,
            action: "Continue routine monitoring".to_string(),
        });
    }

    // Stable sort keeps rule order within one priority.
    recommendations.sort_by_key(|recommendation| recommendation.priority);
    recommendations
}

/// Everything the combiner derives from one aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub total_score: u32,
    pub level: RiskLevel,
    pub band: TimelineBand,
    pub recommendations: Vec<Recommendation>,
}

pub fn assess(aggregate: &Aggregate) -> Assessment {
    let total_score = total_score(&aggregate.factors);
    Assessment {
        total_score,
        level: RiskLevel::from_score(total_score),
        band: timeline_band(total_score),
        recommendations: recommendations(aggregate),
    }
}

pub fn profile_from_snapshot(snapshot: &RiskSnapshot) -> RiskProfile {
    let band = timeline_band(snapshot.total_score);
    RiskProfile {
        student_id: snapshot.student_id,
        total_score: snapshot.total_score,
        level: snapshot.level,
        factor_scores: snapshot
            .factors
            .iter()
            .map(|factor| (factor.factor, factor.score))
            .collect(),
        last_calculated_at: snapshot.calculated_at,
        dropout_probability_band: band.probability.to_string(),
        predicted_timeline: band.timeline.to_string(),
    }
}

/// School years run from June; "2025-2026" covers June 2025 to May 2026.
pub fn academic_period(at: DateTime<Utc>) -> String {
    let year = at.year();
    if at.month() >= 6 {
        format!("{}-{}", year, year + 1)
    } else {
        format!("{}-{}", year - 1, year)
    }
}
