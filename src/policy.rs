//! SLA thresholds per grievance category and the priority tiering rule.

use serde::{Deserialize, Serialize};

use crate::error::EscalationError;
use crate::state_machine::{Priority, Ticket};

/// Default SLA, in working hours, for categories without a rule.
pub const DEFAULT_THRESHOLD_HOURS: f64 = 40.0;

/// SLA for the tightened categories shipped by default.
pub const TIGHT_THRESHOLD_HOURS: f64 = 24.0;

const TIGHT_CATEGORIES: &[&str] = &[
    "health",
    "insurance",
    "advance",
    "reimbursement",
    "esi",
    "medical",
    "facility",
];

/// One row of the category table. `pattern` matches a category
/// case-insensitively, either exactly or as a substring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub pattern: String,
    pub threshold_hours: f64,
}

impl CategoryRule {
    pub fn new(pattern: impl Into<String>, threshold_hours: f64) -> Self {
        Self {
            pattern: pattern.into().to_lowercase(),
            threshold_hours,
        }
    }

    fn matches(&self, category_lower: &str) -> bool {
        category_lower.contains(&self.pattern)
    }
}

/// Elapsed/threshold ratios at which a ticket enters each tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierBoundaries {
    #[serde(default = "default_medium")]
    pub medium: f64,
    #[serde(default = "default_high")]
    pub high: f64,
    #[serde(default = "default_critical")]
    pub critical: f64,
}

fn default_medium() -> f64 {
    0.5
}

fn default_high() -> f64 {
    0.8
}

fn default_critical() -> f64 {
    1.0
}

impl Default for TierBoundaries {
    fn default() -> Self {
        Self {
            medium: default_medium(),
            high: default_high(),
            critical: default_critical(),
        }
    }
}

impl TierBoundaries {
    pub fn validate(&self) -> Result<(), EscalationError> {
        let ordered = 0.0 < self.medium && self.medium <= self.high && self.high <= self.critical;
        if !ordered || !self.critical.is_finite() {
            return Err(EscalationError::Config(format!(
                "tier ratios must satisfy 0 < medium <= high <= critical, got {} / {} / {}",
                self.medium, self.high, self.critical
            )));
        }
        Ok(())
    }
}

/// Computed escalation state for a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub priority: Priority,
    pub breached: bool,
}

/// Category -> threshold table plus tier boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct SlaPolicy {
    default_threshold_hours: f64,
    rules: Vec<CategoryRule>,
    tiers: TierBoundaries,
}

impl SlaPolicy {
    pub fn new(
        default_threshold_hours: f64,
        rules: Vec<CategoryRule>,
        tiers: TierBoundaries,
    ) -> Result<Self, EscalationError> {
        check_threshold("default", default_threshold_hours)?;
        let mut normalized = Vec::with_capacity(rules.len());
        for rule in rules {
            let pattern = rule.pattern.trim().to_lowercase();
            if pattern.is_empty() {
                return Err(EscalationError::Config(
                    "SLA category pattern must not be empty".into(),
                ));
            }
            check_threshold(&pattern, rule.threshold_hours)?;
            normalized.push(CategoryRule {
                pattern,
                threshold_hours: rule.threshold_hours,
            });
        }
        tiers.validate()?;
        Ok(Self {
            default_threshold_hours,
            rules: normalized,
            tiers,
        })
    }

    pub fn default_rules() -> Vec<CategoryRule> {
        TIGHT_CATEGORIES
            .iter()
            .map(|c| CategoryRule::new(*c, TIGHT_THRESHOLD_HOURS))
            .collect()
    }

    pub fn tiers(&self) -> TierBoundaries {
        self.tiers
    }

    /// Threshold for one category string. Unknown categories fall back to
    /// the default rather than erroring. When several rules match, the
    /// tightest one wins.
    pub fn threshold_for(&self, category: &str) -> f64 {
        self.matching_threshold(category)
            .unwrap_or(self.default_threshold_hours)
    }

    /// Threshold for a ticket, considering both category and sub-category.
    pub fn threshold_for_ticket(&self, ticket: &Ticket) -> f64 {
        let by_category = self.matching_threshold(&ticket.category);
        let by_sub = ticket
            .sub_category
            .as_deref()
            .and_then(|s| self.matching_threshold(s));

        match (by_category, by_sub) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => self.default_threshold_hours,
        }
    }

    /// Map an elapsed/threshold ratio onto a priority tier.
    ///
    /// `r < medium -> low`, `r < high -> medium`, `r < critical -> high`,
    /// otherwise `critical` with `breached = true`. Non-decreasing in
    /// `elapsed_hours` for a fixed threshold.
    pub fn tier_for(&self, elapsed_hours: f64, threshold_hours: f64) -> Tier {
        let ratio = if threshold_hours > 0.0 {
            elapsed_hours.max(0.0) / threshold_hours
        } else {
            f64::INFINITY
        };

        let priority = if ratio < self.tiers.medium {
            Priority::Low
        } else if ratio < self.tiers.high {
            Priority::Medium
        } else if ratio < self.tiers.critical {
            Priority::High
        } else {
            Priority::Critical
        };

        Tier {
            priority,
            breached: priority == Priority::Critical,
        }
    }

    fn matching_threshold(&self, category: &str) -> Option<f64> {
        let lower = category.trim().to_lowercase();
        if lower.is_empty() {
            return None;
        }
        self.rules
            .iter()
            .filter(|rule| rule.matches(&lower))
            .map(|rule| rule.threshold_hours)
            .reduce(f64::min)
    }
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self {
            default_threshold_hours: DEFAULT_THRESHOLD_HOURS,
            rules: Self::default_rules(),
            tiers: TierBoundaries::default(),
        }
    }
}

/// One calendar year of hours.
const MAX_THRESHOLD_HOURS: f64 = 8_760.0;

fn check_threshold(name: &str, hours: f64) -> Result<(), EscalationError> {
    if !(hours > 0.0 && hours.is_finite()) {
        return Err(EscalationError::Config(format!(
            "SLA threshold for {name} must be a positive number of hours, got {hours}"
        )));
    }
    if hours > MAX_THRESHOLD_HOURS {
        return Err(EscalationError::Config(format!(
            "SLA threshold for {name} is {hours}h, above the {MAX_THRESHOLD_HOURS}h limit"
        )));
    }
    Ok(())
}
