use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EscalationError;

/// Opaque ticket identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a grievance ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    /// Open and in-progress tickets are still on the SLA clock.
    pub fn is_active(self) -> bool {
        matches!(self, TicketStatus::Open | TicketStatus::InProgress)
    }

    /// Resolved and closed tickets carry `closed_at` and a frozen priority.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = EscalationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "open" => Ok(TicketStatus::Open),
            "in_progress" => Ok(TicketStatus::InProgress),
            "resolved" => Ok(TicketStatus::Resolved),
            "closed" => Ok(TicketStatus::Closed),
            other => Err(EscalationError::Validation(format!(
                "unknown ticket status: {other}"
            ))),
        }
    }
}

/// Escalation tier. Ordered so that `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = EscalationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(EscalationError::Validation(format!(
                "unknown priority: {other}"
            ))),
        }
    }
}

/// A grievance ticket as seen by the escalation core.
///
/// `version` is bumped by the repository on every committed write and is the
/// optimistic-concurrency token for both the escalation engine and the status
/// machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub category: String,
    #[serde(default)]
    pub sub_category: Option<String>,
    pub status: TicketStatus,
    pub priority: Priority,
    #[serde(default)]
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reopenable_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sla_breached: bool,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Ticket {
    /// Creates an open ticket whose SLA clock starts at `created_at`.
    pub fn new(category: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: TicketId::generate(),
            category: category.into(),
            sub_category: None,
            status: TicketStatus::Open,
            priority: Priority::default(),
            assignee: None,
            created_at,
            closed_at: None,
            reopenable_until: None,
            sla_breached: false,
            updated_at: created_at,
            version: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_id(mut self, id: TicketId) -> Self {
        self.id = id;
        self
    }

    pub fn with_sub_category(mut self, sub_category: impl Into<String>) -> Self {
        self.sub_category = Some(sub_category.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// The priority, or `None` once the ticket is resolved/closed and the
    /// stored value is only a frozen record.
    pub fn effective_priority(&self) -> Option<Priority> {
        self.status.is_active().then_some(self.priority)
    }

    /// The observable slice of the ticket recorded in audit entries.
    pub fn snapshot(&self) -> TicketSnapshot {
        TicketSnapshot {
            status: self.status,
            priority: self.priority,
            sla_breached: self.sla_breached,
            assignee: self.assignee.clone(),
        }
    }

    /// Checks the closed/reopen field invariants.
    pub fn check_invariants(&self) -> Result<(), EscalationError> {
        if self.status.is_terminal() != self.closed_at.is_some() {
            return Err(EscalationError::Validation(format!(
                "ticket {}: closed_at must be set iff status is resolved/closed",
                self.id
            )));
        }
        match (self.closed_at, self.reopenable_until) {
            (None, Some(_)) => Err(EscalationError::Validation(format!(
                "ticket {}: reopenable_until set without closed_at",
                self.id
            ))),
            (Some(closed), Some(until)) if until < closed => {
                Err(EscalationError::Validation(format!(
                    "ticket {}: reopenable_until precedes closed_at",
                    self.id
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Before/after view of a ticket stored in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketSnapshot {
    pub status: TicketStatus,
    pub priority: Priority,
    pub sla_breached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}
