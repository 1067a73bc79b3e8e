use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ticket::{Ticket, TicketStatus};
use crate::error::EscalationError;

/// The kind of edge a status change takes through the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// open -> in_progress
    Start,
    /// open|in_progress -> resolved
    Resolve,
    /// open|in_progress -> closed
    Close,
    /// resolved|closed -> open, only inside the reopen window
    Reopen,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionKind::Start => write!(f, "start"),
            TransitionKind::Resolve => write!(f, "resolve"),
            TransitionKind::Close => write!(f, "close"),
            TransitionKind::Reopen => write!(f, "reopen"),
        }
    }
}

/// A validated status change, ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: TicketStatus,
    pub to: TicketStatus,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub reopenable_until: Option<DateTime<Utc>>,
}

/// The ticket lifecycle transition table.
///
/// ```text
/// open ──► in_progress ──► resolved ─┐
///   │          │                      ├─ reopen (now < reopenable_until) ──► open
///   └──────────┴─────────► closed ───┘
/// ```
pub struct StatusMachine;

impl StatusMachine {
    /// Classify the edge `from -> to` without looking at time.
    ///
    /// Any pair not in the table, including self-loops and direct moves out
    /// of a terminal state to anything but `open`, is an invalid transition.
    pub fn edge(from: TicketStatus, to: TicketStatus) -> Result<TransitionKind, EscalationError> {
        use TicketStatus::*;

        match (from, to) {
            (Open, InProgress) => Ok(TransitionKind::Start),
            (Open | InProgress, Resolved) => Ok(TransitionKind::Resolve),
            (Open | InProgress, Closed) => Ok(TransitionKind::Close),
            (Resolved | Closed, Open) => Ok(TransitionKind::Reopen),
            _ => Err(EscalationError::InvalidTransition { from, to }),
        }
    }

    /// Validate moving `ticket` to `target` at `now` and compute the new
    /// close/reopen fields.
    ///
    /// - Resolving or closing stamps `closed_at = now` and
    ///   `reopenable_until = now + reopen_window`.
    /// - Reopening requires `now < reopenable_until` and clears both fields.
    /// - Starting work leaves both fields empty.
    pub fn plan(
        ticket: &Ticket,
        target: TicketStatus,
        now: DateTime<Utc>,
        reopen_window: Duration,
    ) -> Result<Transition, EscalationError> {
        let kind = Self::edge(ticket.status, target)?;

        let (closed_at, reopenable_until) = match kind {
            TransitionKind::Start => (None, None),
            TransitionKind::Resolve | TransitionKind::Close => {
                (Some(now), Some(now + reopen_window))
            }
            TransitionKind::Reopen => {
                // A terminal ticket without a window predates the window
                // rule; it cannot be reopened.
                let until = ticket
                    .reopenable_until
                    .or(ticket.closed_at)
                    .unwrap_or(now);
                if now >= until {
                    return Err(EscalationError::ReopenWindowExpired {
                        ticket_id: ticket.id.clone(),
                        until,
                    });
                }
                (None, None)
            }
        };

        Ok(Transition {
            from: ticket.status,
            to: target,
            kind,
            at: now,
            closed_at,
            reopenable_until,
        })
    }

    /// Apply a planned transition to an in-memory ticket.
    ///
    /// Priority and the breach flag are left untouched: a closing transition
    /// freezes them, a reopening one hands them back to the escalation engine.
    pub fn apply(ticket: &mut Ticket, transition: &Transition) {
        ticket.status = transition.to;
        ticket.closed_at = transition.closed_at;
        ticket.reopenable_until = transition.reopenable_until;
        ticket.updated_at = transition.at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Priority;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
    }

    fn week() -> Duration {
        Duration::days(7)
    }

    fn closed_ticket() -> Ticket {
        let mut ticket = Ticket::new("medical", t0());
        let t = StatusMachine::plan(&ticket, TicketStatus::Closed, t0(), week()).unwrap();
        StatusMachine::apply(&mut ticket, &t);
        ticket
    }

    #[test]
    fn allowed_edges() {
        use TicketStatus::*;
        assert_eq!(StatusMachine::edge(Open, InProgress).unwrap(), TransitionKind::Start);
        assert_eq!(StatusMachine::edge(Open, Resolved).unwrap(), TransitionKind::Resolve);
        assert_eq!(StatusMachine::edge(Open, Closed).unwrap(), TransitionKind::Close);
        assert_eq!(StatusMachine::edge(InProgress, Resolved).unwrap(), TransitionKind::Resolve);
        assert_eq!(StatusMachine::edge(InProgress, Closed).unwrap(), TransitionKind::Close);
        assert_eq!(StatusMachine::edge(Resolved, Open).unwrap(), TransitionKind::Reopen);
        assert_eq!(StatusMachine::edge(Closed, Open).unwrap(), TransitionKind::Reopen);
    }

    #[test]
    fn rejected_edges() {
        use TicketStatus::*;
        for (from, to) in [
            (Closed, InProgress),
            (Resolved, InProgress),
            (Resolved, Closed),
            (Closed, Resolved),
            (InProgress, Open),
            (Open, Open),
            (Closed, Closed),
        ] {
            let err = StatusMachine::edge(from, to).unwrap_err();
            assert!(
                matches!(err, EscalationError::InvalidTransition { from: f, to: t } if f == from && t == to),
                "{from} -> {to} should be invalid"
            );
        }
    }

    #[test]
    fn closing_stamps_window_and_keeps_priority() {
        let mut ticket = Ticket::new("medical", t0()).with_priority(Priority::High);
        let at = t0() + Duration::hours(5);
        let t = StatusMachine::plan(&ticket, TicketStatus::Closed, at, week()).unwrap();
        assert_eq!(t.kind, TransitionKind::Close);
        assert_eq!(t.closed_at, Some(at));
        assert_eq!(t.reopenable_until, Some(at + week()));

        StatusMachine::apply(&mut ticket, &t);
        assert_eq!(ticket.status, TicketStatus::Closed);
        assert_eq!(ticket.priority, Priority::High);
        assert!(ticket.check_invariants().is_ok());
    }

    #[test]
    fn reopen_succeeds_inside_window() {
        let mut ticket = closed_ticket();
        let until = ticket.reopenable_until.unwrap();
        let just_before = until - Duration::nanoseconds(1);

        let t = StatusMachine::plan(&ticket, TicketStatus::Open, just_before, week()).unwrap();
        assert_eq!(t.kind, TransitionKind::Reopen);
        StatusMachine::apply(&mut ticket, &t);
        assert_eq!(ticket.status, TicketStatus::Open);
        assert!(ticket.closed_at.is_none());
        assert!(ticket.reopenable_until.is_none());
        assert!(ticket.check_invariants().is_ok());
    }

    #[test]
    fn reopen_fails_at_and_after_window_end() {
        let ticket = closed_ticket();
        let until = ticket.reopenable_until.unwrap();

        for now in [until, until + Duration::nanoseconds(1), until + Duration::days(30)] {
            let err = StatusMachine::plan(&ticket, TicketStatus::Open, now, week()).unwrap_err();
            assert!(matches!(
                err,
                EscalationError::ReopenWindowExpired { until: u, .. } if u == until
            ));
        }
    }

    #[test]
    fn closed_to_in_progress_requires_reopen_first() {
        let ticket = closed_ticket();
        let err = StatusMachine::plan(&ticket, TicketStatus::InProgress, t0(), week()).unwrap_err();
        assert!(matches!(err, EscalationError::InvalidTransition { .. }));
    }

    #[test]
    fn terminal_ticket_without_window_cannot_reopen() {
        let mut ticket = closed_ticket();
        ticket.reopenable_until = None;
        let err = StatusMachine::plan(&ticket, TicketStatus::Open, t0(), week()).unwrap_err();
        assert!(matches!(err, EscalationError::ReopenWindowExpired { .. }));
    }

    #[test]
    fn transition_kind_display() {
        assert_eq!(TransitionKind::Start.to_string(), "start");
        assert_eq!(TransitionKind::Reopen.to_string(), "reopen");
    }
}
