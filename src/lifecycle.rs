//! Ticket lifecycle service: status transitions, reopen, assignment and
//! creation, each persisted together with its audit entry.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEntry, AuditTrail};
use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::error::EscalationError;
use crate::repository::{RepoResult, StatusChange, TicketRepository, with_timeout};
use crate::state_machine::{
    Priority, StatusMachine, Ticket, TicketId, TicketStatus, Transition, TransitionKind,
};

/// Input for [`StatusService::create`].
#[derive(Debug, Clone, Default)]
pub struct NewTicket {
    pub category: String,
    pub sub_category: Option<String>,
    pub priority: Option<Priority>,
}

/// A ticket together with its SLA figures as of `now`.
#[derive(Debug, Clone, Serialize)]
pub struct TicketView {
    #[serde(flatten)]
    pub ticket: Ticket,
    /// `None` once resolved or closed; `priority` is then only a frozen record.
    pub effective_priority: Option<Priority>,
    pub threshold_hours: f64,
    /// Working hours on the SLA clock, up to `closed_at` for terminal tickets.
    pub elapsed_hours: f64,
    pub due_at: DateTime<Utc>,
    /// Turnaround time, only once resolved or closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tat_hours: Option<f64>,
}

pub struct StatusService {
    repo: Arc<dyn TicketRepository>,
    audit: Arc<dyn AuditTrail>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
}

impl StatusService {
    pub fn new(
        repo: Arc<dyn TicketRepository>,
        audit: Arc<dyn AuditTrail>,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            audit,
            config,
            clock,
        }
    }

    async fn call<T>(&self, fut: impl Future<Output = RepoResult<T>>) -> Result<T, EscalationError> {
        let limit = self.config.current().repository_timeout;
        Ok(with_timeout(limit, fut).await?)
    }

    /// Open a new ticket. The SLA clock starts now.
    pub async fn create(&self, new: NewTicket, actor: &str) -> Result<Ticket, EscalationError> {
        let category = new.category.trim();
        if category.is_empty() {
            return Err(EscalationError::Validation(
                "category must not be empty".into(),
            ));
        }

        let now = self.clock.now();
        let mut ticket = Ticket::new(category, now);
        if let Some(sub) = new.sub_category.as_deref().map(str::trim) {
            if !sub.is_empty() {
                ticket = ticket.with_sub_category(sub);
            }
        }
        if let Some(priority) = new.priority {
            ticket = ticket.with_priority(priority);
        }

        let entry = AuditEntry::new(
            ticket.id.clone(),
            AuditAction::Created,
            actor,
            now,
            None,
            ticket.snapshot(),
        );
        let saved = self.call(self.repo.insert_ticket(ticket, entry)).await?;
        info!(ticket_id = %saved.id, category = %saved.category, %actor, "ticket created");
        Ok(saved)
    }

    pub async fn get(&self, id: &TicketId) -> Result<Ticket, EscalationError> {
        self.call(self.repo.get_ticket(id)).await
    }

    pub async fn view(&self, id: &TicketId) -> Result<TicketView, EscalationError> {
        let ticket = self.get(id).await?;
        let settings = self.config.current();
        let now = self.clock.now();

        let threshold_hours = settings.policy.threshold_for_ticket(&ticket);
        let clock_end = ticket.closed_at.unwrap_or(now);
        let elapsed_hours = settings.calendar.working_hours(ticket.created_at, clock_end);
        let due_at = settings.calendar.deadline(ticket.created_at, threshold_hours);
        let tat_hours = ticket.closed_at.map(|_| elapsed_hours);

        Ok(TicketView {
            effective_priority: ticket.effective_priority(),
            ticket,
            threshold_hours,
            elapsed_hours,
            due_at,
            tat_hours,
        })
    }

    /// Move a ticket to `target`. Moving a resolved/closed ticket to `open`
    /// follows the reopen rules.
    pub async fn transition(
        &self,
        id: &TicketId,
        target: TicketStatus,
        actor: &str,
    ) -> Result<Ticket, EscalationError> {
        self.apply(id, target, actor, None).await
    }

    /// Return a resolved/closed ticket to `open` while its reopen window is
    /// still running.
    pub async fn reopen(
        &self,
        id: &TicketId,
        actor: &str,
        reason: &str,
    ) -> Result<Ticket, EscalationError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EscalationError::Validation(
                "a reason is required to reopen a ticket".into(),
            ));
        }
        self.apply(id, TicketStatus::Open, actor, Some(reason)).await
    }

    /// Set the assignee. An open ticket starts work in the same step.
    pub async fn assign(
        &self,
        id: &TicketId,
        assignee: &str,
        actor: &str,
    ) -> Result<Ticket, EscalationError> {
        let assignee = assignee.trim();
        if assignee.is_empty() {
            return Err(EscalationError::Validation(
                "assignee must not be empty".into(),
            ));
        }

        let ticket = self.get(id).await?;
        let now = self.clock.now();

        let status = match ticket.status {
            TicketStatus::Open => {
                StatusMachine::plan(
                    &ticket,
                    TicketStatus::InProgress,
                    now,
                    self.config.current().reopen_window,
                )?
                .to
            }
            TicketStatus::InProgress => TicketStatus::InProgress,
            terminal => {
                return Err(EscalationError::InvalidTransition {
                    from: terminal,
                    to: TicketStatus::InProgress,
                });
            }
        };

        let mut after = ticket.snapshot();
        after.status = status;
        after.assignee = Some(assignee.to_string());
        let entry = AuditEntry::new(
            ticket.id.clone(),
            AuditAction::Assigned,
            actor,
            now,
            Some(ticket.snapshot()),
            after,
        );
        let change = StatusChange {
            id: ticket.id.clone(),
            expected_version: ticket.version,
            status,
            closed_at: None,
            reopenable_until: None,
            assignee: Some(assignee.to_string()),
            at: now,
        };

        let saved = self.call(self.repo.transition_ticket_status(change, entry)).await?;
        info!(ticket_id = %saved.id, %assignee, %actor, "ticket assigned");
        Ok(saved)
    }

    /// Audit history, oldest first.
    pub async fn history(&self, id: &TicketId) -> Result<Vec<AuditEntry>, EscalationError> {
        self.get(id).await?;
        self.call(self.audit.history(id)).await
    }

    async fn apply(
        &self,
        id: &TicketId,
        target: TicketStatus,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Ticket, EscalationError> {
        let ticket = self.get(id).await?;
        let now = self.clock.now();
        let window = self.config.current().reopen_window;

        let transition = match StatusMachine::plan(&ticket, target, now, window) {
            Ok(t) => t,
            Err(e) => {
                warn!(ticket_id = %id, from = %ticket.status, to = %target, error = %e, "transition rejected");
                return Err(e);
            }
        };

        let entry = audit_entry(&ticket, &transition, actor, reason);
        let change = StatusChange {
            id: ticket.id.clone(),
            expected_version: ticket.version,
            status: transition.to,
            closed_at: transition.closed_at,
            reopenable_until: transition.reopenable_until,
            assignee: None,
            at: now,
        };

        let saved = self.call(self.repo.transition_ticket_status(change, entry)).await?;
        info!(
            ticket_id = %saved.id,
            from = %transition.from,
            to = %transition.to,
            kind = %transition.kind,
            %actor,
            "ticket status changed"
        );
        Ok(saved)
    }
}

fn audit_entry(
    ticket: &Ticket,
    transition: &Transition,
    actor: &str,
    reason: Option<&str>,
) -> AuditEntry {
    let mut next = ticket.clone();
    StatusMachine::apply(&mut next, transition);

    let action = match transition.kind {
        TransitionKind::Reopen => AuditAction::Reopened,
        _ => AuditAction::StatusChanged,
    };
    let entry = AuditEntry::new(
        ticket.id.clone(),
        action,
        actor,
        transition.at,
        Some(ticket.snapshot()),
        next.snapshot(),
    );
    match reason {
        Some(reason) => entry.with_reason(reason),
        None => entry,
    }
}
