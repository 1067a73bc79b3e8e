//! Priority escalation engine.
//!
//! A run lists every open/in-progress ticket, computes its elapsed working
//! time and tier, and writes back only the tickets whose priority or breach
//! flag changed. Per-ticket failures land in [`BatchResult::failed`]; only a
//! failure to list the candidate set fails the run as a whole.
//!
//! At most one run executes at a time. [`EscalationEngine::run`] joins an
//! in-flight run and returns its result, [`EscalationEngine::try_run`]
//! rejects with [`EscalationError::Busy`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry};
use crate::clock::Clock;
use crate::config::{ConfigHandle, Settings};
use crate::error::{ErrorKind, EscalationError};
use crate::repository::{PriorityUpdate, TicketRepository, with_timeout};
use crate::state_machine::{Ticket, TicketId};

const SCHEDULER_ACTOR: &str = "system:scheduler";

/// What started a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual { actor: String },
}

impl Trigger {
    pub fn manual(actor: impl Into<String>) -> Self {
        Trigger::Manual {
            actor: actor.into(),
        }
    }

    /// Actor recorded on the audit entries the run writes.
    pub fn actor(&self) -> &str {
        match self {
            Trigger::Scheduled => SCHEDULER_ACTOR,
            Trigger::Manual { actor } => actor,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Scheduled => write!(f, "scheduled"),
            Trigger::Manual { actor } => write!(f, "manual:{actor}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTicket {
    pub id: TicketId,
    pub kind: ErrorKind,
    pub error: String,
}

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Tickets looked at.
    pub evaluated: usize,
    /// Tickets whose priority or breach flag was rewritten.
    pub successful_ids: Vec<TicketId>,
    /// Tickets already at their computed tier.
    pub unchanged: usize,
    pub failed: Vec<FailedTicket>,
}

impl BatchResult {
    pub fn summary(&self) -> String {
        format!(
            "{} evaluated, {} updated, {} unchanged, {} failed",
            self.evaluated,
            self.successful_ids.len(),
            self.unchanged,
            self.failed.len()
        )
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

type RunOutcome = Result<BatchResult, EscalationError>;

/// The single-flight slot: the id of the run that holds it and a receiver
/// that followers clone to wait for that run's outcome.
type Inflight = Mutex<Option<(Uuid, watch::Receiver<Option<RunOutcome>>)>>;

enum Slot<'a> {
    Leader(FlightGuard<'a>),
    Follower(watch::Receiver<Option<RunOutcome>>),
}

/// Held by the leading run. Dropping it, whether after `finish` or because
/// the run was cancelled, frees the slot.
struct FlightGuard<'a> {
    inflight: &'a Inflight,
    run_id: Uuid,
    tx: watch::Sender<Option<RunOutcome>>,
}

impl FlightGuard<'_> {
    fn finish(self, outcome: RunOutcome) {
        self.release();
        self.tx.send_replace(Some(outcome));
    }

    fn release(&self) {
        let mut inflight = self.inflight.lock();
        if matches!(inflight.as_ref(), Some((id, _)) if *id == self.run_id) {
            *inflight = None;
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

enum Recalculated {
    Updated,
    Unchanged,
}

pub struct EscalationEngine {
    repo: Arc<dyn TicketRepository>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    inflight: Inflight,
}

impl EscalationEngine {
    pub fn new(repo: Arc<dyn TicketRepository>, config: ConfigHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            config,
            clock,
            inflight: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.inflight.lock().is_some()
    }

    /// Run a pass, or wait for the pass already in flight and return its
    /// result. Returns only after every write of the pass is committed.
    pub async fn run(&self, trigger: Trigger) -> RunOutcome {
        loop {
            match self.acquire() {
                Slot::Leader(guard) => return self.lead(trigger, guard).await,
                Slot::Follower(mut rx) => {
                    debug!(trigger = %trigger, "joining in-flight priority update");
                    loop {
                        let done: Option<RunOutcome> = rx.borrow().as_ref().cloned();
                        if let Some(outcome) = done {
                            return outcome;
                        }
                        // Leader dropped without an outcome; contend again.
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Run a pass, or fail with `Busy` if one is already in flight.
    pub async fn try_run(&self, trigger: Trigger) -> RunOutcome {
        match self.acquire() {
            Slot::Leader(guard) => self.lead(trigger, guard).await,
            Slot::Follower(_) => {
                debug!(trigger = %trigger, "priority update rejected, another run is in flight");
                Err(EscalationError::Busy)
            }
        }
    }

    fn acquire(&self) -> Slot<'_> {
        let mut inflight = self.inflight.lock();
        if let Some((_, rx)) = inflight.as_ref() {
            return Slot::Follower(rx.clone());
        }

        let run_id = Uuid::new_v4();
        let (tx, rx) = watch::channel(None);
        *inflight = Some((run_id, rx));
        Slot::Leader(FlightGuard {
            inflight: &self.inflight,
            run_id,
            tx,
        })
    }

    async fn lead(&self, trigger: Trigger, guard: FlightGuard<'_>) -> RunOutcome {
        let outcome = self.execute(guard.run_id, trigger).await;
        guard.finish(outcome.clone());
        outcome
    }

    async fn execute(&self, run_id: Uuid, trigger: Trigger) -> RunOutcome {
        let settings = self.config.current();
        let started_at = self.clock.now();
        info!(%run_id, trigger = %trigger, "priority update started");

        let tickets = with_timeout(settings.repository_timeout, self.repo.list_open_tickets())
            .await
            .map_err(|e| {
                error!(%run_id, error = %e, "could not list open tickets");
                EscalationError::from(e)
            })?;
        let evaluated = tickets.len();

        let actor = trigger.actor();
        let outcomes: Vec<(TicketId, Result<Recalculated, EscalationError>)> =
            stream::iter(tickets)
                .map(|ticket| {
                    let settings = &settings;
                    async move {
                        let id = ticket.id.clone();
                        let outcome = self.recalculate(ticket, settings, started_at, actor).await;
                        (id, outcome)
                    }
                })
                .buffer_unordered(settings.max_concurrent_updates)
                .collect()
                .await;

        let mut successful_ids = Vec::new();
        let mut unchanged = 0;
        let mut failed = Vec::new();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(Recalculated::Updated) => successful_ids.push(id),
                Ok(Recalculated::Unchanged) => unchanged += 1,
                Err(e) => {
                    warn!(%run_id, ticket_id = %id, kind = %e.kind(), error = %e, "ticket update failed");
                    failed.push(FailedTicket {
                        id,
                        kind: e.kind(),
                        error: e.to_string(),
                    });
                }
            }
        }
        successful_ids.sort();
        failed.sort_by(|a, b| a.id.cmp(&b.id));

        let result = BatchResult {
            run_id,
            trigger,
            started_at,
            finished_at: self.clock.now(),
            evaluated,
            successful_ids,
            unchanged,
            failed,
        };
        info!(
            %run_id,
            evaluated = result.evaluated,
            updated = result.successful_ids.len(),
            unchanged = result.unchanged,
            failed = result.failed.len(),
            "priority update finished"
        );
        Ok(result)
    }

    /// Read-compute-write-audit for one ticket. The repository rejects the
    /// write if the ticket moved on since it was listed.
    async fn recalculate(
        &self,
        ticket: Ticket,
        settings: &Settings,
        now: DateTime<Utc>,
        actor: &str,
    ) -> Result<Recalculated, EscalationError> {
        let elapsed = settings.calendar.working_hours(ticket.created_at, now);
        let threshold = settings.policy.threshold_for_ticket(&ticket);
        let tier = settings.policy.tier_for(elapsed, threshold);

        if tier.priority == ticket.priority && tier.breached == ticket.sla_breached {
            return Ok(Recalculated::Unchanged);
        }

        let before = ticket.snapshot();
        let mut after = before.clone();
        after.priority = tier.priority;
        after.sla_breached = tier.breached;

        let entry = AuditEntry::new(
            ticket.id.clone(),
            AuditAction::PriorityRecalculated,
            actor,
            now,
            Some(before),
            after,
        );
        let update = PriorityUpdate {
            id: ticket.id.clone(),
            expected_version: ticket.version,
            priority: tier.priority,
            breached: tier.breached,
            at: now,
        };

        with_timeout(
            settings.repository_timeout,
            self.repo.update_ticket_priority(update, entry),
        )
        .await?;

        debug!(
            ticket_id = %ticket.id,
            elapsed_hours = elapsed,
            threshold_hours = threshold,
            from = %ticket.priority,
            to = %tier.priority,
            breached = tier.breached,
            "priority recalculated"
        );
        Ok(Recalculated::Updated)
    }
}
