//! Periodic trigger for the escalation engine.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{EscalationEngine, Trigger};
use crate::error::EscalationError;

pub struct Scheduler;

/// Handle to a running scheduler task.
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Start the timer loop. Each cycle re-reads the interval and the
    /// `enabled` flag from the current settings, so a config reload takes
    /// effect from the next cycle.
    pub fn spawn(engine: Arc<EscalationEngine>) -> SchedulerHandle {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!("scheduler started");
            loop {
                let settings = engine.config().current();
                tokio::select! {
                    _ = tokio::time::sleep(settings.scheduler_interval) => {}
                    _ = stopped.changed() => break,
                }
                if *stopped.borrow() {
                    break;
                }
                if !settings.scheduler_enabled {
                    debug!("scheduler disabled, skipping tick");
                    continue;
                }

                // Outside the select: stopping never cancels a pass midway.
                match engine.try_run(Trigger::Scheduled).await {
                    Ok(result) => debug!(run_id = %result.run_id, summary = %result.summary(), "scheduled run done"),
                    Err(EscalationError::Busy) => debug!("tick skipped, a run is already in flight"),
                    Err(e) => warn!(error = %e, "scheduled run failed"),
                }
            }
            info!("scheduler stopped");
        });

        SchedulerHandle { stop, task }
    }
}

impl SchedulerHandle {
    /// Stop the timer and wait for the loop to exit. A run in progress
    /// completes first.
    pub async fn shutdown(self) {
        if self.stop.send(true).is_err() {
            debug!("scheduler task already exited");
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Notify;

    use crate::audit::{AuditAction, AuditEntry, AuditTrail, MemoryAuditTrail};
    use crate::clock::SystemClock;
    use crate::config::{ConfigHandle, Settings};
    use crate::repository::{
        LocalTicketStore, PriorityUpdate, RepoResult, StatusChange, TicketRepository,
    };
    use crate::state_machine::{Priority, Ticket, TicketId};

    /// Store whose listing blocks until the gate opens.
    struct GatedRepo {
        store: Arc<LocalTicketStore>,
        entered: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl TicketRepository for GatedRepo {
        async fn list_open_tickets(&self) -> RepoResult<Vec<Ticket>> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.store.list_open_tickets().await
        }

        async fn get_ticket(&self, id: &TicketId) -> RepoResult<Ticket> {
            self.store.get_ticket(id).await
        }

        async fn insert_ticket(&self, ticket: Ticket, entry: AuditEntry) -> RepoResult<Ticket> {
            self.store.insert_ticket(ticket, entry).await
        }

        async fn update_ticket_priority(
            &self,
            update: PriorityUpdate,
            entry: AuditEntry,
        ) -> RepoResult<Ticket> {
            self.store.update_ticket_priority(update, entry).await
        }

        async fn transition_ticket_status(
            &self,
            change: StatusChange,
            entry: AuditEntry,
        ) -> RepoResult<Ticket> {
            self.store.transition_ticket_status(change, entry).await
        }
    }

    async fn setup(settings: Settings) -> (Arc<EscalationEngine>, Arc<LocalTicketStore>, TicketId) {
        let audit = Arc::new(MemoryAuditTrail::new());
        let repo = Arc::new(LocalTicketStore::new(audit));
        let ticket = Ticket::new("payroll", Utc::now());
        let entry = AuditEntry::new(
            ticket.id.clone(),
            AuditAction::Created,
            "employee",
            ticket.created_at,
            None,
            ticket.snapshot(),
        );
        let id = repo.insert_ticket(ticket, entry).await.unwrap().id;
        let engine = Arc::new(EscalationEngine::new(
            repo.clone(),
            ConfigHandle::new(settings),
            Arc::new(SystemClock),
        ));
        (engine, repo, id)
    }

    #[tokio::test]
    async fn shutdown_lets_the_run_in_flight_finish() {
        let (_, store, id) = setup(Settings::default()).await;
        let repo = Arc::new(GatedRepo {
            store: store.clone(),
            entered: Notify::new(),
            gate: Notify::new(),
        });
        let settings = Settings {
            scheduler_interval: Duration::from_millis(10),
            ..Settings::default()
        };
        let engine = Arc::new(EscalationEngine::new(
            repo.clone(),
            ConfigHandle::new(settings),
            Arc::new(SystemClock),
        ));

        let handle = Scheduler::spawn(engine.clone());
        tokio::time::timeout(Duration::from_secs(5), repo.entered.notified())
            .await
            .unwrap();
        assert!(engine.is_running());

        let stopping = tokio::spawn(handle.shutdown());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());
        assert_eq!(store.audit().history(&id).await.unwrap().len(), 1);

        repo.gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), stopping)
            .await
            .unwrap()
            .unwrap();

        assert!(!engine.is_running());
        let history = store.audit().history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].action, AuditAction::PriorityRecalculated);
        assert_eq!(history[1].actor, "system:scheduler");
        assert_eq!(store.get_ticket(&id).await.unwrap().priority, Priority::Low);
    }

    #[tokio::test]
    async fn ticks_run_the_engine() {
        let settings = Settings {
            scheduler_interval: Duration::from_millis(10),
            ..Settings::default()
        };
        let (engine, repo, id) = setup(settings).await;

        let handle = Scheduler::spawn(engine);
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown().await;

        let ticket = repo.get_ticket(&id).await.unwrap();
        assert_eq!(ticket.priority, Priority::Low);
        let history = repo.audit().history(&id).await.unwrap();
        assert_eq!(history.last().map(|e| e.actor.as_str()), Some("system:scheduler"));
    }

    #[tokio::test]
    async fn shutdown_does_not_wait_for_the_next_tick() {
        let settings = Settings {
            scheduler_interval: Duration::from_secs(3600),
            ..Settings::default()
        };
        let (engine, repo, id) = setup(settings).await;

        let handle = Scheduler::spawn(engine);
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();

        let ticket = repo.get_ticket(&id).await.unwrap();
        assert_eq!(ticket.priority, Priority::Medium);
    }

    #[tokio::test]
    async fn disabled_scheduler_never_runs() {
        let settings = Settings {
            scheduler_interval: Duration::from_millis(10),
            scheduler_enabled: false,
            ..Settings::default()
        };
        let (engine, repo, id) = setup(settings).await;

        let handle = Scheduler::spawn(engine);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        handle.shutdown().await;

        assert_eq!(repo.audit().history(&id).await.unwrap().len(), 1);
    }
}
