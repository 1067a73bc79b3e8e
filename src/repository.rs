//! Ticket repository abstraction and the local store.
//!
//! Both write operations are units of work: the repository checks the
//! caller's expected `version` (and, for priority updates, that the ticket is
//! still open/in progress), appends the audit entry, and only then applies
//! the change. A failed audit append leaves the ticket untouched; once the
//! append succeeds the change is applied.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditTrail, JsonlAuditTrail};
use crate::error::RepositoryError;
use crate::state_machine::{Priority, Ticket, TicketId, TicketStatus};

/// Repository result type
pub type RepoResult<T> = Result<T, RepositoryError>;

const TICKETS_FILE: &str = "tickets.json";
const AUDIT_FILE: &str = "audit.jsonl";

/// New priority/breach state computed by the escalation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityUpdate {
    pub id: TicketId,
    pub expected_version: u64,
    pub priority: Priority,
    pub breached: bool,
    pub at: DateTime<Utc>,
}

/// New lifecycle fields computed by the status machine.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub id: TicketId,
    pub expected_version: u64,
    pub status: TicketStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub reopenable_until: Option<DateTime<Utc>>,
    /// `Some` replaces the assignee, `None` leaves it as is.
    pub assignee: Option<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait TicketRepository: Send + Sync {
    /// Tickets currently on the SLA clock (open or in progress).
    async fn list_open_tickets(&self) -> RepoResult<Vec<Ticket>>;

    async fn get_ticket(&self, id: &TicketId) -> RepoResult<Ticket>;

    /// Store a new ticket together with its `created` audit entry.
    async fn insert_ticket(&self, ticket: Ticket, entry: AuditEntry) -> RepoResult<Ticket>;

    /// Fails with `Conflict` if the version moved or the ticket left the
    /// open/in-progress set.
    async fn update_ticket_priority(
        &self,
        update: PriorityUpdate,
        entry: AuditEntry,
    ) -> RepoResult<Ticket>;

    /// Fails with `Conflict` if the version moved.
    async fn transition_ticket_status(
        &self,
        change: StatusChange,
        entry: AuditEntry,
    ) -> RepoResult<Ticket>;
}

/// Run a repository call with an upper bound on its duration.
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = RepoResult<T>>,
) -> RepoResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RepositoryError::Timeout(limit)),
    }
}

/// In-memory ticket store with an optional JSON snapshot on disk.
///
/// Writes run on their own task: a caller that stops waiting, for example
/// on a timeout, never leaves a write half applied.
pub struct LocalTicketStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    tickets: RwLock<HashMap<TicketId, Ticket>>,
    audit: Arc<dyn AuditTrail>,
    snapshot: Option<PathBuf>,
}

impl LocalTicketStore {
    pub fn new(audit: Arc<dyn AuditTrail>) -> Self {
        Self::from_parts(HashMap::new(), audit, None)
    }

    fn from_parts(
        tickets: HashMap<TicketId, Ticket>,
        audit: Arc<dyn AuditTrail>,
        snapshot: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                tickets: RwLock::new(tickets),
                audit,
                snapshot,
            }),
        }
    }

    /// Open the store kept in `data_dir`: `tickets.json` for ticket state and
    /// `audit.jsonl` for the audit trail. Missing files start empty. A
    /// snapshot holding a ticket with inconsistent lifecycle fields is
    /// rejected.
    pub async fn open(data_dir: &Path) -> RepoResult<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let audit = JsonlAuditTrail::open(data_dir.join(AUDIT_FILE)).await?;
        let snapshot = data_dir.join(TICKETS_FILE);

        let tickets = match tokio::fs::read_to_string(&snapshot).await {
            Ok(content) => serde_json::from_str::<Vec<Ticket>>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        for ticket in &tickets {
            ticket.check_invariants().map_err(|e| {
                RepositoryError::Storage(format!("{}: {e}", snapshot.display()))
            })?;
        }
        info!(
            path = %snapshot.display(),
            tickets = tickets.len(),
            "ticket store opened"
        );

        Ok(Self::from_parts(
            tickets.into_iter().map(|t| (t.id.clone(), t)).collect(),
            Arc::new(audit),
            Some(snapshot),
        ))
    }

    pub fn audit(&self) -> Arc<dyn AuditTrail> {
        Arc::clone(&self.inner.audit)
    }
}

async fn detached<F>(write: F) -> RepoResult<Ticket>
where
    F: Future<Output = RepoResult<Ticket>> + Send + 'static,
{
    tokio::spawn(write)
        .await
        .map_err(|e| RepositoryError::Storage(format!("store write task failed: {e}")))?
}

impl StoreInner {
    /// Record the audit entry, publish the new ticket state, then persist
    /// the snapshot. The audit append is the commit point: once it succeeds
    /// the change is applied, and a failed snapshot write is only logged
    /// (the next commit rewrites the whole file).
    async fn commit(
        &self,
        tickets: &mut HashMap<TicketId, Ticket>,
        next: Ticket,
        entry: AuditEntry,
    ) -> RepoResult<Ticket> {
        self.audit.record(entry).await?;
        tickets.insert(next.id.clone(), next.clone());

        if let Some(path) = &self.snapshot {
            let mut all: Vec<&Ticket> = tickets.values().collect();
            all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            if let Err(e) = write_snapshot(path, &all).await {
                warn!(
                    path = %path.display(),
                    ticket_id = %next.id,
                    error = %e,
                    "snapshot write failed, disk is behind the audit trail"
                );
            }
        }

        debug!(ticket_id = %next.id, version = next.version, "ticket committed");
        Ok(next)
    }

    async fn insert(&self, ticket: Ticket, entry: AuditEntry) -> RepoResult<Ticket> {
        let mut tickets = self.tickets.write().await;
        if tickets.contains_key(&ticket.id) {
            return Err(RepositoryError::Conflict(format!(
                "ticket {} already exists",
                ticket.id
            )));
        }
        self.commit(&mut tickets, ticket, entry).await
    }

    async fn update_priority(&self, update: PriorityUpdate, entry: AuditEntry) -> RepoResult<Ticket> {
        let mut tickets = self.tickets.write().await;
        let current = tickets
            .get(&update.id)
            .ok_or_else(|| RepositoryError::NotFound(update.id.to_string()))?;

        check_version(current, update.expected_version)?;
        if !current.status.is_active() {
            return Err(RepositoryError::Conflict(format!(
                "ticket {} is {} and no longer escalates",
                current.id, current.status
            )));
        }

        let mut next = current.clone();
        next.priority = update.priority;
        next.sla_breached = update.breached;
        next.updated_at = update.at;
        next.version += 1;

        self.commit(&mut tickets, next, entry).await
    }

    async fn transition(&self, change: StatusChange, entry: AuditEntry) -> RepoResult<Ticket> {
        let mut tickets = self.tickets.write().await;
        let current = tickets
            .get(&change.id)
            .ok_or_else(|| RepositoryError::NotFound(change.id.to_string()))?;

        check_version(current, change.expected_version)?;

        let mut next = current.clone();
        next.status = change.status;
        next.closed_at = change.closed_at;
        next.reopenable_until = change.reopenable_until;
        if let Some(assignee) = change.assignee {
            next.assignee = Some(assignee);
        }
        next.updated_at = change.at;
        next.version += 1;

        self.commit(&mut tickets, next, entry).await
    }
}

async fn write_snapshot(path: &Path, tickets: &[&Ticket]) -> RepoResult<()> {
    let json = serde_json::to_vec_pretty(tickets)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn check_version(current: &Ticket, expected: u64) -> RepoResult<()> {
    if current.version == expected {
        Ok(())
    } else {
        Err(RepositoryError::Conflict(format!(
            "ticket {} is at version {}, expected {}",
            current.id, current.version, expected
        )))
    }
}

#[async_trait]
impl TicketRepository for LocalTicketStore {
    async fn list_open_tickets(&self) -> RepoResult<Vec<Ticket>> {
        let mut open: Vec<Ticket> = self
            .inner
            .tickets
            .read()
            .await
            .values()
            .filter(|t| t.status.is_active())
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(open)
    }

    async fn get_ticket(&self, id: &TicketId) -> RepoResult<Ticket> {
        self.inner
            .tickets
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }

    async fn insert_ticket(&self, ticket: Ticket, entry: AuditEntry) -> RepoResult<Ticket> {
        let inner = Arc::clone(&self.inner);
        detached(async move { inner.insert(ticket, entry).await }).await
    }

    async fn update_ticket_priority(
        &self,
        update: PriorityUpdate,
        entry: AuditEntry,
    ) -> RepoResult<Ticket> {
        let inner = Arc::clone(&self.inner);
        detached(async move { inner.update_priority(update, entry).await }).await
    }

    async fn transition_ticket_status(
        &self,
        change: StatusChange,
        entry: AuditEntry,
    ) -> RepoResult<Ticket> {
        let inner = Arc::clone(&self.inner);
        detached(async move { inner.transition(change, entry).await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, MemoryAuditTrail};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 3, 30, 0).unwrap()
    }

    fn created(ticket: &Ticket) -> AuditEntry {
        AuditEntry::new(
            ticket.id.clone(),
            AuditAction::Created,
            "tester",
            ticket.created_at,
            None,
            ticket.snapshot(),
        )
    }

    fn recalculated(ticket: &Ticket, priority: Priority) -> AuditEntry {
        let mut after = ticket.snapshot();
        after.priority = priority;
        AuditEntry::new(
            ticket.id.clone(),
            AuditAction::PriorityRecalculated,
            "system:test",
            t0(),
            Some(ticket.snapshot()),
            after,
        )
    }

    /// Audit trail whose appends always fail.
    struct BrokenAudit;

    #[async_trait]
    impl AuditTrail for BrokenAudit {
        async fn record(&self, _entry: AuditEntry) -> RepoResult<()> {
            Err(RepositoryError::Storage("disk full".into()))
        }

        async fn history(&self, _ticket_id: &TicketId) -> RepoResult<Vec<AuditEntry>> {
            Ok(Vec::new())
        }
    }

    async fn store_with(ticket: &Ticket) -> (LocalTicketStore, Arc<MemoryAuditTrail>) {
        let audit = Arc::new(MemoryAuditTrail::new());
        let store = LocalTicketStore::new(audit.clone());
        store.insert_ticket(ticket.clone(), created(ticket)).await.unwrap();
        (store, audit)
    }

    #[tokio::test]
    async fn priority_update_bumps_version_and_audits() {
        let ticket = Ticket::new("esi", t0());
        let (store, audit) = store_with(&ticket).await;

        let update = PriorityUpdate {
            id: ticket.id.clone(),
            expected_version: 0,
            priority: Priority::High,
            breached: false,
            at: t0(),
        };
        let saved = store
            .update_ticket_priority(update, recalculated(&ticket, Priority::High))
            .await
            .unwrap();

        assert_eq!(saved.priority, Priority::High);
        assert_eq!(saved.version, 1);
        assert_eq!(audit.history(&ticket.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let ticket = Ticket::new("esi", t0());
        let (store, audit) = store_with(&ticket).await;

        let update = PriorityUpdate {
            id: ticket.id.clone(),
            expected_version: 7,
            priority: Priority::High,
            breached: false,
            at: t0(),
        };
        let err = store
            .update_ticket_priority(update, recalculated(&ticket, Priority::High))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(audit.history(&ticket.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_ticket_rejects_priority_update() {
        let ticket = Ticket::new("esi", t0());
        let (store, _audit) = store_with(&ticket).await;

        let (change, entry) = close(&ticket);
        store.transition_ticket_status(change, entry).await.unwrap();
        assert!(store.list_open_tickets().await.unwrap().is_empty());

        let update = PriorityUpdate {
            id: ticket.id.clone(),
            expected_version: 1,
            priority: Priority::Critical,
            breached: true,
            at: t0(),
        };
        let err = store
            .update_ticket_priority(update, recalculated(&ticket, Priority::Critical))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn failed_audit_leaves_ticket_untouched() {
        let store = LocalTicketStore::new(Arc::new(BrokenAudit));
        let ticket = Ticket::new("esi", t0());

        let err = store
            .insert_ticket(ticket.clone(), created(&ticket))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Storage(_)));
        assert!(matches!(
            store.get_ticket(&ticket.id).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    fn close(ticket: &Ticket) -> (StatusChange, AuditEntry) {
        let change = StatusChange {
            id: ticket.id.clone(),
            expected_version: ticket.version,
            status: TicketStatus::Closed,
            closed_at: Some(t0()),
            reopenable_until: Some(t0() + chrono::Duration::days(7)),
            assignee: None,
            at: t0(),
        };
        let mut after = ticket.snapshot();
        after.status = TicketStatus::Closed;
        let entry = AuditEntry::new(
            ticket.id.clone(),
            AuditAction::StatusChanged,
            "tester",
            t0(),
            Some(ticket.snapshot()),
            after,
        );
        (change, entry)
    }

    #[tokio::test]
    async fn snapshot_failure_after_audit_still_commits() {
        let dir = tempfile::tempdir().unwrap();
        let ticket = Ticket::new("esi", t0()).with_id(TicketId::new("T-1"));
        let store = LocalTicketStore::open(dir.path()).await.unwrap();
        store.insert_ticket(ticket.clone(), created(&ticket)).await.unwrap();

        // A non-empty directory in place of the snapshot makes the rename fail.
        let snapshot = dir.path().join(TICKETS_FILE);
        std::fs::remove_file(&snapshot).unwrap();
        std::fs::create_dir(&snapshot).unwrap();
        std::fs::write(snapshot.join("blocker"), "x").unwrap();

        let (change, entry) = close(&ticket);
        let saved = store.transition_ticket_status(change, entry).await.unwrap();
        assert_eq!(saved.status, TicketStatus::Closed);

        let stored = store.get_ticket(&ticket.id).await.unwrap();
        assert_eq!(stored.status, TicketStatus::Closed);
        let history = store.audit().history(&ticket.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].after.status, TicketStatus::Closed);
    }

    /// Audit trail that takes a while to append.
    struct SlowAudit {
        inner: MemoryAuditTrail,
        delay: Duration,
    }

    #[async_trait]
    impl AuditTrail for SlowAudit {
        async fn record(&self, entry: AuditEntry) -> RepoResult<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.record(entry).await
        }

        async fn history(&self, ticket_id: &TicketId) -> RepoResult<Vec<AuditEntry>> {
            self.inner.history(ticket_id).await
        }
    }

    #[tokio::test]
    async fn timed_out_write_is_applied_whole() {
        let audit = Arc::new(SlowAudit {
            inner: MemoryAuditTrail::new(),
            delay: Duration::from_millis(50),
        });
        let store = LocalTicketStore::new(audit.clone());
        let ticket = Ticket::new("esi", t0());
        store.insert_ticket(ticket.clone(), created(&ticket)).await.unwrap();

        let update = PriorityUpdate {
            id: ticket.id.clone(),
            expected_version: 0,
            priority: Priority::High,
            breached: false,
            at: t0(),
        };
        let err = with_timeout(
            Duration::from_millis(5),
            store.update_ticket_priority(update, recalculated(&ticket, Priority::High)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RepositoryError::Timeout(_)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let stored = store.get_ticket(&ticket.id).await.unwrap();
        assert_eq!(stored.priority, Priority::High);
        assert_eq!(stored.version, 1);
        assert_eq!(audit.history(&ticket.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn open_rejects_tickets_with_broken_lifecycle_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut ticket = Ticket::new("esi", t0());
        ticket.status = TicketStatus::Closed;
        std::fs::write(
            dir.path().join(TICKETS_FILE),
            serde_json::to_string(&vec![ticket]).unwrap(),
        )
        .unwrap();

        let err = LocalTicketStore::open(dir.path()).await.err().unwrap();
        assert!(matches!(err, RepositoryError::Storage(msg) if msg.contains("closed_at")));
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let ticket = Ticket::new("esi", t0());
        let (store, _audit) = store_with(&ticket).await;
        let err = store
            .insert_ticket(ticket.clone(), created(&ticket))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn open_persists_tickets_and_audit_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let ticket = Ticket::new("Medical", t0()).with_id(TicketId::new("T-100"));

        {
            let store = LocalTicketStore::open(dir.path()).await.unwrap();
            store.insert_ticket(ticket.clone(), created(&ticket)).await.unwrap();
        }

        let store = LocalTicketStore::open(dir.path()).await.unwrap();
        let loaded = store.get_ticket(&ticket.id).await.unwrap();
        assert_eq!(loaded, ticket);
        let history = store.audit().history(&ticket.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, AuditAction::Created);
    }

    #[tokio::test]
    async fn timeout_wrapper_bounds_slow_calls() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, RepositoryError>(())
        };
        let err = with_timeout(Duration::from_millis(10), slow).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Timeout(_)));
    }
}
