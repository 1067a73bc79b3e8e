//! Append-only audit trail of ticket state changes.
//!
//! Every committed status transition and priority recalculation carries one
//! [`AuditEntry`]. Entries are never rewritten or removed; `history` returns
//! a fresh, oldest-first copy on every call.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{OpenOptions, create_dir_all};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::RepositoryError;
use crate::repository::RepoResult;
use crate::state_machine::{TicketId, TicketSnapshot};

/// What happened to the ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    StatusChanged,
    Reopened,
    Assigned,
    PriorityRecalculated,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditAction::Created => write!(f, "created"),
            AuditAction::StatusChanged => write!(f, "status_changed"),
            AuditAction::Reopened => write!(f, "reopened"),
            AuditAction::Assigned => write!(f, "assigned"),
            AuditAction::PriorityRecalculated => write!(f, "priority_recalculated"),
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ticket_id: TicketId,
    pub action: AuditAction,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    /// `None` only for `created`.
    pub before: Option<TicketSnapshot>,
    pub after: TicketSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEntry {
    pub fn new(
        ticket_id: TicketId,
        action: AuditAction,
        actor: impl Into<String>,
        occurred_at: DateTime<Utc>,
        before: Option<TicketSnapshot>,
        after: TicketSnapshot,
    ) -> Self {
        Self {
            ticket_id,
            action,
            actor: actor.into(),
            occurred_at,
            before,
            after,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[async_trait]
pub trait AuditTrail: Send + Sync {
    /// Append an entry. An error means the entry is not durable and the
    /// change it describes must not be committed.
    async fn record(&self, entry: AuditEntry) -> RepoResult<()>;

    /// All entries for one ticket, oldest first.
    async fn history(&self, ticket_id: &TicketId) -> RepoResult<Vec<AuditEntry>>;
}

/// Audit trail kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryAuditTrail {
    entries: RwLock<HashMap<TicketId, Vec<AuditEntry>>>,
}

impl MemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl AuditTrail for MemoryAuditTrail {
    async fn record(&self, entry: AuditEntry) -> RepoResult<()> {
        self.entries
            .write()
            .await
            .entry(entry.ticket_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn history(&self, ticket_id: &TicketId) -> RepoResult<Vec<AuditEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .get(ticket_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Audit trail stored as one JSON object per line, synced after each append.
#[derive(Debug)]
pub struct JsonlAuditTrail {
    path: PathBuf,
    append: Mutex<()>,
}

impl JsonlAuditTrail {
    /// Open the trail at `path`. An incomplete last line, left by an append
    /// that never finished, is truncated away.
    pub async fn open(path: impl Into<PathBuf>) -> RepoResult<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                create_dir_all(dir).await?;
            }
        }
        repair_tail(&path).await?;
        info!(path = %path.display(), "audit trail opened");
        Ok(Self {
            path,
            append: Mutex::new(()),
        })
    }

    async fn read_all(&self) -> RepoResult<Vec<AuditEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    RepositoryError::Storage(format!(
                        "corrupt audit line {} in {}: {e}",
                        n + 1,
                        self.path.display()
                    ))
                })
            })
            .collect()
    }
}

async fn repair_tail(path: &Path) -> RepoResult<()> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(());
    }

    let keep = content.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(keep as u64).await?;
    file.sync_all().await?;
    warn!(
        path = %path.display(),
        dropped_bytes = content.len() - keep,
        "truncated incomplete audit line"
    );
    Ok(())
}

#[async_trait]
impl AuditTrail for JsonlAuditTrail {
    async fn record(&self, entry: AuditEntry) -> RepoResult<()> {
        let line = serde_json::to_string(&entry)? + "\n";

        let _guard = self.append.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn history(&self, ticket_id: &TicketId) -> RepoResult<Vec<AuditEntry>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|entry| &entry.ticket_id == ticket_id)
            .collect())
    }
}
