use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::{TicketId, TicketStatus};

#[derive(Debug, Clone, Error)]
pub enum EscalationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: TicketStatus,
        to: TicketStatus,
    },

    #[error("Reopen window for ticket {ticket_id} expired at {until}")]
    ReopenWindowExpired {
        ticket_id: TicketId,
        until: DateTime<Utc>,
    },

    #[error("Ticket {0} was modified concurrently")]
    ConcurrentModification(String),

    #[error("Ticket not found: {0}")]
    TicketNotFound(String),

    #[error("Repository error: {0}")]
    Repository(RepositoryError),

    #[error("A priority update is already running")]
    Busy,

    #[error("Config error: {0}")]
    Config(String),
}

/// Errors raised by ticket and audit storage.
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<std::io::Error> for RepositoryError {
    fn from(e: std::io::Error) -> Self {
        RepositoryError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::Storage(e.to_string())
    }
}

impl From<RepositoryError> for EscalationError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(id) => EscalationError::TicketNotFound(id),
            RepositoryError::Conflict(msg) => EscalationError::ConcurrentModification(msg),
            other => EscalationError::Repository(other),
        }
    }
}

impl EscalationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EscalationError::Validation(_) => ErrorKind::Validation,
            EscalationError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EscalationError::ReopenWindowExpired { .. } => ErrorKind::ReopenWindowExpired,
            EscalationError::ConcurrentModification(_) => ErrorKind::ConcurrentModification,
            EscalationError::TicketNotFound(_) => ErrorKind::NotFound,
            EscalationError::Repository(_) => ErrorKind::Repository,
            EscalationError::Busy => ErrorKind::Busy,
            EscalationError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Classifies an error for batch reports and API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[serde(rename = "validation_error")]
    Validation,
    InvalidTransition,
    ReopenWindowExpired,
    ConcurrentModification,
    NotFound,
    #[serde(rename = "repository_error")]
    Repository,
    Busy,
    #[serde(rename = "config_error")]
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation_error"),
            ErrorKind::InvalidTransition => write!(f, "invalid_transition"),
            ErrorKind::ReopenWindowExpired => write!(f, "reopen_window_expired"),
            ErrorKind::ConcurrentModification => write!(f, "concurrent_modification"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Repository => write!(f, "repository_error"),
            ErrorKind::Busy => write!(f, "busy"),
            ErrorKind::Config => write!(f, "config_error"),
        }
    }
}
