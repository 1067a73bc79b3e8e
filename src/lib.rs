//! SLA-driven priority escalation for the employee grievance portal.
//!
//! Working-time arithmetic over a business calendar ([`calendar`]), category
//! thresholds and tiers ([`policy`]), the ticket lifecycle ([`state_machine`],
//! [`lifecycle`]), the batch escalation engine ([`engine`]) and the audit
//! trail ([`audit`]). Tickets are read and written through
//! [`repository::TicketRepository`].

pub mod api;
pub mod audit;
pub mod calendar;
pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod policy;
pub mod repository;
pub mod scheduler;
pub mod state_machine;
pub mod ui;

pub use calendar::BusinessCalendar;
pub use engine::{BatchResult, EscalationEngine, Trigger};
pub use error::{ErrorKind, EscalationError, RepositoryError};
pub use lifecycle::StatusService;
pub use policy::SlaPolicy;
