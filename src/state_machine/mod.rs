mod status;
mod ticket;

pub use status::{StatusMachine, Transition, TransitionKind};
pub use ticket::{Priority, Ticket, TicketId, TicketSnapshot, TicketStatus};
