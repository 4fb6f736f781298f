//! Circuit breaking for downstream resources.

mod breaker;
mod state;

pub use breaker::{CircuitBreaker, ReportStatus, Ticket};
pub use state::{should_trip, CircuitRecord, CircuitState, Counts, ReportOutcome, Transition};
