//! Admission pipeline as seen by the HTTP gateway.

mod control;
mod response;

pub use control::{Admission, AdmissionControl, Completed};
pub use response::{
    format_window, rate_limit_headers, Rejection, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
    STATUS_INTERNAL_ERROR, STATUS_SERVICE_UNAVAILABLE, STATUS_TOO_MANY_REQUESTS,
};
