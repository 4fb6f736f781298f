//! Rate limiting logic.

mod decision;
mod key;
mod limiter;

pub use decision::RateDecision;
pub use key::{KeySource, RateLimitKey, RequestIdentity};
pub use limiter::RateLimiter;
