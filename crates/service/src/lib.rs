pub mod error;
pub mod hub;
pub mod rate_limiter;
pub mod session;

pub use error::RegisterError;
pub use hub::{Hub, HubConfig};
pub use rate_limiter::RateLimiter;
pub use session::{EnqueueOutcome, OutboundBuffer, Session};
