pub mod clock;
pub mod config;
pub mod error;
pub mod rate_limiter;
pub mod utils;

pub use config::{GuardConfig, Settings, SweepConfig};
pub use error::GuardError;
pub use rate_limiter::{AbuseGuard, Decision, DenyReason};
