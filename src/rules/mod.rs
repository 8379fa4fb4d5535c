//! Text rules applied to tool input and output
//!
//! - Rate-limit signatures in terminal output
//! - Extra launch options typed by the user

pub mod launch_options;
pub mod rate_limit;

pub use launch_options::{reserved_flags, validate_launch_options, LaunchOptionsError};
pub use rate_limit::{retry_notice, RateLimitEvent, RemainingTime, UNSPECIFIED_RESET_LABEL};
