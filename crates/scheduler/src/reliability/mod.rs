//! Reliability patterns
//!
//! - [`RetryPolicy`] - backoff before resubmitting crashed tasks

mod retry;

pub use retry::RetryPolicy;
