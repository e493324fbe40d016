//! Wall-clock time behind a trait.
//!
//! Cron due-ness is evaluated against calendar time, so the seam returns
//! `DateTime<Utc>` rather than a monotonic instant. Elapsed-time
//! measurements keep using `tokio::time::Instant`.
//!
//! ```
//! use chrono::{DateTime, Utc};
//! use rpnet_std::time::{Clock, SystemClock};
//!
//! fn is_due<C: Clock>(clock: &C, at: DateTime<Utc>) -> bool {
//!     clock.now() >= at
//! }
//!
//! assert!(is_due(&SystemClock, DateTime::<Utc>::MIN_UTC));
//! ```

mod mock;
mod system;

use chrono::{DateTime, Utc};

#[cfg(any(test, feature = "test-support"))]
pub use mock::MockClock;
pub use system::SystemClock;

pub trait Clock: Send + Sync + Clone + 'static {
    fn now(&self) -> DateTime<Utc>;
}
