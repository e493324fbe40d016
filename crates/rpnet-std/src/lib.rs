//! Process-level seams shared by the rpnet crates.
//!
//! | Concern | Trait | Production | Test |
//! |---------|-------|------------|------|
//! | Env vars | [`ReadEnv`] | [`SystemEnv`] | [`InMemoryEnv`]* |
//! | Wall-clock time | [`Clock`] | [`SystemClock`] | [`MockClock`]* |
//!
//! *Available with `#[cfg(test)]` or the `"test-support"` feature.
//!
//! Both test doubles are `Send + Sync` so they can be shared with tasks
//! spawned on a multi-threaded tokio runtime.

pub mod env;
pub mod time;

pub use env::{ReadEnv, SystemEnv};
pub use time::{Clock, SystemClock};
