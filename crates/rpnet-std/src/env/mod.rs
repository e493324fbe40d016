//! Environment variable access behind a trait so configuration loading can
//! be tested without touching the process environment.
//!
//! ```
//! use rpnet_std::env::{ReadEnv, SystemEnv};
//!
//! fn node_name<E: ReadEnv>(env: &E) -> String {
//!     env.var("CRON_NODE_NAME").unwrap_or_else(|_| "local".to_string())
//! }
//!
//! let name = node_name(&SystemEnv);
//! ```

mod in_memory;
mod read_env;
mod system;

#[cfg(any(test, feature = "test-support"))]
pub use in_memory::InMemoryEnv;
pub use read_env::ReadEnv;
pub use system::SystemEnv;
