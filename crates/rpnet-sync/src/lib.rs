//! # rpnet-sync
//!
//! Coordination primitives over a revisioned KV bucket
//! ([`rpnet_nats::KvBucket`]):
//!
//! | type | guarantee |
//! |------|-----------|
//! | [`Lock`] | at most one holder per name; abandoned locks are reclaimed after `max_lock_age` |
//! | [`LeaderElector`] | at most one leader per key; a new leader emerges within the ttl after the old one stops or goes silent |
//! | [`Store`] | per-key linearizable writes, local reads, replicas converge through [`Merge`] |
//!
//! All three work against any [`rpnet_nats::KvBucket`], including the
//! in-memory [`rpnet_nats::MockKv`].

pub mod error;
pub mod leader;
pub mod lock;
pub mod store;

pub use error::{ElectionError, LockError, StoreError};
pub use leader::{ElectionConfig, LeaderElector};
pub use lock::{LOCK_PREFIX, Lock};
pub use store::{Merge, Store, StoreBuilder};
