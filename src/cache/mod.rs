//! Response cache and access-pattern prefetch.
//!
//! - [`fingerprint`]: canonical cache keys
//! - [`store`]: epoch-tagged entry store with a cell budget
//! - [`evictor`]: victim selection (stale first, then LRU)
//! - [`tracker`]: per-session access transitions
//! - [`prefetcher`]: background fetches for predicted ranges

pub mod evictor;
pub mod fingerprint;
pub mod prefetcher;
pub mod store;
pub mod tracker;
