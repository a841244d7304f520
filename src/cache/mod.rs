//! Response caching.
//!
//! - [`ResponseCache`] is what the gateway and dispatcher talk to: lazy
//!   expiry, hit/miss metrics, bypass on backend failure.
//! - [`CacheBackend`] is the storage seam; [`MemoryCacheBackend`] is the
//!   bundled moka implementation.

pub mod backend;
pub mod response;

pub use backend::{CacheBackend, CacheEntry, MemoryCacheBackend};
pub use response::{CacheConfig, ResponseCache};
