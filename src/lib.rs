//! Purpose: Disk-backed cache for logged simulation variables, one generation per run.
//! Exports: `core` (cache files, multi-vector caches, vectors, registries, errors), `handler`, `cache_paths`.
//! Role: Library backing the `logcache` CLI; collaborators use the handler and shared variable handles.
//! Invariants: Single-threaded; shared ownership is `Rc` with interior mutability.
//! Invariants: A cache file lives exactly as long as its last subscribing vector.
pub mod cache_paths;
pub mod core;
pub mod handler;

pub use crate::core::error::{Error, ErrorKind, Result, to_exit_code};
pub use crate::core::multi_cache::{CacheSubscription, MultiDataVectorCache, Session};
pub use crate::core::registry::{GenerationRegistry, LogVariable, SharedLogVariable};
pub use crate::core::vector::CachableDataVector;
pub use crate::handler::{LogCacheConfig, LogDataHandler};
