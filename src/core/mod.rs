// Core modules: cache files, shared multi-vector caches, dual-mode vectors, generation registries.
pub mod cache_file;
pub mod checkout;
pub mod error;
pub mod multi_cache;
pub mod registry;
pub mod vector;
