//! mdcache - Metadata cache with flush dependencies, coordinated multi-process
//! writes and cache images
//!
//! This library provides the entry store, the flush-dependency graph, the
//! sync-point protocol for cooperating processes, and the cache image codec.

pub mod auto_resize;
pub mod cache;
pub mod cache_image;
pub mod config;
pub mod coordination;
pub mod entry;
pub mod entry_list;
pub mod error;
pub mod flush_dependency;
pub mod logging;
pub mod process_group;
pub mod storage;

pub use error::{CacheError, Result};
