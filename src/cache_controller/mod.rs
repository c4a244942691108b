//! Edge cache controller for the TripBasket web client.
//!
//! Mirrors the lifecycle of a browser service worker: `install` precaches the
//! app shell, `activate` drops partitions left by older versions, and
//! `handle_fetch` routes each intercepted request through a cache-first or
//! network-first strategy.

pub mod controller;
pub mod network;
pub mod storage;
pub mod types;

pub use controller::{CacheConfig, CacheController, WorkerState};
pub use network::{HttpNetwork, Network};
pub use storage::{CacheStorage, DEFAULT_PARTITION_CAPACITY, MemoryCacheStorage};
pub use types::{CacheError, CacheMode, FetchDecision, FetchRequest, FetchResponse, RequestMode};
