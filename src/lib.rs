#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Counter storage for distributed rate limiting: given a named limit scoped
//! by resource, property and time window, answer "what is the current count
//! after adding N units" fast enough to make throttling decisions — even
//! when the authoritative counter lives across the network.
//!
//! ## Features
//!
//! - **Fixed-window and sliding-window in-memory stores** with lazy eviction
//! - **Redis backend** with an atomic carry-over script that approximates a
//!   sliding window in O(1) state per counter
//! - **Async reconciling wrappers**: callers are answered from memory; a
//!   periodic background task drains deltas to the backend without ever
//!   losing a concurrent increment
//! - One storage contract ([`UsageStorage`]) across all of the above
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::{AddAndGetRequest, InMemoryStorage, UsageStorage};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), floodgate::StorageError> {
//!     let storage = InMemoryStorage::new();
//!     let request = AddAndGetRequest::builder("search", "per-user", "alice")
//!         .window_length(Duration::from_secs(60))
//!         .build();
//!     let (_key, count) = storage.add_and_get_one(request).await?;
//!     assert_eq!(count, 1);
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod counter;
pub mod error;
pub mod key;
pub mod request;
pub mod storage;
pub mod window;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::CounterCell;
pub use error::StorageError;
pub use key::{LimitKey, SeriesKey};
pub use request::{AddAndGetRequest, AddAndGetRequestBuilder};
pub use storage::{
    AsyncBatchStorage, AsyncSlidingStorage, CounterFilter, InMemorySlidingStorage, InMemoryStorage,
    OverrideKeyRequest, RedisStorage, UsageStorage,
};
