//! A crate mirroring third-party web assets to durable storage.
//!
//! Recorded sessions reference scripts, stylesheets and the fonts and images those stylesheets pull in from third-party origins that
//! may be long gone by replay time. This crate copies them to an object storage in the background so that replays can serve them from
//! a stable origin. It provides features dedicated to:
//! - executing fetch-and-cache tasks on a bounded pool of workers,
//! - suppressing duplicate fetches of the same asset, in flight or recently stored,
//! - rewriting stylesheets to point to their mirrored sub-resources, and crawling those sub-resources up to a maximum depth,
//! - reporting failures without ever blocking the fetch path.
//!
//! Concurrency relies on a few primitives: a bounded `mpsc` channel as task queue, throttling submitters rather than growing memory,
//! a `watch` channel as shutdown signal, a `RwLock`'ed hashmap as deduplication registry, favourably read before being written, and a
//! `Notify` to wake the single consumer of error reports.
//!
//! Every asset is stored under a cache key derived from its URL, scoped by session unless it is a JS source file shared by every
//! session. Keys are also the storage layout:
//!
//! ```text
//!     - root storage
//!       L js
//!         L {escaped JS file URL}
//!       L {session_id}
//!         L {escaped asset URL}
//!         L {escaped asset URL}
//!         L ...
//! ```
//!
//! Escaping turns any URL into a single path segment, see [`rewrite::escape_key()`].
//!
//! A task goes through the following steps, any failure being reported to the [`ErrorStream`] with the URL trail that led to it:
//! 1. skip if its key is already registered, otherwise register it;
//! 2. skip if its key is stored and fresh;
//! 3. fetch, within a time limit and a size limit;
//! 4. rewrite if it is a stylesheet;
//! 5. upload;
//! 6. submit a child task for every cacheable reference of a stylesheet, if the recursion budget is not exhausted.
//!
//! Children are new tasks going through the same queue, a worker never waits for them.

mod cacher;
pub use cacher::{Cacher, DOWNLOADED_ASSETS};

mod error;
pub use error::{Error, Report};

pub mod config;
pub use config::{Config, ConfigError};

pub mod download;
pub mod metrics;
pub use metrics::{Counter, Metrics};

pub mod registry;
pub mod reporting;
pub use reporting::{ErrorSink, ErrorStream};

pub mod rewrite;
pub mod storage;
pub use storage::{FsStorage, MemoryStorage, Storage, StorageError};

pub mod task;
pub use task::{Closed, Overloaded, Task};
