//! Windowed distinct-id counting for tally.
//!
//! Ids submitted during a window are collected in a shared set; once per
//! flush interval the distinct count is read, sent downstream, pushed to any
//! registered callback endpoints, and the window is cleared.
//!
//! # Modules
//!
//! - [`store`] - the Identifier and Endpoint sets (Redis or in-memory)
//! - [`publisher`] - durable queue sink for flushed counts
//! - [`notifier`] - best-effort callback POSTs
//! - [`aggregator`] - the periodic flush loop tying the above together
//! - [`metrics`] - Prometheus helpers
//!
//! # Data flow
//!
//! ```text
//! ingest ──add──▶ WindowStore ──read+clear──▶ Aggregator ─┬─▶ CountPublisher (or log)
//!                                                         └─▶ Notifier
//! ```

pub mod aggregator;
mod error;
pub mod metrics;
pub mod notifier;
pub mod publisher;
pub mod store;

pub use aggregator::{
    Aggregator, AggregatorConfig, AggregatorHandle, CycleReport, FlushMode, Sink,
};
pub use error::{Error, Result};
pub use notifier::{Delivery, Notifier};
pub use publisher::{AmqpPublisher, CountPublisher};
pub use store::{MemoryStore, RedisStore, WindowSnapshot, WindowStore};
