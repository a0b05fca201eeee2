//! Tally Serve - HTTP ingest for windowed distinct-id counting.
//!
//! Clients submit ids (and optionally a callback URL) to
//! `GET /api/verve/accept`. Every flush interval the distinct count of the
//! window is published to a durable queue, or logged when no queue is
//! connected, and POSTed to each registered callback.
//!
//! # Architecture
//!
//! - **Config**: environment-driven settings
//! - **AppState**: shared window store handed to request handlers
//! - **Routes**: ingest and health handlers
//! - **Service**: startup wiring of store, publisher and aggregator loop

mod routes;
mod service;
mod state;

pub use self::routes::router;
pub use self::service::{Service, connect_store};
pub use self::state::{AppState, Config, StoreKind};
