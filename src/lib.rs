//! # docsync
//!
//! Change-data-capture pipeline keeping a denormalized, queryable document
//! index eventually consistent with a normalized relational source.
//!
//! ## Architecture
//!
//! ```text
//! Postgres NOTIFY -> Emitter -> Redis Stream -> Worker -> Projector -> Index
//!                                                                        |
//!                                 Search API  <-  Query Join Engine  <---+
//! ```
//!
//! ## Modules
//!
//! - [`change`]: change envelope and the typed per-table event union
//! - [`emitter`] / [`publisher`]: the capture/publish path
//! - [`consumer`] / [`projector`]: the projection path
//! - [`index`]: the document store seam (Redis + in-memory backends)
//! - [`query`] / [`api`]: the read side

pub mod api;
pub mod change;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod documents;
pub mod emitter;
pub mod index;
pub mod projector;
pub mod publisher;
pub mod query;
pub mod shutdown;

pub use change::{ChangeEnvelope, Operation, TableChange};
pub use projector::Projector;
pub use query::QueryEngine;

/// Redis stream carrying captured change events.
pub const CHANGE_STREAM_NAME: &str = "docsync:changes";

/// Default consumer group for projection workers.
pub const DEFAULT_CONSUMER_GROUP: &str = "docsync_projectors";
