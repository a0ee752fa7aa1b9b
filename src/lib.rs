//! # oplogsync - live MongoDB replication
//!
//! Continuously copies data from a source replica set to a destination
//! (standalone, replica set, or sharded cluster) by tailing the source
//! oplog and replaying each operation as an idempotent write.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Introspection│     │ Oplog Tailer │     │   Decoder    │
//! │ (start pos)  │────▶│ (live cursor)│────▶│ (canonical   │
//! └──────────────┘     └──────────────┘     │    edits)    │
//!                                           └──────┬───────┘
//!                                                  │
//!                      ┌──────────────┐     ┌──────▼───────┐
//!                      │   Position   │◀────│ Orchestrator │
//!                      │    Store     │     │  + Applier   │
//!                      └──────────────┘     └──────────────┘
//! ```
//!
//! The resume position is persisted only after the corresponding write is
//! durably committed at the destination: replay is at-least-once with
//! idempotent edits, never lossy.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use oplogsync::{FilePositionStore, MongoEndpoint, OplogSyncer};
//!
//! # async fn example() -> oplogsync::Result<()> {
//! let mut syncer = OplogSyncer::builder()
//!     .source(MongoEndpoint::single("source:27017"))
//!     .destination(MongoEndpoint::single("dest:27017"))
//!     .position_store(Arc::new(FilePositionStore::new("/var/lib/oplogsync/position.json")))
//!     .build()?;
//!
//! // Blocks until fatal error or shutdown signal.
//! syncer.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Fatal errors (unexpected duplicate keys, unrecognized write failures)
//! return from `run` without the position advancing; embedders should exit
//! non-zero and restart only after operator intervention. Transient
//! connectivity is absorbed internally by unbounded reconnect loops.

pub mod apply;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod conn;
pub mod error;
pub mod filter;
pub mod introspect;
pub mod oplog;
pub mod syncer;
pub mod tailer;

pub use apply::Applier;
pub use batch::{BatchCounts, EditBatch};
pub use checkpoint::{
    FilePositionStore, MemoryPositionStore, Optime, PositionStore, SharedPositionStore,
};
pub use config::{MongoEndpoint, SyncOptions};
pub use conn::MongoConn;
pub use error::{ErrorCategory, Result, SyncError};
pub use filter::{
    FilterConfig, IdentityMapping, IncludeAll, NamespaceFilter, NamespaceMapping, RenameMapping,
    StaticFilter,
};
pub use introspect::PrimaryInfo;
pub use oplog::{classify, Decoded, OpKind, OplogEdit, OplogRecord, SkipReason};
pub use syncer::{shutdown_channel, OplogSyncer};
pub use tailer::OplogTailer;
