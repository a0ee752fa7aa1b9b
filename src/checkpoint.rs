//! Resume position tracking
//!
//! The optime is the sole piece of cross-run shared state: an opaque,
//! totally ordered marker into the source oplog. It is persisted only after
//! the corresponding edits are durably committed at the destination, which
//! is what makes restart-and-replay at-least-once without gaps.
//!
//! Storage backends follow the same protocol: serialize to JSON, write to a
//! temp file, fsync, atomic rename. A crash mid-save leaves the previous
//! position intact.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use mongodb::bson::Timestamp;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

/// A position in the source oplog.
///
/// Wraps the oplog entry's logical timestamp plus the election term for
/// protocolVersion 1 replica sets. Ordering is by timestamp first, so
/// positions from both wire formats compare correctly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(from = "OptimeRepr", into = "OptimeRepr")]
pub struct Optime {
    /// Oplog timestamp (seconds + ordinal)
    pub ts: Timestamp,
    /// Election term, when the source reports one
    pub term: Option<i64>,
}

impl Optime {
    /// Create a position from a bare timestamp.
    pub fn new(ts: Timestamp) -> Self {
        Self { ts, term: None }
    }

    /// Create a position from a timestamp and term.
    pub fn with_term(ts: Timestamp, term: i64) -> Self {
        Self {
            ts,
            term: Some(term),
        }
    }

    /// The zero position, ordered before every real oplog entry.
    pub fn zero() -> Self {
        Self::new(Timestamp {
            time: 0,
            increment: 0,
        })
    }
}

impl std::fmt::Display for Optime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.term {
            Some(t) => write!(f, "{}:{} (t: {})", self.ts.time, self.ts.increment, t),
            None => write!(f, "{}:{}", self.ts.time, self.ts.increment),
        }
    }
}

/// Plain on-disk shape, independent of BSON extended JSON.
#[derive(Serialize, Deserialize)]
struct OptimeRepr {
    time: u32,
    increment: u32,
    #[serde(default)]
    term: Option<i64>,
}

impl From<OptimeRepr> for Optime {
    fn from(r: OptimeRepr) -> Self {
        Self {
            ts: Timestamp {
                time: r.time,
                increment: r.increment,
            },
            term: r.term,
        }
    }
}

impl From<Optime> for OptimeRepr {
    fn from(o: Optime) -> Self {
        Self {
            time: o.ts.time,
            increment: o.ts.increment,
            term: o.term,
        }
    }
}

/// Durable storage for the resume position.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Persist a confirmed position.
    async fn save(&self, position: Optime) -> Result<()>;

    /// Load the last persisted position, if any.
    async fn load(&self) -> Result<Option<Optime>>;
}

/// Shared position store handle.
pub type SharedPositionStore = Arc<dyn PositionStore>;

/// File-backed position store with atomic writes.
pub struct FilePositionStore {
    path: PathBuf,
    /// Whether to fsync after writes
    fsync: bool,
}

impl FilePositionStore {
    /// Create a store persisting to the given file path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            fsync: true,
        }
    }

    /// Create a store with fsync disabled (faster, weaker durability).
    pub fn without_fsync(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            fsync: false,
        }
    }
}

#[async_trait]
impl PositionStore for FilePositionStore {
    async fn save(&self, position: Optime) -> Result<()> {
        let json = serde_json::to_string_pretty(&position)?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &self.path).await?;

        debug!("Saved position {}", position);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Optime>> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let position: Optime = serde_json::from_str(&contents)?;
                Ok(Some(position))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Io(e)),
        }
    }
}

/// In-memory position store for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    position: RwLock<Option<Optime>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn save(&self, position: Optime) -> Result<()> {
        let mut slot = self.position.write().await;
        *slot = Some(position);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Optime>> {
        let slot = self.position.read().await;
        Ok(*slot)
    }
}
