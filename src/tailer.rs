//! Oplog tailing
//!
//! Maintains the long-lived tailable-await cursor over `local.oplog.rs`.
//! The stream is unbounded (the oplog is continuously appended) and
//! restartable: on any interruption the cursor is reopened from the last
//! position the orchestrator confirmed as fully applied, so records are
//! redelivered rather than lost. Entries tagged `fromMigrate` are excluded
//! at the server; they are produced by internal chunk migrations and would
//! double-apply if replayed verbatim.

use crate::checkpoint::Optime;
use crate::config::SyncOptions;
use crate::conn::MongoConn;
use crate::error::Result;
use crate::oplog::OplogRecord;
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::CursorType;
use mongodb::Cursor;
use std::time::Duration;
use tracing::{info, warn};

/// Tails the source oplog as a live, ordered, restartable record stream.
pub struct OplogTailer {
    conn: MongoConn,
    max_await_time: Duration,
    cursor: Option<Cursor<Document>>,
    /// Last position the orchestrator confirmed as fully applied; every
    /// reopen resumes from here.
    confirmed: Optime,
}

impl OplogTailer {
    /// Create a tailer over a source connection handle.
    pub fn new(conn: MongoConn, options: &SyncOptions) -> Self {
        Self {
            conn,
            max_await_time: options.max_await_time,
            cursor: None,
            confirmed: Optime::zero(),
        }
    }

    /// Connect the underlying handle.
    pub async fn connect(&mut self) -> Result<()> {
        self.conn.connect().await
    }

    /// Close the cursor and the underlying handle.
    pub async fn close(&mut self) {
        self.cursor = None;
        self.conn.close().await;
    }

    /// The source connection handle.
    pub fn conn(&self) -> &MongoConn {
        &self.conn
    }

    /// Start tailing from a position.
    pub async fn tail(&mut self, start: Optime) -> Result<()> {
        self.confirmed = start;
        let cursor = self.open_once().await?;
        self.cursor = Some(cursor);
        info!("Tailing oplog from {}", start);
        Ok(())
    }

    /// Record that everything up to `position` was durably applied.
    ///
    /// Positions are monotonically non-decreasing; a stale confirm is
    /// ignored.
    pub fn confirm(&mut self, position: Optime) {
        if position >= self.confirmed {
            self.confirmed = position;
        }
    }

    /// The current resume position.
    pub fn confirmed(&self) -> Optime {
        self.confirmed
    }

    /// Produce the next oplog record, blocking (bounded) while idle.
    ///
    /// Cursor errors and cursor death are absorbed by reconnecting and
    /// reopening from the confirmed position; records already confirmed are
    /// never redelivered, records after it may be (idempotent replay makes
    /// that safe).
    pub async fn next(&mut self) -> Result<OplogRecord> {
        loop {
            let cursor = match self.cursor.as_mut() {
                Some(cursor) => cursor,
                None => {
                    self.reopen().await;
                    continue;
                }
            };
            match cursor.try_next().await {
                Ok(Some(raw)) => return OplogRecord::from_document(raw),
                Ok(None) => {
                    // A tailable-await cursor only ends when it dies
                    // (e.g. oplog rollover past its position).
                    warn!("Oplog cursor ended, reopening from {}", self.confirmed);
                    self.cursor = None;
                }
                Err(e) => {
                    warn!("Oplog cursor error: {}", e);
                    self.cursor = None;
                    self.conn.reconnect().await;
                }
            }
        }
    }

    /// Reopen the cursor from the confirmed position, reconnecting until
    /// it succeeds.
    async fn reopen(&mut self) {
        loop {
            match self.open_once().await {
                Ok(cursor) => {
                    self.cursor = Some(cursor);
                    info!("Oplog cursor reopened from {}", self.confirmed);
                    return;
                }
                Err(e) => {
                    warn!("Failed to reopen oplog cursor: {}", e);
                    self.conn.reconnect().await;
                }
            }
        }
    }

    /// One attempt at opening the tailable cursor.
    async fn open_once(&self) -> Result<Cursor<Document>> {
        let coll = self
            .conn
            .client()?
            .database("local")
            .collection::<Document>("oplog.rs");
        let cursor = coll
            .find(oplog_filter(self.confirmed))
            .cursor_type(CursorType::TailableAwait)
            .no_cursor_timeout(true)
            .max_await_time(self.max_await_time)
            .await?;
        Ok(cursor)
    }
}

/// The oplog query: everything at or after `start`, excluding entries
/// produced by internal chunk migrations.
pub fn oplog_filter(start: Optime) -> Document {
    doc! {
        "fromMigrate": { "$exists": false },
        "ts": { "$gte": start.ts },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MongoEndpoint;
    use mongodb::bson::{Bson, Timestamp};

    #[test]
    fn test_oplog_filter_shape() {
        let start = Optime::new(Timestamp {
            time: 100,
            increment: 5,
        });
        let filter = oplog_filter(start);
        assert_eq!(
            filter.get_document("fromMigrate").unwrap(),
            &doc! { "$exists": false }
        );
        assert_eq!(
            filter.get_document("ts").unwrap().get("$gte"),
            Some(&Bson::Timestamp(Timestamp {
                time: 100,
                increment: 5,
            }))
        );
    }

    #[test]
    fn test_confirm_is_monotonic() {
        let conn = MongoConn::new(
            MongoEndpoint::single("localhost:27017"),
            SyncOptions::default(),
        )
        .unwrap();
        let mut tailer = OplogTailer::new(conn, &SyncOptions::default());

        let early = Optime::new(Timestamp {
            time: 10,
            increment: 0,
        });
        let late = Optime::new(Timestamp {
            time: 20,
            increment: 0,
        });

        tailer.confirm(late);
        assert_eq!(tailer.confirmed(), late);

        // A stale confirm must not move the resume position backwards.
        tailer.confirm(early);
        assert_eq!(tailer.confirmed(), late);
    }
}
