//! Oplog record decoding
//!
//! Interprets raw `local.oplog.rs` entries and normalizes them into
//! canonical edits the writer can apply idempotently. Inserts become
//! upserts keyed by the primary key so that at-least-once delivery never
//! duplicates documents; insert-kind records without a primary key are
//! index/metadata writes and are skipped, detected structurally rather
//! than by any flag.
//!
//! Before classification the decoder strips the server's internal `$v`
//! versioning metadata (top level and inside `$set`); it is an artifact of
//! the source's replication protocol and has no meaning on the destination.

use crate::checkpoint::Optime;
use crate::error::{Result, SyncError};
use mongodb::bson::{doc, Bson, Document, Timestamp};
use serde::Deserialize;
use tracing::error;

/// The unique document identifier field used for idempotent addressing.
pub const PRIMARY_KEY_FIELD: &str = "_id";

/// Internal versioning metadata stripped during normalization.
const VERSION_FIELD: &str = "$v";

/// One raw entry from the source oplog.
#[derive(Debug, Clone, Deserialize)]
pub struct OplogRecord {
    /// Operation kind: `i`, `u`, `d`, `c`, `n`
    pub op: String,
    /// Target namespace as `db.coll`
    #[serde(default)]
    pub ns: String,
    /// Logical timestamp of this entry
    pub ts: Timestamp,
    /// Election term (protocolVersion 1)
    #[serde(default)]
    pub t: Option<i64>,
    /// Primary document or delta payload
    #[serde(default)]
    pub o: Document,
    /// Secondary selector payload (updates)
    #[serde(default)]
    pub o2: Option<Document>,
    /// Set on entries produced by internal chunk migrations
    #[serde(default, rename = "fromMigrate")]
    pub from_migrate: Option<bool>,
}

impl OplogRecord {
    /// Decode a raw oplog document.
    pub fn from_document(doc: Document) -> Result<Self> {
        Ok(mongodb::bson::from_document(doc)?)
    }

    /// The operation kind of this record.
    pub fn kind(&self) -> OpKind {
        match self.op.as_str() {
            "i" => OpKind::Insert,
            "u" => OpKind::Update,
            "d" => OpKind::Delete,
            "c" => OpKind::Command,
            "n" => OpKind::Noop,
            _ => OpKind::Unknown,
        }
    }

    /// The oplog position of this record.
    pub fn position(&self) -> Optime {
        Optime {
            ts: self.ts,
            term: self.t,
        }
    }
}

/// Operation kind of an oplog record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Command,
    Noop,
    Unknown,
}

/// A canonical edit, free of source-log versioning noise.
///
/// This is the unit the writer consumes, matched exhaustively. `Insert` is
/// the one non-idempotent variant; the decoder never produces it for oplog
/// records (inserts are rewritten as upserts), it exists for bulk-load
/// callers feeding an initial copy through the same writer.
#[derive(Debug, Clone, PartialEq)]
pub enum OplogEdit {
    /// Plain insert (bulk-load path only)
    Insert { doc: Document },
    /// Replace-or-insert keyed by an explicit filter
    Upsert { filter: Document, doc: Document },
    /// Apply a delta to the document selected by `filter`
    Update { filter: Document, update: Document },
    /// Delete the document selected by `filter`
    Delete { filter: Document },
}

impl OplogEdit {
    /// Whether replaying this edit twice leaves the same state as once.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Self::Insert { .. })
    }
}

/// Outcome of classifying one oplog record.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A document write addressed to a namespace
    Edit {
        db: String,
        coll: String,
        edit: OplogEdit,
    },
    /// An administrative command to forward to the destination database
    Command { db: String, command: Document },
    /// Nothing to replay
    Skip(SkipReason),
}

/// Why a record decoded to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No-op record
    Noop,
    /// Insert-kind record without a primary key (index/metadata write)
    IndexMetadata,
    /// Operation kind this engine does not recognize
    UnknownOp,
    /// Record is structurally incomplete for its kind
    Malformed,
}

/// Classify one oplog record into a canonical edit.
///
/// Implements the decision table: insert-with-pk becomes an upsert, updates
/// carry their `o2` selector, deletes carry their payload as the filter,
/// commands are forwarded raw, and no-ops plus unrecognized kinds decode to
/// nothing. Unrecognized kinds are logged and dropped, never fatal.
pub fn classify(record: &OplogRecord) -> Result<Decoded> {
    match record.kind() {
        OpKind::Noop => return Ok(Decoded::Skip(SkipReason::Noop)),
        OpKind::Unknown => {
            error!("Unrecognized op kind '{}' in ns {}", record.op, record.ns);
            return Ok(Decoded::Skip(SkipReason::UnknownOp));
        }
        _ => {}
    }

    let (db, coll) = parse_namespace(&record.ns)?;
    let mut payload = record.o.clone();
    strip_versioning(&mut payload);

    let decoded = match record.kind() {
        OpKind::Insert => match payload.get(PRIMARY_KEY_FIELD) {
            Some(id) => Decoded::Edit {
                db,
                coll,
                edit: OplogEdit::Upsert {
                    filter: doc! { PRIMARY_KEY_FIELD: id.clone() },
                    doc: payload,
                },
            },
            // Index builds insert into *.system.indexes without an _id.
            None => Decoded::Skip(SkipReason::IndexMetadata),
        },
        OpKind::Update => match &record.o2 {
            Some(filter) => Decoded::Edit {
                db,
                coll,
                edit: OplogEdit::Update {
                    filter: filter.clone(),
                    update: payload,
                },
            },
            None => {
                error!("Update record without o2 selector in ns {}", record.ns);
                Decoded::Skip(SkipReason::Malformed)
            }
        },
        OpKind::Delete => Decoded::Edit {
            db,
            coll,
            edit: OplogEdit::Delete { filter: payload },
        },
        OpKind::Command => Decoded::Command {
            db,
            command: payload,
        },
        OpKind::Noop | OpKind::Unknown => unreachable!("handled above"),
    };

    Ok(decoded)
}

/// Remove internal versioning metadata from a payload, at the top level and
/// inside a nested `$set` operation.
pub fn strip_versioning(payload: &mut Document) {
    payload.remove(VERSION_FIELD);
    if let Some(Bson::Document(set)) = payload.get_mut("$set") {
        set.remove(VERSION_FIELD);
    }
}

/// Split a namespace string on its first dot.
///
/// Collection names may themselves contain dots (`db.system.indexes`).
pub fn parse_namespace(ns: &str) -> Result<(String, String)> {
    match ns.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => {
            Ok((db.to_string(), coll.to_string()))
        }
        _ => Err(SyncError::InvalidNamespace(ns.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(op: &str, ns: &str, o: Document, o2: Option<Document>) -> OplogRecord {
        OplogRecord {
            op: op.to_string(),
            ns: ns.to_string(),
            ts: Timestamp {
                time: 1705000000,
                increment: 1,
            },
            t: Some(1),
            o,
            o2,
            from_migrate: None,
        }
    }

    #[test]
    fn test_insert_becomes_upsert() {
        let r = record("i", "d.c", doc! { "_id": 1, "x": 1 }, None);
        let decoded = classify(&r).unwrap();
        assert_eq!(
            decoded,
            Decoded::Edit {
                db: "d".into(),
                coll: "c".into(),
                edit: OplogEdit::Upsert {
                    filter: doc! { "_id": 1 },
                    doc: doc! { "_id": 1, "x": 1 },
                },
            }
        );
    }

    #[test]
    fn test_insert_without_pk_is_metadata_skip() {
        let r = record("i", "d.system.indexes", doc! { "key": { "x": 1 } }, None);
        assert_eq!(
            classify(&r).unwrap(),
            Decoded::Skip(SkipReason::IndexMetadata)
        );
    }

    #[test]
    fn test_update_carries_selector_and_delta() {
        let r = record(
            "u",
            "d.c",
            doc! { "$set": { "x": 2 } },
            Some(doc! { "_id": 1 }),
        );
        match classify(&r).unwrap() {
            Decoded::Edit {
                edit: OplogEdit::Update { filter, update },
                ..
            } => {
                assert_eq!(filter, doc! { "_id": 1 });
                assert_eq!(update, doc! { "$set": { "x": 2 } });
            }
            other => panic!("expected update edit, got {:?}", other),
        }
    }

    #[test]
    fn test_update_without_selector_is_malformed_skip() {
        let r = record("u", "d.c", doc! { "$set": { "x": 2 } }, None);
        assert_eq!(classify(&r).unwrap(), Decoded::Skip(SkipReason::Malformed));
    }

    #[test]
    fn test_delete_uses_payload_as_filter() {
        let r = record("d", "d.c", doc! { "_id": 1 }, None);
        match classify(&r).unwrap() {
            Decoded::Edit {
                edit: OplogEdit::Delete { filter },
                ..
            } => assert_eq!(filter, doc! { "_id": 1 }),
            other => panic!("expected delete edit, got {:?}", other),
        }
    }

    #[test]
    fn test_command_is_forwarded_raw() {
        let r = record("c", "d.$cmd", doc! { "drop": "c" }, None);
        assert_eq!(
            classify(&r).unwrap(),
            Decoded::Command {
                db: "d".into(),
                command: doc! { "drop": "c" },
            }
        );
    }

    #[test]
    fn test_noop_and_unknown_skip() {
        let r = record("n", "", doc! {}, None);
        assert_eq!(classify(&r).unwrap(), Decoded::Skip(SkipReason::Noop));

        let r = record("x", "d.c", doc! {}, None);
        assert_eq!(classify(&r).unwrap(), Decoded::Skip(SkipReason::UnknownOp));
    }

    #[test]
    fn test_versioning_metadata_is_stripped() {
        let r = record(
            "u",
            "d.c",
            doc! { "$v": 2, "$set": { "$v": 1, "x": 2 } },
            Some(doc! { "_id": 1 }),
        );
        match classify(&r).unwrap() {
            Decoded::Edit {
                edit: OplogEdit::Update { update, .. },
                ..
            } => {
                assert_eq!(update, doc! { "$set": { "x": 2 } });
            }
            other => panic!("expected update edit, got {:?}", other),
        }
    }

    #[test]
    fn test_versioning_stripped_from_insert_payload() {
        let r = record("i", "d.c", doc! { "_id": 1, "$v": 1 }, None);
        match classify(&r).unwrap() {
            Decoded::Edit {
                edit: OplogEdit::Upsert { doc, .. },
                ..
            } => assert_eq!(doc, doc! { "_id": 1 }),
            other => panic!("expected upsert edit, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_namespace() {
        assert_eq!(
            parse_namespace("db.coll").unwrap(),
            ("db".to_string(), "coll".to_string())
        );
        assert_eq!(
            parse_namespace("d.system.indexes").unwrap(),
            ("d".to_string(), "system.indexes".to_string())
        );
        assert!(parse_namespace("nodot").is_err());
        assert!(parse_namespace(".coll").is_err());
        assert!(parse_namespace("db.").is_err());
    }

    #[test]
    fn test_record_position() {
        let r = record("i", "d.c", doc! { "_id": 1 }, None);
        let pos = r.position();
        assert_eq!(pos.ts.time, 1705000000);
        assert_eq!(pos.term, Some(1));
    }

    #[test]
    fn test_record_from_document() {
        let raw = doc! {
            "op": "i",
            "ns": "d.c",
            "ts": Timestamp { time: 10, increment: 2 },
            "o": { "_id": 5 },
        };
        let r = OplogRecord::from_document(raw).unwrap();
        assert_eq!(r.kind(), OpKind::Insert);
        assert_eq!(r.ns, "d.c");
        assert_eq!(r.t, None);
        assert_eq!(r.position().ts.increment, 2);
    }

    #[test]
    fn test_edit_idempotency() {
        assert!(OplogEdit::Upsert {
            filter: doc! {},
            doc: doc! {}
        }
        .is_idempotent());
        assert!(OplogEdit::Delete { filter: doc! {} }.is_idempotent());
        assert!(!OplogEdit::Insert { doc: doc! {} }.is_idempotent());
    }
}
