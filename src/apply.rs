//! Destination-side write application
//!
//! Two paths share one edit vocabulary: the bulk path commits a whole
//! [`EditBatch`] in one driver-level bulk write, and the tailing path
//! replays single edits. Both absorb lost connections through the
//! reconnect primitive. A bulk failure that is not connection-related
//! degrades to per-edit replay in original order, where the duplicate-key
//! policy applies and every unrecognized failure is deliberately fatal:
//! the engine refuses to guess rather than risk silent divergence.

use crate::batch::EditBatch;
use crate::conn::MongoConn;
use crate::error::{Result, SyncError};
use crate::oplog::OplogEdit;
use mongodb::bson::{Bson, Document};
use mongodb::options::{
    DeleteOneModel, InsertOneModel, ReplaceOneModel, UpdateModifications, UpdateOneModel,
    WriteModel,
};
use mongodb::{Collection, Namespace};
use tracing::{debug, info, warn};

/// Applies canonical edits to the destination.
pub struct Applier {
    conn: MongoConn,
    ignore_duplicate_key: bool,
}

impl Applier {
    /// Create an applier over a destination connection handle.
    pub fn new(conn: MongoConn, ignore_duplicate_key: bool) -> Self {
        Self {
            conn,
            ignore_duplicate_key,
        }
    }

    /// Connect the underlying handle.
    pub async fn connect(&mut self) -> Result<()> {
        self.conn.connect().await
    }

    /// Close the underlying handle.
    pub async fn close(&mut self) {
        self.conn.close().await
    }

    /// Reconnect the underlying handle (blocks until success).
    pub async fn reconnect(&mut self) {
        self.conn.reconnect().await
    }

    /// Commit a batch of edits to its namespace.
    ///
    /// Fast path is one bulk write. Lost connections retry the entire
    /// batch from scratch when every edit is idempotent; any other failure
    /// degrades to per-edit replay in original order.
    ///
    /// The tailing loop applies records one at a time through
    /// [`Applier::apply_edit`]; this entry point is for bulk producers such
    /// as an initial collection copy.
    pub async fn apply_batch(&mut self, batch: &EditBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        loop {
            match self.bulk_commit(batch).await {
                Ok(()) => {
                    debug!(
                        "Committed batch of {} edits to {} ({:?})",
                        batch.len(),
                        batch.namespace(),
                        batch.counts()
                    );
                    return Ok(());
                }
                Err(e) if e.is_transient() && batch.retryable() => {
                    warn!("Lost connection during bulk write: {}", e);
                    self.conn.reconnect().await;
                }
                Err(e) => {
                    warn!(
                        "Bulk write to {} failed, replaying {} edits individually: {}",
                        batch.namespace(),
                        batch.len(),
                        e
                    );
                    for edit in &batch.edits {
                        self.apply_edit(&batch.db, &batch.coll, edit).await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Apply one edit, absorbing transient failures.
    ///
    /// Duplicate keys follow the configured policy: logged and skipped when
    /// `ignore_duplicate_key` is set, fatal otherwise. Updates rejected for
    /// mutating an immutable shard-key field fall back to
    /// delete-then-insert. Every other failure is fatal.
    pub async fn apply_edit(&mut self, db: &str, coll: &str, edit: &OplogEdit) -> Result<()> {
        loop {
            match self.try_edit(db, coll, edit).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!("Lost connection applying edit to {}.{}: {}", db, coll, e);
                    self.conn.reconnect().await;
                }
                Err(e) if e.is_duplicate_key() => {
                    if self.ignore_duplicate_key {
                        info!("Ignoring duplicate key on {}.{}: {}", db, coll, e);
                        return Ok(());
                    }
                    return Err(SyncError::fatal(format!(
                        "unexpected duplicate key on {}.{}: {}",
                        db, coll, e
                    )));
                }
                Err(e) if e.is_immutable_field() => {
                    let OplogEdit::Update { filter, update } = edit else {
                        return Err(SyncError::fatal(format!(
                            "immutable field violation outside an update on {}.{}: {}",
                            db, coll, e
                        )));
                    };
                    warn!(
                        "Destination rejected shard-key mutation on {}.{}, \
                         replaying as delete-then-insert",
                        db, coll
                    );
                    match self.replace_shard_key_document(db, coll, filter, update).await {
                        Ok(()) => return Ok(()),
                        Err(e) if e.is_transient() => {
                            // Retry the whole edit; the position has not
                            // advanced, so replaying it is safe.
                            self.conn.reconnect().await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    return Err(SyncError::fatal(format!(
                        "unhandled write failure on {}.{}: {}",
                        db, coll, e
                    )));
                }
            }
        }
    }

    /// Forward an administrative command to the destination database.
    ///
    /// Commands may legitimately not apply to a narrower replicated scope,
    /// so operation failures are logged at info and swallowed.
    pub async fn execute_command(&mut self, db: &str, command: &Document) -> Result<()> {
        loop {
            let attempt = match self.conn.client() {
                Ok(client) => client
                    .database(db)
                    .run_command(command.clone())
                    .await
                    .map(|_| ())
                    .map_err(SyncError::from),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!("Lost connection executing command on {}: {}", db, e);
                    self.conn.reconnect().await;
                }
                Err(e) => {
                    info!("Command on {} not applied: {}", db, e);
                    return Ok(());
                }
            }
        }
    }

    /// One bulk write attempt for the whole batch.
    async fn bulk_commit(&self, batch: &EditBatch) -> Result<()> {
        let ns = Namespace::new(batch.db.clone(), batch.coll.clone());
        let models: Vec<WriteModel> = batch
            .edits
            .iter()
            .map(|edit| write_model(&ns, edit))
            .collect();
        self.conn
            .client()?
            .bulk_write(models)
            .ordered(batch.ordered)
            .await?;
        Ok(())
    }

    /// One application attempt for a single edit.
    async fn try_edit(&self, db: &str, coll: &str, edit: &OplogEdit) -> Result<()> {
        let collection = self.collection(db, coll)?;
        match edit {
            OplogEdit::Insert { doc } => {
                collection.insert_one(doc.clone()).await?;
            }
            OplogEdit::Upsert { filter, doc } => {
                collection
                    .replace_one(filter.clone(), doc.clone())
                    .upsert(true)
                    .await?;
            }
            OplogEdit::Update { filter, update } => {
                if is_operator_update(update) {
                    collection
                        .update_one(
                            filter.clone(),
                            UpdateModifications::Document(update.clone()),
                        )
                        .await?;
                } else {
                    // Pre-operator oplog format: the payload is a full
                    // replacement document.
                    collection.replace_one(filter.clone(), update.clone()).await?;
                }
            }
            OplogEdit::Delete { filter } => {
                collection.delete_one(filter.clone()).await?;
            }
        }
        Ok(())
    }

    /// Replay an update that mutates an immutable shard-key field.
    ///
    /// Reads the current destination document by the update's filter (fatal
    /// if absent), computes the new document by merging the `$set` delta or
    /// substituting a full replacement, deletes the old document, and
    /// inserts the new one. The two steps are not atomic; a crash in
    /// between leaves the document absent until the engine restarts and
    /// replays the same record, which is safe because the resume position
    /// has not advanced past it.
    async fn replace_shard_key_document(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<()> {
        let collection = self.collection(db, coll)?;

        let old_doc = collection.find_one(filter.clone()).await?.ok_or_else(|| {
            SyncError::fatal(format!(
                "shard-key replay on {}.{}: no document matches {}",
                db, coll, filter
            ))
        })?;
        let new_doc = merge_update(old_doc, update);

        let deleted = collection.delete_one(filter.clone()).await?;
        if deleted.deleted_count != 1 {
            return Err(SyncError::fatal(format!(
                "shard-key replay on {}.{}: delete matched {} documents",
                db, coll, deleted.deleted_count
            )));
        }
        collection.insert_one(new_doc).await?;
        Ok(())
    }

    fn collection(&self, db: &str, coll: &str) -> Result<Collection<Document>> {
        Ok(self.conn.client()?.database(db).collection(coll))
    }
}

/// Build the driver write model for one edit.
fn write_model(ns: &Namespace, edit: &OplogEdit) -> WriteModel {
    match edit {
        OplogEdit::Insert { doc } => WriteModel::InsertOne(
            InsertOneModel::builder()
                .namespace(ns.clone())
                .document(doc.clone())
                .build(),
        ),
        OplogEdit::Upsert { filter, doc } => WriteModel::ReplaceOne(
            ReplaceOneModel::builder()
                .namespace(ns.clone())
                .filter(filter.clone())
                .replacement(doc.clone())
                .upsert(true)
                .build(),
        ),
        OplogEdit::Update { filter, update } => {
            if is_operator_update(update) {
                WriteModel::UpdateOne(
                    UpdateOneModel::builder()
                        .namespace(ns.clone())
                        .filter(filter.clone())
                        .update(UpdateModifications::Document(update.clone()))
                        .build(),
                )
            } else {
                WriteModel::ReplaceOne(
                    ReplaceOneModel::builder()
                        .namespace(ns.clone())
                        .filter(filter.clone())
                        .replacement(update.clone())
                        .build(),
                )
            }
        }
        OplogEdit::Delete { filter } => WriteModel::DeleteOne(
            DeleteOneModel::builder()
                .namespace(ns.clone())
                .filter(filter.clone())
                .build(),
        ),
    }
}

/// Whether an update payload uses atomic modifiers (`$set`, ...) rather
/// than being a full replacement document.
pub(crate) fn is_operator_update(update: &Document) -> bool {
    update.keys().next().is_some_and(|k| k.starts_with('$'))
}

/// Compute the post-update document for the shard-key replay path.
///
/// A `$set` delta is merged over the old document; any other payload is a
/// full replacement.
fn merge_update(old: Document, update: &Document) -> Document {
    match update.get("$set") {
        Some(Bson::Document(set)) => {
            let mut merged = old;
            for (key, value) in set {
                merged.insert(key.clone(), value.clone());
            }
            merged
        }
        _ => update.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn test_is_operator_update() {
        assert!(is_operator_update(&doc! { "$set": { "x": 1 } }));
        assert!(is_operator_update(&doc! { "$unset": { "x": 1 } }));
        assert!(!is_operator_update(&doc! { "_id": 1, "x": 1 }));
        assert!(!is_operator_update(&doc! {}));
    }

    #[test]
    fn test_merge_update_with_set_delta() {
        let old = doc! { "_id": 1, "shard": "a", "x": 1 };
        let update = doc! { "$set": { "shard": "b", "y": 2 } };
        let merged = merge_update(old, &update);
        assert_eq!(merged, doc! { "_id": 1, "shard": "b", "x": 1, "y": 2 });
    }

    #[test]
    fn test_merge_update_full_replacement() {
        let old = doc! { "_id": 1, "x": 1 };
        let update = doc! { "_id": 1, "shard": "b" };
        let merged = merge_update(old, &update);
        assert_eq!(merged, doc! { "_id": 1, "shard": "b" });
    }

    #[test]
    fn test_merge_update_preserves_unmentioned_fields() {
        let old = doc! { "_id": 1, "a": 1, "b": 2 };
        let update = doc! { "$set": { "b": 3 } };
        let merged = merge_update(old, &update);
        assert_eq!(merged, doc! { "_id": 1, "a": 1, "b": 3 });
    }
}
