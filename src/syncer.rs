//! Replay orchestration
//!
//! The control loop tying tailer, decoder, and applier together. One
//! sequential consumer: records are decoded, routed through the filter and
//! mapping collaborators, applied to the destination, and only then is the
//! resume position persisted and confirmed back to the tailer. A fatal
//! error propagates out of [`OplogSyncer::start`] without the position
//! advancing, so the next run re-attempts from the same record; the
//! embedding process should exit non-zero on it.

use crate::apply::{is_operator_update, Applier};
use crate::checkpoint::{MemoryPositionStore, Optime, SharedPositionStore};
use crate::config::{MongoEndpoint, SyncOptions};
use crate::conn::MongoConn;
use crate::error::{Result, SyncError};
use crate::filter::{IdentityMapping, IncludeAll, NamespaceFilter, NamespaceMapping};
use crate::introspect;
use crate::oplog::{classify, Decoded, OplogEdit, OplogRecord, PRIMARY_KEY_FIELD};
use crate::tailer::OplogTailer;
use mongodb::bson::{Bson, Document};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Create a shutdown signal pair for [`OplogSyncer`].
///
/// Send `true` (or drop the sender) to request a clean stop: the loop
/// finishes the in-flight record, persists the final position, and returns.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// The tail-and-replay engine.
pub struct OplogSyncer {
    tailer: OplogTailer,
    applier: Applier,
    position_store: SharedPositionStore,
    filter: Arc<dyn NamespaceFilter>,
    mapping: Arc<dyn NamespaceMapping>,
    shutdown: watch::Receiver<bool>,
    /// Keeps the default shutdown channel open when the embedder did not
    /// provide one.
    _shutdown_guard: Option<watch::Sender<bool>>,
}

impl OplogSyncer {
    /// Create a builder.
    pub fn builder() -> OplogSyncerBuilder {
        OplogSyncerBuilder::default()
    }

    /// Connect both endpoints.
    pub async fn connect(&mut self) -> Result<()> {
        self.tailer.connect().await?;
        self.applier.connect().await
    }

    /// Determine the position to resume from: the persisted position if one
    /// exists, otherwise the source primary's current optime.
    pub async fn starting_position(&self) -> Result<Optime> {
        if let Some(position) = self.position_store.load().await? {
            info!("Resuming from persisted position {}", position);
            return Ok(position);
        }
        let position = introspect::last_optime(self.tailer.conn().client()?).await?;
        info!("No persisted position, starting from source optime {}", position);
        Ok(position)
    }

    /// Run the tail-and-replay loop from `initial`.
    ///
    /// Blocks until a fatal error or a shutdown signal. Skipped records
    /// still advance the position; the position is persisted only after the
    /// record's effect is durably committed at the destination.
    pub async fn start(&mut self, initial: Optime) -> Result<()> {
        self.tailer.tail(initial).await?;
        info!("Replay started from {}", initial);

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let record = tokio::select! {
                record = self.tailer.next() => record?,
                _ = self.shutdown.changed() => break,
            };
            let position = record.position();
            self.replay(&record).await?;
            self.position_store.save(position).await?;
            self.tailer.confirm(position);
        }

        info!(
            "Shutdown requested, stopping at position {}",
            self.tailer.confirmed()
        );
        self.tailer.close().await;
        self.applier.close().await;
        Ok(())
    }

    /// Convenience: connect, resolve the starting position, and run.
    pub async fn run(&mut self) -> Result<()> {
        self.connect().await?;
        let initial = self.starting_position().await?;
        self.start(initial).await
    }

    /// Replay one record. Terminal states: applied, skipped, or a fatal
    /// error propagated to the caller.
    async fn replay(&mut self, record: &OplogRecord) -> Result<()> {
        match classify(record)? {
            Decoded::Skip(reason) => {
                debug!("Skipping record at {}: {:?}", record.position(), reason);
            }
            Decoded::Edit { db, coll, mut edit } => {
                if !self.filter.includes(&db, &coll) {
                    debug!("Namespace {}.{} filtered out", db, coll);
                    return Ok(());
                }
                filter_fields(self.filter.as_ref(), &db, &coll, &mut edit);
                let (db, coll) = self.mapping.map(&db, &coll);
                self.applier.apply_edit(&db, &coll, &edit).await?;
            }
            Decoded::Command { db, command } => {
                if !self.filter.forward_commands(&db) {
                    debug!("Command on {} filtered out", db);
                    return Ok(());
                }
                let (db, _) = self.mapping.map(&db, "$cmd");
                self.applier.execute_command(&db, &command).await?;
            }
        }
        Ok(())
    }
}

/// Drop excluded fields from an edit's payload before it is applied.
///
/// The primary key is always carried; dropping it would break idempotent
/// addressing.
fn filter_fields(filter: &dyn NamespaceFilter, db: &str, coll: &str, edit: &mut OplogEdit) {
    fn drop_excluded(
        filter: &dyn NamespaceFilter,
        db: &str,
        coll: &str,
        payload: &mut Document,
    ) {
        let excluded: Vec<String> = payload
            .keys()
            .filter(|k| k.as_str() != PRIMARY_KEY_FIELD && !filter.includes_field(db, coll, k))
            .cloned()
            .collect();
        for key in excluded {
            payload.remove(&key);
        }
    }

    match edit {
        OplogEdit::Insert { doc } | OplogEdit::Upsert { doc, .. } => {
            drop_excluded(filter, db, coll, doc);
        }
        OplogEdit::Update { update, .. } => {
            if is_operator_update(update) {
                if let Some(Bson::Document(set)) = update.get_mut("$set") {
                    drop_excluded(filter, db, coll, set);
                }
            } else {
                // Pre-operator oplog format: the payload is the full
                // replacement document and carries fields directly.
                drop_excluded(filter, db, coll, update);
            }
        }
        OplogEdit::Delete { .. } => {}
    }
}

/// Builder for [`OplogSyncer`].
#[derive(Default)]
pub struct OplogSyncerBuilder {
    source: Option<MongoEndpoint>,
    destination: Option<MongoEndpoint>,
    options: SyncOptions,
    position_store: Option<SharedPositionStore>,
    filter: Option<Arc<dyn NamespaceFilter>>,
    mapping: Option<Arc<dyn NamespaceMapping>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl OplogSyncerBuilder {
    /// Set the source endpoint (required).
    pub fn source(mut self, endpoint: MongoEndpoint) -> Self {
        self.source = Some(endpoint);
        self
    }

    /// Set the destination endpoint (required).
    pub fn destination(mut self, endpoint: MongoEndpoint) -> Self {
        self.destination = Some(endpoint);
        self
    }

    /// Set engine options.
    pub fn options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the durable position store. Defaults to an in-memory store.
    pub fn position_store(mut self, store: SharedPositionStore) -> Self {
        self.position_store = Some(store);
        self
    }

    /// Set the namespace filter collaborator. Defaults to include-all.
    pub fn filter(mut self, filter: Arc<dyn NamespaceFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set the namespace rename mapping. Defaults to identity.
    pub fn mapping(mut self, mapping: Arc<dyn NamespaceMapping>) -> Self {
        self.mapping = Some(mapping);
        self
    }

    /// Set the shutdown signal receiver (see [`shutdown_channel`]).
    pub fn shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Build the syncer.
    pub fn build(self) -> Result<OplogSyncer> {
        let source = self
            .source
            .ok_or_else(|| SyncError::config("source endpoint is required"))?;
        let destination = self
            .destination
            .ok_or_else(|| SyncError::config("destination endpoint is required"))?;

        let tailer = OplogTailer::new(MongoConn::new(source, self.options.clone())?, &self.options);
        let applier = Applier::new(
            MongoConn::new(destination, self.options.clone())?,
            self.options.ignore_duplicate_key,
        );

        let (shutdown, guard) = match self.shutdown {
            Some(rx) => (rx, None),
            None => {
                let (tx, rx) = shutdown_channel();
                (rx, Some(tx))
            }
        };

        Ok(OplogSyncer {
            tailer,
            applier,
            position_store: self
                .position_store
                .unwrap_or_else(|| Arc::new(MemoryPositionStore::new())),
            filter: self.filter.unwrap_or_else(|| Arc::new(IncludeAll)),
            mapping: self.mapping.unwrap_or_else(|| Arc::new(IdentityMapping)),
            shutdown,
            _shutdown_guard: guard,
        })
    }
}
