//! The engine facade
//!
//! `Engine` composes the catalog, WAL, memory buffer, maintenance
//! workers and query dispatcher, and enforces the cross-subsystem
//! ordering rules:
//! - `mem_serialize` serializes flushes against each other,
//! - `flush_merge_compact` excludes flush, merge and compaction from
//!   touching a collection's segment population at the same time,
//! - `build_index` serializes index-build commits against index-schema
//!   changes.
//!
//! ## Lifecycle
//!
//! `open` recovers before serving: the catalog purges shadow rows, the
//! WAL replays records past each collection's flush watermark back into
//! the buffer and the delete masks, and recovered rows are flushed so
//! queries see them. `stop` (also run on drop) flushes, stops the
//! timer, drains the pools and persists the global LSN.

use crate::blacklist::BlacklistRegistry;
use crate::config::EngineConfig;
use crate::context::QueryContext;
use crate::index_tracker::IndexFailedTracker;
use crate::maintenance::{self, MaintenanceEngine};
use crate::mem_buffer::{split_rows, MemBuffer};
use crate::ongoing::OngoingOps;
use crate::query;
use crate::worker_pool::WorkerPool;
use magnetite_core::{
    CollectionSchema, Error, IndexBuilder, IndexSpec, Lsn, Result, SearchKernel, SegmentKind,
    SegmentMeta, SegmentStore, VectorBatch, BUILD_INDEX_THRESHOLD,
};
use magnetite_durability::{WalConfig, WalManager, WalOperation, WalRecord};
use magnetite_meta::MetaStore;
use magnetite_storage::{BruteForceKernel, FlatIndexBuilder, LocalSegmentStore, SegmentCache};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Result rows of a top-k query: `nq * k` entries, padded with id -1.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Matched ids, -1 for padding.
    pub ids: Vec<i64>,
    /// Scores aligned with `ids`.
    pub distances: Vec<f32>,
    /// Results per query row.
    pub k: usize,
}

/// Shared state reached by the facade, the query workers and the
/// maintenance tasks.
pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) meta: MetaStore,
    pub(crate) wal: WalManager,
    pub(crate) store: Arc<dyn SegmentStore>,
    pub(crate) kernel: Arc<dyn SearchKernel>,
    pub(crate) builder: Arc<dyn IndexBuilder>,
    pub(crate) cache: SegmentCache,
    pub(crate) buffer: MemBuffer,
    pub(crate) blacklists: BlacklistRegistry,
    pub(crate) ongoing: Arc<OngoingOps>,
    pub(crate) failed: IndexFailedTracker,
    pub(crate) query_pool: WorkerPool,
    pub(crate) mem_serialize: Mutex<()>,
    pub(crate) flush_merge_compact: Mutex<()>,
    pub(crate) build_index: Mutex<()>,
    pub(crate) merging: Mutex<HashSet<String>>,
    pub(crate) building: Mutex<HashSet<i64>>,
    maintenance: OnceLock<MaintenanceEngine>,
}

impl EngineCore {
    pub(crate) fn maintenance(&self) -> &MaintenanceEngine {
        self.maintenance
            .get()
            .expect("maintenance engine initialized at open")
    }

    /// Root collection id of a (sub-)collection.
    pub(crate) fn root_of(&self, collection_id: &str) -> Result<String> {
        let schema = self.meta.describe_collection(collection_id)?;
        Ok(if schema.is_partition() {
            schema.owner
        } else {
            schema.collection_id
        })
    }

    /// All live collection ids: roots and their partitions.
    pub(crate) fn family_targets(&self) -> Result<Vec<String>> {
        let mut targets = Vec::new();
        for root in self.meta.all_root_collections()? {
            for partition in self.meta.show_partitions(&root.collection_id)? {
                targets.push(partition.collection_id);
            }
            targets.push(root.collection_id);
        }
        Ok(targets)
    }

    /// A root collection plus its partitions.
    fn family_of(&self, root: &str) -> Result<Vec<String>> {
        let mut targets = vec![root.to_string()];
        for partition in self.meta.show_partitions(root)? {
            targets.push(partition.collection_id);
        }
        Ok(targets)
    }

    fn family_has_pending(&self, root: &str) -> Result<bool> {
        Ok(self
            .family_of(root)?
            .iter()
            .any(|target| self.buffer.has_pending(target)))
    }

    /// Seal one collection family's buffered data into RAW segments.
    ///
    /// Returns immediately when nothing is pending. Every insert with an
    /// LSN at or below the FLUSH record's is in a RAW segment when this
    /// returns, and that LSN becomes the family's flush watermark.
    pub(crate) fn flush_family(&self, root: &str) -> Result<()> {
        let _mem = self.mem_serialize.lock();
        let _fmc = self.flush_merge_compact.lock();

        if !self.family_has_pending(root)? {
            return Ok(());
        }
        let flush_lsn = self.wal.append(root, "", WalOperation::Flush)?;

        for target in self.family_of(root)? {
            self.seal_target(&target, flush_lsn)?;
        }
        self.meta.set_global_lsn(self.wal.last_lsn())?;
        debug!(collection = root, flush_lsn, "flushed collection family");
        self.maintenance().notify();
        Ok(())
    }

    /// Seal one target collection's buffer and advance its watermark.
    fn seal_target(&self, target: &str, flush_lsn: Lsn) -> Result<()> {
        let drained = match self.buffer.drain(target) {
            Some(drained) => drained,
            None => {
                self.meta.set_collection_flush_lsn(target, flush_lsn)?;
                return Ok(());
            }
        };

        let schema = match self.meta.describe_collection(target) {
            Ok(schema) => schema,
            Err(e) if e.is_not_found() => {
                // dropped with data still buffered; nothing to seal
                self.buffer.remove_collection(target);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let chunks = split_rows(&drained, schema.target_segment_size);
        let mut sealed = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let mut segment = SegmentMeta::new(target);
            segment.kind = SegmentKind::New;
            self.meta.create_segment(&mut segment)?;

            let data = magnetite_core::SegmentData {
                ids: chunk.ids.clone(),
                dim: chunk.dim,
                data: chunk.data.clone(),
            };
            segment.bytes = self.store.write_segment(&segment, &data)?;
            segment.row_count = chunk.ids.len() as u64;
            segment.flush_lsn = flush_lsn;
            segment.kind = SegmentKind::Raw;
            sealed.push(segment);
        }

        // NEW -> RAW for every chunk in one transaction; a failure leaves
        // only shadow rows for the startup purge
        if !sealed.is_empty() {
            self.meta.update_segments(&mut sealed)?;
        }
        self.meta.set_collection_flush_lsn(target, flush_lsn)?;
        if !sealed.is_empty() {
            info!(
                collection = target,
                segments = sealed.len(),
                rows = drained.row_count(),
                "sealed buffer into segments"
            );
        }
        Ok(())
    }

    /// Flush every family with pending data, then truncate the WAL.
    pub(crate) fn flush_all(&self) -> Result<()> {
        let mut first_error = None;
        for root in self.meta.all_root_collections()? {
            match self.family_has_pending(&root.collection_id) {
                Ok(true) => {
                    if let Err(e) = self.flush_family(&root.collection_id) {
                        warn!(collection = %root.collection_id, error = %e, "flush failed");
                        first_error.get_or_insert(e);
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        self.truncate_wal()?;
        Ok(())
    }

    /// Flush one family if it has anything buffered (read-your-writes for
    /// the query paths).
    pub(crate) fn ensure_flushed(&self, root: &str) -> Result<()> {
        if self.family_has_pending(root)? {
            self.flush_family(root)?;
        }
        Ok(())
    }

    /// Remove log files fully covered by the flush watermarks.
    ///
    /// The cut point is the minimum of every collection's flush LSN and
    /// the oldest unapplied delete: a DELETE record must stay replayable
    /// until compaction physically applies it.
    pub(crate) fn truncate_wal(&self) -> Result<()> {
        let mut watermark: Option<Lsn> = None;
        for target in self.family_targets()? {
            let lsn = self.meta.get_collection_flush_lsn(&target)?;
            watermark = Some(watermark.map_or(lsn, |w| w.min(lsn)));
        }
        let mut cut = match watermark {
            Some(cut) => cut,
            None => return Ok(()), // no collections: nothing safe to reason about
        };
        if let Some(pending) = self.blacklists.min_pending_lsn() {
            cut = cut.min(pending.saturating_sub(1));
        }
        self.wal.truncate_through(cut)?;
        Ok(())
    }
}

/// The storage-and-execution core: public operations over collections,
/// partitions, vectors, indexes and queries.
pub struct Engine {
    core: Arc<EngineCore>,
    running: AtomicBool,
}

impl Engine {
    /// Open with the reference collaborators (local blob store, exact
    /// kernel, flat builder).
    pub fn open(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(LocalSegmentStore::new(&config.data_path));
        Self::open_with(
            config,
            store,
            Arc::new(BruteForceKernel),
            Arc::new(FlatIndexBuilder),
        )
    }

    /// Open with injected collaborators.
    pub fn open_with(
        config: EngineConfig,
        store: Arc<dyn SegmentStore>,
        kernel: Arc<dyn SearchKernel>,
        builder: Arc<dyn IndexBuilder>,
    ) -> Result<Self> {
        config.validate()?;
        let meta = MetaStore::open(&config.data_path)?;
        let global_lsn = meta.get_global_lsn()?;
        let wal = WalManager::open(
            &config.data_path,
            WalConfig {
                enabled: config.wal_enable,
                file_size_limit: config.wal_file_size_limit(),
                sync_window: config.wal_sync_window(),
            },
            global_lsn,
        )?;

        let query_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let core = Arc::new(EngineCore {
            cache: SegmentCache::new(config.cache_size()),
            meta,
            wal,
            store,
            kernel,
            builder,
            buffer: MemBuffer::new(),
            blacklists: BlacklistRegistry::new(),
            ongoing: Arc::new(OngoingOps::new()),
            failed: IndexFailedTracker::default(),
            query_pool: WorkerPool::new("magnetite-query", query_threads),
            mem_serialize: Mutex::new(()),
            flush_merge_compact: Mutex::new(()),
            build_index: Mutex::new(()),
            merging: Mutex::new(HashSet::new()),
            building: Mutex::new(HashSet::new()),
            maintenance: OnceLock::new(),
            config,
        });

        recover(&core)?;

        let me = MaintenanceEngine::new(
            core.config.merge_concurrency,
            core.config.index_concurrency,
        );
        core.maintenance
            .set(me)
            .map_err(|_| Error::internal("maintenance engine initialized twice"))?;
        core.maintenance().spawn_timer(&core);

        info!(data_path = %core.config.data_path.display(), "engine started");
        Ok(Self {
            core,
            running: AtomicBool::new(true),
        })
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Create a collection. An empty id gets a generated one; a zero
    /// segment-size target gets the configured default.
    pub fn create_collection(&self, schema: &mut CollectionSchema) -> Result<()> {
        if schema.dimension == 0 {
            return Err(Error::invalid_argument("dimension must be positive"));
        }
        if schema.target_segment_size == 0 {
            schema.target_segment_size = self.core.config.target_segment_size();
        }
        self.core.meta.create_collection(schema)
    }

    /// Soft-delete a collection and its partitions; blobs follow after
    /// the TTL grace period.
    pub fn drop_collection(&self, collection_id: &str) -> Result<()> {
        // partitions go down with their parent
        let partitions = match self.core.meta.show_partitions(collection_id) {
            Ok(partitions) => partitions,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        for partition in &partitions {
            self.core.meta.drop_collection(&partition.collection_id)?;
            self.core.buffer.remove_collection(&partition.collection_id);
        }
        self.core.meta.drop_collection(collection_id)?;
        self.core.buffer.remove_collection(collection_id);
        self.core.blacklists.remove_collection(collection_id);
        info!(collection = collection_id, "dropped collection");
        Ok(())
    }

    /// Look up a live collection.
    pub fn describe_collection(&self, collection_id: &str) -> Result<CollectionSchema> {
        self.core.meta.describe_collection(collection_id)
    }

    /// Whether a live collection exists.
    pub fn has_collection(&self, collection_id: &str) -> Result<bool> {
        self.core.meta.has_collection(collection_id)
    }

    /// All live root collections.
    pub fn all_collections(&self) -> Result<Vec<CollectionSchema>> {
        self.core.meta.all_root_collections()
    }

    /// Total vector count across a family's visible segments.
    pub fn row_count(&self, collection_id: &str) -> Result<u64> {
        self.core.ensure_flushed(collection_id)?;
        let mut total = 0;
        for target in self.core.family_of(collection_id)? {
            total += self.core.meta.row_count(&target)?;
        }
        Ok(total)
    }

    /// Warm the segment cache with a family's visible segments.
    pub fn preload_collection(&self, collection_id: &str) -> Result<()> {
        self.core.ensure_flushed(collection_id)?;
        for target in self.core.family_of(collection_id)? {
            for segment in self.core.meta.files_to_search(&target, &[])? {
                self.core
                    .cache
                    .get_or_load(&segment, self.core.store.as_ref(), &|id| {
                        self.core.ongoing.is_pinned(id)
                    })?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Partitions
    // ========================================================================

    /// Create a partition under `parent` with the given tag.
    pub fn create_partition(
        &self,
        parent: &str,
        name: &str,
        tag: &str,
    ) -> Result<CollectionSchema> {
        self.core
            .meta
            .create_partition(parent, name, tag, self.core.wal.last_lsn())
    }

    /// All live partitions of `parent`.
    pub fn show_partitions(&self, parent: &str) -> Result<Vec<CollectionSchema>> {
        self.core.meta.show_partitions(parent)
    }

    /// Resolve a tag and soft-delete the partition it names.
    pub fn drop_partition_by_tag(&self, parent: &str, tag: &str) -> Result<()> {
        let name = self.core.meta.partition_name_by_tag(parent, tag)?;
        self.core.meta.drop_collection(&name)?;
        self.core.buffer.remove_collection(&name);
        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert a batch into a collection (or one of its partitions by
    /// tag). Returns the batch's LSN; when this returns, the records are
    /// durable in the WAL.
    pub fn insert(
        &self,
        collection_id: &str,
        partition_tag: &str,
        batch: &VectorBatch,
    ) -> Result<Lsn> {
        let schema = self.core.meta.describe_collection(collection_id)?;
        if schema.is_partition() {
            return Err(Error::invalid_argument(
                "insert targets a root collection; use partition_tag for partitions",
            ));
        }
        if batch.dim != schema.dimension {
            return Err(Error::dimension_mismatch(schema.dimension, batch.dim));
        }
        if batch.row_count() == 0 {
            return Err(Error::invalid_argument("empty insert batch"));
        }

        let tag = partition_tag.trim();
        let target = if tag.is_empty() {
            schema.collection_id.clone()
        } else {
            self.core.meta.partition_name_by_tag(collection_id, tag)?
        };

        // WAL append and buffer append are one unit under mem_serialize:
        // a flush that slips between them would seal the batch under a
        // watermark below its LSN and replay it twice after a crash
        let lsn = {
            let _mem = self.core.mem_serialize.lock();
            let lsn = self.core.wal.append(
                collection_id,
                tag,
                WalOperation::Insert(batch.clone()),
            )?;
            self.core
                .buffer
                .append(&target, schema.dimension, batch, lsn)?;
            lsn
        };

        if self.core.buffer.size_bytes() >= self.core.config.insert_buffer_size() {
            self.core.flush_family(collection_id)?;
        }
        Ok(lsn)
    }

    /// Soft-delete vectors by id. Future queries omit them immediately;
    /// compaction reclaims the space.
    pub fn delete_vectors(&self, collection_id: &str, ids: &[i64]) -> Result<()> {
        let schema = self.core.meta.describe_collection(collection_id)?;
        if ids.is_empty() {
            return Ok(());
        }
        let targets = self.core.family_of(collection_id)?;
        let _mem = self.core.mem_serialize.lock();
        let lsn =
            self.core
                .wal
                .append(collection_id, "", WalOperation::Delete(ids.to_vec()))?;
        self.core
            .blacklists
            .add(&schema.collection_id, ids, lsn);
        for target in &targets {
            self.core.buffer.append_delete(target, ids, lsn);
        }
        Ok(())
    }

    /// Soft-delete one vector.
    pub fn delete_vector(&self, collection_id: &str, id: i64) -> Result<()> {
        self.delete_vectors(collection_id, &[id])
    }

    /// Seal a collection family's buffered writes into segments.
    pub fn flush(&self, collection_id: &str) -> Result<()> {
        self.core.meta.describe_collection(collection_id)?;
        self.core.flush_family(collection_id)?;
        self.core.truncate_wal()
    }

    /// Flush every collection with pending data.
    pub fn flush_all(&self) -> Result<()> {
        self.core.flush_all()
    }

    /// Rewrite segments whose soft-deleted fraction passed the
    /// threshold, dropping tombstoned rows.
    pub fn compact(&self, collection_id: &str) -> Result<()> {
        self.core.meta.describe_collection(collection_id)?;
        self.core.flush_family(collection_id)?;
        maintenance::compact_collection(&self.core, collection_id)
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Configure and schedule an index over a collection family.
    ///
    /// Existing segments past the row threshold are queued for the build
    /// pool; `describe_index` reflects the new configuration right away.
    pub fn create_index(&self, collection_id: &str, spec: &IndexSpec) -> Result<()> {
        let schema = self.core.meta.describe_collection(collection_id)?;
        if spec.metric.is_binary() != schema.metric.is_binary() {
            return Err(Error::invalid_argument(format!(
                "index metric {} is incompatible with collection metric {}",
                spec.metric, schema.metric
            )));
        }
        self.core.flush_family(collection_id)?;

        let _lock = self.core.build_index.lock();
        for target in self.core.family_of(collection_id)? {
            self.core.meta.update_collection_index(&target, spec)?;
            self.core.failed.clear_collection(&target);
            self.core
                .meta
                .mark_segments_to_index(&target, BUILD_INDEX_THRESHOLD)?;
        }
        drop(_lock);

        self.core.maintenance().submit_index_builds(&self.core);
        self.core.maintenance().notify();
        info!(collection = collection_id, kind = ?spec.kind, "index configured");
        Ok(())
    }

    /// Read a collection's index configuration.
    pub fn describe_index(&self, collection_id: &str) -> Result<IndexSpec> {
        self.core.meta.describe_collection_index(collection_id)
    }

    /// Drop a collection family's index; raw backups revive to RAW.
    pub fn drop_index(&self, collection_id: &str) -> Result<()> {
        self.core.meta.describe_collection(collection_id)?;
        let _lock = self.core.build_index.lock();
        for target in self.core.family_of(collection_id)? {
            self.core.meta.drop_collection_index(&target)?;
            self.core.failed.clear_collection(&target);
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Top-k search across a collection (scoped to partitions when tags
    /// are given).
    #[allow(clippy::too_many_arguments)]
    pub fn query(
        &self,
        ctx: &QueryContext,
        collection_id: &str,
        partition_tags: &[String],
        k: usize,
        nprobe: usize,
        vectors: &[f32],
    ) -> Result<QueryResult> {
        query::validate_topk(k, nprobe)?;
        let schema = self.core.meta.describe_collection(collection_id)?;
        if vectors.is_empty() || vectors.len() % schema.dimension != 0 {
            return Err(Error::dimension_mismatch(
                schema.dimension,
                vectors.len() % schema.dimension.max(1),
            ));
        }
        ctx.check("query")?;
        self.core.ensure_flushed(collection_id)?;

        let targets = query::resolve_scope(&self.core, collection_id, partition_tags)?;
        let mut segments = Vec::new();
        for target in &targets {
            segments.extend(self.core.meta.files_to_search(target, &[])?);
        }
        self.search(ctx, &schema, segments, k, nprobe, vectors)
    }

    /// Search with the stored vector of `id` as the query.
    #[allow(clippy::too_many_arguments)]
    pub fn query_by_id(
        &self,
        ctx: &QueryContext,
        collection_id: &str,
        partition_tags: &[String],
        k: usize,
        nprobe: usize,
        id: i64,
    ) -> Result<QueryResult> {
        let vector = self.get_vector_by_id(collection_id, id)?;
        self.query(ctx, collection_id, partition_tags, k, nprobe, &vector)
    }

    /// Search restricted to the given blob file ids (debugging surface).
    #[allow(clippy::too_many_arguments)]
    pub fn query_by_file_id(
        &self,
        ctx: &QueryContext,
        collection_id: &str,
        file_ids: &[String],
        k: usize,
        nprobe: usize,
        vectors: &[f32],
    ) -> Result<QueryResult> {
        query::validate_topk(k, nprobe)?;
        let schema = self.core.meta.describe_collection(collection_id)?;
        self.core.ensure_flushed(collection_id)?;

        let mut segments = Vec::new();
        for target in self.core.family_of(collection_id)? {
            segments.extend(self.core.meta.segments_by_file_ids(&target, file_ids)?);
        }
        if segments.is_empty() {
            return Err(Error::not_found("no segments match the given file ids"));
        }
        self.search(ctx, &schema, segments, k, nprobe, vectors)
    }

    /// Fetch a stored vector by id, honoring the delete mask.
    pub fn get_vector_by_id(&self, collection_id: &str, id: i64) -> Result<Vec<f32>> {
        let schema = self.core.meta.describe_collection(collection_id)?;
        if self.core.blacklists.contains(&schema.collection_id, id) {
            return Err(Error::not_found(format!("vector {}", id)));
        }
        self.core.ensure_flushed(collection_id)?;

        for target in self.core.family_of(collection_id)? {
            let segments = self.core.meta.files_to_search(&target, &[])?;
            let _pin = self
                .core
                .ongoing
                .acquire(segments.iter().map(|s| s.id).collect());
            for segment in &segments {
                let data =
                    self.core
                        .cache
                        .get_or_load(segment, self.core.store.as_ref(), &|id| {
                            self.core.ongoing.is_pinned(id)
                        })?;
                if let Some(row) = data.ids.iter().position(|candidate| *candidate == id) {
                    return Ok(data.row(row).to_vec());
                }
            }
        }
        Err(Error::not_found(format!("vector {}", id)))
    }

    fn search(
        &self,
        ctx: &QueryContext,
        schema: &CollectionSchema,
        segments: Vec<SegmentMeta>,
        k: usize,
        nprobe: usize,
        vectors: &[f32],
    ) -> Result<QueryResult> {
        let _pin = self
            .core
            .ongoing
            .acquire(segments.iter().map(|s| s.id).collect());
        let blacklist = Arc::new(self.core.blacklists.snapshot(&schema.collection_id));
        let queries = Arc::new(vectors.to_vec());

        let (ids, distances) = query::search_segments(
            &self.core,
            ctx,
            &segments,
            queries,
            schema.dimension,
            k,
            nprobe,
            schema.metric,
            blacklist,
        )?;
        Ok(QueryResult { ids, distances, k })
    }

    // ========================================================================
    // Admin
    // ========================================================================

    /// Total bytes of all non-tombstoned segments.
    pub fn size(&self) -> Result<u64> {
        self.core.meta.size()
    }

    /// Segment rows of one collection filtered by kind (admin surface).
    pub fn segments_by_kind(
        &self,
        collection_id: &str,
        kinds: &[SegmentKind],
    ) -> Result<Vec<SegmentMeta>> {
        self.core.meta.files_by_kind(collection_id, kinds)
    }

    /// Truncate the catalog and remove all collection data directories.
    pub fn drop_all(&self) -> Result<()> {
        let _mem = self.core.mem_serialize.lock();
        let _fmc = self.core.flush_merge_compact.lock();

        self.core.buffer.clear();
        self.core.blacklists.clear();
        self.core.cache.clear();
        self.core.meta.drop_all()?;

        // every subdirectory except the WAL belongs to a collection
        for entry in std::fs::read_dir(&self.core.config.data_path)? {
            let path = entry?.path();
            if path.is_dir() && path.file_name().is_some_and(|name| name != "wal") {
                std::fs::remove_dir_all(&path)?;
            }
        }
        info!("dropped all data");
        Ok(())
    }

    /// Block until queued background merges and builds have finished.
    /// Intended for tests and orderly shutdown.
    pub fn wait_for_background(&self) {
        self.core.maintenance().drain();
    }

    /// Flush, stop background work and persist the final LSN.
    /// Idempotent; also runs on drop.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.core.flush_all() {
            warn!(error = %e, "final flush failed during shutdown");
        }
        self.core.maintenance().stop();
        self.core.query_pool.shutdown();
        self.core.meta.set_global_lsn(self.core.wal.last_lsn())?;
        self.core.wal.sync()?;
        info!("engine stopped");
        Ok(())
    }

    /// Stop background work without the final flush, leaving buffered
    /// records to WAL replay on the next open. Crash-simulation support
    /// for durability testing.
    pub fn stop_without_flush(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.core.maintenance().stop();
        self.core.query_pool.shutdown();
        self.core.wal.sync()?;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "shutdown error");
        }
    }
}

/// Replay the WAL into the buffer and delete masks, then flush so the
/// recovered rows are searchable again.
fn recover(core: &Arc<EngineCore>) -> Result<()> {
    let mut watermarks: HashMap<String, Lsn> = HashMap::new();
    let mut dimensions: HashMap<String, usize> = HashMap::new();
    let mut replayed = 0u64;

    core.wal.replay(0, |record: WalRecord| {
        let WalRecord {
            lsn,
            collection_id,
            partition_tag,
            op,
        } = record;

        let schema = match core.meta.describe_collection(&collection_id) {
            Ok(schema) => schema,
            Err(e) if e.is_not_found() => {
                debug!(collection = %collection_id, "skipping WAL record for dropped collection");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let target = if partition_tag.is_empty() {
            collection_id.clone()
        } else {
            match core.meta.partition_name_by_tag(&collection_id, &partition_tag) {
                Ok(name) => name,
                Err(e) if e.is_not_found() => {
                    debug!(
                        collection = %collection_id,
                        tag = %partition_tag,
                        "skipping WAL record for dropped partition"
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        };

        let watermark = match watermarks.get(&target) {
            Some(watermark) => *watermark,
            None => {
                let watermark = core.meta.get_collection_flush_lsn(&target)?;
                watermarks.insert(target.clone(), watermark);
                watermark
            }
        };
        dimensions.entry(target.clone()).or_insert(schema.dimension);

        match op {
            WalOperation::Insert(batch) => {
                if lsn > watermark {
                    core.buffer
                        .append(&target, dimensions[&target], &batch, lsn)?;
                    replayed += 1;
                }
            }
            WalOperation::Delete(ids) => {
                // re-masking an already-compacted id is harmless; losing a
                // mask is not, so deletes apply regardless of the watermark
                core.blacklists.add(&collection_id, &ids, lsn);
                if lsn > watermark {
                    core.buffer.append_delete(&target, &ids, lsn);
                }
                replayed += 1;
            }
            WalOperation::Flush => {}
        }
        Ok(())
    })?;

    core.meta.set_global_lsn(core.wal.last_lsn())?;

    if replayed > 0 {
        info!(replayed, "recovered WAL records");
        // make recovered rows searchable again before serving
        for root in core.meta.all_root_collections()? {
            if core.family_has_pending(&root.collection_id)? {
                core.flush_family_for_recovery(&root.collection_id)?;
            }
        }
    }
    Ok(())
}

impl EngineCore {
    /// Flush during recovery, before the maintenance engine exists.
    fn flush_family_for_recovery(&self, root: &str) -> Result<()> {
        let _mem = self.mem_serialize.lock();
        let _fmc = self.flush_merge_compact.lock();
        if !self.family_has_pending(root)? {
            return Ok(());
        }
        let flush_lsn = self.wal.append(root, "", WalOperation::Flush)?;
        for target in self.family_of(root)? {
            self.seal_target(&target, flush_lsn)?;
        }
        self.meta.set_global_lsn(self.wal.last_lsn())?;
        Ok(())
    }
}
