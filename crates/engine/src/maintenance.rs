//! Background maintenance: merge, compaction, index builds, cleanup
//!
//! Two worker pools and a timer thread transform the segment population:
//! - the merge pool packs small RAW segments toward the size target,
//! - the index pool turns TO_INDEX segments into INDEX artifacts,
//! - the timer drives auto-flush, the TTL cleaner, archival and WAL
//!   truncation.
//!
//! Every transformation follows the shadow-state protocol: the new
//! segment is written under an invisible kind (NEW_MERGE / NEW_INDEX)
//! and becomes visible in the same catalog transaction that retires its
//! inputs. A crash at any point leaves either the old world or the new
//! one, never both, and startup purges the shadows.

use crate::engine::EngineCore;
use crate::wait_notify::WaitNotify;
use crate::worker_pool::WorkerPool;
use magnetite_core::{
    Result, SegmentData, SegmentKind, SegmentMeta, BUILD_INDEX_THRESHOLD, COMPACT_THRESHOLD,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Cadence of the TTL cleaner and archival checks relative to the timer.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Background workers plus the periodic timer.
pub(crate) struct MaintenanceEngine {
    merge_pool: WorkerPool,
    index_pool: WorkerPool,
    timer: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    timer_notify: Arc<WaitNotify>,
}

impl MaintenanceEngine {
    /// Create the worker pools. The timer is spawned separately once the
    /// shared core can reach this instance, so a timer tick never races
    /// engine construction.
    pub fn new(merge_concurrency: usize, index_concurrency: usize) -> Self {
        Self {
            merge_pool: WorkerPool::new("magnetite-merge", merge_concurrency),
            index_pool: WorkerPool::new("magnetite-index", index_concurrency),
            timer: parking_lot::Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            timer_notify: Arc::new(WaitNotify::new()),
        }
    }

    /// Spawn the periodic timer thread.
    pub fn spawn_timer(&self, core: &Arc<EngineCore>) {
        let handle = {
            let core = Arc::clone(core);
            let shutdown = Arc::clone(&self.shutdown);
            let notify = Arc::clone(&self.timer_notify);
            std::thread::Builder::new()
                .name("magnetite-timer".to_string())
                .spawn(move || timer_loop(&core, &shutdown, &notify))
                .expect("failed to spawn maintenance timer")
        };
        *self.timer.lock() = Some(handle);
    }

    /// Wake the timer ahead of schedule (a flush produced new segments).
    pub fn notify(&self) {
        self.timer_notify.notify();
    }

    /// Queue a merge sweep for one collection family.
    pub fn submit_merge(&self, core: &Arc<EngineCore>, collection_id: &str) {
        if !core.merging.lock().insert(collection_id.to_string()) {
            return; // a sweep for this collection is already queued
        }
        let worker_core = Arc::clone(core);
        let collection_id = collection_id.to_string();
        let queued = self.merge_pool.submit({
            let collection_id = collection_id.clone();
            move || {
                if let Err(e) = merge_collection(&worker_core, &collection_id) {
                    if !e.is_not_found() {
                        error!(collection = %collection_id, error = %e, "background merge failed");
                    }
                }
                worker_core.merging.lock().remove(&collection_id);
            }
        });
        if !queued {
            core.merging.lock().remove(&collection_id);
        }
    }

    /// Queue index builds for every TO_INDEX segment.
    pub fn submit_index_builds(&self, core: &Arc<EngineCore>) {
        let segments = match core.meta.files_to_index() {
            Ok(segments) => segments,
            Err(e) => {
                error!(error = %e, "failed to list to-index segments");
                return;
            }
        };
        for segment in segments {
            if core
                .failed
                .should_skip(&segment.collection_id, &segment.file_id)
            {
                continue;
            }
            if !core.building.lock().insert(segment.id) {
                continue; // already queued or building
            }
            let worker_core = Arc::clone(core);
            let segment_id = segment.id;
            let queued = self.index_pool.submit(move || {
                if let Err(e) = build_segment_index(&worker_core, segment) {
                    if !e.is_not_found() {
                        error!(error = %e, "background index build failed");
                    }
                }
                worker_core.building.lock().remove(&segment_id);
            });
            if !queued {
                core.building.lock().remove(&segment_id);
            }
        }
    }

    /// Block until queued merge and index work is done (tests, shutdown).
    pub fn drain(&self) {
        self.merge_pool.drain();
        self.index_pool.drain();
    }

    /// Stop the timer and join all workers. Queued tasks finish first.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.timer_notify.notify();
        if let Some(handle) = self.timer.lock().take() {
            let _ = handle.join();
        }
        self.merge_pool.shutdown();
        self.index_pool.shutdown();
    }
}

fn timer_loop(core: &Arc<EngineCore>, shutdown: &AtomicBool, notify: &WaitNotify) {
    let mut last_cleanup = Instant::now();
    loop {
        notify.wait_timeout(core.config.auto_flush_interval());
        if shutdown.load(Ordering::Acquire) {
            return;
        }

        if let Err(e) = core.flush_all() {
            warn!(error = %e, "auto-flush failed");
        }

        // sweep merges and builds
        match core.family_targets() {
            Ok(targets) => {
                for target in targets {
                    core.maintenance().submit_merge(core, &target);
                }
            }
            Err(e) => warn!(error = %e, "failed to list collections for merge sweep"),
        }
        core.maintenance().submit_index_builds(core);

        if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
            last_cleanup = Instant::now();
            run_cleanup(core);
        }
    }
}

fn run_cleanup(core: &Arc<EngineCore>) {
    let ongoing = core.ongoing.snapshot();
    match core
        .meta
        .clean_expired(core.config.ongoing_ttl_sec, &ongoing, core.store.as_ref())
    {
        Ok(cleaned) if cleaned > 0 => debug!(cleaned, "ttl cleaner removed expired segments"),
        Ok(_) => {}
        Err(e) => error!(error = %e, "ttl cleanup failed"),
    }

    if core.config.archive_days > 0 {
        if let Err(e) = core.meta.archive_by_age(core.config.archive_days) {
            error!(error = %e, "age archival failed");
        }
    }
    if core.config.archive_disk_gb > 0 {
        if let Err(e) = core.meta.archive_by_disk_quota(core.config.archive_disk_quota()) {
            error!(error = %e, "disk-quota archival failed");
        }
    }

    if let Err(e) = core.truncate_wal() {
        warn!(error = %e, "wal truncation failed");
    }
}

/// Greedy size-descending batching: a batch closes when the next segment
/// would push it past the target; singleton batches are dropped.
pub(crate) fn plan_merge_batches(
    files: &[SegmentMeta],
    target_segment_size: u64,
) -> Vec<Vec<SegmentMeta>> {
    let mut batches = Vec::new();
    let mut current: Vec<SegmentMeta> = Vec::new();
    let mut current_bytes = 0u64;

    for file in files {
        if !current.is_empty() && current_bytes + file.bytes > target_segment_size {
            if current.len() >= 2 {
                batches.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
            current_bytes = 0;
        }
        current_bytes += file.bytes;
        current.push(file.clone());
    }
    if current.len() >= 2 {
        batches.push(current);
    }
    batches
}

/// One merge sweep over a collection: repeat until no batch closes.
pub(crate) fn merge_collection(core: &Arc<EngineCore>, collection_id: &str) -> Result<()> {
    loop {
        let _lock = core.flush_merge_compact.lock();
        let schema = core.meta.describe_collection(collection_id)?;
        let files = core.meta.files_to_merge(collection_id)?;
        let batches = plan_merge_batches(&files, schema.target_segment_size);
        if batches.is_empty() {
            return Ok(());
        }
        for batch in batches {
            merge_files(core, collection_id, &batch)?;
        }
        // lock released between rounds so flushes are not starved
    }
}

/// Merge one batch of RAW segments into a single larger segment.
fn merge_files(
    core: &Arc<EngineCore>,
    collection_id: &str,
    inputs: &[SegmentMeta],
) -> Result<()> {
    let _pin = core
        .ongoing
        .acquire(inputs.iter().map(|s| s.id).collect());
    let root = core.root_of(collection_id)?;
    let blacklist = core.blacklists.snapshot(&root);

    let mut merged = SegmentData {
        ids: Vec::new(),
        dim: inputs[0].dimension,
        data: Vec::new(),
    };
    let mut input_rows = 0u64;
    let mut dropped = 0u64;
    let mut flush_lsn = 0;
    for input in inputs {
        let data = core.store.load_segment(input)?;
        input_rows += data.row_count() as u64;
        for row in 0..data.row_count() {
            let id = data.ids[row];
            if blacklist.contains(&id) {
                dropped += 1;
                continue;
            }
            merged.ids.push(id);
            merged.data.extend_from_slice(data.row(row));
        }
        flush_lsn = flush_lsn.max(input.flush_lsn);
    }

    let mut output = SegmentMeta::new(collection_id);
    output.kind = SegmentKind::NewMerge;
    core.meta.create_segment(&mut output)?;

    let commit = (|| -> Result<()> {
        output.bytes = core.store.write_segment(&output, &merged)?;
        output.row_count = merged.row_count() as u64;
        output.flush_lsn = flush_lsn;
        output.kind = if output.row_count >= BUILD_INDEX_THRESHOLD {
            SegmentKind::ToIndex
        } else {
            SegmentKind::Raw
        };

        let mut rows = Vec::with_capacity(inputs.len() + 1);
        rows.push(output.clone());
        for input in inputs {
            let mut retired = input.clone();
            retired.kind = SegmentKind::ToDelete;
            rows.push(retired);
        }
        core.meta.update_segments(&mut rows)?;
        Ok(())
    })();

    match commit {
        Ok(()) => {
            for input in inputs {
                core.cache.evict(input.id);
            }
            info!(
                collection = collection_id,
                inputs = inputs.len(),
                rows = merged.row_count(),
                dropped,
                input_rows,
                "merged segments"
            );
            Ok(())
        }
        Err(e) => {
            // leave the shadow row for the startup purge if this also fails
            output.kind = SegmentKind::ToDelete;
            if let Err(mark) = core.meta.update_segment(&mut output) {
                warn!(error = %mark, "failed to tombstone aborted merge output");
            }
            Err(e)
        }
    }
}

/// Build the index artifact for one TO_INDEX segment.
fn build_segment_index(core: &Arc<EngineCore>, mut input: SegmentMeta) -> Result<()> {
    let _pin = core.ongoing.acquire(vec![input.id]);

    // the segment may have been retired since the sweep listed it
    let current = core
        .meta
        .files_by_kind(&input.collection_id, &[SegmentKind::ToIndex])?;
    if !current.iter().any(|s| s.id == input.id) {
        return Ok(());
    }

    let spec = core.meta.describe_collection_index(&input.collection_id)?;
    let result = (|| -> Result<SegmentMeta> {
        let data = core.store.load_segment(&input)?;
        let artifact = core.builder.build(&data, &spec)?;

        let mut sibling = SegmentMeta::new(&input.collection_id);
        sibling.segment_group = input.segment_group.clone();
        sibling.kind = SegmentKind::NewIndex;
        core.meta.create_segment(&mut sibling)?;

        let commit = (|| -> Result<()> {
            sibling.bytes = core.store.write_artifact(&sibling, &artifact)?;
            sibling.row_count = input.row_count;
            sibling.flush_lsn = input.flush_lsn;
            sibling.kind = SegmentKind::Index;

            // raw input becomes the backup sibling in the same transaction
            let _build_lock = core.build_index.lock();
            input.kind = SegmentKind::Backup;
            let mut rows = vec![sibling.clone(), input.clone()];
            core.meta.update_segments(&mut rows)?;
            Ok(())
        })();

        match commit {
            Ok(()) => Ok(sibling),
            Err(e) => {
                sibling.kind = SegmentKind::ToDelete;
                if let Err(mark) = core.meta.update_segment(&mut sibling) {
                    warn!(error = %mark, "failed to tombstone aborted index output");
                }
                Err(e)
            }
        }
    })();

    match result {
        Ok(sibling) => {
            core.failed
                .record_success(&input.collection_id, &input.file_id);
            info!(
                collection = %input.collection_id,
                file = %sibling.file_id,
                kind = ?spec.kind,
                "built segment index"
            );
            Ok(())
        }
        Err(e) => {
            core.failed
                .record_failure(&input.collection_id, &input.file_id);
            Err(e)
        }
    }
}

/// Operator-invoked compaction: rewrite segments whose soft-deleted
/// fraction exceeds the threshold, dropping tombstoned rows.
///
/// The unit of atomicity is one segment. After the sweep, ids that no
/// longer appear in any surviving segment are unmasked.
pub(crate) fn compact_collection(core: &Arc<EngineCore>, collection_id: &str) -> Result<()> {
    let _lock = core.flush_merge_compact.lock();
    let root = core.root_of(collection_id)?;
    let blacklist = core.blacklists.snapshot(&root);
    if blacklist.is_empty() {
        return Ok(());
    }

    let mut targets = vec![collection_id.to_string()];
    if collection_id == root {
        for partition in core.meta.show_partitions(&root)? {
            targets.push(partition.collection_id);
        }
    }

    let mut applied: HashSet<i64> = HashSet::new();
    let mut still_present: HashSet<i64> = HashSet::new();
    for target in &targets {
        let segments = core.meta.files_to_search(target, &[])?;
        for segment in segments {
            compact_segment(core, &segment, &blacklist, &mut applied, &mut still_present)?;
        }
    }

    // only ids gone from every surviving segment can be unmasked
    let clearable: Vec<i64> = applied.difference(&still_present).copied().collect();
    if !clearable.is_empty() {
        core.blacklists.clear_applied(&root, &clearable);
        info!(
            collection = collection_id,
            cleared = clearable.len(),
            "compaction applied deletions"
        );
    }
    Ok(())
}

fn compact_segment(
    core: &Arc<EngineCore>,
    segment: &SegmentMeta,
    blacklist: &HashSet<i64>,
    applied: &mut HashSet<i64>,
    still_present: &mut HashSet<i64>,
) -> Result<()> {
    let _pin = core.ongoing.acquire(vec![segment.id]);
    let data = core.store.load_segment(segment)?;
    let deleted: Vec<i64> = data
        .ids
        .iter()
        .copied()
        .filter(|id| blacklist.contains(id))
        .collect();
    if deleted.is_empty() {
        return Ok(());
    }

    let ratio = deleted.len() as f64 / data.row_count().max(1) as f64;
    if ratio <= COMPACT_THRESHOLD {
        // left as-is: its deleted ids must stay masked
        still_present.extend(deleted);
        return Ok(());
    }

    let mut kept = SegmentData {
        ids: Vec::with_capacity(data.row_count() - deleted.len()),
        dim: data.dim,
        data: Vec::new(),
    };
    for row in 0..data.row_count() {
        let id = data.ids[row];
        if blacklist.contains(&id) {
            continue;
        }
        kept.ids.push(id);
        kept.data.extend_from_slice(data.row(row));
    }

    let mut rewritten = SegmentMeta::new(&segment.collection_id);
    rewritten.kind = if segment.kind == SegmentKind::Index {
        SegmentKind::NewIndex
    } else {
        SegmentKind::NewMerge
    };
    core.meta.create_segment(&mut rewritten)?;

    let commit = (|| -> Result<()> {
        rewritten.bytes = if segment.kind == SegmentKind::Index {
            let spec = core.meta.describe_collection_index(&segment.collection_id)?;
            let artifact = core.builder.build(&kept, &spec)?;
            core.store.write_artifact(&rewritten, &artifact)?
        } else {
            core.store.write_segment(&rewritten, &kept)?
        };
        rewritten.row_count = kept.row_count() as u64;
        rewritten.flush_lsn = segment.flush_lsn;
        rewritten.kind = segment.kind;

        let mut retired = segment.clone();
        retired.kind = SegmentKind::ToDelete;
        let mut rows = vec![rewritten.clone(), retired];
        core.meta.update_segments(&mut rows)?;
        Ok(())
    })();

    match commit {
        Ok(()) => {
            core.cache.evict(segment.id);
            let dropped = deleted.len();
            applied.extend(deleted);
            debug!(
                file = %segment.file_id,
                rows = kept.row_count(),
                dropped = dropped,
                "compacted segment"
            );
            Ok(())
        }
        Err(e) => {
            rewritten.kind = SegmentKind::ToDelete;
            if let Err(mark) = core.meta.update_segment(&mut rewritten) {
                warn!(error = %mark, "failed to tombstone aborted compaction output");
            }
            still_present.extend(deleted);
            Err(e)
        }
    }
}
