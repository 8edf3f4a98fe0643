//! Concurrent top-k query dispatch
//!
//! One query fans out across the visible segment snapshot: every segment
//! is searched independently on the query pool (through the decoded-
//! segment cache, with the collection's blacklist applied), and the
//! per-segment partial results are k-way merged into a global top-k with
//! the metric's ordering. The snapshot is pinned in `OngoingOps` for the
//! whole dispatch so a concurrent merge cannot erase blobs under us.

use crate::engine::EngineCore;
use magnetite_core::{
    Error, MetricType, Result, SearchHits, SegmentMeta, MAX_NPROBE, MAX_TOPK,
};
use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::debug;

use crate::context::QueryContext;

/// Validate `k`/`nprobe` against their hard caps.
pub(crate) fn validate_topk(k: usize, nprobe: usize) -> Result<()> {
    if k == 0 || k > MAX_TOPK {
        return Err(Error::invalid_argument(format!(
            "k must be in 1..={}, got {}",
            MAX_TOPK, k
        )));
    }
    if nprobe == 0 || nprobe > MAX_NPROBE {
        return Err(Error::invalid_argument(format!(
            "nprobe must be in 1..={}, got {}",
            MAX_NPROBE, nprobe
        )));
    }
    Ok(())
}

/// Resolve partition tags to collection ids.
///
/// Empty tags mean the root collection alone. Unknown tags are skipped;
/// if every tag is unknown the query has nothing to search and that is a
/// caller error.
pub(crate) fn resolve_scope(
    core: &EngineCore,
    collection_id: &str,
    partition_tags: &[String],
) -> Result<Vec<String>> {
    if partition_tags.is_empty() {
        return Ok(vec![collection_id.to_string()]);
    }
    let mut targets = Vec::new();
    for tag in partition_tags {
        match core.meta.partition_name_by_tag(collection_id, tag) {
            Ok(name) => targets.push(name),
            Err(e) if e.is_not_found() => {
                debug!(collection = collection_id, tag = %tag, "skipping unknown partition tag");
            }
            Err(e) => return Err(e),
        }
    }
    if targets.is_empty() {
        return Err(Error::not_found(format!(
            "no partition of {} matches the given tags",
            collection_id
        )));
    }
    Ok(targets)
}

/// Fan a query batch out over `segments` and merge to a global top-k.
///
/// Returns `nq * k` padded rows. The caller owns scope resolution and
/// the ongoing-ops pin; cancellation is polled before each per-segment
/// submission and once more before the merge.
#[allow(clippy::too_many_arguments)]
pub(crate) fn search_segments(
    core: &Arc<EngineCore>,
    ctx: &QueryContext,
    segments: &[SegmentMeta],
    queries: Arc<Vec<f32>>,
    dim: usize,
    k: usize,
    nprobe: usize,
    metric: MetricType,
    blacklist: Arc<HashSet<i64>>,
) -> Result<(Vec<i64>, Vec<f32>)> {
    let nq = queries.len() / dim;
    if segments.is_empty() {
        let pad = if metric.larger_is_closer() {
            f32::MIN
        } else {
            f32::MAX
        };
        return Ok((vec![-1; nq * k], vec![pad; nq * k]));
    }

    let (sender, receiver) = mpsc::channel::<Result<SearchHits>>();
    let mut submitted = 0usize;
    for segment in segments {
        ctx.check("query")?;
        let worker_core = Arc::clone(core);
        let segment = segment.clone();
        let queries = Arc::clone(&queries);
        let blacklist = Arc::clone(&blacklist);
        let sender = sender.clone();
        let submitted_ok = core.query_pool.submit(move || {
            let result = (|| {
                let data = worker_core.cache.get_or_load(
                    &segment,
                    worker_core.store.as_ref(),
                    &|id| worker_core.ongoing.is_pinned(id),
                )?;
                worker_core
                    .kernel
                    .search(&data, &queries, dim, k, nprobe, metric, &blacklist)
            })();
            // a dropped receiver means the query already failed; nothing to do
            let _ = sender.send(result);
        });
        if !submitted_ok {
            return Err(Error::cancelled("query pool is shut down"));
        }
        submitted += 1;
    }
    drop(sender);

    let mut partials = Vec::with_capacity(submitted);
    for _ in 0..submitted {
        let hits = receiver
            .recv()
            .map_err(|_| Error::internal("query worker dropped its result"))??;
        partials.push(hits);
    }

    ctx.check("query merge")?;
    Ok(merge_hits(&partials, nq, k, metric))
}

/// K-way merge of per-segment partial results.
///
/// Rows are padded with id -1; ties break toward the smaller id so
/// results are deterministic across runs and segment orderings.
pub(crate) fn merge_hits(
    partials: &[SearchHits],
    nq: usize,
    k: usize,
    metric: MetricType,
) -> (Vec<i64>, Vec<f32>) {
    let larger_is_closer = metric.larger_is_closer();
    let pad_score = if larger_is_closer { f32::MIN } else { f32::MAX };

    let mut ids = Vec::with_capacity(nq * k);
    let mut distances = Vec::with_capacity(nq * k);

    for q in 0..nq {
        let mut candidates: Vec<(i64, f32)> = Vec::new();
        for hits in partials {
            let row = &hits.ids[q * hits.k..(q + 1) * hits.k];
            let scores = &hits.distances[q * hits.k..(q + 1) * hits.k];
            for (id, score) in row.iter().zip(scores.iter()) {
                if *id >= 0 {
                    candidates.push((*id, *score));
                }
            }
        }
        candidates.sort_by(|a, b| {
            let ord = if larger_is_closer {
                b.1.partial_cmp(&a.1)
            } else {
                a.1.partial_cmp(&b.1)
            };
            ord.unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        candidates.truncate(k);

        for (id, score) in &candidates {
            ids.push(*id);
            distances.push(*score);
        }
        for _ in candidates.len()..k {
            ids.push(-1);
            distances.push(pad_score);
        }
    }

    (ids, distances)
}
