//! Query semantics: ordering, masking, lookup and cancellation

use magnetite_core::{CollectionSchema, Error, MetricType, VectorBatch};
use magnetite_engine::{Engine, EngineConfig, QueryContext};
use tempfile::TempDir;

fn setup(dim: usize, metric: MetricType) -> (Engine, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::new(dir.path());
    config.auto_flush_interval_sec = 3600;
    let engine = Engine::open(config).unwrap();
    let mut schema = CollectionSchema::new("c1", dim, metric);
    engine.create_collection(&mut schema).unwrap();
    (engine, dir)
}

fn line_batch(ids: Vec<i64>, dim: usize) -> VectorBatch {
    let data: Vec<f32> = ids
        .iter()
        .flat_map(|id| {
            let mut row = vec![0.0f32; dim];
            row[0] = *id as f32 - 1.0; // id 1 at x=0, id 2 at x=1, ...
            row
        })
        .collect();
    VectorBatch::new(ids, dim, data).unwrap()
}

#[test]
fn l2_top2_returns_nearest_with_distances() {
    let (engine, _dir) = setup(4, MetricType::L2);
    engine
        .insert("c1", "", &line_batch(vec![1, 2, 3], 4))
        .unwrap();

    let hits = engine
        .query(
            &QueryContext::new(),
            "c1",
            &[],
            2,
            16,
            &[0.0, 0.0, 0.0, 0.0],
        )
        .unwrap();
    assert_eq!(hits.ids, vec![1, 2]);
    assert_eq!(hits.distances, vec![0.0, 1.0]);
}

#[test]
fn ip_ranks_largest_first() {
    let (engine, _dir) = setup(4, MetricType::Ip);
    engine
        .insert("c1", "", &line_batch(vec![1, 2, 3], 4))
        .unwrap();

    let hits = engine
        .query(
            &QueryContext::new(),
            "c1",
            &[],
            2,
            16,
            &[1.0, 0.0, 0.0, 0.0],
        )
        .unwrap();
    // id 3 has the largest projection, then id 2
    assert_eq!(hits.ids, vec![3, 2]);
    assert_eq!(hits.distances, vec![2.0, 1.0]);
}

#[test]
fn deleted_vector_is_invisible_everywhere() {
    let (engine, _dir) = setup(4, MetricType::L2);
    engine
        .insert("c1", "", &line_batch(vec![1, 2, 3], 4))
        .unwrap();
    engine.flush("c1").unwrap();
    engine.delete_vector("c1", 1).unwrap();

    let hits = engine
        .query(
            &QueryContext::new(),
            "c1",
            &[],
            2,
            16,
            &[0.0, 0.0, 0.0, 0.0],
        )
        .unwrap();
    assert_eq!(hits.ids, vec![2, 3]);

    assert!(engine.get_vector_by_id("c1", 1).unwrap_err().is_not_found());
    assert!(engine
        .query_by_id(&QueryContext::new(), "c1", &[], 1, 16, 1)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn query_by_id_uses_the_stored_vector() {
    let (engine, _dir) = setup(4, MetricType::L2);
    engine
        .insert("c1", "", &line_batch(vec![1, 2, 3], 4))
        .unwrap();

    let hits = engine
        .query_by_id(&QueryContext::new(), "c1", &[], 2, 16, 2)
        .unwrap();
    // nearest to id 2 is itself, then a neighbor at distance 1
    assert_eq!(hits.ids[0], 2);
    assert_eq!(hits.distances[0], 0.0);
    assert_eq!(hits.distances[1], 1.0);
}

#[test]
fn get_vector_by_id_round_trips() {
    let (engine, _dir) = setup(4, MetricType::L2);
    engine.insert("c1", "", &line_batch(vec![5], 4)).unwrap();

    let vector = engine.get_vector_by_id("c1", 5).unwrap();
    assert_eq!(vector, vec![4.0, 0.0, 0.0, 0.0]);
    assert!(engine
        .get_vector_by_id("c1", 99)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn unknown_collection_is_not_found() {
    let (engine, _dir) = setup(4, MetricType::L2);
    let err = engine
        .query(&QueryContext::new(), "nope", &[], 1, 16, &[0.0; 4])
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn wrong_dimension_rejected() {
    let (engine, _dir) = setup(4, MetricType::L2);
    engine.insert("c1", "", &line_batch(vec![1], 4)).unwrap();

    let err = engine
        .query(&QueryContext::new(), "c1", &[], 1, 16, &[0.0; 3])
        .unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { .. }));

    let bad_batch = VectorBatch::new(vec![9], 3, vec![0.0; 3]).unwrap();
    let err = engine.insert("c1", "", &bad_batch).unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { .. }));
}

#[test]
fn cancelled_context_aborts() {
    let (engine, _dir) = setup(4, MetricType::L2);
    engine.insert("c1", "", &line_batch(vec![1], 4)).unwrap();

    let ctx = QueryContext::new();
    ctx.cancel();
    let err = engine
        .query(&ctx, "c1", &[], 1, 16, &[0.0; 4])
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));
}

#[test]
fn empty_collection_returns_padding() {
    let (engine, _dir) = setup(4, MetricType::L2);
    let hits = engine
        .query(&QueryContext::new(), "c1", &[], 3, 16, &[0.0; 4])
        .unwrap();
    assert_eq!(hits.ids, vec![-1, -1, -1]);
}

#[test]
fn k_beyond_row_count_pads() {
    let (engine, _dir) = setup(4, MetricType::L2);
    engine.insert("c1", "", &line_batch(vec![1, 2], 4)).unwrap();

    let hits = engine
        .query(&QueryContext::new(), "c1", &[], 5, 16, &[0.0; 4])
        .unwrap();
    assert_eq!(&hits.ids[..2], &[1, 2]);
    assert_eq!(&hits.ids[2..], &[-1, -1, -1]);
}

#[test]
fn multi_query_batches_merge_per_row() {
    let (engine, _dir) = setup(4, MetricType::L2);
    engine
        .insert("c1", "", &line_batch(vec![1, 2, 3, 4], 4))
        .unwrap();

    let queries = [
        0.0, 0.0, 0.0, 0.0, // near id 1
        3.0, 0.0, 0.0, 0.0, // near id 4
    ];
    let hits = engine
        .query(&QueryContext::new(), "c1", &[], 1, 16, &queries)
        .unwrap();
    assert_eq!(hits.ids, vec![1, 4]);
}

#[test]
fn results_span_multiple_segments() {
    let (engine, _dir) = setup(4, MetricType::L2);
    // two flushes make two segments
    engine.insert("c1", "", &line_batch(vec![1, 2], 4)).unwrap();
    engine.flush("c1").unwrap();
    engine.insert("c1", "", &line_batch(vec![3, 4], 4)).unwrap();
    engine.flush("c1").unwrap();

    let hits = engine
        .query(
            &QueryContext::new(),
            "c1",
            &[],
            4,
            16,
            &[0.0, 0.0, 0.0, 0.0],
        )
        .unwrap();
    assert_eq!(hits.ids, vec![1, 2, 3, 4]);
}

#[test]
fn query_by_file_id_restricts_the_segment_set() {
    let (engine, _dir) = setup(4, MetricType::L2);
    engine.insert("c1", "", &line_batch(vec![1, 2], 4)).unwrap();
    engine.flush("c1").unwrap();
    engine.insert("c1", "", &line_batch(vec![3, 4], 4)).unwrap();
    engine.flush("c1").unwrap();

    let segments = engine
        .segments_by_kind("c1", &[magnetite_core::SegmentKind::Raw])
        .unwrap();
    assert_eq!(segments.len(), 2);
    let first_file = segments
        .iter()
        .find(|s| {
            // the segment holding ids 1 and 2 has the earlier flush lsn
            s.flush_lsn == segments.iter().map(|x| x.flush_lsn).min().unwrap()
        })
        .unwrap()
        .file_id
        .clone();

    let hits = engine
        .query_by_file_id(
            &QueryContext::new(),
            "c1",
            &[first_file],
            4,
            16,
            &[0.0, 0.0, 0.0, 0.0],
        )
        .unwrap();
    assert_eq!(&hits.ids[..2], &[1, 2]);
    assert_eq!(&hits.ids[2..], &[-1, -1]);

    let err = engine
        .query_by_file_id(
            &QueryContext::new(),
            "c1",
            &["0".to_string()],
            1,
            16,
            &[0.0; 4],
        )
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn preload_warms_without_changing_results() {
    let (engine, _dir) = setup(4, MetricType::L2);
    engine
        .insert("c1", "", &line_batch(vec![1, 2, 3], 4))
        .unwrap();
    engine.flush("c1").unwrap();

    engine.preload_collection("c1").unwrap();
    let hits = engine
        .query(&QueryContext::new(), "c1", &[], 1, 16, &[0.0; 4])
        .unwrap();
    assert_eq!(hits.ids[0], 1);
}
