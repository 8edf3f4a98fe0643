//! SQLite-backed catalog of collections, partitions and segments
//!
//! The catalog is the single source of truth for collection schemas and
//! segment lifecycle state. All multi-row mutations run inside one SQLite
//! transaction; readers see consistent snapshots via SQLite's WAL mode.
//!
//! A single writer mutex serializes every call. SQLite itself tolerates
//! more concurrency, but the lifecycle invariants (notably the TO_DELETE
//! coercion of orphaned segments) are only easy to reason about with one
//! writer, so the lock stays.
//!
//! ## Schema compatibility
//!
//! On open we compare the stored column sets of `collections` and
//! `segments` against the runtime schema. A mismatch fails startup with
//! `IncompatibleMeta`; the tables are never dropped and recreated under
//! existing data.

use magnetite_core::{
    date_bucket, next_id, now_micros, CollectionSchema, CollectionState, Error, IndexKind,
    IndexSpec, Lsn, MetricType, Result, SegmentKind, SegmentMeta, SegmentStore,
    CURRENT_META_VERSION,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const COLLECTIONS_DDL: &str = "CREATE TABLE IF NOT EXISTS collections (
    id INTEGER PRIMARY KEY,
    collection_id TEXT UNIQUE NOT NULL,
    state INTEGER NOT NULL,
    dimension INTEGER NOT NULL,
    created_on INTEGER NOT NULL,
    flag INTEGER NOT NULL DEFAULT 0,
    target_segment_size INTEGER NOT NULL,
    engine_type INTEGER NOT NULL,
    index_params TEXT NOT NULL,
    metric_type INTEGER NOT NULL,
    owner TEXT NOT NULL DEFAULT '',
    partition_tag TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL,
    flush_lsn INTEGER NOT NULL DEFAULT 0
)";

const SEGMENTS_DDL: &str = "CREATE TABLE IF NOT EXISTS segments (
    id INTEGER PRIMARY KEY,
    collection_id TEXT NOT NULL,
    segment_group TEXT NOT NULL DEFAULT '',
    engine_type INTEGER NOT NULL,
    file_id TEXT NOT NULL,
    kind INTEGER NOT NULL,
    bytes INTEGER NOT NULL DEFAULT 0,
    row_count INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL,
    created_on INTEGER NOT NULL,
    date INTEGER NOT NULL,
    flush_lsn INTEGER NOT NULL DEFAULT 0
)";

const ENVIRONMENT_DDL: &str = "CREATE TABLE IF NOT EXISTS environment (
    global_lsn INTEGER NOT NULL DEFAULT 0
)";

const COLLECTION_COLUMNS: &[&str] = &[
    "id",
    "collection_id",
    "state",
    "dimension",
    "created_on",
    "flag",
    "target_segment_size",
    "engine_type",
    "index_params",
    "metric_type",
    "owner",
    "partition_tag",
    "version",
    "flush_lsn",
];

const SEGMENT_COLUMNS: &[&str] = &[
    "id",
    "collection_id",
    "segment_group",
    "engine_type",
    "file_id",
    "kind",
    "bytes",
    "row_count",
    "updated_at",
    "created_on",
    "date",
    "flush_lsn",
];

const COLLECTION_SELECT: &str = "SELECT id, collection_id, state, dimension, created_on, flag, \
     target_segment_size, engine_type, index_params, metric_type, owner, partition_tag, \
     version, flush_lsn FROM collections";

const SEGMENT_SELECT: &str = "SELECT id, collection_id, segment_group, engine_type, file_id, \
     kind, bytes, row_count, updated_at, created_on, date, flush_lsn FROM segments";

fn meta_err(context: &str, e: rusqlite::Error) -> Error {
    Error::transaction_failed(format!("{}: {}", context, e))
}

fn collection_from_row(row: &Row<'_>) -> rusqlite::Result<CollectionSchema> {
    Ok(CollectionSchema {
        id: row.get(0)?,
        collection_id: row.get(1)?,
        state: CollectionState::from_i32(row.get(2)?).unwrap_or(CollectionState::Normal),
        dimension: row.get::<_, i64>(3)? as usize,
        created_on: row.get(4)?,
        flag: row.get(5)?,
        target_segment_size: row.get::<_, i64>(6)? as u64,
        index: IndexKind::from_i32(row.get(7)?).unwrap_or(IndexKind::Idmap),
        index_params: row.get(8)?,
        metric: MetricType::from_i32(row.get(9)?).unwrap_or(MetricType::L2),
        owner: row.get(10)?,
        partition_tag: row.get(11)?,
        version: row.get(12)?,
        flush_lsn: row.get::<_, i64>(13)? as Lsn,
    })
}

fn segment_from_row(row: &Row<'_>) -> rusqlite::Result<SegmentMeta> {
    Ok(SegmentMeta {
        id: row.get(0)?,
        collection_id: row.get(1)?,
        segment_group: row.get(2)?,
        index: IndexKind::from_i32(row.get(3)?).unwrap_or(IndexKind::Idmap),
        file_id: row.get(4)?,
        kind: SegmentKind::from_i32(row.get(5)?).unwrap_or(SegmentKind::ToDelete),
        bytes: row.get::<_, i64>(6)? as u64,
        row_count: row.get::<_, i64>(7)? as u64,
        updated_at: row.get(8)?,
        created_on: row.get(9)?,
        date: row.get(10)?,
        flush_lsn: row.get::<_, i64>(11)? as Lsn,
        dimension: 0,
        metric: MetricType::L2,
        index_params: "{}".to_string(),
        target_segment_size: 0,
    })
}

fn kinds_sql(kinds: &[SegmentKind]) -> String {
    let list: Vec<String> = kinds.iter().map(|k| k.as_i32().to_string()).collect();
    list.join(",")
}

/// Durable catalog of collections, partitions and segment files.
///
/// One instance per data directory, explicitly constructed and threaded
/// through the engine; there is no process-wide connector.
#[derive(Debug)]
pub struct MetaStore {
    conn: Mutex<Connection>,
    data_path: PathBuf,
}

impl MetaStore {
    /// Open (or create) the catalog at `<data_path>/meta.db`.
    ///
    /// Enables WAL journaling, validates schema compatibility, creates
    /// missing tables and purges shadow segment rows left by a crash.
    pub fn open(data_path: impl AsRef<Path>) -> Result<Self> {
        let data_path = data_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_path)?;

        let conn = Connection::open(data_path.join("meta.db"))
            .map_err(|e| meta_err("open meta.db", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| meta_err("set journal_mode", e))?;

        validate_schema(&conn)?;
        conn.execute_batch(&format!(
            "{};\n{};\n{};",
            COLLECTIONS_DDL, SEGMENTS_DDL, ENVIRONMENT_DDL
        ))
        .map_err(|e| meta_err("create tables", e))?;

        let store = Self {
            conn: Mutex::new(conn),
            data_path,
        };
        let purged = store.clean_shadow_rows()?;
        if purged > 0 {
            info!(purged, "purged shadow segment rows left by previous run");
        }
        Ok(store)
    }

    /// Root data directory this catalog manages.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Persist a new collection row.
    ///
    /// Assigns `collection_id` from the id source when empty and stamps
    /// `created_on`. Fails `AlreadyExists` if the id is taken by a live
    /// row, `Conflict` if the previous incarnation is still awaiting its
    /// TO_DELETE grace period.
    pub fn create_collection(&self, schema: &mut CollectionSchema) -> Result<()> {
        let conn = self.conn.lock();

        if schema.collection_id.is_empty() {
            schema.collection_id = next_id().to_string();
        } else {
            let existing: Option<i32> = conn
                .query_row(
                    "SELECT state FROM collections WHERE collection_id = ?1",
                    params![schema.collection_id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(meta_err("lookup collection", other)),
                })?;
            match existing.and_then(CollectionState::from_i32) {
                Some(CollectionState::ToDelete) => {
                    return Err(Error::conflict(format!(
                        "collection {} is awaiting deletion, retry later",
                        schema.collection_id
                    )));
                }
                Some(CollectionState::Normal) => {
                    return Err(Error::already_exists(format!(
                        "collection {}",
                        schema.collection_id
                    )));
                }
                None => {}
            }
        }

        schema.created_on = now_micros();
        schema.version = CURRENT_META_VERSION.to_string();
        conn.execute(
            "INSERT INTO collections (collection_id, state, dimension, created_on, flag, \
             target_segment_size, engine_type, index_params, metric_type, owner, \
             partition_tag, version, flush_lsn) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                schema.collection_id,
                schema.state.as_i32(),
                schema.dimension as i64,
                schema.created_on,
                schema.flag,
                schema.target_segment_size as i64,
                schema.index.as_i32(),
                schema.index_params,
                schema.metric.as_i32(),
                schema.owner,
                schema.partition_tag,
                schema.version,
                schema.flush_lsn as i64,
            ],
        )
        .map_err(|e| meta_err("insert collection", e))?;
        schema.id = conn.last_insert_rowid();

        debug!(collection = %schema.collection_id, "created collection");
        Ok(())
    }

    /// Look up a live collection row. TO_DELETE rows are invisible.
    pub fn describe_collection(&self, collection_id: &str) -> Result<CollectionSchema> {
        let conn = self.conn.lock();
        describe_locked(&conn, collection_id)
    }

    /// Whether a live collection with this id exists.
    pub fn has_collection(&self, collection_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM collections WHERE collection_id = ?1 AND state != ?2",
                params![collection_id, CollectionState::ToDelete.as_i32()],
                |row| row.get(0),
            )
            .map_err(|e| meta_err("lookup collection", e))?;
        Ok(count > 0)
    }

    /// All live root collections (partitions excluded).
    pub fn all_root_collections(&self) -> Result<Vec<CollectionSchema>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE state != ?1 AND owner = ''",
                COLLECTION_SELECT
            ))
            .map_err(|e| meta_err("prepare", e))?;
        let rows = stmt
            .query_map(params![CollectionState::ToDelete.as_i32()], collection_from_row)
            .map_err(|e| meta_err("list collections", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| meta_err("decode collection row", e))?);
        }
        Ok(out)
    }

    /// Soft-delete a collection: set its state to TO_DELETE. Idempotent.
    ///
    /// Blobs and segment rows stay behind for the TTL cleaner.
    pub fn drop_collection(&self, collection_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE collections SET state = ?1 WHERE collection_id = ?2 AND state != ?1",
            params![CollectionState::ToDelete.as_i32(), collection_id],
        )
        .map_err(|e| meta_err("drop collection", e))?;
        debug!(collection = %collection_id, "soft-deleted collection");
        Ok(())
    }

    // ========================================================================
    // Partitions
    // ========================================================================

    /// Create a partition of `parent` with the given tag.
    ///
    /// The partition reuses the parent's vector schema. Nested partitions
    /// are rejected, and the tag (after trimming surrounding whitespace)
    /// must be unique within the parent. An empty `name` gets a generated
    /// one.
    pub fn create_partition(
        &self,
        parent: &str,
        name: &str,
        tag: &str,
        lsn: Lsn,
    ) -> Result<CollectionSchema> {
        let parent_schema = self.describe_collection(parent)?;
        if parent_schema.is_partition() {
            return Err(Error::invalid_argument("nested partition is not allowed"));
        }

        let valid_tag = tag.trim().to_string();
        if valid_tag.is_empty() {
            return Err(Error::invalid_argument("partition tag must not be empty"));
        }
        if self.partition_name_by_tag(parent, &valid_tag).is_ok() {
            return Err(Error::already_exists(format!(
                "partition with tag {} under {}",
                valid_tag, parent
            )));
        }

        let mut schema = parent_schema;
        schema.id = -1;
        schema.collection_id = if name.is_empty() {
            next_id().to_string()
        } else {
            name.to_string()
        };
        schema.state = CollectionState::Normal;
        schema.flag = 0;
        schema.owner = parent.to_string();
        schema.partition_tag = valid_tag;
        schema.flush_lsn = lsn;

        self.create_collection(&mut schema).map_err(|e| {
            if e.is_already_exists() {
                Error::already_exists(format!("partition {}", schema.collection_id))
            } else {
                e
            }
        })?;
        Ok(schema)
    }

    /// All live partitions of `parent`.
    pub fn show_partitions(&self, parent: &str) -> Result<Vec<CollectionSchema>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE owner = ?1 AND state != ?2",
                COLLECTION_SELECT
            ))
            .map_err(|e| meta_err("prepare", e))?;
        let rows = stmt
            .query_map(
                params![parent, CollectionState::ToDelete.as_i32()],
                collection_from_row,
            )
            .map_err(|e| meta_err("list partitions", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| meta_err("decode partition row", e))?);
        }
        Ok(out)
    }

    /// Resolve a partition tag (trimmed) to its collection id.
    pub fn partition_name_by_tag(&self, parent: &str, tag: &str) -> Result<String> {
        let valid_tag = tag.trim();
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT collection_id FROM collections \
             WHERE owner = ?1 AND partition_tag = ?2 AND state != ?3",
            params![parent, valid_tag, CollectionState::ToDelete.as_i32()],
            |row| row.get(0),
        )
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Err(Error::not_found(format!(
                "partition with tag {} under {}",
                valid_tag, parent
            ))),
            other => Err(meta_err("resolve partition tag", other)),
        })
    }

    /// Resolve a tag and soft-delete the partition it names.
    pub fn drop_partition_by_tag(&self, parent: &str, tag: &str) -> Result<()> {
        let name = self.partition_name_by_tag(parent, tag)?;
        self.drop_collection(&name)
    }

    // ========================================================================
    // Segments
    // ========================================================================

    /// Persist a new segment row in state NEW.
    ///
    /// Assigns `file_id` (and `segment_group`, defaulting to the file id),
    /// copies dimension/index/metric/target-size from the owning
    /// collection and stamps timestamps.
    pub fn create_segment(&self, segment: &mut SegmentMeta) -> Result<()> {
        let schema = self.describe_collection(&segment.collection_id)?;

        segment.file_id = next_id().to_string();
        if segment.segment_group.is_empty() {
            segment.segment_group = segment.file_id.clone();
        }
        if segment.date == 0 {
            segment.date = date_bucket();
        }
        segment.index = schema.index;
        segment.dimension = schema.dimension;
        segment.metric = schema.metric;
        segment.index_params = schema.index_params.clone();
        segment.target_segment_size = schema.target_segment_size;
        segment.bytes = 0;
        segment.row_count = 0;
        segment.created_on = now_micros();
        segment.updated_at = segment.created_on;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO segments (collection_id, segment_group, engine_type, file_id, kind, \
             bytes, row_count, updated_at, created_on, date, flush_lsn) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                segment.collection_id,
                segment.segment_group,
                segment.index.as_i32(),
                segment.file_id,
                segment.kind.as_i32(),
                segment.bytes as i64,
                segment.row_count as i64,
                segment.updated_at,
                segment.created_on,
                segment.date,
                segment.flush_lsn as i64,
            ],
        )
        .map_err(|e| meta_err("insert segment", e))?;
        segment.id = conn.last_insert_rowid();

        debug!(file = %segment.file_id, collection = %segment.collection_id, "created segment");
        Ok(())
    }

    /// Write back a segment row.
    ///
    /// If the owning collection is gone or TO_DELETE the segment is
    /// transparently coerced to TO_DELETE; the cleaner erases it later.
    pub fn update_segment(&self, segment: &mut SegmentMeta) -> Result<()> {
        let conn = self.conn.lock();
        if !collection_is_live(&conn, &segment.collection_id)? {
            segment.kind = SegmentKind::ToDelete;
        }
        segment.updated_at = now_micros();
        update_segment_locked(&conn, segment)?;
        debug!(file = %segment.file_id, kind = ?segment.kind, "updated segment");
        Ok(())
    }

    /// Write back a batch of segment rows in one transaction, with the
    /// same TO_DELETE coercion as [`update_segment`](Self::update_segment).
    pub fn update_segments(&self, segments: &mut [SegmentMeta]) -> Result<()> {
        let mut conn = self.conn.lock();

        let mut live: HashMap<String, bool> = HashMap::new();
        for segment in segments.iter() {
            if !live.contains_key(&segment.collection_id) {
                let ok = collection_is_live(&conn, &segment.collection_id)?;
                live.insert(segment.collection_id.clone(), ok);
            }
        }

        let tx = conn
            .transaction()
            .map_err(|e| meta_err("begin transaction", e))?;
        for segment in segments.iter_mut() {
            if !live[&segment.collection_id] {
                segment.kind = SegmentKind::ToDelete;
            }
            segment.updated_at = now_micros();
            update_segment_locked(&tx, segment)?;
        }
        tx.commit().map_err(|e| meta_err("commit", e))?;

        debug!(count = segments.len(), "updated segment batch");
        Ok(())
    }

    /// Fetch segment rows by catalog rowid within one collection.
    pub fn get_segments(&self, collection_id: &str, ids: &[i64]) -> Result<Vec<SegmentMeta>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let schema = self.describe_collection(collection_id)?;
        let conn = self.conn.lock();
        let id_list: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        let sql = format!(
            "{} WHERE collection_id = ?1 AND id IN ({}) AND kind != ?2",
            SEGMENT_SELECT,
            id_list.join(",")
        );
        let segments = query_segments(
            &conn,
            &sql,
            params![collection_id, SegmentKind::ToDelete.as_i32()],
        )?;
        Ok(fill_from_schema(segments, &schema))
    }

    /// Fetch live segment rows by blob file id within one collection.
    pub fn segments_by_file_ids(
        &self,
        collection_id: &str,
        file_ids: &[String],
    ) -> Result<Vec<SegmentMeta>> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let schema = self.describe_collection(collection_id)?;
        let conn = self.conn.lock();
        let placeholders: Vec<String> =
            file_ids.iter().map(|f| format!("'{}'", f.replace('\'', "''"))).collect();
        let sql = format!(
            "{} WHERE collection_id = ?1 AND file_id IN ({}) AND kind IN ({})",
            SEGMENT_SELECT,
            placeholders.join(","),
            kinds_sql(&[SegmentKind::Raw, SegmentKind::ToIndex, SegmentKind::Index]),
        );
        let segments = query_segments(&conn, &sql, params![collection_id])?;
        Ok(fill_from_schema(segments, &schema))
    }

    /// Segments a query may read: kind ∈ {RAW, TO_INDEX, INDEX}.
    ///
    /// With a non-empty `ids` list the result is further restricted to
    /// those rowids (the debugging query-by-file path).
    pub fn files_to_search(&self, collection_id: &str, ids: &[i64]) -> Result<Vec<SegmentMeta>> {
        let schema = self.describe_collection(collection_id)?;
        let conn = self.conn.lock();
        let visible = kinds_sql(&[SegmentKind::Raw, SegmentKind::ToIndex, SegmentKind::Index]);
        let sql = if ids.is_empty() {
            format!(
                "{} WHERE collection_id = ?1 AND kind IN ({})",
                SEGMENT_SELECT, visible
            )
        } else {
            let id_list: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
            format!(
                "{} WHERE collection_id = ?1 AND id IN ({}) AND kind IN ({})",
                SEGMENT_SELECT,
                id_list.join(","),
                visible
            )
        };
        let segments = query_segments(&conn, &sql, params![collection_id])?;
        Ok(fill_from_schema(segments, &schema))
    }

    /// RAW segments strictly smaller than the collection's target size,
    /// sorted by size descending so the merger packs large-first.
    pub fn files_to_merge(&self, collection_id: &str) -> Result<Vec<SegmentMeta>> {
        let schema = self.describe_collection(collection_id)?;
        let conn = self.conn.lock();
        let sql = format!(
            "{} WHERE collection_id = ?1 AND kind = ?2 ORDER BY bytes DESC",
            SEGMENT_SELECT
        );
        let segments = query_segments(
            &conn,
            &sql,
            params![collection_id, SegmentKind::Raw.as_i32()],
        )?;
        let segments = segments
            .into_iter()
            .filter(|s| s.bytes < schema.target_segment_size)
            .collect();
        Ok(fill_from_schema(segments, &schema))
    }

    /// All TO_INDEX segments across all collections.
    pub fn files_to_index(&self) -> Result<Vec<SegmentMeta>> {
        let conn = self.conn.lock();
        let sql = format!("{} WHERE kind = ?1", SEGMENT_SELECT);
        let segments = query_segments(&conn, &sql, params![SegmentKind::ToIndex.as_i32()])?;
        self.fill_many_locked(&conn, segments)
    }

    /// Segments of one collection filtered by kind; admin surface.
    pub fn files_by_kind(
        &self,
        collection_id: &str,
        kinds: &[SegmentKind],
    ) -> Result<Vec<SegmentMeta>> {
        if kinds.is_empty() {
            return Err(Error::invalid_argument("kinds array is empty"));
        }
        let schema = self.describe_collection(collection_id)?;
        let conn = self.conn.lock();
        let sql = format!(
            "{} WHERE collection_id = ?1 AND kind IN ({})",
            SEGMENT_SELECT,
            kinds_sql(kinds)
        );
        let segments = query_segments(&conn, &sql, params![collection_id])?;
        Ok(fill_from_schema(segments, &schema))
    }

    /// Promote RAW segments at or above `threshold` rows to TO_INDEX.
    pub fn mark_segments_to_index(&self, collection_id: &str, threshold: u64) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE segments SET kind = ?1, updated_at = ?2 \
                 WHERE collection_id = ?3 AND kind = ?4 AND row_count >= ?5",
                params![
                    SegmentKind::ToIndex.as_i32(),
                    now_micros(),
                    collection_id,
                    SegmentKind::Raw.as_i32(),
                    threshold as i64,
                ],
            )
            .map_err(|e| meta_err("mark segments to-index", e))?;
        if changed > 0 {
            debug!(collection = %collection_id, changed, "promoted raw segments to to-index");
        }
        Ok(changed)
    }

    // ========================================================================
    // Index configuration
    // ========================================================================

    /// Write a collection's index configuration and revive its BACKUP
    /// segments to RAW (re-usable after an index-schema change).
    pub fn update_collection_index(&self, collection_id: &str, spec: &IndexSpec) -> Result<()> {
        let mut conn = self.conn.lock();
        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM collections WHERE collection_id = ?1 AND state != ?2",
                params![collection_id, CollectionState::ToDelete.as_i32()],
                |row| row.get(0),
            )
            .map_err(|e| meta_err("lookup collection", e))?;
        if exists == 0 {
            return Err(Error::not_found(format!("collection {}", collection_id)));
        }

        let tx = conn
            .transaction()
            .map_err(|e| meta_err("begin transaction", e))?;
        tx.execute(
            "UPDATE collections SET engine_type = ?1, index_params = ?2, metric_type = ?3 \
             WHERE collection_id = ?4",
            params![
                spec.kind.as_i32(),
                spec.params.to_string(),
                spec.metric.as_i32(),
                collection_id,
            ],
        )
        .map_err(|e| meta_err("update collection index", e))?;
        tx.execute(
            "UPDATE segments SET kind = ?1, updated_at = ?2 \
             WHERE collection_id = ?3 AND kind = ?4",
            params![
                SegmentKind::Raw.as_i32(),
                now_micros(),
                collection_id,
                SegmentKind::Backup.as_i32(),
            ],
        )
        .map_err(|e| meta_err("revive backup segments", e))?;
        tx.commit().map_err(|e| meta_err("commit", e))?;

        debug!(collection = %collection_id, kind = ?spec.kind, "updated collection index");
        Ok(())
    }

    /// Read a collection's index configuration.
    pub fn describe_collection_index(&self, collection_id: &str) -> Result<IndexSpec> {
        let schema = self.describe_collection(collection_id)?;
        let params = serde_json::from_str(&schema.index_params)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        Ok(IndexSpec {
            kind: schema.index,
            params,
            metric: schema.metric,
        })
    }

    /// Drop a collection's index: INDEX segments become TO_DELETE, BACKUP
    /// segments revive to RAW, and the collection resets to the
    /// metric-appropriate default kind with empty params.
    pub fn drop_collection_index(&self, collection_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let metric: Option<i32> = conn
            .query_row(
                "SELECT metric_type FROM collections WHERE collection_id = ?1",
                params![collection_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(meta_err("lookup collection", other)),
            })?;
        let metric = metric
            .and_then(MetricType::from_i32)
            .ok_or_else(|| Error::not_found(format!("collection {}", collection_id)))?;
        let default_kind = IndexKind::default_for(metric);

        let tx = conn
            .transaction()
            .map_err(|e| meta_err("begin transaction", e))?;
        let now = now_micros();
        tx.execute(
            "UPDATE segments SET kind = ?1, updated_at = ?2 \
             WHERE collection_id = ?3 AND kind = ?4",
            params![
                SegmentKind::ToDelete.as_i32(),
                now,
                collection_id,
                SegmentKind::Index.as_i32(),
            ],
        )
        .map_err(|e| meta_err("tombstone index segments", e))?;
        tx.execute(
            "UPDATE segments SET kind = ?1, updated_at = ?2 \
             WHERE collection_id = ?3 AND kind = ?4",
            params![
                SegmentKind::Raw.as_i32(),
                now,
                collection_id,
                SegmentKind::Backup.as_i32(),
            ],
        )
        .map_err(|e| meta_err("revive backup segments", e))?;
        tx.execute(
            "UPDATE collections SET engine_type = ?1, index_params = '{}' \
             WHERE collection_id = ?2",
            params![default_kind.as_i32(), collection_id],
        )
        .map_err(|e| meta_err("reset collection index", e))?;
        tx.commit().map_err(|e| meta_err("commit", e))?;

        debug!(collection = %collection_id, "dropped collection index");
        Ok(())
    }

    // ========================================================================
    // LSNs and flags
    // ========================================================================

    /// Read the globally last-assigned LSN (0 when never set).
    pub fn get_global_lsn(&self) -> Result<Lsn> {
        let conn = self.conn.lock();
        conn.query_row("SELECT global_lsn FROM environment", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|v| v as Lsn)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(0),
            other => Err(meta_err("read global lsn", other)),
        })
    }

    /// Upsert the globally last-assigned LSN; a no-op if unchanged.
    pub fn set_global_lsn(&self, lsn: Lsn) -> Result<()> {
        let conn = self.conn.lock();
        let current: Option<i64> = conn
            .query_row("SELECT global_lsn FROM environment", [], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(meta_err("read global lsn", other)),
            })?;
        match current {
            None => {
                conn.execute(
                    "INSERT INTO environment (global_lsn) VALUES (?1)",
                    params![lsn as i64],
                )
                .map_err(|e| meta_err("insert global lsn", e))?;
            }
            Some(v) if v as Lsn == lsn => {}
            Some(_) => {
                conn.execute(
                    "UPDATE environment SET global_lsn = ?1",
                    params![lsn as i64],
                )
                .map_err(|e| meta_err("update global lsn", e))?;
            }
        }
        Ok(())
    }

    /// Read a collection's flush LSN (including TO_DELETE rows; recovery
    /// needs the watermark of a collection mid-drop).
    pub fn get_collection_flush_lsn(&self, collection_id: &str) -> Result<Lsn> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT flush_lsn FROM collections WHERE collection_id = ?1",
            params![collection_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|v| v as Lsn)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                Err(Error::not_found(format!("collection {}", collection_id)))
            }
            other => Err(meta_err("read flush lsn", other)),
        })
    }

    /// Advance a collection's flush LSN.
    pub fn set_collection_flush_lsn(&self, collection_id: &str, lsn: Lsn) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE collections SET flush_lsn = ?1 WHERE collection_id = ?2",
            params![lsn as i64, collection_id],
        )
        .map_err(|e| meta_err("update flush lsn", e))?;
        Ok(())
    }

    /// Write a collection's flag word.
    pub fn update_collection_flag(&self, collection_id: &str, flag: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE collections SET flag = ?1 WHERE collection_id = ?2",
            params![flag, collection_id],
        )
        .map_err(|e| meta_err("update collection flag", e))?;
        Ok(())
    }

    // ========================================================================
    // Accounting
    // ========================================================================

    /// Sum of visible segment row counts for one collection.
    pub fn row_count(&self, collection_id: &str) -> Result<u64> {
        self.describe_collection(collection_id)?;
        let conn = self.conn.lock();
        let sum: i64 = conn
            .query_row(
                &format!(
                    "SELECT COALESCE(SUM(row_count), 0) FROM segments \
                     WHERE collection_id = ?1 AND kind IN ({})",
                    kinds_sql(&[SegmentKind::Raw, SegmentKind::ToIndex, SegmentKind::Index])
                ),
                params![collection_id],
                |row| row.get(0),
            )
            .map_err(|e| meta_err("sum row counts", e))?;
        Ok(sum as u64)
    }

    /// Total bytes of all non-tombstoned segments across all collections.
    pub fn size(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let sum: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(bytes), 0) FROM segments WHERE kind != ?1",
                params![SegmentKind::ToDelete.as_i32()],
                |row| row.get(0),
            )
            .map_err(|e| meta_err("sum segment bytes", e))?;
        Ok(sum as u64)
    }

    // ========================================================================
    // Archival and cleanup
    // ========================================================================

    /// Tombstone segments older than `days` calendar days.
    pub fn archive_by_age(&self, days: u64) -> Result<usize> {
        let horizon = now_micros() - (days as i64) * 86_400 * 1_000_000;
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE segments SET kind = ?1, updated_at = ?2 \
                 WHERE created_on < ?3 AND kind != ?1",
                params![SegmentKind::ToDelete.as_i32(), now_micros(), horizon],
            )
            .map_err(|e| meta_err("archive by age", e))?;
        if changed > 0 {
            info!(changed, days, "archived segments past age limit");
        }
        Ok(changed)
    }

    /// Tombstone oldest segments until total size fits under
    /// `limit_bytes`. Works in small batches so a huge overshoot does not
    /// hold the writer lock for long.
    pub fn archive_by_disk_quota(&self, limit_bytes: u64) -> Result<usize> {
        let total = self.size()?;
        let mut to_discard = total as i64 - limit_bytes as i64;
        if to_discard <= 0 {
            return Ok(0);
        }
        info!(total, limit_bytes, "disk quota exceeded, discarding oldest segments");

        let mut discarded = 0usize;
        while to_discard > 0 {
            let mut conn = self.conn.lock();
            let tx = conn
                .transaction()
                .map_err(|e| meta_err("begin transaction", e))?;
            let batch: Vec<(i64, i64)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id, bytes FROM segments WHERE kind != ?1 ORDER BY id LIMIT 10",
                    )
                    .map_err(|e| meta_err("prepare", e))?;
                let rows = stmt
                    .query_map(params![SegmentKind::ToDelete.as_i32()], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .map_err(|e| meta_err("select discard batch", e))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(|e| meta_err("decode discard row", e))?);
                }
                out
            };
            if batch.is_empty() {
                break;
            }

            let mut ids = Vec::new();
            for (id, bytes) in &batch {
                if to_discard <= 0 {
                    break;
                }
                ids.push(id.to_string());
                to_discard -= bytes;
            }
            tx.execute(
                &format!(
                    "UPDATE segments SET kind = ?1, updated_at = ?2 WHERE id IN ({})",
                    ids.join(",")
                ),
                params![SegmentKind::ToDelete.as_i32(), now_micros()],
            )
            .map_err(|e| meta_err("discard segments", e))?;
            tx.commit().map_err(|e| meta_err("commit", e))?;
            discarded += ids.len();
        }
        Ok(discarded)
    }

    /// Delete shadow segment rows (NEW, NEW_MERGE, NEW_INDEX).
    ///
    /// Runs at startup: shadow rows surviving a crash belong to operations
    /// that never committed, so their blobs are garbage.
    pub fn clean_shadow_rows(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                &format!(
                    "DELETE FROM segments WHERE kind IN ({})",
                    kinds_sql(&[
                        SegmentKind::New,
                        SegmentKind::NewMerge,
                        SegmentKind::NewIndex
                    ])
                ),
                [],
            )
            .map_err(|e| meta_err("clean shadow rows", e))?;
        Ok(removed)
    }

    /// Remove TO_DELETE rows whose grace period has elapsed.
    ///
    /// Three phases: expired segment rows go first (blobs erased via
    /// `store`, segments pinned in `ongoing` are skipped), then TO_DELETE
    /// collection rows (with their now-empty directories), then
    /// segment-group directories that lost their last row. Idempotent:
    /// a second run over an unchanged catalog is a no-op.
    pub fn clean_expired(
        &self,
        ttl_secs: u64,
        ongoing: &HashSet<i64>,
        store: &dyn SegmentStore,
    ) -> Result<usize> {
        let horizon = now_micros() - (ttl_secs as i64) * 1_000_000;
        let mut touched_collections: HashSet<String> = HashSet::new();
        let mut touched_groups: HashSet<(String, String)> = HashSet::new();
        let mut cleaned = 0usize;

        // Phase 1: expired tombstoned segments.
        {
            let mut conn = self.conn.lock();
            let sql = format!("{} WHERE kind = ?1 AND updated_at < ?2", SEGMENT_SELECT);
            let expired = query_segments(
                &conn,
                &sql,
                params![SegmentKind::ToDelete.as_i32(), horizon],
            )?;

            let tx = conn
                .transaction()
                .map_err(|e| meta_err("begin transaction", e))?;
            for segment in &expired {
                if ongoing.contains(&segment.id) {
                    debug!(file = %segment.file_id, "segment in use, deferring cleanup");
                    continue;
                }
                tx.execute("DELETE FROM segments WHERE id = ?1", params![segment.id])
                    .map_err(|e| meta_err("delete segment row", e))?;
                if let Err(e) = store.delete_segment(segment) {
                    warn!(file = %segment.file_id, error = %e, "failed to erase segment blob");
                }
                touched_collections.insert(segment.collection_id.clone());
                touched_groups
                    .insert((segment.collection_id.clone(), segment.segment_group.clone()));
                cleaned += 1;
            }
            tx.commit().map_err(|e| meta_err("commit", e))?;
        }
        if cleaned > 0 {
            debug!(cleaned, ttl_secs, "removed expired segments");
        }

        // Phase 2: tombstoned collection rows.
        {
            let mut conn = self.conn.lock();
            let dead: Vec<(i64, String)> = {
                let mut stmt = conn
                    .prepare("SELECT id, collection_id FROM collections WHERE state = ?1")
                    .map_err(|e| meta_err("prepare", e))?;
                let rows = stmt
                    .query_map(params![CollectionState::ToDelete.as_i32()], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .map_err(|e| meta_err("select dead collections", e))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(|e| meta_err("decode row", e))?);
                }
                out
            };

            let tx = conn
                .transaction()
                .map_err(|e| meta_err("begin transaction", e))?;
            for (id, collection_id) in &dead {
                if let Err(e) = store.remove_collection_dir(collection_id, false) {
                    warn!(collection = %collection_id, error = %e, "failed to remove collection dir");
                }
                tx.execute("DELETE FROM collections WHERE id = ?1", params![id])
                    .map_err(|e| meta_err("delete collection row", e))?;
            }
            tx.commit().map_err(|e| meta_err("commit", e))?;
            if !dead.is_empty() {
                debug!(count = dead.len(), "removed tombstoned collection rows");
            }
        }

        // Phase 3: directories that lost their last segment.
        {
            let conn = self.conn.lock();
            for collection_id in &touched_collections {
                let remaining: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM segments WHERE collection_id = ?1",
                        params![collection_id],
                        |row| row.get(0),
                    )
                    .map_err(|e| meta_err("count remaining segments", e))?;
                if remaining == 0 {
                    if let Err(e) = store.remove_collection_dir(collection_id, true) {
                        warn!(collection = %collection_id, error = %e, "failed to remove collection dir");
                    }
                }
            }
            for (collection_id, group) in &touched_groups {
                let remaining: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM segments WHERE segment_group = ?1",
                        params![group],
                        |row| row.get(0),
                    )
                    .map_err(|e| meta_err("count remaining group rows", e))?;
                if remaining == 0 {
                    if let Err(e) = store.remove_group_dir(collection_id, group) {
                        warn!(group = %group, error = %e, "failed to remove segment group dir");
                    }
                }
            }
        }

        Ok(cleaned)
    }

    /// Drop both catalog tables. The engine pairs this with removing the
    /// data directories.
    pub fn drop_all(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "DROP TABLE IF EXISTS collections; \
             DROP TABLE IF EXISTS segments; \
             DROP TABLE IF EXISTS environment;",
        )
        .map_err(|e| meta_err("drop tables", e))?;
        conn.execute_batch(&format!(
            "{};\n{};\n{};",
            COLLECTIONS_DDL, SEGMENTS_DDL, ENVIRONMENT_DDL
        ))
        .map_err(|e| meta_err("recreate tables", e))?;
        info!("dropped all catalog tables");
        Ok(())
    }

    fn fill_many_locked(
        &self,
        conn: &Connection,
        segments: Vec<SegmentMeta>,
    ) -> Result<Vec<SegmentMeta>> {
        let mut schemas: HashMap<String, CollectionSchema> = HashMap::new();
        let mut out = Vec::with_capacity(segments.len());
        for mut segment in segments {
            if !schemas.contains_key(&segment.collection_id) {
                let schema = describe_locked(conn, &segment.collection_id)?;
                schemas.insert(segment.collection_id.clone(), schema);
            }
            let schema = &schemas[&segment.collection_id];
            segment.dimension = schema.dimension;
            segment.metric = schema.metric;
            segment.index_params = schema.index_params.clone();
            segment.target_segment_size = schema.target_segment_size;
            out.push(segment);
        }
        Ok(out)
    }
}

fn describe_locked(conn: &Connection, collection_id: &str) -> Result<CollectionSchema> {
    let sql = format!(
        "{} WHERE collection_id = ?1 AND state != ?2",
        COLLECTION_SELECT
    );
    conn.query_row(
        &sql,
        params![collection_id, CollectionState::ToDelete.as_i32()],
        collection_from_row,
    )
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            Err(Error::not_found(format!("collection {}", collection_id)))
        }
        other => Err(meta_err("describe collection", other)),
    })
}

fn collection_is_live(conn: &Connection, collection_id: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM collections WHERE collection_id = ?1 AND state != ?2",
            params![collection_id, CollectionState::ToDelete.as_i32()],
            |row| row.get(0),
        )
        .map_err(|e| meta_err("lookup collection", e))?;
    Ok(count > 0)
}

fn update_segment_locked(conn: &Connection, segment: &SegmentMeta) -> Result<()> {
    conn.execute(
        "UPDATE segments SET collection_id = ?1, segment_group = ?2, engine_type = ?3, \
         file_id = ?4, kind = ?5, bytes = ?6, row_count = ?7, updated_at = ?8, \
         created_on = ?9, date = ?10, flush_lsn = ?11 WHERE id = ?12",
        params![
            segment.collection_id,
            segment.segment_group,
            segment.index.as_i32(),
            segment.file_id,
            segment.kind.as_i32(),
            segment.bytes as i64,
            segment.row_count as i64,
            segment.updated_at,
            segment.created_on,
            segment.date,
            segment.flush_lsn as i64,
            segment.id,
        ],
    )
    .map_err(|e| meta_err("update segment", e))?;
    Ok(())
}

fn query_segments(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<SegmentMeta>> {
    let mut stmt = conn.prepare(sql).map_err(|e| meta_err("prepare", e))?;
    let rows = stmt
        .query_map(params, segment_from_row)
        .map_err(|e| meta_err("query segments", e))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| meta_err("decode segment row", e))?);
    }
    Ok(out)
}

fn fill_from_schema(segments: Vec<SegmentMeta>, schema: &CollectionSchema) -> Vec<SegmentMeta> {
    segments
        .into_iter()
        .map(|mut s| {
            s.dimension = schema.dimension;
            s.metric = schema.metric;
            s.index_params = schema.index_params.clone();
            s.target_segment_size = schema.target_segment_size;
            s
        })
        .collect()
}

/// Compare the stored column sets against the runtime schema.
///
/// Missing tables are fine (first open); present tables whose columns
/// drifted fail with `IncompatibleMeta` rather than being recreated.
fn validate_schema(conn: &Connection) -> Result<()> {
    for (table, expected) in [
        ("collections", COLLECTION_COLUMNS),
        ("segments", SEGMENT_COLUMNS),
    ] {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table))
            .map_err(|e| meta_err("read table info", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| meta_err("read table info", e))?;
        let mut stored = Vec::new();
        for row in rows {
            stored.push(row.map_err(|e| meta_err("decode table info", e))?);
        }
        if stored.is_empty() {
            continue; // table does not exist yet
        }
        let expected_set: HashSet<&str> = expected.iter().copied().collect();
        let stored_set: HashSet<&str> = stored.iter().map(String::as_str).collect();
        if expected_set != stored_set {
            return Err(Error::incompatible_meta(format!(
                "table {} was created by an incompatible version \
                 (stored columns: {:?})",
                table, stored
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use magnetite_core::SegmentData;
    use tempfile::TempDir;

    /// Blob store stub: cleanup paths only need call accounting.
    #[derive(Default)]
    struct NullStore;

    impl SegmentStore for NullStore {
        fn write_segment(&self, _: &SegmentMeta, _: &SegmentData) -> Result<u64> {
            Ok(0)
        }
        fn write_artifact(&self, _: &SegmentMeta, _: &[u8]) -> Result<u64> {
            Ok(0)
        }
        fn load_segment(&self, _: &SegmentMeta) -> Result<SegmentData> {
            Ok(SegmentData::default())
        }
        fn delete_segment(&self, _: &SegmentMeta) -> Result<()> {
            Ok(())
        }
        fn remove_group_dir(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn remove_collection_dir(&self, _: &str, _: bool) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (MetaStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn make_collection(meta: &MetaStore, id: &str) -> CollectionSchema {
        let mut schema = CollectionSchema::new(id, 8, MetricType::L2);
        schema.target_segment_size = 1024 * 1024;
        meta.create_collection(&mut schema).unwrap();
        schema
    }

    #[test]
    fn create_and_describe_collection() {
        let (meta, _dir) = setup();
        let schema = make_collection(&meta, "c1");
        assert!(schema.id > 0);
        assert!(schema.created_on > 0);

        let described = meta.describe_collection("c1").unwrap();
        assert_eq!(described.dimension, 8);
        assert_eq!(described.metric, MetricType::L2);
        assert_eq!(described.index, IndexKind::Idmap);
        assert!(meta.has_collection("c1").unwrap());
        assert!(!meta.has_collection("nope").unwrap());
    }

    #[test]
    fn create_collection_generates_id_when_empty() {
        let (meta, _dir) = setup();
        let mut schema = CollectionSchema::new("", 4, MetricType::Ip);
        meta.create_collection(&mut schema).unwrap();
        assert!(!schema.collection_id.is_empty());
        assert!(meta.has_collection(&schema.collection_id).unwrap());
    }

    #[test]
    fn duplicate_collection_is_already_exists() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        let mut dup = CollectionSchema::new("c1", 8, MetricType::L2);
        let err = meta.create_collection(&mut dup).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn recreate_during_grace_period_is_conflict() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        meta.drop_collection("c1").unwrap();

        let mut again = CollectionSchema::new("c1", 8, MetricType::L2);
        let err = meta.create_collection(&mut again).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn drop_collection_hides_it_and_is_idempotent() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        meta.drop_collection("c1").unwrap();
        meta.drop_collection("c1").unwrap();

        assert!(!meta.has_collection("c1").unwrap());
        assert!(meta.describe_collection("c1").unwrap_err().is_not_found());
        assert!(meta.all_root_collections().unwrap().is_empty());
    }

    #[test]
    fn root_listing_excludes_partitions() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        meta.create_partition("c1", "", "p1", 0).unwrap();

        let roots = meta.all_root_collections().unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].collection_id, "c1");
    }

    #[test]
    fn partition_inherits_parent_schema() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        let part = meta.create_partition("c1", "", "tag-a", 42).unwrap();

        assert_eq!(part.dimension, 8);
        assert_eq!(part.owner, "c1");
        assert_eq!(part.partition_tag, "tag-a");
        assert_eq!(part.flush_lsn, 42);

        let shown = meta.show_partitions("c1").unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].collection_id, part.collection_id);
    }

    #[test]
    fn duplicate_partition_tag_rejected_after_trim() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        meta.create_partition("c1", "", "p1", 0).unwrap();

        let err = meta.create_partition("c1", "", "  p1  ", 0).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn nested_partition_rejected() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        let child = meta.create_partition("c1", "x", "a", 0).unwrap();

        let err = meta
            .create_partition(&child.collection_id, "y", "b", 0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert!(err.to_string().contains("nested partition"));
    }

    #[test]
    fn drop_partition_by_tag_resolves_trimmed() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        meta.create_partition("c1", "", "p1", 0).unwrap();

        meta.drop_partition_by_tag("c1", " p1 ").unwrap();
        assert!(meta.show_partitions("c1").unwrap().is_empty());
        assert!(meta
            .partition_name_by_tag("c1", "p1")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn create_segment_fills_from_collection() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");

        let mut seg = SegmentMeta::new("c1");
        meta.create_segment(&mut seg).unwrap();

        assert!(seg.id > 0);
        assert!(!seg.file_id.is_empty());
        assert_eq!(seg.segment_group, seg.file_id);
        assert_eq!(seg.kind, SegmentKind::New);
        assert_eq!(seg.dimension, 8);
        assert_eq!(seg.target_segment_size, 1024 * 1024);
        assert!(seg.date > 20_200_101);
    }

    #[test]
    fn create_segment_for_missing_collection_fails() {
        let (meta, _dir) = setup();
        let mut seg = SegmentMeta::new("nope");
        assert!(meta.create_segment(&mut seg).unwrap_err().is_not_found());
    }

    #[test]
    fn update_segment_coerces_to_delete_for_dropped_collection() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        let mut seg = SegmentMeta::new("c1");
        meta.create_segment(&mut seg).unwrap();

        meta.drop_collection("c1").unwrap();
        seg.kind = SegmentKind::Raw;
        meta.update_segment(&mut seg).unwrap();
        assert_eq!(seg.kind, SegmentKind::ToDelete);
    }

    #[test]
    fn files_to_search_returns_only_visible_kinds() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");

        let mut kinds_present = Vec::new();
        for kind in [
            SegmentKind::New,
            SegmentKind::Raw,
            SegmentKind::ToIndex,
            SegmentKind::Index,
            SegmentKind::ToDelete,
            SegmentKind::Backup,
        ] {
            let mut seg = SegmentMeta::new("c1");
            meta.create_segment(&mut seg).unwrap();
            seg.kind = kind;
            meta.update_segment(&mut seg).unwrap();
            kinds_present.push(seg);
        }

        let found = meta.files_to_search("c1", &[]).unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|s| s.kind.is_visible()));
        // derived fields are filled in
        assert!(found.iter().all(|s| s.dimension == 8));
    }

    #[test]
    fn files_to_merge_sorted_desc_and_under_target() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");

        for bytes in [100u64, 5000, 2_000_000, 300] {
            let mut seg = SegmentMeta::new("c1");
            meta.create_segment(&mut seg).unwrap();
            seg.kind = SegmentKind::Raw;
            seg.bytes = bytes;
            meta.update_segment(&mut seg).unwrap();
        }

        let to_merge = meta.files_to_merge("c1").unwrap();
        // 2 MB segment exceeds the 1 MB target and is skipped
        assert_eq!(to_merge.len(), 3);
        let sizes: Vec<u64> = to_merge.iter().map(|s| s.bytes).collect();
        assert_eq!(sizes, vec![5000, 300, 100]);
    }

    #[test]
    fn files_to_index_spans_collections() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        make_collection(&meta, "c2");

        for cid in ["c1", "c2"] {
            let mut seg = SegmentMeta::new(cid);
            meta.create_segment(&mut seg).unwrap();
            seg.kind = SegmentKind::ToIndex;
            seg.row_count = 10_000;
            meta.update_segment(&mut seg).unwrap();
        }

        let to_index = meta.files_to_index().unwrap();
        assert_eq!(to_index.len(), 2);
        let collections: HashSet<&str> =
            to_index.iter().map(|s| s.collection_id.as_str()).collect();
        assert_eq!(collections.len(), 2);
    }

    #[test]
    fn mark_segments_to_index_respects_threshold() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");

        for rows in [100u64, 5000, 9000] {
            let mut seg = SegmentMeta::new("c1");
            meta.create_segment(&mut seg).unwrap();
            seg.kind = SegmentKind::Raw;
            seg.row_count = rows;
            meta.update_segment(&mut seg).unwrap();
        }

        let changed = meta.mark_segments_to_index("c1", 4096).unwrap();
        assert_eq!(changed, 2);
        let to_index = meta
            .files_by_kind("c1", &[SegmentKind::ToIndex])
            .unwrap();
        assert_eq!(to_index.len(), 2);
    }

    #[test]
    fn update_collection_index_revives_backup() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        let mut seg = SegmentMeta::new("c1");
        meta.create_segment(&mut seg).unwrap();
        seg.kind = SegmentKind::Backup;
        meta.update_segment(&mut seg).unwrap();

        let spec = IndexSpec {
            kind: IndexKind::IvfFlat,
            params: serde_json::json!({"nlist": 128}),
            metric: MetricType::L2,
        };
        meta.update_collection_index("c1", &spec).unwrap();

        let described = meta.describe_collection_index("c1").unwrap();
        assert_eq!(described.kind, IndexKind::IvfFlat);
        assert_eq!(described.params["nlist"], 128);

        let raw = meta.files_by_kind("c1", &[SegmentKind::Raw]).unwrap();
        assert_eq!(raw.len(), 1);
    }

    #[test]
    fn drop_collection_index_resets_to_default() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");

        let mut index_seg = SegmentMeta::new("c1");
        meta.create_segment(&mut index_seg).unwrap();
        index_seg.kind = SegmentKind::Index;
        meta.update_segment(&mut index_seg).unwrap();

        let mut backup_seg = SegmentMeta::new("c1");
        meta.create_segment(&mut backup_seg).unwrap();
        backup_seg.kind = SegmentKind::Backup;
        meta.update_segment(&mut backup_seg).unwrap();

        let spec = IndexSpec {
            kind: IndexKind::Hnsw,
            params: serde_json::json!({"M": 16}),
            metric: MetricType::L2,
        };
        meta.update_collection_index("c1", &spec).unwrap();
        meta.drop_collection_index("c1").unwrap();

        let described = meta.describe_collection_index("c1").unwrap();
        assert_eq!(described.kind, IndexKind::Idmap);
        assert_eq!(described.params.to_string(), "{}");

        assert_eq!(
            meta.files_by_kind("c1", &[SegmentKind::ToDelete]).unwrap().len(),
            1
        );
        // backup revived twice is fine, it ends RAW
        assert!(meta.files_by_kind("c1", &[SegmentKind::Raw]).unwrap().len() >= 1);
    }

    #[test]
    fn global_lsn_round_trip() {
        let (meta, _dir) = setup();
        assert_eq!(meta.get_global_lsn().unwrap(), 0);
        meta.set_global_lsn(77).unwrap();
        assert_eq!(meta.get_global_lsn().unwrap(), 77);
        meta.set_global_lsn(77).unwrap(); // no-op path
        meta.set_global_lsn(99).unwrap();
        assert_eq!(meta.get_global_lsn().unwrap(), 99);
    }

    #[test]
    fn collection_flush_lsn_round_trip() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        assert_eq!(meta.get_collection_flush_lsn("c1").unwrap(), 0);
        meta.set_collection_flush_lsn("c1", 123).unwrap();
        assert_eq!(meta.get_collection_flush_lsn("c1").unwrap(), 123);
        assert!(meta
            .get_collection_flush_lsn("nope")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn row_count_sums_visible_only() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        for (kind, rows) in [
            (SegmentKind::Raw, 100u64),
            (SegmentKind::Index, 200),
            (SegmentKind::ToDelete, 400),
            (SegmentKind::New, 800),
        ] {
            let mut seg = SegmentMeta::new("c1");
            meta.create_segment(&mut seg).unwrap();
            seg.kind = kind;
            seg.row_count = rows;
            meta.update_segment(&mut seg).unwrap();
        }
        assert_eq!(meta.row_count("c1").unwrap(), 300);
    }

    #[test]
    fn size_excludes_tombstones() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        for (kind, bytes) in [(SegmentKind::Raw, 1000u64), (SegmentKind::ToDelete, 5000)] {
            let mut seg = SegmentMeta::new("c1");
            meta.create_segment(&mut seg).unwrap();
            seg.kind = kind;
            seg.bytes = bytes;
            meta.update_segment(&mut seg).unwrap();
        }
        assert_eq!(meta.size().unwrap(), 1000);
    }

    #[test]
    fn shadow_rows_purged_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let meta = MetaStore::open(dir.path()).unwrap();
            make_collection(&meta, "c1");
            for kind in [SegmentKind::New, SegmentKind::NewMerge, SegmentKind::Raw] {
                let mut seg = SegmentMeta::new("c1");
                meta.create_segment(&mut seg).unwrap();
                seg.kind = kind;
                meta.update_segment(&mut seg).unwrap();
            }
        }
        let meta = MetaStore::open(dir.path()).unwrap();
        let all = meta
            .files_by_kind(
                "c1",
                &[
                    SegmentKind::New,
                    SegmentKind::NewMerge,
                    SegmentKind::NewIndex,
                    SegmentKind::Raw,
                ],
            )
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, SegmentKind::Raw);
    }

    #[test]
    fn clean_expired_skips_ongoing_and_is_idempotent() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");

        let mut pinned = SegmentMeta::new("c1");
        meta.create_segment(&mut pinned).unwrap();
        pinned.kind = SegmentKind::ToDelete;
        meta.update_segment(&mut pinned).unwrap();

        let mut loose = SegmentMeta::new("c1");
        meta.create_segment(&mut loose).unwrap();
        loose.kind = SegmentKind::ToDelete;
        meta.update_segment(&mut loose).unwrap();

        let mut ongoing = HashSet::new();
        ongoing.insert(pinned.id);

        // ttl 0 makes everything expired immediately
        let cleaned = meta.clean_expired(0, &ongoing, &NullStore).unwrap();
        assert_eq!(cleaned, 1);

        let cleaned_again = meta.clean_expired(0, &ongoing, &NullStore).unwrap();
        assert_eq!(cleaned_again, 0);

        // releasing the pin lets the next pass take it
        let cleaned_final = meta.clean_expired(0, &HashSet::new(), &NullStore).unwrap();
        assert_eq!(cleaned_final, 1);
    }

    #[test]
    fn clean_expired_removes_tombstoned_collection_rows() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        meta.drop_collection("c1").unwrap();

        meta.clean_expired(0, &HashSet::new(), &NullStore).unwrap();

        // the id is free again
        let mut again = CollectionSchema::new("c1", 8, MetricType::L2);
        meta.create_collection(&mut again).unwrap();
    }

    #[test]
    fn clean_expired_honors_ttl() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        let mut seg = SegmentMeta::new("c1");
        meta.create_segment(&mut seg).unwrap();
        seg.kind = SegmentKind::ToDelete;
        meta.update_segment(&mut seg).unwrap();

        // a long ttl keeps the fresh tombstone
        let cleaned = meta.clean_expired(3600, &HashSet::new(), &NullStore).unwrap();
        assert_eq!(cleaned, 0);
    }

    #[test]
    fn archive_by_disk_quota_marks_oldest_first() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        let mut ids = Vec::new();
        for _ in 0..4 {
            let mut seg = SegmentMeta::new("c1");
            meta.create_segment(&mut seg).unwrap();
            seg.kind = SegmentKind::Raw;
            seg.bytes = 1000;
            meta.update_segment(&mut seg).unwrap();
            ids.push(seg.id);
        }

        // 4000 bytes total, quota 2500 -> discard 2 oldest
        let discarded = meta.archive_by_disk_quota(2500).unwrap();
        assert_eq!(discarded, 2);
        let dead = meta.files_by_kind("c1", &[SegmentKind::ToDelete]).unwrap();
        let dead_ids: Vec<i64> = dead.iter().map(|s| s.id).collect();
        assert!(dead_ids.contains(&ids[0]));
        assert!(dead_ids.contains(&ids[1]));
        assert_eq!(meta.size().unwrap(), 2000);
    }

    #[test]
    fn archive_by_age_keeps_recent() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        let mut seg = SegmentMeta::new("c1");
        meta.create_segment(&mut seg).unwrap();
        seg.kind = SegmentKind::Raw;
        meta.update_segment(&mut seg).unwrap();

        assert_eq!(meta.archive_by_age(1).unwrap(), 0);
        // age 0 days archives everything created before "now"
        assert_eq!(meta.archive_by_age(0).unwrap(), 1);
    }

    #[test]
    fn drop_all_resets_catalog() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        meta.set_global_lsn(5).unwrap();
        meta.drop_all().unwrap();

        assert!(meta.all_root_collections().unwrap().is_empty());
        assert_eq!(meta.get_global_lsn().unwrap(), 0);
        // catalog is usable again
        make_collection(&meta, "c2");
    }

    #[test]
    fn incompatible_schema_fails_open() {
        let dir = TempDir::new().unwrap();
        {
            let conn = Connection::open(dir.path().join("meta.db")).unwrap();
            conn.execute_batch("CREATE TABLE collections (id INTEGER PRIMARY KEY, junk TEXT)")
                .unwrap();
        }
        let err = MetaStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::IncompatibleMeta { .. }));
    }

    #[test]
    fn reopen_preserves_rows() {
        let dir = TempDir::new().unwrap();
        {
            let meta = MetaStore::open(dir.path()).unwrap();
            make_collection(&meta, "c1");
            meta.set_global_lsn(11).unwrap();
        }
        let meta = MetaStore::open(dir.path()).unwrap();
        assert!(meta.has_collection("c1").unwrap());
        assert_eq!(meta.get_global_lsn().unwrap(), 11);
    }

    #[test]
    fn get_segments_by_rowid_skips_tombstones() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");

        let mut live = SegmentMeta::new("c1");
        meta.create_segment(&mut live).unwrap();
        live.kind = SegmentKind::Raw;
        meta.update_segment(&mut live).unwrap();

        let mut dead = SegmentMeta::new("c1");
        meta.create_segment(&mut dead).unwrap();
        dead.kind = SegmentKind::ToDelete;
        meta.update_segment(&mut dead).unwrap();

        let found = meta.get_segments("c1", &[live.id, dead.id]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, live.id);
        assert!(meta.get_segments("c1", &[]).unwrap().is_empty());
    }

    #[test]
    fn collection_flag_round_trips() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        meta.update_collection_flag("c1", 0b101).unwrap();
        assert_eq!(meta.describe_collection("c1").unwrap().flag, 0b101);
    }

    #[test]
    fn segments_by_file_ids_filters_visible() {
        let (meta, _dir) = setup();
        make_collection(&meta, "c1");
        let mut seg = SegmentMeta::new("c1");
        meta.create_segment(&mut seg).unwrap();
        seg.kind = SegmentKind::Raw;
        meta.update_segment(&mut seg).unwrap();

        let found = meta
            .segments_by_file_ids("c1", &[seg.file_id.clone()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_id, seg.file_id);

        let missing = meta
            .segments_by_file_ids("c1", &["0".to_string()])
            .unwrap();
        assert!(missing.is_empty());
    }
}
