//! WAL manager: segmented log files with LSN ordering, replay and
//! truncation
//!
//! Log files live under `<data>/wal/` and are named by the first LSN they
//! contain (`<lsn:020>.wal`), so lexicographic order is log order. The
//! writer rotates to a fresh file once the current one passes the
//! configured size.
//!
//! ## Durability
//!
//! Every append flushes the userspace buffer to the OS; fsync policy is a
//! group-commit window. A window of zero fsyncs on every append (the
//! default; an acknowledged insert survives a crash). A positive window
//! batches fsyncs and bounds the loss on power failure to that window.
//!
//! ## Disabled mode
//!
//! With WAL disabled the manager still assigns LSNs (the engine's
//! ordering depends on them) but writes nothing; replay is a no-op.

use crate::record::{encode_frame, read_frame, FrameRead, WalOperation, WalRecord};
use magnetite_core::{compose_lsn, Error, Lsn, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// WAL tuning knobs, filled from the engine configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Master switch; disabled still assigns LSNs.
    pub enabled: bool,
    /// Rotate the active file once it exceeds this many bytes.
    pub file_size_limit: u64,
    /// Group-commit fsync window; zero fsyncs every append.
    pub sync_window: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file_size_limit: 64 * 1024 * 1024,
            sync_window: Duration::ZERO,
        }
    }
}

struct ActiveFile {
    writer: BufWriter<File>,
    bytes: u64,
    last_sync: Instant,
}

/// Append-only log of insert/delete/flush records.
pub struct WalManager {
    dir: PathBuf,
    config: WalConfig,
    last_lsn: AtomicU64,
    active: Mutex<Option<ActiveFile>>,
}

impl WalManager {
    /// Open the log under `<data_path>/wal`, scanning existing files to
    /// recover the last assigned LSN. `floor_lsn` (typically the
    /// catalog's global LSN) guards against a clock that went backwards:
    /// no future LSN will be at or below it.
    pub fn open(data_path: impl AsRef<Path>, config: WalConfig, floor_lsn: Lsn) -> Result<Self> {
        let dir = data_path.as_ref().join("wal");
        let mut last_lsn = floor_lsn;

        if config.enabled {
            std::fs::create_dir_all(&dir)?;
            if let Some(last_file) = sorted_wal_files(&dir)?.last() {
                let mut reader = BufReader::new(File::open(last_file)?);
                let mut good_bytes = 0u64;
                let mut torn = false;
                loop {
                    match read_frame(&mut reader)? {
                        FrameRead::Record(record) => {
                            last_lsn = last_lsn.max(record.lsn);
                            good_bytes = reader.stream_position()?;
                        }
                        FrameRead::Eof => break,
                        FrameRead::TornTail { reason } => {
                            warn!(file = %last_file.display(), %reason, "truncating torn WAL tail");
                            torn = true;
                            break;
                        }
                    }
                }
                // chop the torn tail so the file never trips a future
                // replay once newer files exist after it
                if torn {
                    drop(reader);
                    OpenOptions::new()
                        .write(true)
                        .open(last_file)?
                        .set_len(good_bytes)?;
                }
            }
            info!(dir = %dir.display(), last_lsn, "opened write-ahead log");
        }

        Ok(Self {
            dir,
            config,
            last_lsn: AtomicU64::new(last_lsn),
            active: Mutex::new(None),
        })
    }

    /// The most recently assigned LSN.
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn.load(Ordering::Acquire)
    }

    /// Assign the next LSN: wall-clock seconds in the upper half when the
    /// clock cooperates, otherwise simply `last + 1`.
    fn next_lsn(&self) -> Lsn {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut current = self.last_lsn.load(Ordering::Acquire);
        loop {
            let candidate = compose_lsn(secs, 0).max(current + 1);
            match self.last_lsn.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }

    /// Append one record, assigning and returning its LSN.
    ///
    /// When the log is enabled the record is on disk (per the sync
    /// policy) before this returns.
    pub fn append(
        &self,
        collection_id: &str,
        partition_tag: &str,
        op: WalOperation,
    ) -> Result<Lsn> {
        let mut active = self.active.lock();
        let lsn = self.next_lsn();
        if !self.config.enabled {
            return Ok(lsn);
        }

        let record = WalRecord {
            lsn,
            collection_id: collection_id.to_string(),
            partition_tag: partition_tag.to_string(),
            op,
        };
        let frame = encode_frame(&record)?;

        // rotate before writing if the active file is over the limit
        let needs_new = match active.as_ref() {
            None => true,
            Some(file) => file.bytes >= self.config.file_size_limit,
        };
        if needs_new {
            if let Some(mut old) = active.take() {
                old.writer.flush()?;
                old.writer.get_ref().sync_data()?;
            }
            let path = self.dir.join(format!("{:020}.wal", lsn));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            debug!(file = %path.display(), "rotated WAL file");
            *active = Some(ActiveFile {
                writer: BufWriter::new(file),
                bytes: 0,
                last_sync: Instant::now(),
            });
        }

        let file = active.as_mut().ok_or_else(|| Error::internal("no active WAL file"))?;
        file.writer.write_all(&frame)?;
        file.bytes += frame.len() as u64;
        file.writer.flush()?;
        if self.config.sync_window.is_zero() || file.last_sync.elapsed() >= self.config.sync_window
        {
            file.writer.get_ref().sync_data()?;
            file.last_sync = Instant::now();
        }
        Ok(lsn)
    }

    /// Flush and fsync the active file.
    pub fn sync(&self) -> Result<()> {
        let mut active = self.active.lock();
        if let Some(file) = active.as_mut() {
            file.writer.flush()?;
            file.writer.get_ref().sync_data()?;
            file.last_sync = Instant::now();
        }
        Ok(())
    }

    /// Replay every record with LSN greater than `from_lsn` in ascending
    /// order. Returns the highest LSN seen (or `from_lsn` when empty).
    ///
    /// A torn tail stops the containing file with a warning; a torn tail
    /// in a non-final file means later files hold acknowledged records,
    /// which is corruption and fails the replay.
    pub fn replay(
        &self,
        from_lsn: Lsn,
        mut on_record: impl FnMut(WalRecord) -> Result<()>,
    ) -> Result<Lsn> {
        let mut max_lsn = from_lsn;
        if !self.config.enabled {
            return Ok(max_lsn);
        }

        let files = sorted_wal_files(&self.dir)?;
        let last_index = files.len().saturating_sub(1);
        let mut replayed = 0u64;
        for (i, path) in files.iter().enumerate() {
            let mut reader = BufReader::new(File::open(path)?);
            loop {
                match read_frame(&mut reader)? {
                    FrameRead::Record(record) => {
                        max_lsn = max_lsn.max(record.lsn);
                        if record.lsn > from_lsn {
                            replayed += 1;
                            on_record(record)?;
                        }
                    }
                    FrameRead::Eof => break,
                    FrameRead::TornTail { reason } => {
                        if i == last_index {
                            warn!(file = %path.display(), %reason, "stopping replay at torn tail");
                            break;
                        }
                        return Err(Error::corruption(format!(
                            "torn frame in non-final WAL file {}: {}",
                            path.display(),
                            reason
                        )));
                    }
                }
            }
        }
        if replayed > 0 {
            info!(replayed, max_lsn, "replayed WAL records");
        }
        Ok(max_lsn)
    }

    /// Delete log files every record of which has LSN ≤ `lsn`.
    ///
    /// A file qualifies when the next file's first LSN is ≤ `lsn + 1`
    /// (file names are first-LSNs, so everything in the earlier file is
    /// strictly below that). The active tail file is never deleted.
    pub fn truncate_through(&self, lsn: Lsn) -> Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        let _active = self.active.lock();

        let files = sorted_wal_files(&self.dir)?;
        let mut removed = 0;
        for window in files.windows(2) {
            let next_first = match first_lsn_of(&window[1]) {
                Some(lsn) => lsn,
                None => continue,
            };
            if next_first <= lsn + 1 {
                std::fs::remove_file(&window[0])?;
                debug!(file = %window[0].display(), "truncated WAL file");
                removed += 1;
            } else {
                break;
            }
        }
        Ok(removed)
    }
}

fn first_lsn_of(path: &Path) -> Option<Lsn> {
    path.file_stem()?.to_str()?.parse().ok()
}

fn sorted_wal_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("wal")
            && first_lsn_of(&path).is_some()
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
