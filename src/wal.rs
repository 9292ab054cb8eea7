use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use metrics::histogram;
use tracing::info;

use crate::job::history::{HistoryError, JobHistory, JobHistorySink};
use crate::limits::MAX_HISTORY_RECORD_BYTES;
use crate::model::Ms;
use crate::observability::HISTORY_FLUSH_DURATION_SECONDS;

/// Encode a single record to [len][bincode][crc32] format.
fn encode_entry(writer: &mut impl Write, entry: &JobHistory) -> io::Result<()> {
    let payload = bincode::serialize(entry).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_HISTORY_RECORD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("history record of {} bytes exceeds {MAX_HISTORY_RECORD_BYTES}", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only job history log.
///
/// Format per entry: `[u32: len][bincode: JobHistory][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append a single record and fsync.
    pub fn append(&mut self, entry: &JobHistory) -> io::Result<()> {
        self.append_buffered(entry)?;
        self.flush_sync()
    }

    /// Append a single record to the BufWriter without flushing or syncing.
    pub fn append_buffered(&mut self, entry: &JobHistory) -> io::Result<()> {
        encode_entry(&mut self.writer, entry)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the retained records to a temp file and fsync.
    pub fn write_compact_file(path: &Path, entries: &[JobHistory]) -> io::Result<()> {
        let tmp_path = path.with_extension("log.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for entry in entries {
            encode_entry(&mut writer, entry)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the log and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("log.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replace the log with `entries`.
    pub fn compact(&mut self, entries: &[JobHistory]) -> io::Result<()> {
        Self::write_compact_file(&self.path, entries)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the log from disk, returning all valid records.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<JobHistory>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_HISTORY_RECORD_BYTES {
                break;
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            let stored_crc = u32::from_le_bytes(crc_buf);
            if stored_crc != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<JobHistory>(&payload) {
                Ok(entry) => entries.push(entry),
                Err(_) => break,
            }
        }

        Ok(entries)
    }
}

/// The job history sink the binary writes to: a `Wal` behind a lock, compacted by age.
pub struct HistoryLog {
    wal: Mutex<Wal>,
    compact_threshold: u64,
}

impl HistoryLog {
    pub fn open(path: &Path, compact_threshold: u64) -> Result<Self, HistoryError> {
        Ok(Self {
            wal: Mutex::new(Wal::open(path)?),
            compact_threshold,
        })
    }

    /// Every record currently on disk.
    pub fn entries(&self) -> Result<Vec<JobHistory>, HistoryError> {
        let mut wal = self.wal.lock().unwrap_or_else(|e| e.into_inner());
        wal.flush_sync()?;
        Ok(Wal::replay(wal.path())?)
    }

    pub fn needs_compaction(&self) -> bool {
        let wal = self.wal.lock().unwrap_or_else(|e| e.into_inner());
        wal.appends_since_compact() >= self.compact_threshold
    }

    /// Rewrite the log without records that ended before `cutoff`. Returns how many went.
    pub fn compact_before(&self, cutoff: Ms) -> Result<usize, HistoryError> {
        let mut wal = self.wal.lock().unwrap_or_else(|e| e.into_inner());
        wal.flush_sync()?;
        let entries = Wal::replay(wal.path())?;
        let total = entries.len();
        let kept: Vec<JobHistory> = entries.into_iter().filter(|e| e.end >= cutoff).collect();
        wal.compact(&kept)?;
        let dropped = total - kept.len();
        info!("job history compacted: {dropped} of {total} records dropped");
        Ok(dropped)
    }
}

impl JobHistorySink for HistoryLog {
    fn record(&self, entry: &JobHistory) -> Result<(), HistoryError> {
        let started = Instant::now();
        let mut wal = self.wal.lock().unwrap_or_else(|e| e.into_inner());
        wal.append_buffered(entry)?;
        wal.flush_sync()?;
        histogram!(HISTORY_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("emberline_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn entry(id: u64, end: Ms, success: bool) -> JobHistory {
        JobHistory {
            id: JobId(id),
            name: format!("Clump MODIS for 2024-07-0{}", id % 9 + 1),
            kind: "clump".into(),
            start: Some(end - 500),
            end,
            status: if success {
                "Successfully created 3 clumps".into()
            } else {
                "upstream job job-1 failed".into()
            },
            success,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.log");
        let _ = fs::remove_file(&path);

        let entries = vec![entry(1, 1000, true), entry(2, 2000, false)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &entries {
                wal.append(e).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, entries);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.log");
        let _ = fs::remove_file(&path);

        let first = entry(1, 1000, true);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }

        // Garbage simulating a truncated second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.log");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.log");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&entry(1, 1000, true)).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_oversized_length() {
        let path = tmp_path("oversized_len.log");
        let _ = fs::remove_file(&path);

        let first = entry(1, 1000, true);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0xAB; 16]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut big = entry(1, 1000, false);
        big.status = "x".repeat(MAX_HISTORY_RECORD_BYTES + 1);
        let mut buf = Vec::new();
        let err = encode_entry(&mut buf, &big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(buf.is_empty());
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.log");
        let _ = fs::remove_file(&path);

        let kept = entry(2, 2000, true);
        let newer = entry(3, 3000, false);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&entry(1, 1000, true)).unwrap();
            wal.append(&kept).unwrap();
            wal.compact(std::slice::from_ref(&kept)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&newer).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, newer]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn history_log_records_and_compacts_by_age() {
        let path = tmp_path("history_log.log");
        let _ = fs::remove_file(&path);

        let log = HistoryLog::open(&path, 3).unwrap();
        for (id, end) in [(1, 1000), (2, 2000), (3, 3000)] {
            log.record(&entry(id, end, true)).unwrap();
        }
        assert!(log.needs_compaction());
        assert_eq!(log.compact_before(2000).unwrap(), 1);
        assert!(!log.needs_compaction());

        let ids: Vec<JobId> = log.entries().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![JobId(2), JobId(3)]);

        let _ = fs::remove_file(&path);
    }
}
