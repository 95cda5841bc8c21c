//! Append-only journal for the in-process hot tier
//!
//! Every mutation of a durable key is appended here before the command
//! returns. Record format:
//!
//! ```text
//! | Magic (4) | LSN (8) | Length (4) | Data (variable) | Checksum (8) |
//! ```
//!
//! The checksum is the xxh64 of everything before it. A torn or corrupt
//! record ends the readable journal; `open` cuts the file back to the last
//! good record so later appends stay reachable.

use crate::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

/// Magic number identifying a journal record
const JOURNAL_MAGIC: u32 = 0x464E_4A4C; // "FNJL"

/// Magic + LSN + length
const RECORD_HEADER_SIZE: usize = 4 + 8 + 4;

/// Trailing checksum
const RECORD_TRAILER_SIZE: usize = 8;

/// Journal configuration
#[derive(Clone, Debug)]
pub struct JournalConfig {
    /// fsync after every append
    pub sync_on_write: bool,
    /// Size after which a snapshot is due
    pub max_size_bytes: u64,
    /// Write buffer size
    pub write_buffer_size: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            sync_on_write: false,
            max_size_bytes: 64 * 1024 * 1024, // 64 MB
            write_buffer_size: 64 * 1024,     // 64 KB
        }
    }
}

fn encode_record(lsn: u64, data: &[u8]) -> StoreResult<Vec<u8>> {
    let len = u32::try_from(data.len())
        .map_err(|_| StoreError::Corrupt(format!("journal record of {} bytes", data.len())))?;
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + data.len() + RECORD_TRAILER_SIZE);
    buf.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());
    buf.extend_from_slice(&lsn.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(data);
    let checksum = xxh64(&buf, 0);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

/// Parse the record at the start of `buf`, returning its LSN, payload and
/// encoded size. `None` for a torn or corrupt record.
fn decode_record(buf: &[u8]) -> Option<(u64, &[u8], usize)> {
    let header = buf.get(..RECORD_HEADER_SIZE)?;
    let magic = u32::from_le_bytes(header[0..4].try_into().ok()?);
    if magic != JOURNAL_MAGIC {
        return None;
    }
    let lsn = u64::from_le_bytes(header[4..12].try_into().ok()?);
    let len = u32::from_le_bytes(header[12..16].try_into().ok()?) as usize;

    let body_end = RECORD_HEADER_SIZE + len;
    let total = body_end + RECORD_TRAILER_SIZE;
    let stored = u64::from_le_bytes(buf.get(body_end..total)?.try_into().ok()?);
    if xxh64(&buf[..body_end], 0) != stored {
        return None;
    }
    Some((lsn, &buf[RECORD_HEADER_SIZE..body_end], total))
}

/// Walk the readable records of a journal image. Returns the last LSN and
/// the length of the readable prefix.
fn scan<F>(buf: &[u8], mut callback: F) -> StoreResult<(u64, usize)>
where
    F: FnMut(u64, &[u8]) -> StoreResult<()>,
{
    let mut offset = 0;
    let mut last_lsn = 0;
    while offset < buf.len() {
        let Some((lsn, data, size)) = decode_record(&buf[offset..]) else {
            break;
        };
        callback(lsn, data)?;
        last_lsn = lsn;
        offset += size;
    }
    Ok((last_lsn, offset))
}

fn read_image(path: &Path) -> StoreResult<Vec<u8>> {
    match std::fs::read(path) {
        Ok(buf) => Ok(buf),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Hot tier journal
pub struct Journal {
    path: PathBuf,
    /// Held for every append so file order matches LSN order
    writer: Mutex<BufWriter<File>>,
    size: AtomicU64,
    next_lsn: AtomicU64,
    config: JournalConfig,
}

impl Journal {
    /// Open the journal at `path`, creating it if needed
    pub fn open(path: impl AsRef<Path>, config: JournalConfig) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let image = read_image(&path)?;
        let (last_lsn, readable) = scan(&image, |_, _| Ok(()))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        if readable < image.len() {
            warn!(
                "Dropping {} unreadable bytes at the tail of {}",
                image.len() - readable,
                path.display()
            );
            file.set_len(readable as u64)?;
        }

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(config.write_buffer_size, file)),
            size: AtomicU64::new(readable as u64),
            next_lsn: AtomicU64::new(last_lsn + 1),
            path,
            config,
        })
    }

    /// Append one record and return its LSN
    pub fn append(&self, data: &[u8]) -> StoreResult<u64> {
        let mut writer = self.writer.lock();
        let lsn = self.next_lsn.load(Ordering::SeqCst);
        let record = encode_record(lsn, data)?;
        writer.write_all(&record)?;
        writer.flush()?;
        if self.config.sync_on_write {
            writer.get_ref().sync_data()?;
        }
        self.next_lsn.store(lsn + 1, Ordering::SeqCst);
        self.size.fetch_add(record.len() as u64, Ordering::Relaxed);
        Ok(lsn)
    }

    /// Flush and fsync the journal
    pub fn sync(&self) -> StoreResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Call `callback` for every readable record with an LSN of at least
    /// `from_lsn`. Returns the last LSN seen.
    pub fn replay<F>(&self, from_lsn: u64, mut callback: F) -> StoreResult<u64>
    where
        F: FnMut(u64, &[u8]) -> StoreResult<()>,
    {
        self.writer.lock().flush()?;
        let image = read_image(&self.path)?;
        let (last_lsn, _) = scan(&image, |lsn, data| {
            if lsn >= from_lsn {
                callback(lsn, data)?;
            }
            Ok(())
        })?;
        Ok(last_lsn)
    }

    /// Drop every record below `lsn`
    ///
    /// Called after a snapshot covering those records reached disk.
    pub fn truncate_before(&self, lsn: u64) -> StoreResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let image = read_image(&self.path)?;
        let mut kept = Vec::new();
        scan(&image, |record_lsn, data| {
            if record_lsn >= lsn {
                kept.extend_from_slice(&encode_record(record_lsn, data)?);
            }
            Ok(())
        })?;

        let new_path = self.path.with_extension("journal.new");
        {
            let mut file = File::create(&new_path)?;
            file.write_all(&kept)?;
            file.sync_all()?;
        }
        std::fs::rename(&new_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        *writer = BufWriter::with_capacity(self.config.write_buffer_size, file);
        self.size.store(kept.len() as u64, Ordering::Relaxed);
        debug!("Truncated {} before LSN {}", self.path.display(), lsn);
        Ok(())
    }

    /// Make sure the next LSN is above `lsn`
    pub fn advance_past(&self, lsn: u64) {
        self.next_lsn.fetch_max(lsn + 1, Ordering::SeqCst);
    }

    /// Last assigned LSN
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Journal size in bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Whether the journal grew past the configured size
    pub fn needs_compaction(&self) -> bool {
        self.size() > self.config.max_size_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn records(journal: &Journal, from: u64) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        journal
            .replay(from, |lsn, data| {
                out.push((lsn, data.to_vec()));
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hot.journal");

        {
            let journal = Journal::open(&path, JournalConfig::default()).unwrap();
            assert_eq!(journal.append(b"one").unwrap(), 1);
            assert_eq!(journal.append(b"two").unwrap(), 2);
            journal.sync().unwrap();
        }

        let journal = Journal::open(&path, JournalConfig::default()).unwrap();
        assert_eq!(journal.current_lsn(), 2);
        assert_eq!(journal.append(b"three").unwrap(), 3);
        assert_eq!(
            records(&journal, 2),
            vec![(2, b"two".to_vec()), (3, b"three".to_vec())]
        );
    }

    #[test]
    fn test_torn_tail_is_cut() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hot.journal");

        {
            let journal = Journal::open(&path, JournalConfig::default()).unwrap();
            journal.append(b"kept").unwrap();
            journal.append(b"torn").unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let journal = Journal::open(&path, JournalConfig::default()).unwrap();
        assert_eq!(journal.current_lsn(), 1);
        journal.append(b"after").unwrap();
        assert_eq!(
            records(&journal, 0),
            vec![(1, b"kept".to_vec()), (2, b"after".to_vec())]
        );
    }

    #[test]
    fn test_truncate_before() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hot.journal");
        let journal = Journal::open(&path, JournalConfig::default()).unwrap();
        for data in [b"a", b"b", b"c"] {
            journal.append(data).unwrap();
        }
        let before = journal.size();

        journal.truncate_before(3).unwrap();
        assert!(journal.size() < before);
        assert_eq!(records(&journal, 0), vec![(3, b"c".to_vec())]);

        // Appends keep numbering after a truncation
        assert_eq!(journal.append(b"d").unwrap(), 4);
        assert_eq!(records(&journal, 0).len(), 2);
    }

    #[test]
    fn test_needs_compaction() {
        let dir = tempdir().unwrap();
        let config = JournalConfig {
            max_size_bytes: 64,
            ..Default::default()
        };
        let journal = Journal::open(dir.path().join("hot.journal"), config).unwrap();
        assert!(!journal.needs_compaction());
        journal.append(&[0u8; 80]).unwrap();
        assert!(journal.needs_compaction());
    }
}
