//! Append-only queue log.
//!
//! The log is the single source of truth for the disk queue:
//! 1. Every insert and every ack is appended as one checksummed frame
//! 2. Each append is flushed (and fsynced when configured) before returning
//! 3. On open the whole log is replayed to rebuild the pending set
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [FRAME 1: codec-encoded LogEntry]
//! [FRAME 2: codec-encoded LogEntry]
//! ...
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Seek, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::attribute::Attribute;
use crate::error::QueueError;

use super::codec::{self, FrameError, Header};

/// One frame of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// What the entry records.
    pub kind: LogEntryKind,
}

/// Change recorded by a [`LogEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntryKind {
    /// A record became pending under `sequence`.
    Insert {
        /// Sequence assigned at insert time.
        sequence: u64,
        /// The queued attribute.
        attribute: Attribute,
    },
    /// These records were acknowledged and are no longer pending.
    Ack {
        /// Sequences that were pending when the ack was written.
        sequences: Vec<u64>,
    },
    /// Written first by compaction so sequences are never reused after the
    /// frames that carried them are dropped.
    Watermark {
        /// Lowest sequence the next insert may receive.
        next_sequence: u64,
    },
}

/// Log writer. Not internally synchronized; the owning queue serializes access.
#[derive(Debug)]
pub struct QueueLog {
    path: PathBuf,
    file: File,
    size: u64,
    sync_on_write: bool,
    /// Set when a rewrite failed after replacing the file. `file` may then
    /// point at an unlinked inode, so nothing more may be written.
    poisoned: Option<String>,
}

impl QueueLog {
    /// Open or create the log and return every complete entry in it.
    ///
    /// A torn final frame (crash mid-append) is cut off so new frames land on
    /// a clean boundary.
    ///
    /// # Errors
    /// - `Corrupted` if a complete frame or the header fails its checks
    /// - `Io` if the file cannot be read, created or truncated
    pub fn open(path: &Path, sync_on_write: bool) -> Result<(Self, Vec<LogEntry>), QueueError> {
        let replayed = match File::open(path) {
            Ok(file) => Self::replay(path, file)?,
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let (entries, size) = match replayed {
            Some(replayed) => replayed,
            None => {
                let mut file = File::create(path)?;
                codec::write_header(&mut file)?;
                file.sync_all()?;
                (Vec::new(), codec::HEADER_LEN)
            }
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                size,
                sync_on_write,
                poisoned: None,
            },
            entries,
        ))
    }

    /// Read every frame of an existing log. `None` when the header was never
    /// completely written.
    fn replay(path: &Path, file: File) -> Result<Option<(Vec<LogEntry>, u64)>, QueueError> {
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        if codec::read_header(&mut reader)? == Header::Missing {
            if file_size > 0 {
                warn!(
                    path = %path.display(),
                    file_size,
                    "queue log header incomplete, reinitializing"
                );
            }
            return Ok(None);
        }

        let mut entries = Vec::new();
        let mut valid_len = codec::HEADER_LEN;
        loop {
            match codec::decode::<LogEntry>(&mut reader) {
                Ok(Some(entry)) => {
                    entries.push(entry);
                    valid_len = reader.stream_position()?;
                }
                Ok(None) => break,
                Err(FrameError::Torn) => {
                    warn!(
                        path = %path.display(),
                        valid_len,
                        file_size,
                        "truncating torn frame at end of queue log"
                    );
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(valid_len)?;
                    file.sync_all()?;
                    break;
                }
                Err(FrameError::Io(e)) => return Err(e.into()),
                Err(e) => {
                    return Err(QueueError::Corrupted(format!(
                        "queue log frame at offset {valid_len}: {e}"
                    )));
                }
            }
        }

        Ok(Some((entries, valid_len)))
    }

    /// Append one entry; durable once this returns.
    ///
    /// On a failed write the file is cut back to its previous length so a
    /// partial frame never precedes later appends.
    ///
    /// # Errors
    /// - `Io` if the frame could not be written, or the log is poisoned
    pub fn append(&mut self, kind: LogEntryKind) -> Result<(), QueueError> {
        self.check_usable()?;
        let encoded = codec::encode(&LogEntry {
            timestamp: Utc::now(),
            kind,
        })?;

        if let Err(e) = self.write_frame(&encoded) {
            if let Err(rollback) = self.file.set_len(self.size) {
                warn!(error = %rollback, "failed to roll back partial queue log frame");
            }
            return Err(e.into());
        }

        self.size += encoded.len() as u64;
        Ok(())
    }

    fn write_frame(&mut self, encoded: &[u8]) -> io::Result<()> {
        self.file.write_all(encoded)?;
        self.file.flush()?;
        if self.sync_on_write {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Replace the log with `kinds`, atomically.
    ///
    /// The new log is written beside the old one, fsynced, then renamed over
    /// it, so a crash leaves either the old or the new log intact. A failure
    /// after the rename poisons the log: every later write fails instead of
    /// landing in the replaced file.
    ///
    /// # Errors
    /// - `Io` if the replacement could not be written or installed
    pub fn rewrite(
        &mut self,
        kinds: impl IntoIterator<Item = LogEntryKind>,
    ) -> Result<(), QueueError> {
        self.rewrite_with(kinds, sync_parent_dir)
    }

    fn rewrite_with(
        &mut self,
        kinds: impl IntoIterator<Item = LogEntryKind>,
        sync_dir: fn(&Path) -> io::Result<()>,
    ) -> Result<(), QueueError> {
        self.check_usable()?;
        let tmp_path = self.path.with_extension("log.tmp");
        let size = match write_replacement(&tmp_path, kinds) {
            Ok(size) => size,
            Err(e) => {
                // Best effort; a leftover temp file is overwritten next time.
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        // Until the rename succeeds the old file and handle stay valid.
        fs::rename(&tmp_path, &self.path)?;

        self.file = match OpenOptions::new().append(true).open(&self.path) {
            Ok(file) => file,
            Err(e) => return Err(self.poison("reopen after rewrite", &e)),
        };
        self.size = size;

        if let Err(e) = sync_dir(&self.path) {
            return Err(self.poison("directory fsync after rewrite", &e));
        }
        Ok(())
    }

    fn poison(&mut self, step: &str, cause: &io::Error) -> QueueError {
        let reason = format!("{step} failed: {cause}");
        error!(path = %self.path.display(), %reason, "queue log poisoned");
        self.poisoned = Some(reason.clone());
        QueueError::Io(format!("queue log unusable: {reason}"))
    }

    fn check_usable(&self) -> Result<(), QueueError> {
        match &self.poisoned {
            Some(reason) => Err(QueueError::Io(format!("queue log unusable: {reason}"))),
            None => Ok(()),
        }
    }

    /// Whether a failed rewrite left the log unwritable.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Current log size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    /// Flush and fsync outstanding writes.
    ///
    /// # Errors
    /// - `Io` if the flush fails, or the log is poisoned
    pub fn sync(&mut self) -> Result<(), QueueError> {
        self.check_usable()?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Write a complete log holding `kinds` to `path`; returns its size.
fn write_replacement(
    path: &Path,
    kinds: impl IntoIterator<Item = LogEntryKind>,
) -> Result<u64, QueueError> {
    let mut tmp = File::create(path)?;
    codec::write_header(&mut tmp)?;
    let mut size = codec::HEADER_LEN;
    let timestamp = Utc::now();
    for kind in kinds {
        let encoded = codec::encode(&LogEntry { timestamp, kind })?;
        tmp.write_all(&encoded)?;
        size += encoded.len() as u64;
    }
    tmp.sync_all()?;
    Ok(size)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::VertexId;
    use tempfile::tempdir;

    fn insert(sequence: u64) -> LogEntryKind {
        LogEntryKind::Insert {
            sequence,
            attribute: Attribute::new("k", format!("v{sequence}"), VertexId(sequence)),
        }
    }

    fn kinds(path: &Path) -> Vec<LogEntryKind> {
        let (_, entries) = QueueLog::open(path, false).unwrap();
        entries.into_iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        {
            let (mut log, entries) = QueueLog::open(&path, false).unwrap();
            assert!(entries.is_empty());
            log.append(insert(1)).unwrap();
            log.append(LogEntryKind::Ack { sequences: vec![1] }).unwrap();
            assert_eq!(log.size_bytes(), fs::metadata(&path).unwrap().len());
        }

        assert_eq!(
            kinds(&path),
            vec![insert(1), LogEntryKind::Ack { sequences: vec![1] }]
        );
    }

    #[test]
    fn test_short_header_is_reinitialized() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        fs::write(&path, b"AT").unwrap();

        let (log, entries) = QueueLog::open(&path, false).unwrap();
        assert!(entries.is_empty());
        assert_eq!(log.size_bytes(), codec::HEADER_LEN);
        assert_eq!(fs::metadata(&path).unwrap().len(), codec::HEADER_LEN);
    }

    #[test]
    fn test_foreign_file_is_corrupted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        fs::write(&path, b"{\"not\": \"a log\"}").unwrap();

        assert!(matches!(
            QueueLog::open(&path, false),
            Err(QueueError::Corrupted(_))
        ));
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let intact = {
            let (mut log, _) = QueueLog::open(&path, true).unwrap();
            log.append(insert(1)).unwrap();
            let intact = log.size_bytes();
            log.append(insert(2)).unwrap();
            intact
        };

        let full = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(full - 4).unwrap();

        {
            let (mut log, entries) = QueueLog::open(&path, true).unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact);
            log.append(insert(3)).unwrap();
        }

        assert_eq!(kinds(&path), vec![insert(1), insert(3)]);
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let (mut log, _) = QueueLog::open(&path, false).unwrap();
        for seq in 1..=10 {
            log.append(insert(seq)).unwrap();
        }
        let before = log.size_bytes();

        log.rewrite(vec![LogEntryKind::Watermark { next_sequence: 11 }, insert(10)])
            .unwrap();
        assert!(log.size_bytes() < before);
        log.append(insert(11)).unwrap();
        drop(log);

        assert_eq!(
            kinds(&path),
            vec![LogEntryKind::Watermark { next_sequence: 11 }, insert(10), insert(11)]
        );
        assert!(!path.with_extension("log.tmp").exists());
    }

    #[test]
    fn test_failure_after_rename_blocks_further_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let (mut log, _) = QueueLog::open(&path, false).unwrap();
        for seq in 1..=3 {
            log.append(insert(seq)).unwrap();
        }

        let err = log
            .rewrite_with(vec![insert(3)], |_| {
                Err(io::Error::new(ErrorKind::PermissionDenied, "directory fsync refused"))
            })
            .unwrap_err();
        assert!(matches!(err, QueueError::Io(_)));
        assert!(log.is_poisoned());

        // Nothing may be accepted that a restart would not find again.
        assert!(matches!(log.append(insert(4)), Err(QueueError::Io(_))));
        assert!(matches!(log.rewrite(vec![insert(3)]), Err(QueueError::Io(_))));
        assert!(log.sync().is_err());
        drop(log);

        assert_eq!(kinds(&path), vec![insert(3)]);
    }
}
