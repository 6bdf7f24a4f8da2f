//! Local segment files
//!
//! Each minute bucket is staged on disk as `<segment key>.txt` in the data
//! directory, one JSON object per line. Files are only ever appended to or
//! deleted; they are never rewritten in place. Coordination between the
//! flush cycle (appends) and the upload cycle (read + delete) happens in the
//! segment-state table, not here.
//!
//! Next to a file the upload cycle keeps an upload mark, `<segment key>.uploaded`,
//! recording how much of the file has reached the remote store. Because files
//! are append-only, a prefix identified by its length and CRC32 stays valid
//! across later appends and restarts.

pub mod cursor;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::memory::LogRecord;
use crate::segment::SegmentKey;

const MARK_EXTENSION: &str = "uploaded";

/// A segment file found in the data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSegment {
    /// Segment the file belongs to
    pub key: SegmentKey,
    /// Last modification time reported by the filesystem
    pub modified: SystemTime,
}

/// Leading bytes of a segment file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePrefix {
    /// Length in bytes
    pub len: u64,
    /// CRC32 of those bytes
    pub crc: u32,
}

impl FilePrefix {
    /// The whole of `data`
    pub fn of(data: &[u8]) -> Self {
        Self {
            len: data.len() as u64,
            crc: crc32fast::hash(data),
        }
    }

    /// Length of the prefix if `data` still starts with it
    pub fn within(&self, data: &[u8]) -> Option<usize> {
        let len = usize::try_from(self.len).ok()?;
        let prefix = data.get(..len)?;
        (crc32fast::hash(prefix) == self.crc).then_some(len)
    }
}

/// Upload progress of one segment file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMark {
    /// Prefix confirmed in the remote object
    #[serde(default)]
    pub shipped: Option<FilePrefix>,
    /// Prefix of a put that was in flight; it may or may not have landed
    #[serde(default)]
    pub pending: Option<FilePrefix>,
}

impl UploadMark {
    /// Bytes of `data` confirmed remote, zero if the mark no longer matches
    pub fn shipped_len(&self, data: &[u8]) -> usize {
        self.shipped
            .and_then(|prefix| prefix.within(data))
            .unwrap_or(0)
    }
}

/// Directory of append-only segment files
#[derive(Debug)]
pub struct LocalSegments {
    dir: PathBuf,
}

impl LocalSegments {
    /// Open (creating if needed) the data directory
    pub fn open<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Data directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for `key`
    pub fn path(&self, key: SegmentKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    fn mark_path(&self, key: SegmentKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key, MARK_EXTENSION))
    }

    /// Append `records` to the file for `key`, creating it if absent
    ///
    /// The batch is encoded up front and written with a single call, then
    /// synced, so a failed append leaves at most one torn trailing line.
    /// Creating the file drops any upload mark left from an earlier file.
    pub fn append(&self, key: SegmentKey, records: &[LogRecord]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(records.len() * 64);
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let path = self.path(key);
        if !path.exists() {
            remove_if_present(&self.mark_path(key))?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&buf)?;
        file.sync_data()
    }

    /// Full contents of the file for `key`
    pub fn read(&self, key: SegmentKey) -> io::Result<Vec<u8>> {
        fs::read(self.path(key))
    }

    /// Upload mark of the file for `key`, if one was written
    pub fn read_mark(&self, key: SegmentKey) -> io::Result<Option<UploadMark>> {
        match fs::read(self.mark_path(key)) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace the upload mark of the file for `key`
    ///
    /// Written to a temporary file and renamed over the old mark, so a crash
    /// leaves either the old or the new mark.
    pub fn write_mark(&self, key: SegmentKey, mark: &UploadMark) -> io::Result<()> {
        let path = self.mark_path(key);
        let tmp = path.with_extension(format!("{}.tmp", MARK_EXTENSION));
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(mark)?)?;
        file.sync_data()?;
        fs::rename(tmp, path)
    }

    /// Remove the file for `key` and its upload mark
    ///
    /// Missing files are not an error.
    pub fn delete(&self, key: SegmentKey) -> io::Result<()> {
        remove_if_present(&self.path(key))?;
        remove_if_present(&self.mark_path(key))
    }

    /// Whether a file exists for `key`
    pub fn exists(&self, key: SegmentKey) -> bool {
        self.path(key).is_file()
    }

    /// Every segment file in the directory, oldest key first
    ///
    /// Files whose names are not segment keys are ignored. A file that
    /// disappears between listing and inspection is skipped.
    pub fn list(&self) -> io::Result<Vec<LocalSegment>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(SegmentKey::from_file_name) else {
                continue;
            };

            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            segments.push(LocalSegment {
                key,
                modified: metadata.modified()?,
            });
        }
        segments.sort_by_key(|segment| segment.key);
        Ok(segments)
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
