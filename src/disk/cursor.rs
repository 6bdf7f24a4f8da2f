//! Cursor over the lines of a segment file
//!
//! The cursor walks newline-delimited JSON and yields one [`LogRecord`] per
//! well-formed line. Blank lines are skipped silently; malformed lines (for
//! example a torn final line after a failed append) are logged, counted and
//! skipped so one bad line never costs the rest of the segment.

use tracing::warn;

use crate::memory::LogRecord;

/// Stateful reader over an in-memory segment file
#[derive(Debug)]
pub struct Cursor<'a> {
    data: &'a [u8],
    /// Byte offset of the next unread line
    offset: usize,
    /// One-based number of the next unread line
    line: usize,
    skipped: usize,
}

impl<'a> Cursor<'a> {
    /// Start reading `data` from the beginning
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            line: 1,
            skipped: 0,
        }
    }

    /// Malformed lines skipped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn next_line(&mut self) -> Option<(usize, &'a [u8])> {
        if self.offset >= self.data.len() {
            return None;
        }
        let data = self.data;
        let rest = &data[self.offset..];
        let len = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
        let line = (self.line, &rest[..len]);

        self.offset += (len + 1).min(rest.len());
        self.line += 1;
        Some(line)
    }
}

impl Iterator for Cursor<'_> {
    type Item = LogRecord;

    fn next(&mut self) -> Option<LogRecord> {
        while let Some((number, line)) = self.next_line() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice(line) {
                Ok(record) => return Some(record),
                Err(e) => {
                    self.skipped += 1;
                    warn!(line = number, error = %e, "skipping malformed segment line");
                }
            }
        }
        None
    }
}
