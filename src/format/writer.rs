//! Append-only, buffered trace writer (§4.2). Never reorders entries or
//! reorders payload bytes; `flush` and `close` are distinct operations and
//! `close` implies `flush`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::entry::TraceEntry;

const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

pub struct TraceWriter {
    inner: BufWriter<File>,
    closed: bool,
}

impl TraceWriter {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Self::create_with_capacity(path, DEFAULT_BUFFER_SIZE)
    }

    pub fn create_with_capacity(path: impl AsRef<Path>, capacity: usize) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            inner: BufWriter::with_capacity(capacity, file),
            closed: false,
        })
    }

    /// Writes a pre-encoded blob verbatim, ahead of any entries. Used for
    /// the prefix file's image-table header (§4.2), which isn't itself a
    /// `TraceEntry`.
    pub fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(bytes)
    }

    pub fn write_entry(&mut self, entry: &TraceEntry) -> std::io::Result<()> {
        let mut buf = Vec::new();
        entry.encode(&mut buf);
        self.inner.write_all(&buf)
    }

    pub fn write_entries<'a>(
        &mut self,
        entries: impl IntoIterator<Item = &'a TraceEntry>,
    ) -> std::io::Result<()> {
        for entry in entries {
            self.write_entry(entry)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }

    pub fn close(mut self) -> std::io::Result<()> {
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.inner.flush();
        }
    }
}
