//! Lazy, zero-copy trace entry iteration (§4.2). The reader never copies
//! the backing buffer; it only ever borrows slices out of it.

use super::entry::TraceEntry;
use crate::error::TraceFormatError;

/// A one-shot iterator of [`TraceEntry`] values over a byte buffer. Does
/// not outlive `buf`. Random access is unsupported except by constructing
/// a fresh reader over the same buffer (cursor reset).
pub struct TraceReader<'a> {
    cursor: &'a [u8],
    failed: bool,
}

impl<'a> TraceReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            cursor: buf,
            failed: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.cursor.len()
    }
}

impl<'a> Iterator for TraceReader<'a> {
    type Item = Result<TraceEntry, TraceFormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor.is_empty() {
            return None;
        }
        match TraceEntry::decode(self.cursor) {
            Ok((entry, rest)) => {
                self.cursor = rest;
                Some(Ok(entry))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
