//! Log Reader
//!
//! Sequential iteration over flushed records, crossing chunk boundaries and
//! skipping the holes scavenging leaves behind.

use crate::error::Result;

use super::manager::ChunkedLog;
use super::record::LogRecord;

/// Iterator over records in `[position, limit)`
pub struct LogReader<'a> {
    log: &'a ChunkedLog,
    position: i64,
    limit: i64,
}

impl<'a> LogReader<'a> {
    pub(super) fn new(log: &'a ChunkedLog, from: i64, limit: i64) -> Self {
        Self {
            log,
            position: from,
            limit,
        }
    }

    /// Position the next record will be read from
    pub fn position(&self) -> i64 {
        self.position
    }
}

impl<'a> Iterator for LogReader<'a> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.limit {
            return None;
        }
        match self.log.read_next(self.position) {
            Ok(Some((record, next))) => {
                if record.log_position() >= self.limit {
                    self.position = self.limit;
                    return None;
                }
                self.position = next;
                Some(Ok(record))
            }
            Ok(None) => {
                self.position = self.limit;
                None
            }
            Err(e) => {
                self.position = self.limit;
                Some(Err(e))
            }
        }
    }
}
