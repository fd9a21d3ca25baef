//! Reader seam
//!
//! The scheduler drives each input through the [`TraceReader`] trait: a lazy,
//! forward-only record cursor with a random-access instruction skip. The
//! decoder behind it (file formats, compression, chunking) lives upstream.

use crate::record::{MarkerKind, TraceRecord};
use thiserror::Error;

/// Reader fault surfaced unchanged through the scheduler.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// Underlying I/O failure
    #[error("trace read failed: {0}")]
    Io(#[from] std::io::Error),

    /// Decoder rejected the byte stream
    #[error("corrupt trace in {stream}: {detail}")]
    Corrupt { stream: String, detail: String },

    /// A skip target before the current position or past the end
    #[error("skip target out of range in {0}")]
    SkipOutOfRange(String),
}

/// Result type for reader operations.
pub type ReaderResult<T> = std::result::Result<T, ReaderError>;

/// A lazy sequence of trace records for one input.
///
/// Implementations must keep `instruction_ordinal`, `last_timestamp`, and
/// `version` current as records are consumed, including across
/// `skip_instructions`.
pub trait TraceReader: Send {
    /// Advance and return the next record, or `None` at end of trace.
    fn next_record(&mut self) -> ReaderResult<Option<TraceRecord>>;

    /// Count of instruction records consumed so far.
    fn instruction_ordinal(&self) -> u64;

    /// Count of all records consumed so far.
    fn record_ordinal(&self) -> u64;

    /// Most recent timestamp marker value seen (0 before any).
    fn last_timestamp(&self) -> u64;

    /// Trace format version (0 until the version marker is consumed).
    fn version(&self) -> u64;

    /// Whether the trace is exhausted.
    fn at_eof(&self) -> bool;

    /// Skip forward so that `count` further instruction records are dropped.
    ///
    /// Markers inside the skipped range still update reader state (so
    /// `last_timestamp` reflects the skip target), but are not returned.
    fn skip_instructions(&mut self, count: u64) -> ReaderResult<()>;

    /// Diagnostic name of the underlying stream.
    fn stream_name(&self) -> &str;
}

/// In-memory reader over a prebuilt record vector.
///
/// The test and tool workhorse; also the shape online ingestion adapts to.
#[derive(Debug)]
pub struct VecReader {
    records: Vec<TraceRecord>,
    pos: usize,
    instr_ordinal: u64,
    last_timestamp: u64,
    version: u64,
    name: String,
}

impl VecReader {
    /// Wrap a record vector.
    pub fn new(name: impl Into<String>, records: Vec<TraceRecord>) -> Self {
        Self {
            records,
            pos: 0,
            instr_ordinal: 0,
            last_timestamp: 0,
            version: 0,
            name: name.into(),
        }
    }

    fn consume(&mut self, rec: &TraceRecord) {
        match rec {
            TraceRecord::Instr { .. } => self.instr_ordinal += 1,
            TraceRecord::Marker { kind: MarkerKind::Timestamp, value } => {
                self.last_timestamp = *value;
            }
            TraceRecord::Marker { kind: MarkerKind::Version, value } => {
                self.version = *value;
            }
            _ => {}
        }
    }
}

impl TraceReader for VecReader {
    fn next_record(&mut self) -> ReaderResult<Option<TraceRecord>> {
        if self.pos >= self.records.len() {
            return Ok(None);
        }
        let rec = self.records[self.pos];
        self.pos += 1;
        self.consume(&rec);
        Ok(Some(rec))
    }

    fn instruction_ordinal(&self) -> u64 {
        self.instr_ordinal
    }

    fn record_ordinal(&self) -> u64 {
        self.pos as u64
    }

    fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn at_eof(&self) -> bool {
        self.pos >= self.records.len()
    }

    fn skip_instructions(&mut self, count: u64) -> ReaderResult<()> {
        let mut remaining = count;
        while remaining > 0 {
            if self.pos >= self.records.len() {
                return Err(ReaderError::SkipOutOfRange(self.name.clone()));
            }
            let rec = self.records[self.pos];
            self.pos += 1;
            self.consume(&rec);
            if rec.is_instr() {
                remaining -= 1;
            }
        }
        Ok(())
    }

    fn stream_name(&self) -> &str {
        &self.name
    }
}
