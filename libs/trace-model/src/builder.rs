//! Synthetic trace construction
//!
//! Builds well-formed record vectors for tests and tooling: a standard header
//! prefix followed by caller-chosen body records.

use crate::record::{MarkerKind, TraceRecord, TRACE_VERSION_CURRENT};

/// Default page size stamped into built traces.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;
/// Default cache line size stamped into built traces.
pub const DEFAULT_CACHE_LINE_SIZE: u64 = 64;

/// Builder for a single input's record sequence.
#[derive(Debug)]
pub struct TraceBuilder {
    records: Vec<TraceRecord>,
    tid: i64,
    pc: u64,
}

impl TraceBuilder {
    /// Start a trace with the standard header markers and an initial
    /// timestamp + cpuid pair.
    pub fn new(tid: i64, start_timestamp: u64) -> Self {
        Self::with_version(tid, start_timestamp, TRACE_VERSION_CURRENT)
    }

    /// As [`TraceBuilder::new`] but with an explicit format version, for
    /// exercising legacy-trace paths.
    pub fn with_version(tid: i64, start_timestamp: u64, version: u64) -> Self {
        let records = vec![
            TraceRecord::marker(MarkerKind::Version, version),
            TraceRecord::marker(MarkerKind::Filetype, 0),
            TraceRecord::marker(MarkerKind::CacheLineSize, DEFAULT_CACHE_LINE_SIZE),
            TraceRecord::marker(MarkerKind::PageSize, DEFAULT_PAGE_SIZE),
            TraceRecord::marker(MarkerKind::Timestamp, start_timestamp),
            TraceRecord::marker(MarkerKind::Cpuid, 0),
        ];
        Self { records, tid, pc: 0x1000 }
    }

    /// Append `count` instruction records at sequential pcs.
    pub fn instrs(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.records.push(TraceRecord::instr(self.pc));
            self.pc += 4;
        }
        self
    }

    /// Append a timestamp marker.
    pub fn timestamp(mut self, value: u64) -> Self {
        self.records.push(TraceRecord::marker(MarkerKind::Timestamp, value));
        self
    }

    /// Append an arbitrary marker.
    pub fn marker(mut self, kind: MarkerKind, value: u64) -> Self {
        self.records.push(TraceRecord::marker(kind, value));
        self
    }

    /// Append a syscall entry: syscall marker, optionally flagged
    /// maybe-blocking, bracketed by pre/post timestamps.
    pub fn syscall(mut self, num: u64, maybe_blocking: bool, pre: u64, post: u64) -> Self {
        self.records.push(TraceRecord::marker(MarkerKind::Timestamp, pre));
        self.records.push(TraceRecord::marker(MarkerKind::Syscall, num));
        if maybe_blocking {
            self.records
                .push(TraceRecord::marker(MarkerKind::MaybeBlockingSyscall, 0));
        }
        self.records.push(TraceRecord::marker(MarkerKind::Timestamp, post));
        self
    }

    /// Append an arbitrary record.
    pub fn record(mut self, rec: TraceRecord) -> Self {
        self.records.push(rec);
        self
    }

    /// Finish with a thread-exit record and return the sequence.
    pub fn exit(mut self) -> Vec<TraceRecord> {
        self.records.push(TraceRecord::ThreadExit { tid: self.tid });
        self.records
    }

    /// Return the sequence without a thread exit (truncated-trace cases).
    pub fn build(self) -> Vec<TraceRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_then_body() {
        let recs = TraceBuilder::new(42, 500).instrs(3).exit();
        assert!(recs[0].is_marker(MarkerKind::Version));
        assert_eq!(recs.iter().filter(|r| r.is_instr()).count(), 3);
        assert!(recs.last().unwrap().is_thread_exit());
    }

    #[test]
    fn test_syscall_brackets() {
        let recs = TraceBuilder::new(1, 10).instrs(1).syscall(39, true, 20, 90).exit();
        let kinds: Vec<_> = recs.iter().filter_map(|r| r.as_marker()).collect();
        assert!(kinds.contains(&(MarkerKind::Syscall, 39)));
        assert!(kinds.contains(&(MarkerKind::MaybeBlockingSyscall, 0)));
        assert!(kinds.contains(&(MarkerKind::Timestamp, 90)));
    }
}
