//! Trace record model
//!
//! The tagged record union the scheduler and analysis tools consume, plus the
//! marker vocabulary recorded by the tracer.

use serde::{Deserialize, Serialize};

/// Trace format version emitted by current tracers.
pub const TRACE_VERSION_CURRENT: u64 = 7;

/// First trace version whose syscalls are bracketed by timestamps.
///
/// Older traces carry no per-syscall timing, so schedulers must fall back to
/// treating every maybe-blocking syscall as blocking.
pub const TRACE_VERSION_FREQUENT_TIMESTAMPS: u64 = 6;

/// Marker kinds the scheduler inspects
///
/// Markers carry a 64-bit payload whose meaning depends on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerKind {
    /// Wall-clock microseconds at trace-buffer flush time
    Timestamp,
    /// Trace format version
    Version,
    /// Trace content bitfield
    Filetype,
    /// Cache line size in bytes
    CacheLineSize,
    /// Page size in bytes
    PageSize,
    /// Instruction count per trace chunk
    ChunkInstrCount,
    /// The cpu the following records were traced on
    Cpuid,
    /// A system call is being entered; payload is the syscall number
    Syscall,
    /// The entered syscall may block
    MaybeBlockingSyscall,
    /// Timeout argument of the in-flight syscall, in microseconds
    SyscallArgTimeout,
    /// The in-flight syscall hands control to the thread named in the payload
    DirectThreadSwitch,
    /// The in-flight syscall deschedules this thread
    SyscallUnschedule,
    /// The in-flight syscall wakes the thread named in the payload
    SyscallSchedule,
    /// Start of context-switch kernel code
    ContextSwitchStart,
    /// End of context-switch kernel code
    ContextSwitchEnd,
    /// Start of an injected syscall kernel sequence
    SyscallTraceStart,
    /// End of an injected syscall kernel sequence
    SyscallTraceEnd,
    /// Synthetic: the consuming core is waiting on a replay dependence
    CoreWait,
    /// Synthetic: the consuming core has nothing to run
    CoreIdle,
    /// Separator between regions of interest; payload is the window ordinal
    WindowId,
}

/// One trace record
///
/// Records are read-only to the scheduler; it only ever copies them, queues
/// them, or fabricates synthetic ones (idle markers, window separators, early
/// thread exits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceRecord {
    /// One executed instruction (memory references are folded in upstream).
    Instr { pc: u64, size: u16 },
    /// A metadata marker.
    Marker { kind: MarkerKind, value: u64 },
    /// The traced thread exited.
    ThreadExit { tid: i64 },
    /// Sentinel for "no record"; never handed to a consumer.
    Invalid,
}

impl TraceRecord {
    /// Shorthand for an instruction record.
    pub fn instr(pc: u64) -> Self {
        TraceRecord::Instr { pc, size: 4 }
    }

    /// Shorthand for a marker record.
    pub fn marker(kind: MarkerKind, value: u64) -> Self {
        TraceRecord::Marker { kind, value }
    }

    /// Whether this record is an instruction.
    pub fn is_instr(&self) -> bool {
        matches!(self, TraceRecord::Instr { .. })
    }

    /// Whether this record starts a new instruction.
    ///
    /// With memory references folded into their instruction record upstream,
    /// every instruction record is a boundary.
    pub fn is_instr_boundary(&self) -> bool {
        self.is_instr()
    }

    /// The marker fields, if this record is a marker.
    pub fn as_marker(&self) -> Option<(MarkerKind, u64)> {
        match self {
            TraceRecord::Marker { kind, value } => Some((*kind, *value)),
            _ => None,
        }
    }

    /// Whether this record is a marker of the given kind.
    pub fn is_marker(&self, kind: MarkerKind) -> bool {
        matches!(self, TraceRecord::Marker { kind: k, .. } if *k == kind)
    }

    /// The timestamp payload, if this record is a timestamp marker.
    pub fn timestamp(&self) -> Option<u64> {
        match self {
            TraceRecord::Marker { kind: MarkerKind::Timestamp, value } => Some(*value),
            _ => None,
        }
    }

    /// Whether this record is a thread exit.
    pub fn is_thread_exit(&self) -> bool {
        matches!(self, TraceRecord::ThreadExit { .. })
    }

    /// Whether this record is the invalid sentinel.
    pub fn is_invalid(&self) -> bool {
        matches!(self, TraceRecord::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_predicates() {
        let i = TraceRecord::instr(0x4000);
        assert!(i.is_instr());
        assert!(i.is_instr_boundary());
        assert!(i.as_marker().is_none());

        let m = TraceRecord::marker(MarkerKind::Timestamp, 1234);
        assert!(!m.is_instr());
        assert_eq!(m.as_marker(), Some((MarkerKind::Timestamp, 1234)));
        assert_eq!(m.timestamp(), Some(1234));
        assert!(m.is_marker(MarkerKind::Timestamp));
        assert!(!m.is_marker(MarkerKind::Syscall));

        assert!(TraceRecord::ThreadExit { tid: 7 }.is_thread_exit());
        assert!(TraceRecord::Invalid.is_invalid());
    }
}
