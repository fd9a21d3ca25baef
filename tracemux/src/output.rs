//! Per-output state
//!
//! One [`OutputState`] per consumer stream. Most fields are touched only by
//! the owning consumer thread and live in [`OutputLocal`] behind an
//! uncontended mutex; the ready queue has its own lock that stealers and the
//! rebalancer contend on; everything else cross-thread is atomic.
//!
//! Lock order: when two outputs' queue locks are both needed they are
//! acquired in increasing ordinal order; an input lock is only acquired after
//! the queue lock of the output holding that input.

use crate::input::ReadyKey;
use crate::queue::IndexedPriorityQueue;
use crate::schedule_file::ScheduleSegment;
use crate::workload::InputIndex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use trace_model::TraceRecord;

/// Schedule statistics exported per output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StatKind {
    /// Context switches from one input to a different input.
    SwitchInputToInput,
    /// Transitions from running an input to idling.
    SwitchInputToIdle,
    /// Transitions from idle back to running an input.
    SwitchIdleToInput,
    /// Switch considered but the same input was kept.
    SwitchNop,
    /// Preemptions at quantum expiry.
    QuantumPreempts,
    /// Direct-switch markers observed.
    DirectSwitchAttempts,
    /// Direct switches that reached their target.
    DirectSwitchSuccesses,
    /// Inputs moved between outputs.
    Migrations,
    /// Inputs stolen from a sibling's ready queue on idle.
    RunqueueSteals,
    /// Rebalance passes triggered by this output.
    RunqueueRebalances,
    /// Candidates skipped because their workload was at its output limit.
    HitOutputLimit,
}

const STAT_COUNT: usize = StatKind::HitOutputLimit as usize + 1;

/// Lock-free per-output counters; single-writer per stat in the common case
/// but stealing and rebalancing may bump a sibling's counters.
#[derive(Debug, Default)]
pub(crate) struct OutputStats {
    counts: [AtomicU64; STAT_COUNT],
}

impl OutputStats {
    pub fn bump(&self, kind: StatKind) {
        self.counts[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, kind: StatKind) -> u64 {
        self.counts[kind as usize].load(Ordering::Relaxed)
    }
}

/// An output's ready queue plus its bookkeeping, all under one lock.
#[derive(Debug)]
pub(crate) struct ReadyQueue {
    /// Inputs ready to run here, best-first.
    pub queue: IndexedPriorityQueue<InputIndex, ReadyKey>,
    /// FIFO counter handed to entries as they are enqueued.
    pub fifo_counter: u64,
    /// Count of enqueued inputs still inside a blocked window.
    pub num_blocked: usize,
}

impl ReadyQueue {
    fn new(seed: u64) -> Self {
        Self {
            queue: IndexedPriorityQueue::with_seed(seed),
            fifo_counter: 0,
            num_blocked: 0,
        }
    }
}

/// Speculation layer: where to resume real records afterward.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpeculationFrame {
    pub resume_pc: u64,
}

/// Bookkeeping for the most recent emission, for `unread_last_record`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LastEmission {
    pub input: InputIndex,
    pub record: TraceRecord,
    pub synthetic: bool,
}

/// State owned by the consumer thread driving this output.
pub(crate) struct OutputLocal {
    /// Input currently being read, if any.
    pub cur_input: Option<InputIndex>,
    /// Prior non-invalid input.
    pub prev_input: Option<InputIndex>,

    /// Static assignment list for consistent-mapping fixed mode.
    pub input_indices: Vec<InputIndex>,
    pub input_indices_index: usize,

    /// Waiting or idling (no current input).
    pub waiting: bool,
    /// One steal attempt per transition to idle.
    pub tried_to_steal_on_idle: bool,

    /// Inside an injected syscall kernel sequence.
    pub in_syscall_code: bool,
    pub hit_syscall_code_end: bool,
    /// Inside context-switch kernel code.
    pub in_context_switch_code: bool,
    pub hit_switch_code_end: bool,

    /// Most recent record emitted on this output.
    pub last_record: TraceRecord,
    /// The last emission, until consumed by `unread_last_record`.
    pub last_emission: Option<LastEmission>,

    /// Replay: at the end of this output's recorded sequence.
    pub at_eof: bool,
    /// Idle count when the current recorded idle period started (-1 = none).
    pub idle_start_count: i64,

    /// Speculation nesting; non-empty while speculating.
    pub speculation_stack: Vec<SpeculationFrame>,
    /// Next fabricated pc while speculating.
    pub speculate_pc: u64,

    // Stream-facade cursor state.
    pub cur_ref_count: u64,
    pub cur_instr_count: u64,
    pub last_timestamp: u64,
    pub first_timestamp: u64,
    pub version: u64,
    pub filetype: u64,
    pub cache_line_size: u64,
    pub chunk_instr_count: u64,
    pub page_size: u64,
    /// Inside a kernel-injected sequence from the consumer's viewpoint.
    pub in_kernel_trace: bool,
}

impl OutputLocal {
    fn new() -> Self {
        Self {
            cur_input: None,
            prev_input: None,
            input_indices: Vec::new(),
            input_indices_index: 0,
            waiting: false,
            tried_to_steal_on_idle: false,
            in_syscall_code: false,
            hit_syscall_code_end: false,
            in_context_switch_code: false,
            hit_switch_code_end: false,
            last_record: TraceRecord::Invalid,
            last_emission: None,
            at_eof: false,
            idle_start_count: -1,
            speculation_stack: Vec::new(),
            speculate_pc: 0,
            cur_ref_count: 0,
            cur_instr_count: 0,
            last_timestamp: 0,
            first_timestamp: 0,
            version: 0,
            filetype: 0,
            cache_line_size: 0,
            chunk_instr_count: 0,
            page_size: 0,
            in_kernel_trace: false,
        }
    }
}

/// One consumer stream's scheduler-side state.
pub(crate) struct OutputState {
    /// Owner-thread state; the mutex is uncontended and exists so the
    /// scheduler can be driven through `&self` from each consumer thread.
    pub local: Mutex<OutputLocal>,

    /// Inputs ready to run here. Contended by stealers and the rebalancer.
    pub ready_queue: Mutex<ReadyQueue>,

    /// Consumer may deactivate this output; its queue then migrates.
    pub active: AtomicBool,
    /// Simulation time supplied by the consumer (or surrogate).
    pub cur_time: AtomicU64,
    /// First nonzero simulation time seen.
    pub initial_cur_time: AtomicU64,
    /// Monotonic count of idle records emitted.
    pub idle_count: AtomicU64,
    /// Replay: index of the current schedule segment (-1 = before first).
    pub record_index: AtomicI64,
    /// As-traced cpu id backing this output, if replaying as traced.
    pub as_traced_cpuid: AtomicI64,

    /// Recorded or replayed schedule segments. Written during recording by
    /// the owner and at init during replay; replay reads may cross outputs.
    pub record: RwLock<Vec<ScheduleSegment>>,

    /// Exported statistics.
    pub stats: OutputStats,
}

impl OutputState {
    pub fn new(rand_seed: u64) -> Self {
        Self {
            local: Mutex::new(OutputLocal::new()),
            ready_queue: Mutex::new(ReadyQueue::new(rand_seed)),
            active: AtomicBool::new(true),
            cur_time: AtomicU64::new(0),
            initial_cur_time: AtomicU64::new(0),
            idle_count: AtomicU64::new(0),
            record_index: AtomicI64::new(-1),
            as_traced_cpuid: AtomicI64::new(-1),
            record: RwLock::new(Vec::new()),
            stats: OutputStats::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_bump() {
        let stats = OutputStats::default();
        stats.bump(StatKind::Migrations);
        stats.bump(StatKind::Migrations);
        stats.bump(StatKind::QuantumPreempts);
        assert_eq!(stats.get(StatKind::Migrations), 2);
        assert_eq!(stats.get(StatKind::QuantumPreempts), 1);
        assert_eq!(stats.get(StatKind::RunqueueSteals), 0);
    }
}
