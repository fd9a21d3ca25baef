//! Per-output stream facade
//!
//! The thin handle an analysis tool drives: record-by-record advancement,
//! unread, speculation, activation, and read-only views of the last-seen
//! header and marker state.

use crate::core::{lock, SchedulerImpl};
use crate::error::Result;
use crate::options::{MappingStrategy, SchedulerFlags};
use crate::output::StatKind;
use crate::workload::OutputIndex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use trace_model::{MarkerKind, TraceRecord};

/// One `next_record` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// A record was produced.
    Record(TraceRecord),
    /// Nothing to run right now; poll again (or back off).
    Idle,
    /// Blocked on a replay dependence another output must satisfy first.
    Wait,
    /// This output will never produce another record.
    Eof,
}

/// A consumer's handle to one output stream.
///
/// `Send` but intended for exactly one driving thread per output.
pub struct Stream {
    scheduler: Arc<SchedulerImpl>,
    ordinal: OutputIndex,
}

impl Stream {
    pub(crate) fn new(scheduler: Arc<SchedulerImpl>, ordinal: OutputIndex) -> Self {
        Self { scheduler, ordinal }
    }

    /// This output's ordinal.
    pub fn ordinal(&self) -> OutputIndex {
        self.ordinal
    }

    /// Advance to the next record.
    ///
    /// `cur_time` is the consumer's simulation clock; pass 0 to let the
    /// scheduler substitute a record-count surrogate.
    pub fn next_record(&mut self, cur_time: u64) -> Result<Poll> {
        self.scheduler.next_record(self.ordinal, cur_time)
    }

    /// Undo the last read. Valid once per emission; not during speculation.
    /// `last_timestamp()` is deliberately not rewound.
    pub fn unread_last_record(&mut self) -> Result<()> {
        self.scheduler.unread_last_record(self.ordinal)
    }

    /// Divert this stream to fabricated records starting at `start_address`.
    /// With `queue_current_record`, the last real record is re-delivered
    /// after speculation stops.
    pub fn start_speculation(&mut self, start_address: u64, queue_current_record: bool) -> Result<()> {
        self.scheduler
            .start_speculation(self.ordinal, start_address, queue_current_record)
    }

    /// Return from the innermost speculation layer.
    pub fn stop_speculation(&mut self) -> Result<()> {
        self.scheduler.stop_speculation(self.ordinal)
    }

    /// Activate or deactivate this output (dynamic scheduling only); a
    /// deactivated output's queue migrates to its active peers.
    pub fn set_active(&mut self, active: bool) -> Result<()> {
        self.scheduler.set_output_active(self.ordinal, active)
    }

    fn with_local<T>(&self, f: impl FnOnce(&crate::output::OutputLocal) -> T) -> T {
        let local = lock(&self.scheduler.core.outputs[self.ordinal].local);
        f(&local)
    }

    fn use_input_ordinals(&self) -> bool {
        self.scheduler
            .core
            .options
            .flags
            .contains(SchedulerFlags::USE_INPUT_ORDINALS)
    }

    fn with_cur_input<T>(&self, f: impl FnOnce(&crate::input::InputState) -> T) -> Option<T> {
        let cur = self.with_local(|l| l.cur_input)?;
        let inp = lock(&self.scheduler.core.inputs[cur]);
        Some(f(&inp))
    }

    /// Records emitted so far (input-relative under `USE_INPUT_ORDINALS`).
    pub fn record_ordinal(&self) -> u64 {
        if self.use_input_ordinals() {
            return self.with_cur_input(|i| i.record_ordinal()).unwrap_or(0);
        }
        self.with_local(|l| l.cur_ref_count)
    }

    /// Instructions emitted so far (input-relative under
    /// `USE_INPUT_ORDINALS`).
    pub fn instruction_ordinal(&self) -> u64 {
        if self.use_input_ordinals() {
            return self.with_cur_input(|i| i.instr_ordinal()).unwrap_or(0);
        }
        self.with_local(|l| l.cur_instr_count)
    }

    /// Most recent timestamp marker seen on this output.
    pub fn last_timestamp(&self) -> u64 {
        if self.use_input_ordinals() {
            return self
                .with_cur_input(|i| i.reader.last_timestamp())
                .unwrap_or(0);
        }
        self.with_local(|l| l.last_timestamp)
    }

    /// First timestamp marker seen on this output.
    pub fn first_timestamp(&self) -> u64 {
        if self.use_input_ordinals() {
            return self.with_cur_input(|i| i.first_timestamp).unwrap_or(0);
        }
        self.with_local(|l| l.first_timestamp)
    }

    /// Trace format version of the stream being consumed.
    pub fn version(&self) -> u64 {
        self.with_local(|l| l.version)
    }

    /// Trace content bitfield.
    pub fn filetype(&self) -> u64 {
        self.with_local(|l| l.filetype)
    }

    pub fn cache_line_size(&self) -> u64 {
        self.with_local(|l| l.cache_line_size)
    }

    pub fn chunk_instr_count(&self) -> u64 {
        self.with_local(|l| l.chunk_instr_count)
    }

    pub fn page_size(&self) -> u64 {
        self.with_local(|l| l.page_size)
    }

    /// The simulated cpu this output represents: the as-traced cpuid when
    /// replaying as traced, else the output ordinal.
    pub fn output_cpuid(&self) -> i64 {
        let traced = self.scheduler.core.outputs[self.ordinal]
            .as_traced_cpuid
            .load(Ordering::Acquire);
        if traced >= 0 {
            traced
        } else {
            self.ordinal as i64
        }
    }

    /// Recorded thread id of the current input.
    pub fn tid(&self) -> Option<i64> {
        self.with_cur_input(|i| i.tid)
    }

    /// Ordinal of the current input.
    pub fn input_ordinal(&self) -> Option<usize> {
        self.with_local(|l| l.cur_input)
    }

    /// Workload ordinal of the current input.
    pub fn workload_ordinal(&self) -> Option<usize> {
        self.with_cur_input(|i| i.workload)
    }

    /// The tool-visible shard: the output under core-sharded scheduling,
    /// else the input.
    pub fn shard_index(&self) -> Option<usize> {
        match self.scheduler.core.options.mapping {
            MappingStrategy::AnyOutput
            | MappingStrategy::AsPreviously
            | MappingStrategy::RecordedOutput => Some(self.ordinal),
            MappingStrategy::ConsistentOutput => self.input_ordinal(),
        }
    }

    /// Whether the last record was scheduler-fabricated rather than traced.
    pub fn is_record_synthetic(&self) -> bool {
        self.with_local(|l| {
            if !l.speculation_stack.is_empty() {
                return true;
            }
            match l.last_emission {
                Some(em) => em.synthetic,
                None => matches!(
                    l.last_record,
                    TraceRecord::Marker { kind: MarkerKind::CoreIdle, .. }
                        | TraceRecord::Marker { kind: MarkerKind::CoreWait, .. }
                ),
            }
        })
    }

    /// Whether the stream is inside kernel-injected code.
    pub fn is_record_kernel(&self) -> bool {
        self.with_local(|l| l.in_kernel_trace)
    }

    /// Diagnostic name of the current input's stream.
    pub fn stream_name(&self) -> Option<String> {
        self.with_cur_input(|i| i.reader.stream_name().to_string())
    }

    /// One exported scheduling statistic for this output.
    pub fn schedule_statistic(&self, kind: StatKind) -> u64 {
        self.scheduler.core.outputs[self.ordinal].stats.get(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InputSpec, Scheduler, SchedulerOptions, WorkloadSpec};
    use trace_model::{TraceBuilder, TRACE_VERSION_CURRENT};

    fn one_input_scheduler(instrs: usize) -> Scheduler {
        let records = TraceBuilder::new(7, 10).instrs(instrs).exit();
        let reader = trace_model::VecReader::new("t7", records);
        Scheduler::new(
            vec![WorkloadSpec::new(vec![InputSpec::new(Box::new(reader), 7)])],
            1,
            SchedulerOptions::default(),
        )
        .unwrap()
    }

    fn next(stream: &mut Stream) -> TraceRecord {
        match stream.next_record(0).unwrap() {
            Poll::Record(rec) => rec,
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn test_header_values_latch() {
        let sched = one_input_scheduler(3);
        let mut stream = sched.stream(0).unwrap();
        // Consume through the header prefix.
        for _ in 0..6 {
            next(&mut stream);
        }
        assert_eq!(stream.version(), TRACE_VERSION_CURRENT);
        assert_eq!(stream.cache_line_size(), 64);
        assert_eq!(stream.page_size(), 4096);
        assert_eq!(stream.first_timestamp(), 10);
        assert_eq!(stream.last_timestamp(), 10);
        assert_eq!(stream.tid(), Some(7));
        assert_eq!(stream.workload_ordinal(), Some(0));
        // Core-sharded: the shard is the output.
        assert_eq!(stream.shard_index(), Some(0));
        assert_eq!(stream.output_cpuid(), 0);
    }

    #[test]
    fn test_unread_restores_ordinals() {
        let sched = one_input_scheduler(3);
        let mut stream = sched.stream(0).unwrap();
        let mut rec = next(&mut stream);
        while !rec.is_instr() {
            rec = next(&mut stream);
        }
        assert_eq!(stream.instruction_ordinal(), 1);
        let record_ord = stream.record_ordinal();

        stream.unread_last_record().unwrap();
        assert_eq!(stream.instruction_ordinal(), 0);
        assert_eq!(stream.record_ordinal(), record_ord - 1);
        // Unread is single-shot.
        assert!(stream.unread_last_record().is_err());

        // The same record comes back.
        let again = next(&mut stream);
        assert_eq!(again, rec);
        assert_eq!(stream.instruction_ordinal(), 1);
        assert_eq!(stream.record_ordinal(), record_ord);
    }

    #[test]
    fn test_unread_does_not_rewind_timestamp() {
        let sched = one_input_scheduler(2);
        let mut stream = sched.stream(0).unwrap();
        let mut rec = next(&mut stream);
        while rec.timestamp().is_none() {
            rec = next(&mut stream);
        }
        assert_eq!(stream.last_timestamp(), 10);
        stream.unread_last_record().unwrap();
        // Documented: the timestamp view stays where it was.
        assert_eq!(stream.last_timestamp(), 10);
    }

    #[test]
    fn test_speculation_fabricates_records() {
        let sched = one_input_scheduler(5);
        let mut stream = sched.stream(0).unwrap();
        let mut rec = next(&mut stream);
        while !rec.is_instr() {
            rec = next(&mut stream);
        }
        stream.start_speculation(0x9000, false).unwrap();
        assert_eq!(next(&mut stream), TraceRecord::Instr { pc: 0x9000, size: 4 });
        assert_eq!(next(&mut stream), TraceRecord::Instr { pc: 0x9004, size: 4 });
        assert!(stream.is_record_synthetic());
        assert!(stream.unread_last_record().is_err());

        // Nested layer, then unwind both.
        stream.start_speculation(0xa000, false).unwrap();
        assert_eq!(next(&mut stream), TraceRecord::Instr { pc: 0xa000, size: 4 });
        stream.stop_speculation().unwrap();
        assert_eq!(next(&mut stream), TraceRecord::Instr { pc: 0x9008, size: 4 });
        stream.stop_speculation().unwrap();

        // Back on the real stream.
        let real = next(&mut stream);
        assert!(real.is_instr());
        assert!(!stream.is_record_synthetic());
        // Stopping without a layer is an error.
        assert!(stream.stop_speculation().is_err());
    }

    #[test]
    fn test_speculation_requeues_current_record() {
        let sched = one_input_scheduler(5);
        let mut stream = sched.stream(0).unwrap();
        let mut rec = next(&mut stream);
        while !rec.is_instr() {
            rec = next(&mut stream);
        }
        stream.start_speculation(0x9000, true).unwrap();
        let _ = next(&mut stream);
        stream.stop_speculation().unwrap();
        // The speculated-over record is re-delivered.
        assert_eq!(next(&mut stream), rec);
    }

    #[test]
    fn test_input_ordinals_flag() {
        let records = TraceBuilder::new(7, 10).instrs(3).exit();
        let reader = trace_model::VecReader::new("t7", records);
        let options = SchedulerOptions {
            flags: SchedulerFlags::USE_INPUT_ORDINALS,
            ..Default::default()
        };
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![InputSpec::new(Box::new(reader), 7)])],
            1,
            options,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let mut instrs = 0;
        while let Poll::Record(rec) = stream.next_record(0).unwrap() {
            if rec.is_instr() {
                instrs += 1;
                // Input-relative and output-relative counts agree with one
                // input, but now come from the input's reader.
                assert_eq!(stream.instruction_ordinal(), instrs);
            }
        }
        assert_eq!(instrs, 3);
    }
}
