//! Fixed schedules
//!
//! Static policies for analyzer modes: round-robin assignment of inputs to
//! outputs with no rescheduling (`ConsistentOutput`), and single-stream
//! interleaving of all inputs by timestamp (`RecordedOutput` without an
//! as-traced stream).

use crate::core::{lock, EofOrIdle, Pick, SchedulerImpl, SchedulingMode, SwitchDecision};
use crate::error::{Result, SchedulerError};
use crate::input::InputState;
use crate::options::{DependencyMode, MappingStrategy};
use crate::output::OutputLocal;
use crate::workload::{InputIndex, OutputIndex};
use std::sync::atomic::Ordering;
use trace_model::{MarkerKind, TraceRecord};
use tracing::{debug, trace};

pub(crate) struct FixedMode;

impl FixedMode {
    pub fn new() -> Self {
        Self
    }
}

impl SchedulingMode for FixedMode {
    fn set_initial_schedule(&self, sched: &SchedulerImpl) -> Result<()> {
        let core = &sched.core;
        match core.options.mapping {
            MappingStrategy::ConsistentOutput => {
                // Pre-allocate inputs round-robin so the parallel mode needs
                // no locks to find its next input.
                for i in 0..core.inputs.len() {
                    let output = i % core.outputs.len();
                    let mut local = lock(&core.outputs[output].local);
                    if local.input_indices.is_empty() {
                        sched.set_cur_input(output, &mut local, Some(i))?;
                    }
                    local.input_indices.push(i);
                    debug!(input = i, output, "static assignment");
                }
                Ok(())
            }
            MappingStrategy::RecordedOutput => {
                if core.outputs.len() > 1 {
                    return Err(SchedulerError::param(
                        "timestamp interleaving supports a single output",
                    ));
                }
                let mut local = lock(&core.outputs[0].local);
                if core.inputs.len() == 1 {
                    return sched.set_cur_input(0, &mut local, Some(0));
                }
                // Header records were queued at init, so we can start
                // directly with the oldest timestamp's input.
                let mut min_time = u64::MAX;
                let mut min_input = None;
                for i in 0..core.inputs.len() {
                    let ts = lock(&core.inputs[i]).next_timestamp;
                    if ts < min_time {
                        min_time = ts;
                        min_input = Some(i);
                    }
                }
                let Some(first) = min_input else {
                    return Err(SchedulerError::param("no inputs to interleave"));
                };
                sched.set_cur_input(0, &mut local, Some(first))
            }
            _ => Err(SchedulerError::param(
                "unsupported mapping for a fixed schedule",
            )),
        }
    }

    fn swap_out_input(
        &self,
        _sched: &SchedulerImpl,
        _output: OutputIndex,
        _input: InputIndex,
    ) -> Result<()> {
        Ok(())
    }

    fn swap_in_input(
        &self,
        _sched: &SchedulerImpl,
        _output: OutputIndex,
        _input: InputIndex,
    ) -> Result<()> {
        Ok(())
    }

    fn pick_next_input_for_mode(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        local: &mut OutputLocal,
        _blocked_time: u64,
        prev_index: Option<InputIndex>,
    ) -> Result<Pick> {
        let core = &sched.core;
        if core.options.deps == DependencyMode::Timestamps {
            // Interleave: always advance to the globally oldest timestamp.
            let mut min_time = u64::MAX;
            let mut index = None;
            for i in 0..core.inputs.len() {
                let inp = lock(&core.inputs[i]);
                if !inp.at_eof && inp.next_timestamp > 0 && inp.next_timestamp < min_time {
                    min_time = inp.next_timestamp;
                    index = Some(i);
                }
            }
            match index {
                Some(i) => {
                    trace!(output, input = i, timestamp = min_time, "advancing to oldest");
                    Ok(Pick::Input(i))
                }
                None => match self.eof_or_idle_for_mode(sched, output, local, prev_index)? {
                    EofOrIdle::Eof => Ok(Pick::Eof),
                    _ => Ok(Pick::Idle),
                },
            }
        } else if core.options.mapping == MappingStrategy::ConsistentOutput {
            // The prior input is done; take the next pre-allocated one.
            // The same output is never driven by two threads at once here.
            local.input_indices_index += 1;
            if local.input_indices_index >= local.input_indices.len() {
                trace!(output, "all static inputs at eof");
                return Ok(Pick::Eof);
            }
            let index = local.input_indices[local.input_indices_index];
            trace!(output, input = index, "advancing to next static input");
            Ok(Pick::Input(index))
        } else {
            Err(SchedulerError::Invalid(
                "fixed schedule has no input-picking policy for this mapping".into(),
            ))
        }
    }

    fn check_for_input_switch(
        &self,
        sched: &SchedulerImpl,
        _output: OutputIndex,
        _local: &mut OutputLocal,
        record: &TraceRecord,
        input: &mut InputState,
        _cur_time: u64,
    ) -> Result<SwitchDecision> {
        let mut decision = SwitchDecision::default();
        if sched.core.options.deps == DependencyMode::Timestamps {
            if let Some((MarkerKind::Timestamp, value)) = record.as_marker() {
                input.next_timestamp = value;
                decision.need_new_input = true;
            }
        }
        Ok(decision)
    }

    fn eof_or_idle_for_mode(
        &self,
        sched: &SchedulerImpl,
        _output: OutputIndex,
        _local: &mut OutputLocal,
        _prev_input: Option<InputIndex>,
    ) -> Result<EofOrIdle> {
        if sched.core.options.mapping == MappingStrategy::ConsistentOutput
            || sched.core.live_input_count.load(Ordering::Acquire) == 0
        {
            return Ok(EofOrIdle::Eof);
        }
        Ok(EofOrIdle::Idle)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        DependencyMode, InputSpec, MappingStrategy, Poll, Scheduler, SchedulerOptions,
        Stream, WorkloadSpec,
    };
    use trace_model::{TraceBuilder, TraceRecord, VecReader};

    fn input(tid: i64, records: Vec<TraceRecord>) -> InputSpec {
        InputSpec::new(Box::new(VecReader::new(format!("t{tid}"), records)), tid)
    }

    fn drain_instr_inputs(stream: &mut Stream) -> Vec<usize> {
        let mut out = Vec::new();
        let mut spins = 0;
        loop {
            match stream.next_record(0).unwrap() {
                Poll::Record(rec) => {
                    spins = 0;
                    if rec.is_instr() {
                        out.push(stream.input_ordinal().unwrap());
                    }
                }
                Poll::Eof => return out,
                _ => {
                    spins += 1;
                    assert!(spins < 10_000, "stream idled forever");
                }
            }
        }
    }

    #[test]
    fn test_static_round_robin_assignment() {
        let options = SchedulerOptions {
            mapping: MappingStrategy::ConsistentOutput,
            ..Default::default()
        };
        let inputs: Vec<_> = (1..=3)
            .map(|tid| input(tid, TraceBuilder::new(tid, 10).instrs(4).exit()))
            .collect();
        let sched = Scheduler::new(vec![WorkloadSpec::new(inputs)], 2, options).unwrap();
        let mut s0 = sched.stream(0).unwrap();
        let mut s1 = sched.stream(1).unwrap();
        // Inputs 0 and 2 land on output 0; input 1 on output 1. Each output
        // plays its inputs back to back, never rescheduling.
        assert_eq!(drain_instr_inputs(&mut s0), vec![0, 0, 0, 0, 2, 2, 2, 2]);
        assert_eq!(drain_instr_inputs(&mut s1), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_static_shard_index_is_input() {
        let options = SchedulerOptions {
            mapping: MappingStrategy::ConsistentOutput,
            ..Default::default()
        };
        let inputs = vec![
            input(1, TraceBuilder::new(1, 10).instrs(2).exit()),
            input(2, TraceBuilder::new(2, 10).instrs(2).exit()),
        ];
        let sched = Scheduler::new(vec![WorkloadSpec::new(inputs)], 2, options).unwrap();
        let mut s1 = sched.stream(1).unwrap();
        assert!(matches!(s1.next_record(0).unwrap(), Poll::Record(_)));
        assert_eq!(s1.shard_index(), Some(1));
    }

    #[test]
    fn test_timestamp_interleave() {
        let options = SchedulerOptions {
            mapping: MappingStrategy::RecordedOutput,
            deps: DependencyMode::Timestamps,
            ..Default::default()
        };
        let a = TraceBuilder::new(1, 10).instrs(2).timestamp(50).instrs(2).exit();
        let b = TraceBuilder::new(2, 20).instrs(2).timestamp(60).instrs(2).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a), input(2, b)])],
            1,
            options,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        // Batches run in global timestamp order: 10, 20, 50, 60.
        assert_eq!(drain_instr_inputs(&mut stream), vec![0, 0, 1, 1, 0, 0, 1, 1]);
    }

    #[test]
    fn test_timestamp_interleave_requires_single_output() {
        let options = SchedulerOptions {
            mapping: MappingStrategy::RecordedOutput,
            deps: DependencyMode::Timestamps,
            ..Default::default()
        };
        let a = TraceBuilder::new(1, 10).instrs(2).exit();
        let b = TraceBuilder::new(2, 20).instrs(2).exit();
        assert!(Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a), input(2, b)])],
            2,
            options,
        )
        .is_err());
    }
}
