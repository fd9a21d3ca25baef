//! Scheduler core
//!
//! Mode-independent machinery: construction, the `next_record` dispatcher
//! loop, input swapping, region-of-interest skips, unread, speculation, and
//! recorded-schedule segment bookkeeping. Mode-specific policy (dynamic,
//! fixed, replay) hangs off the [`SchedulingMode`] trait.

use crate::error::{Result, SchedulerError};
use crate::input::{InputState, QueuedRecord};
use crate::options::{DependencyMode, MappingStrategy, SchedulerOptions};
use crate::output::{LastEmission, OutputLocal, OutputState, SpeculationFrame, StatKind};
use crate::schedule_file::{
    component_name, write_component, ArchiveWriterBox, ScheduleSegment, SegmentKind,
};
use crate::stream::{Poll, Stream};
use crate::workload::{InputIndex, OutputIndex, WorkloadSpec, WorkloadState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLockReadGuard, RwLockWriteGuard};
use trace_model::{MarkerKind, TraceRecord};
use tracing::{debug, info, trace, warn};

/// Poison-tolerant mutex acquisition: a panicked holder does not take the
/// scheduler down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read_lock<T>(lock: &std::sync::RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write_lock<T>(lock: &std::sync::RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome of asking the picker for a new input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pick {
    /// Run this input next (already installed as `cur_input`).
    Input(InputIndex),
    /// Nothing runnable now; emit idle.
    Idle,
    /// Replay dependence unmet; emit wait.
    Wait,
    /// No further records will ever appear on this output.
    Eof,
    /// A schedule action (skip, synthetic end) was applied; fetch again.
    Again,
}

/// Outcome of the end-of-work path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EofOrIdle {
    Eof,
    Idle,
    /// Work was stolen and installed as `cur_input`.
    Stole,
}

/// What `check_for_input_switch` decided about the in-flight record.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SwitchDecision {
    pub need_new_input: bool,
    pub preempt: bool,
    pub blocked_time: u64,
    /// A `SyscallSchedule` target to wake once the input lock is released.
    pub deferred_schedule: Option<InputIndex>,
}

/// Mode-specific scheduling policy.
///
/// One implementation each for dynamic, fixed, and replay operation; selected
/// once at construction.
pub(crate) trait SchedulingMode: Send + Sync {
    /// Install the initial input-to-output assignment.
    fn set_initial_schedule(&self, sched: &SchedulerImpl) -> Result<()>;

    /// The outgoing input's fields are already updated; give it a new home.
    fn swap_out_input(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        input: InputIndex,
    ) -> Result<()>;

    /// The incoming input is installed as `cur_input`.
    fn swap_in_input(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        input: InputIndex,
    ) -> Result<()>;

    /// Choose the next input for an output that needs one.
    fn pick_next_input_for_mode(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        local: &mut OutputLocal,
        blocked_time: u64,
        prev_index: Option<InputIndex>,
    ) -> Result<Pick>;

    /// Inspect the in-flight record and decide whether to switch inputs.
    fn check_for_input_switch(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        local: &mut OutputLocal,
        record: &TraceRecord,
        input: &mut InputState,
        cur_time: u64,
    ) -> Result<SwitchDecision>;

    /// Wake a `SyscallSchedule` target (dynamic mode only).
    fn apply_deferred_schedule(
        &self,
        _sched: &SchedulerImpl,
        _output: OutputIndex,
        _target: InputIndex,
    ) -> Result<()> {
        Ok(())
    }

    /// Decide between reporting EOF, idling, or stealing work.
    fn eof_or_idle_for_mode(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        local: &mut OutputLocal,
        prev_input: Option<InputIndex>,
    ) -> Result<EofOrIdle>;

    /// Consumer-driven output (de)activation.
    fn set_output_active(
        &self,
        _sched: &SchedulerImpl,
        _output: OutputIndex,
        _local: &mut OutputLocal,
        _active: bool,
    ) -> Result<()> {
        Err(SchedulerError::Invalid(
            "output deactivation is only supported by the dynamic scheduler".into(),
        ))
    }
}

/// Mode-independent scheduler data.
pub(crate) struct SchedulerCore {
    pub options: SchedulerOptions,
    pub workloads: Vec<WorkloadState>,
    /// One mutex per input: the input lock of the locking discipline.
    pub inputs: Vec<Mutex<InputState>>,
    pub outputs: Vec<OutputState>,
    /// Inputs not yet at EOF.
    pub live_input_count: AtomicUsize,
    /// Replay: outputs not yet at the end of their recorded sequence.
    pub live_replay_output_count: AtomicI64,
    /// (workload, tid) -> input ordinal.
    pub tid2input: HashMap<(usize, i64), InputIndex>,
    /// Archive to flush recorded segments into, when recording.
    pub schedule_ostream: Option<Mutex<ArchiveWriterBox>>,
    /// Replaying a recorded schedule: recorded skips drive the regions of
    /// interest instead of the live windowing logic.
    pub is_replay: bool,
}

impl SchedulerCore {
    pub fn is_recording(&self) -> bool {
        self.schedule_ostream.is_some()
    }
}

/// The scheduler engine: shared data plus the selected mode policy.
pub(crate) struct SchedulerImpl {
    pub core: SchedulerCore,
    pub mode: Box<dyn SchedulingMode>,
}

/// Region-of-interest verdict for the record in flight.
enum RoiAction {
    Keep,
    Refetch,
}

impl SchedulerImpl {
    /// The output's simulation clock; 0 until the first `next_record`.
    pub fn output_time(&self, output: OutputIndex) -> u64 {
        self.core.outputs[output].cur_time.load(Ordering::Acquire)
    }

    /// Convert a microsecond wait into simulated block time: multiplied,
    /// saturated at `block_time_max_us`, and scaled to time units.
    pub fn scale_blocked_time(&self, us: u64) -> u64 {
        let opts = &self.core.options;
        let mut scaled_us = us as f64 * opts.block_time_multiplier;
        if opts.block_time_max_us > 0 && scaled_us > opts.block_time_max_us as f64 {
            scaled_us = opts.block_time_max_us as f64;
        }
        (scaled_us * opts.time_units_per_us) as u64
    }

    /// Advance one output by one record.
    pub fn next_record(&self, output: OutputIndex, cur_time: u64) -> Result<Poll> {
        let out = &self.core.outputs[output];
        let mut local = lock(&out.local);

        if !out.is_active() {
            return self.emit_idle(output, &mut local);
        }

        // Simulation clock: a caller-supplied 0 means "I don't know the
        // time"; substitute the record+idle count surrogate.
        let now = if cur_time == 0 {
            local.cur_instr_count + out.idle_count.load(Ordering::Acquire) + 1
        } else {
            cur_time
        };
        out.cur_time.store(now, Ordering::Release);
        if out.initial_cur_time.load(Ordering::Acquire) == 0 {
            out.initial_cur_time.store(now, Ordering::Release);
        }

        // While speculating, fabricate straight-line instruction records at
        // the speculation pc; the real stream is untouched.
        if !local.speculation_stack.is_empty() {
            let rec = TraceRecord::Instr { pc: local.speculate_pc, size: 4 };
            local.speculate_pc += 4;
            local.cur_instr_count += 1;
            local.last_record = rec;
            local.last_emission = None;
            return Ok(Poll::Record(rec));
        }

        loop {
            let cur = match local.cur_input {
                Some(cur) => cur,
                None => {
                    let was_waiting = local.waiting;
                    match self.pick_next_input(output, &mut local, 0, None)? {
                        Pick::Input(idx) => {
                            if was_waiting {
                                out.stats.bump(StatKind::SwitchIdleToInput);
                            }
                            idx
                        }
                        Pick::Idle => return self.emit_idle(output, &mut local),
                        Pick::Wait => return self.emit_wait(output, &mut local),
                        Pick::Eof => return self.emit_eof(&mut local),
                        Pick::Again => continue,
                    }
                }
            };

            let mut inp = lock(&self.core.inputs[cur]);

            // Fetch: pending queue first, then the reader.
            let fetched = if let Some(q) = inp.dequeue() {
                inp.cur_from_queue = true;
                inp.cur_synthetic = q.synthetic;
                q
            } else if inp.at_eof {
                // Drained a synthesized exit earlier; nothing more here.
                drop(inp);
                self.set_cur_input(output, &mut local, None)?;
                continue;
            } else {
                inp.cur_from_queue = false;
                inp.cur_synthetic = false;
                match inp.reader.next_record()? {
                    Some(rec) => QueuedRecord::real(rec),
                    None => {
                        self.mark_input_eof(&mut inp)?;
                        drop(inp);
                        self.set_cur_input(output, &mut local, None)?;
                        continue;
                    }
                }
            };
            let record = fetched.record;

            // Region-of-interest windowing may drop this record and skip.
            if !self.core.is_replay && !fetched.synthetic && !inp.regions_of_interest.is_empty()
            {
                match self.advance_region_of_interest(output, &mut inp, &record)? {
                    RoiAction::Keep => {}
                    RoiAction::Refetch => {
                        drop(inp);
                        continue;
                    }
                }
            }

            let decision = self.mode.check_for_input_switch(
                self,
                output,
                &mut local,
                &record,
                &mut inp,
                now,
            )?;

            if let Some(target) = decision.deferred_schedule {
                drop(inp);
                self.mode.apply_deferred_schedule(self, output, target)?;
                inp = lock(&self.core.inputs[cur]);
            }

            if decision.need_new_input {
                // Park the fetched record on the input before the mode can
                // publish it to other outputs' view.
                inp.requeue_front(fetched);
                drop(inp);
                let prev = cur;
                if decision.preempt {
                    trace!(output, input = prev, "preempted at quantum expiry");
                }
                // The mode decides whether the outgoing input is swapped out
                // (and so re-enqueued) or kept.
                match self.pick_next_input(
                    output,
                    &mut local,
                    decision.blocked_time,
                    Some(prev),
                )? {
                    Pick::Input(idx) if idx != prev => {
                        out.stats.bump(StatKind::SwitchInputToInput);
                        self.inject_switch_sequence(idx);
                        continue;
                    }
                    Pick::Input(_) => {
                        // Kept the same input: deliver the record already in
                        // hand rather than re-running the switch check.
                        out.stats.bump(StatKind::SwitchNop);
                        let mut inp = lock(&self.core.inputs[prev]);
                        let Some(q) = inp.dequeue() else {
                            continue;
                        };
                        inp.cur_from_queue = true;
                        inp.cur_synthetic = q.synthetic;
                        self.finalize_emission(&mut local, &mut inp, q.record, q.synthetic);
                        return Ok(Poll::Record(q.record));
                    }
                    Pick::Idle => {
                        out.stats.bump(StatKind::SwitchInputToIdle);
                        return self.emit_idle(output, &mut local);
                    }
                    Pick::Wait => return self.emit_wait(output, &mut local),
                    Pick::Eof => return self.emit_eof(&mut local),
                    Pick::Again => continue,
                }
            }

            self.finalize_emission(&mut local, &mut inp, record, fetched.synthetic);
            return Ok(Poll::Record(record));
        }
    }

    /// Install `new_input` (or none) as the output's current input, swapping
    /// the previous one out through the mode policy.
    pub fn set_cur_input(
        &self,
        output: OutputIndex,
        local: &mut OutputLocal,
        new_input: Option<InputIndex>,
    ) -> Result<()> {
        if local.cur_input == new_input {
            return Ok(());
        }
        let prev = local.cur_input;
        let now = self.output_time(output);

        if let Some(p) = prev {
            {
                let mut pin = lock(&self.core.inputs[p]);
                pin.cur_output = None;
                pin.last_run_time = now;
                pin.instrs_in_quantum = 0;
                pin.time_spent_in_quantum = 0;
                // An exhausted input's final segment keeps the run-to-EOF
                // sentinel so replay delivers its trailing exit records.
                if self.core.is_recording() && !pin.at_eof {
                    self.close_open_segment(output, Some(&pin));
                }
            }
            self.mode.swap_out_input(self, output, p)?;
            local.prev_input = Some(p);
        }

        local.cur_input = new_input;
        if let Some(n) = new_input {
            local.waiting = false;
            local.tried_to_steal_on_idle = false;
            {
                let mut nin = lock(&self.core.inputs[n]);
                nin.cur_output = Some(output);
                nin.containing_output = Some(output);
                nin.prev_time_in_quantum = now;
                nin.switching_pre_instruction = false;
                if self.core.is_recording() {
                    self.close_open_segment(output, None); // pending idle
                    self.append_segment(
                        output,
                        SegmentKind::Default,
                        n as u32,
                        nin.instr_ordinal(),
                        u64::MAX,
                    );
                }
            }
            self.mode.swap_in_input(self, output, n)?;
        }
        Ok(())
    }

    /// Ask the mode for a new input and install it.
    pub fn pick_next_input(
        &self,
        output: OutputIndex,
        local: &mut OutputLocal,
        blocked_time: u64,
        prev_index: Option<InputIndex>,
    ) -> Result<Pick> {
        let pick =
            self.mode
                .pick_next_input_for_mode(self, output, local, blocked_time, prev_index)?;
        match pick {
            Pick::Input(idx) => {
                self.set_cur_input(output, local, Some(idx))?;
                Ok(Pick::Input(idx))
            }
            other => Ok(other),
        }
    }

    /// Mark an input exhausted and drop it from the live count.
    ///
    /// The caller holds the input's lock. Returns with the input still locked.
    pub fn mark_input_eof(&self, input: &mut InputState) -> Result<()> {
        if input.at_eof {
            return Ok(());
        }
        input.at_eof = true;
        let remaining = self.core.live_input_count.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(input = input.index, remaining, "input reached eof");
        Ok(())
    }

    fn advance_region_of_interest(
        &self,
        output: OutputIndex,
        inp: &mut InputState,
        record: &TraceRecord,
    ) -> Result<RoiAction> {
        if !record.is_instr() {
            return Ok(RoiAction::Keep);
        }
        // Includes the just-fetched instruction in both fetch paths.
        let cur_ord = inp.instr_ordinal();

        // The candidate is being dropped, so segments close at the count of
        // instructions actually delivered.
        let delivered = cur_ord.saturating_sub(1);

        if inp.in_cur_region {
            let range = inp.regions_of_interest[inp.cur_region];
            if range.stop != 0 && cur_ord > range.stop {
                inp.cur_region += 1;
                inp.in_cur_region = false;
                if inp.cur_region >= inp.regions_of_interest.len() {
                    // Past the final window: synthesize an exit and end here.
                    debug!(input = inp.index, "past final region of interest");
                    inp.clear_queue();
                    let tid = inp.tid;
                    inp.queue_synthetic(TraceRecord::ThreadExit { tid });
                    if self.core.is_recording() {
                        self.close_open_segment_at(output, inp.index as u32, delivered);
                        self.append_segment(
                            output,
                            SegmentKind::SyntheticEnd,
                            inp.index as u32,
                            delivered,
                            0,
                        );
                    }
                    self.mark_input_eof(inp)?;
                    return Ok(RoiAction::Refetch);
                }
            } else {
                return Ok(RoiAction::Keep);
            }
        }

        let range = inp.regions_of_interest[inp.cur_region];
        if cur_ord < range.start {
            // Skip to the window start; the fetched record is dropped.
            let pre_skip = inp.reader.instruction_ordinal();
            let amount = (range.start - 1).saturating_sub(pre_skip);
            debug!(
                input = inp.index,
                from = pre_skip,
                to = range.start,
                "skipping to region of interest"
            );
            self.skip_input_instructions(inp, amount, output)?;
            if self.core.is_recording() {
                self.close_open_segment_at(output, inp.index as u32, delivered);
                self.append_segment(
                    output,
                    SegmentKind::Skip,
                    inp.index as u32,
                    pre_skip,
                    range.start,
                );
                self.append_segment(
                    output,
                    SegmentKind::Default,
                    inp.index as u32,
                    inp.reader.instruction_ordinal(),
                    u64::MAX,
                );
            }
            inp.in_cur_region = true;
            return Ok(RoiAction::Refetch);
        }
        inp.in_cur_region = true;
        Ok(RoiAction::Keep)
    }

    /// Perform a direct skip: drop pending records, advance the reader, and
    /// queue the synthetic window separator plus refreshed timestamp/cpuid.
    ///
    /// The caller must hold the input's lock.
    pub(crate) fn skip_input_instructions(
        &self,
        inp: &mut InputState,
        amount: u64,
        output: OutputIndex,
    ) -> Result<()> {
        inp.clear_queue();
        inp.reader.skip_instructions(amount)?;
        if inp.cur_region > 0 {
            let window = inp.cur_region as u64;
            inp.queue_synthetic(TraceRecord::marker(MarkerKind::WindowId, window));
        }
        let ts = inp.reader.last_timestamp();
        inp.queue_synthetic(TraceRecord::marker(MarkerKind::Timestamp, ts));
        inp.queue_synthetic(TraceRecord::marker(MarkerKind::Cpuid, output as u64));
        Ok(())
    }

    /// Queue the configured context-switch sequence ahead of the incoming
    /// input's next records.
    fn inject_switch_sequence(&self, input: InputIndex) {
        if self.core.options.switch_sequence.is_empty() {
            return;
        }
        let mut inp = lock(&self.core.inputs[input]);
        // Front-load in reverse so the sequence comes out in order.
        for rec in self.core.options.switch_sequence.iter().rev() {
            inp.queue.push_front(QueuedRecord::synthetic(*rec));
        }
    }

    fn finalize_emission(
        &self,
        local: &mut OutputLocal,
        inp: &mut InputState,
        record: TraceRecord,
        synthetic: bool,
    ) {
        if !synthetic {
            local.cur_ref_count += 1;
        }
        if record.is_instr_boundary() {
            local.cur_instr_count += 1;
        }
        if let Some((kind, value)) = record.as_marker() {
            match kind {
                MarkerKind::Timestamp => {
                    local.last_timestamp = value;
                    if local.first_timestamp == 0 {
                        local.first_timestamp = value;
                    }
                }
                MarkerKind::Version => local.version = value,
                MarkerKind::Filetype => local.filetype = value,
                MarkerKind::CacheLineSize => local.cache_line_size = value,
                MarkerKind::ChunkInstrCount => local.chunk_instr_count = value,
                MarkerKind::PageSize => local.page_size = value,
                MarkerKind::SyscallTraceStart | MarkerKind::ContextSwitchStart => {
                    local.in_kernel_trace = true;
                }
                MarkerKind::SyscallTraceEnd | MarkerKind::ContextSwitchEnd => {
                    local.in_kernel_trace = false;
                }
                _ => {}
            }
        }
        local.last_record = record;
        local.last_emission = Some(LastEmission { input: inp.index, record, synthetic });
    }

    pub(crate) fn emit_idle(&self, output: OutputIndex, local: &mut OutputLocal) -> Result<Poll> {
        self.core.outputs[output].idle_count.fetch_add(1, Ordering::AcqRel);
        local.waiting = true;
        local.last_record = TraceRecord::marker(MarkerKind::CoreIdle, 0);
        local.last_emission = None;
        Ok(Poll::Idle)
    }

    fn emit_wait(&self, _output: OutputIndex, local: &mut OutputLocal) -> Result<Poll> {
        local.waiting = true;
        local.last_record = TraceRecord::marker(MarkerKind::CoreWait, 0);
        local.last_emission = None;
        Ok(Poll::Wait)
    }

    fn emit_eof(&self, local: &mut OutputLocal) -> Result<Poll> {
        local.last_emission = None;
        Ok(Poll::Eof)
    }

    /// Undo the last emission. Once per `next_record`, not during speculation.
    pub fn unread_last_record(&self, output: OutputIndex) -> Result<()> {
        let out = &self.core.outputs[output];
        let mut local = lock(&out.local);
        if !local.speculation_stack.is_empty() {
            return Err(SchedulerError::Invalid(
                "unread_last_record during speculation".into(),
            ));
        }
        let Some(em) = local.last_emission.take() else {
            return Err(SchedulerError::Invalid(
                "no record available to unread".into(),
            ));
        };
        if !em.synthetic {
            local.cur_ref_count = local.cur_ref_count.saturating_sub(1);
        }
        if em.record.is_instr() {
            local.cur_instr_count = local.cur_instr_count.saturating_sub(1);
        }
        // last_timestamp is documented as not rewound.
        let mut inp = lock(&self.core.inputs[em.input]);
        inp.requeue_front(QueuedRecord { record: em.record, synthetic: em.synthetic });
        Ok(())
    }

    pub fn start_speculation(
        &self,
        output: OutputIndex,
        start_address: u64,
        queue_current_record: bool,
    ) -> Result<()> {
        let out = &self.core.outputs[output];
        let mut local = lock(&out.local);
        let resume_pc = if local.speculation_stack.is_empty() {
            if queue_current_record {
                if let Some(em) = local.last_emission.take() {
                    if !em.synthetic {
                        local.cur_ref_count = local.cur_ref_count.saturating_sub(1);
                    }
                    if em.record.is_instr() {
                        local.cur_instr_count = local.cur_instr_count.saturating_sub(1);
                    }
                    let mut inp = lock(&self.core.inputs[em.input]);
                    inp.requeue_front(QueuedRecord {
                        record: em.record,
                        synthetic: em.synthetic,
                    });
                }
            }
            0
        } else {
            local.speculate_pc
        };
        local.speculation_stack.push(SpeculationFrame { resume_pc });
        local.speculate_pc = start_address;
        Ok(())
    }

    pub fn stop_speculation(&self, output: OutputIndex) -> Result<()> {
        let out = &self.core.outputs[output];
        let mut local = lock(&out.local);
        let Some(frame) = local.speculation_stack.pop() else {
            return Err(SchedulerError::Invalid("not speculating".into()));
        };
        local.speculate_pc = frame.resume_pc;
        Ok(())
    }

    pub fn set_output_active(&self, output: OutputIndex, active: bool) -> Result<()> {
        let out = &self.core.outputs[output];
        let mut local = lock(&out.local);
        self.mode.set_output_active(self, output, &mut local, active)
    }

    // ------------------------------------------------------------------
    // Recorded-schedule segment bookkeeping.

    /// Wall-clock microseconds, ordering context switches across outputs.
    pub(crate) fn wall_clock_us(&self) -> u64 {
        chrono::Utc::now().timestamp_micros().max(0) as u64
    }

    pub(crate) fn append_segment(
        &self,
        output: OutputIndex,
        kind: SegmentKind,
        input: u32,
        start: u64,
        stop: u64,
    ) {
        let ts = self.wall_clock_us();
        let mut rec = write_lock(&self.core.outputs[output].record);
        rec.push(ScheduleSegment::new(kind, input, start, stop, ts));
    }

    /// Close the trailing open segment: a running `Default` stops at the
    /// input's current ordinal; an open idle period stores its duration.
    pub(crate) fn close_open_segment(&self, output: OutputIndex, input: Option<&InputState>) {
        let out = &self.core.outputs[output];
        let mut rec = write_lock(&out.record);
        let Some(last) = rec.last_mut() else {
            return;
        };
        if last.stop_instruction != u64::MAX {
            return;
        }
        match last.kind {
            SegmentKind::Default => {
                if let Some(inp) = input {
                    if inp.index as u32 == last.input {
                        last.stop_instruction = inp.instr_ordinal();
                    }
                }
            }
            SegmentKind::IdleByCount => {
                let idle_now = out.idle_count.load(Ordering::Acquire);
                last.start_instruction = idle_now.saturating_sub(last.start_instruction);
                last.stop_instruction = 0;
            }
            _ => {}
        }
    }

    /// Close the trailing open `Default` segment at an explicit instruction
    /// count, for paths where the in-hand record was dropped rather than
    /// requeued.
    pub(crate) fn close_open_segment_at(&self, output: OutputIndex, input: u32, stop: u64) {
        let mut rec = write_lock(&self.core.outputs[output].record);
        if let Some(last) = rec.last_mut() {
            if last.kind == SegmentKind::Default
                && last.stop_instruction == u64::MAX
                && last.input == input
            {
                last.stop_instruction = stop;
            }
        }
    }

    /// Open an idle period segment, if one is not already open.
    pub(crate) fn record_idle_segment(&self, output: OutputIndex) {
        let out = &self.core.outputs[output];
        {
            let rec = read_lock(&out.record);
            if let Some(last) = rec.last() {
                if last.kind == SegmentKind::IdleByCount && last.stop_instruction == u64::MAX {
                    return;
                }
            }
        }
        let start = out.idle_count.load(Ordering::Acquire);
        self.append_segment(output, SegmentKind::IdleByCount, 0, start, u64::MAX);
    }

    /// Flush the per-output recorded schedules to the attached archive.
    pub fn write_recorded_schedule(&self) -> Result<()> {
        let Some(ostream) = &self.core.schedule_ostream else {
            return Err(SchedulerError::param(
                "no schedule_record_ostream was configured",
            ));
        };
        // Close any still-open trailing segments first.
        for (i, out) in self.core.outputs.iter().enumerate() {
            let local = lock(&out.local);
            let cur = local.cur_input;
            drop(local);
            match cur {
                Some(c) => {
                    let inp = lock(&self.core.inputs[c]);
                    self.close_open_segment(i, Some(&inp));
                }
                None => self.close_open_segment(i, None),
            }
        }
        let mut writer = lock(ostream);
        for (i, out) in self.core.outputs.iter().enumerate() {
            let rec = read_lock(&out.record);
            write_component(writer.as_mut(), &component_name(i), &rec)?;
            info!(output = i, segments = rec.len(), "wrote recorded schedule component");
        }
        Ok(())
    }

    /// Dump queue depths at debug level.
    pub fn log_queue_stats(&self) {
        let live = self.core.live_input_count.load(Ordering::Acquire);
        debug!(
            live_inputs = live,
            total_inputs = self.core.inputs.len(),
            "queue snapshot"
        );
        for (i, out) in self.core.outputs.iter().enumerate() {
            let rq = lock(&out.ready_queue);
            debug!(
                output = i,
                queued = rq.queue.len(),
                blocked = rq.num_blocked,
                time = self.output_time(i),
                "output queue"
            );
        }
    }
}

/// The public scheduler: construct once, hand out one stream per output.
pub struct Scheduler {
    inner: Arc<SchedulerImpl>,
}

impl Scheduler {
    /// Build a scheduler over the given workloads.
    ///
    /// The mode policy is chosen up front from the options: `AnyOutput` maps
    /// to the dynamic scheduler; `AsPreviously` (or `RecordedOutput` with an
    /// as-traced stream) to replay; anything else to a fixed schedule.
    pub fn new(
        workloads: Vec<WorkloadSpec>,
        output_count: usize,
        mut options: SchedulerOptions,
    ) -> Result<Self> {
        options.validate()?;
        if output_count == 0 {
            return Err(SchedulerError::param("output_count must be > 0"));
        }
        if workloads.iter().all(|w| w.inputs.is_empty()) {
            return Err(SchedulerError::param("no inputs supplied"));
        }
        info!(
            outputs = output_count,
            workloads = workloads.len(),
            mapping = ?options.mapping,
            "initializing scheduler"
        );

        let schedule_ostream = options.schedule_record_ostream.take().map(Mutex::new);
        let replay_istream = options.schedule_replay_istream.take();
        let as_traced_istream = options.replay_as_traced_istream.take();

        let mut workload_states = Vec::with_capacity(workloads.len());
        let mut inputs = Vec::new();
        let mut tid2input = HashMap::new();
        let gather_timestamps = options.deps == DependencyMode::Timestamps
            || options.mapping == MappingStrategy::RecordedOutput;

        for (w, workload) in workloads.into_iter().enumerate() {
            let mut members = Vec::with_capacity(workload.inputs.len());
            for spec in workload.inputs {
                let index = inputs.len();
                if tid2input.insert((w, spec.tid), index).is_some() {
                    return Err(SchedulerError::param(format!(
                        "duplicate tid {} in workload {w}",
                        spec.tid
                    )));
                }
                for out in &spec.binding {
                    if *out >= output_count {
                        return Err(SchedulerError::param(format!(
                            "binding to nonexistent output {out}"
                        )));
                    }
                }
                let mut prev_stop = 0u64;
                for (ri, range) in spec.regions_of_interest.iter().enumerate() {
                    let last = ri + 1 == spec.regions_of_interest.len();
                    if range.start == 0
                        || range.start <= prev_stop
                        || (range.stop != 0 && range.stop < range.start)
                        || (range.stop == 0 && !last)
                    {
                        return Err(SchedulerError::param(
                            "regions of interest must be ascending and non-overlapping",
                        ));
                    }
                    prev_stop = range.stop;
                }
                let mut input = InputState::new(
                    index,
                    w,
                    spec.tid,
                    spec.pid,
                    spec.reader,
                    spec.binding,
                    spec.priority,
                    spec.regions_of_interest,
                );
                read_initial_content(&mut input, gather_timestamps)?;
                members.push(index);
                inputs.push(Mutex::new(input));
            }
            workload_states.push(WorkloadState::new(workload.output_limit, members));
        }

        if options.mapping == MappingStrategy::ConsistentOutput && inputs.is_empty() {
            return Err(SchedulerError::param(
                "consistent mapping requires at least one input",
            ));
        }

        let live = inputs.len();
        let outputs = (0..output_count)
            .map(|i| OutputState::new(i as u64))
            .collect();

        let mut is_replay = false;
        let mode: Box<dyn SchedulingMode> = match options.mapping {
            MappingStrategy::AnyOutput => Box::new(crate::dynamic::DynamicMode::new()),
            MappingStrategy::AsPreviously => {
                is_replay = true;
                Box::new(crate::replay::ReplayMode::recorded(replay_istream))
            }
            MappingStrategy::RecordedOutput if as_traced_istream.is_some() => {
                is_replay = true;
                Box::new(crate::replay::ReplayMode::as_traced(as_traced_istream))
            }
            _ => Box::new(crate::fixed::FixedMode::new()),
        };

        let core = SchedulerCore {
            options,
            workloads: workload_states,
            inputs,
            outputs,
            live_input_count: AtomicUsize::new(live),
            live_replay_output_count: AtomicI64::new(0),
            tid2input,
            schedule_ostream,
            is_replay,
        };
        let sched = SchedulerImpl { core, mode };
        sched.mode.set_initial_schedule(&sched)?;
        Ok(Self { inner: Arc::new(sched) })
    }

    /// A handle for one output's stream. One consumer thread per output.
    pub fn stream(&self, ordinal: OutputIndex) -> Option<Stream> {
        if ordinal >= self.inner.core.outputs.len() {
            return None;
        }
        Some(Stream::new(self.inner.clone(), ordinal))
    }

    /// Number of input streams.
    pub fn input_count(&self) -> usize {
        self.inner.core.inputs.len()
    }

    /// Number of output streams.
    pub fn output_count(&self) -> usize {
        self.inner.core.outputs.len()
    }

    /// Diagnostic name of an input's underlying stream.
    pub fn input_stream_name(&self, input: InputIndex) -> Option<String> {
        let inp = self.inner.core.inputs.get(input)?;
        Some(lock(inp).reader.stream_name().to_string())
    }

    /// Flush the recorded schedule to the attached archive.
    pub fn write_recorded_schedule(&self) -> Result<()> {
        self.inner.write_recorded_schedule()
    }
}

/// Read each input ahead to its header values (and first timestamp when
/// needed), queueing everything consumed for the consumer's first requests.
fn read_initial_content(input: &mut InputState, gather_timestamps: bool) -> Result<()> {
    let mut found_timestamp = false;
    let mut found_filetype = false;
    loop {
        if found_filetype && (!gather_timestamps || found_timestamp) && input.version != 0 {
            break;
        }
        let Some(rec) = input.reader.next_record()? else {
            break;
        };
        if let Some((kind, value)) = rec.as_marker() {
            match kind {
                MarkerKind::Version => input.version = value,
                MarkerKind::Filetype => {
                    input.filetype = value;
                    found_filetype = true;
                }
                MarkerKind::CacheLineSize => input.cache_line_size = value,
                MarkerKind::PageSize => input.page_size = value,
                MarkerKind::ChunkInstrCount => input.chunk_instr_count = value,
                MarkerKind::Timestamp => {
                    if input.first_timestamp == 0 {
                        input.first_timestamp = value;
                        input.next_timestamp = value;
                    }
                    found_timestamp = true;
                }
                _ => {}
            }
        }
        let is_instr = rec.is_instr();
        input.queue.push_back(QueuedRecord::real(rec));
        input.queued_real_records += 1;
        if is_instr {
            input.queued_real_instrs += 1;
            // Do not read into the instruction stream proper.
            break;
        }
    }
    if input.version == 0 && input.reader.at_eof() && input.queue.is_empty() {
        warn!(input = input.index, "input is empty");
    }
    trace!(
        input = input.index,
        version = input.version,
        first_timestamp = input.first_timestamp,
        queued = input.queue.len(),
        "initial read-ahead complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::InputSpec;
    use std::collections::BTreeSet;
    use trace_model::{TraceBuilder, VecReader, TRACE_VERSION_CURRENT};

    fn fresh_input(gather: bool) -> InputState {
        let records = TraceBuilder::new(5, 42).instrs(3).exit();
        let mut input = InputState::new(
            0,
            0,
            5,
            0,
            Box::new(VecReader::new("t5", records)),
            BTreeSet::new(),
            0,
            Vec::new(),
        );
        read_initial_content(&mut input, gather).unwrap();
        input
    }

    #[test]
    fn test_initial_read_ahead_latches_headers() {
        let input = fresh_input(true);
        assert_eq!(input.version, TRACE_VERSION_CURRENT);
        assert_eq!(input.page_size, 4096);
        assert_eq!(input.cache_line_size, 64);
        assert_eq!(input.first_timestamp, 42);
        assert_eq!(input.next_timestamp, 42);
        // Everything consumed was queued for later delivery, so the
        // tool-visible ordinals are untouched.
        assert_eq!(input.record_ordinal(), 0);
        assert!(!input.queue.is_empty());
    }

    #[test]
    fn test_initial_read_ahead_stops_before_instructions() {
        let input = fresh_input(false);
        // Without timestamp gathering the read-ahead stops at the filetype,
        // and never runs into the instruction stream.
        assert_eq!(input.queued_real_instrs, 0);
    }

    #[test]
    fn test_region_of_interest_window() {
        use crate::stream::Poll;
        use crate::workload::InstrRange;
        let records = TraceBuilder::new(1, 10).instrs(6).exit();
        let spec = InputSpec::new(Box::new(VecReader::new("t1", records)), 1)
            .with_regions(vec![InstrRange::new(2, 3)]);
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![spec])],
            1,
            SchedulerOptions::default(),
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let mut emitted = Vec::new();
        while let Poll::Record(rec) = stream.next_record(0).unwrap() {
            emitted.push(rec);
        }
        // Only the windowed instructions survive.
        let pcs: Vec<u64> = emitted
            .iter()
            .filter_map(|r| match r {
                TraceRecord::Instr { pc, .. } => Some(*pc),
                _ => None,
            })
            .collect();
        assert_eq!(pcs, vec![0x1004, 0x1008]);
        // A refreshed cpuid follows the skip, and the early end is a
        // synthesized thread exit.
        assert!(emitted.iter().any(|r| r.is_marker(MarkerKind::Cpuid)));
        assert_eq!(emitted.last(), Some(&TraceRecord::ThreadExit { tid: 1 }));
    }

    #[test]
    fn test_regions_of_interest_window_separator() {
        use crate::stream::Poll;
        use crate::workload::InstrRange;
        let records = TraceBuilder::new(1, 10).instrs(6).exit();
        let spec = InputSpec::new(Box::new(VecReader::new("t1", records)), 1)
            .with_regions(vec![InstrRange::new(1, 2), InstrRange::new(5, 5)]);
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![spec])],
            1,
            SchedulerOptions::default(),
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let mut emitted = Vec::new();
        while let Poll::Record(rec) = stream.next_record(0).unwrap() {
            emitted.push(rec);
        }
        let pcs: Vec<u64> = emitted
            .iter()
            .filter_map(|r| match r {
                TraceRecord::Instr { pc, .. } => Some(*pc),
                _ => None,
            })
            .collect();
        assert_eq!(pcs, vec![0x1000, 0x1004, 0x1010]);
        // The second window announces itself with a separator marker.
        assert!(emitted
            .iter()
            .any(|r| r.as_marker() == Some((MarkerKind::WindowId, 1))));
    }

    #[test]
    fn test_malformed_regions_rejected() {
        use crate::workload::InstrRange;
        let records = TraceBuilder::new(1, 10).instrs(6).exit();
        let spec = InputSpec::new(Box::new(VecReader::new("t1", records)), 1)
            .with_regions(vec![InstrRange::new(4, 6), InstrRange::new(2, 3)]);
        assert!(Scheduler::new(
            vec![WorkloadSpec::new(vec![spec])],
            1,
            SchedulerOptions::default(),
        )
        .is_err());
    }

    #[test]
    fn test_scale_blocked_time_saturates() {
        let records = TraceBuilder::new(1, 10).instrs(1).exit();
        let spec = InputSpec::new(Box::new(VecReader::new("t1", records)), 1);
        let options = SchedulerOptions {
            block_time_multiplier: 3.0,
            block_time_max_us: 1_000,
            time_units_per_us: 10.0,
            ..Default::default()
        };
        let sched =
            Scheduler::new(vec![WorkloadSpec::new(vec![spec])], 1, options).unwrap();
        // Under the cap: multiplied then scaled.
        assert_eq!(sched.inner.scale_blocked_time(100), 3_000);
        // Monotone up to saturation at block_time_max_us.
        assert_eq!(sched.inner.scale_blocked_time(500), 10_000);
        assert_eq!(sched.inner.scale_blocked_time(5_000), 10_000);
    }
}
