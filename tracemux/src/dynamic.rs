//! Dynamic rescheduling
//!
//! The `AnyOutput` policy: per-output ready queues with priority/FIFO or
//! timestamp ordering, quantum preemption, syscall blocking, direct-switch
//! hints, an unscheduled pool for indefinite waits, periodic rebalancing, and
//! work stealing on idle.

use crate::core::{
    lock, EofOrIdle, Pick, SchedulerImpl, SchedulingMode, SwitchDecision,
};
use crate::error::{Result, SchedulerError};
use crate::input::{InputState, ReadyKey};
use crate::output::{OutputLocal, ReadyQueue, StatKind};
use crate::options::QuantumUnit;
use crate::queue::IndexedPriorityQueue;
use crate::workload::{InputIndex, OutputIndex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use trace_model::{MarkerKind, TraceRecord, TRACE_VERSION_FREQUENT_TIMESTAMPS};
use tracing::{debug, trace, warn};

/// Inputs waiting indefinitely until directly targeted.
///
/// Holds inputs with `unscheduled = true` and no block timeout. Its lock is
/// the narrowest in the ordering: acquired after any output or input lock.
#[derive(Debug)]
struct UnscheduledPool {
    queue: IndexedPriorityQueue<InputIndex, ReadyKey>,
    fifo_counter: u64,
}

/// Result of a ready-queue pop attempt.
#[derive(Debug, Clone, Copy)]
struct PopResult {
    input: Option<InputIndex>,
    /// Nothing was runnable but blocked inputs remain: idle, not EOF.
    only_blocked: bool,
}

/// The dynamic scheduling policy.
pub(crate) struct DynamicMode {
    unscheduled: Mutex<UnscheduledPool>,
    /// Rebalancer claim slot: 0 is free, else claiming output + 1.
    rebalancer: AtomicU64,
    last_rebalance_time: AtomicU64,
}

impl DynamicMode {
    pub fn new() -> Self {
        Self {
            unscheduled: Mutex::new(UnscheduledPool {
                queue: IndexedPriorityQueue::new(),
                fifo_counter: 0,
            }),
            rebalancer: AtomicU64::new(0),
            last_rebalance_time: AtomicU64::new(0),
        }
    }

    fn ready_queue_empty(&self, sched: &SchedulerImpl, output: OutputIndex) -> bool {
        lock(&sched.core.outputs[output].ready_queue).queue.is_empty()
    }

    /// The caller must hold the input's lock.
    fn add_to_unscheduled_queue(&self, input: &mut InputState) {
        let mut pool = lock(&self.unscheduled);
        debug_assert!(input.unscheduled && input.blocked_time == 0);
        pool.fifo_counter += 1;
        input.queue_counter = pool.fifo_counter;
        let key = input.ready_key(input.queue_counter);
        pool.queue.push(input.index, key);
        input.prev_output = input.containing_output;
        input.containing_output = None;
        trace!(input = input.index, pool = pool.queue.len(), "added to unscheduled pool");
    }

    /// The caller must hold the output's queue lock and the input's lock.
    fn add_to_ready_queue_hold_locks(
        &self,
        output: OutputIndex,
        rq: &mut ReadyQueue,
        input: &mut InputState,
    ) {
        if input.unscheduled && input.blocked_time == 0 {
            // Record the would-be output so a later wake resumes there
            // instead of funneling everything onto output 0.
            input.containing_output = Some(output);
            self.add_to_unscheduled_queue(input);
            return;
        }
        debug_assert!(input.binding_allows(output));
        if input.blocked_time > 0 {
            rq.num_blocked += 1;
        }
        rq.fifo_counter += 1;
        input.queue_counter = rq.fifo_counter;
        let key = input.ready_key(input.queue_counter);
        rq.queue.push(input.index, key);
        input.containing_output = Some(output);
    }

    fn add_to_ready_queue(&self, sched: &SchedulerImpl, output: OutputIndex, input: InputIndex) {
        let mut rq = lock(&sched.core.outputs[output].ready_queue);
        let mut inp = lock(&sched.core.inputs[input]);
        self.add_to_ready_queue_hold_locks(output, &mut rq, &mut inp);
    }

    /// Pop a runnable input from `from_output`'s queue on behalf of
    /// `for_output` (`None` ignores bindings and migration thresholds other
    /// than the blocked-time check: the rebalancer's shedding pop).
    ///
    /// The caller must hold `from_output`'s queue lock (and `for_output`'s if
    /// different).
    fn pop_from_ready_queue_hold_locks(
        &self,
        sched: &SchedulerImpl,
        from_output: OutputIndex,
        for_output: Option<OutputIndex>,
        rq: &mut ReadyQueue,
        from_back: bool,
    ) -> PopResult {
        let opts = &sched.core.options;
        let mut skipped: Vec<InputIndex> = Vec::new();
        let mut blocked: Vec<InputIndex> = Vec::new();
        let mut res: Option<InputIndex> = None;
        let cur_time = sched.output_time(from_output);

        loop {
            let cand = if from_back {
                rq.queue.back()
            } else if opts.randomize_next_input {
                rq.queue.random_entry()
            } else {
                rq.queue.top()
            };
            let Some(cand) = cand else {
                break;
            };
            rq.queue.erase(&cand);
            let mut inp = lock(&sched.core.inputs[cand]);
            debug_assert!(!inp.unscheduled || inp.blocked_time > 0);
            let binding_ok = match for_output {
                None => true,
                Some(fo) => inp.binding_allows(fo),
            };
            if !binding_ok {
                skipped.push(cand);
                continue;
            }
            if inp.blocked_time > 0 {
                rq.num_blocked = rq.num_blocked.saturating_sub(1);
                if !opts.honor_infinite_timeouts
                    && inp.blocked_start_time == 0
                    && cur_time > 0
                {
                    // A start-unscheduled input had no valid time at init.
                    inp.blocked_start_time = cur_time;
                }
            }
            if inp.blocked_time > 0
                && (cur_time == 0
                    // Tolerate wall-clock regression.
                    || cur_time < inp.blocked_start_time
                    || cur_time - inp.blocked_start_time < inp.blocked_time)
            {
                trace!(
                    input = cand,
                    remaining = inp.blocked_time
                        .saturating_sub(cur_time.saturating_sub(inp.blocked_start_time)),
                    "candidate still blocked"
                );
                blocked.push(cand);
                continue;
            }
            inp.blocked_time = 0;
            inp.unscheduled = false;

            let workload = &sched.core.workloads[inp.workload];
            let mut found = false;
            if workload.output_limit > 0
                && workload.live_output_count.load(Ordering::Acquire) >= workload.output_limit
            {
                debug!(input = cand, "candidate at workload output limit");
                sched.core.outputs[from_output].stats.bump(StatKind::HitOutputLimit);
            } else if for_output == Some(from_output) {
                found = true;
            } else {
                // A migration: throttle unless the input has been off-core
                // long enough. Free movement at init time (cur_time == 0).
                if inp.last_run_time == 0 {
                    inp.last_run_time = sched.core.outputs[from_output]
                        .initial_cur_time
                        .load(Ordering::Acquire);
                }
                if opts.migration_threshold_us == 0
                    || cur_time == 0
                    || (cur_time > inp.last_run_time
                        && cur_time - inp.last_run_time
                            >= opts.us_to_time_units(opts.migration_threshold_us))
                {
                    found = true;
                    if cur_time > 0 {
                        sched.core.outputs[from_output].stats.bump(StatKind::Migrations);
                    }
                }
            }
            if found {
                inp.prev_output = inp.containing_output;
                inp.containing_output = for_output;
                res = Some(cand);
                break;
            }
            skipped.push(cand);
        }

        let only_blocked = res.is_none() && !blocked.is_empty();
        // Re-add skipped candidates with their counters intact, preserving
        // FIFO order; blocked ones go to the back.
        for save in skipped {
            let inp = lock(&sched.core.inputs[save]);
            let key = inp.ready_key(inp.queue_counter);
            rq.queue.push(save, key);
        }
        for save in blocked {
            let mut inp = lock(&sched.core.inputs[save]);
            self.add_to_ready_queue_hold_locks(from_output, rq, &mut inp);
        }
        PopResult { input: res, only_blocked }
    }

    fn pop_from_ready_queue(
        &self,
        sched: &SchedulerImpl,
        from_output: OutputIndex,
        for_output: Option<OutputIndex>,
    ) -> PopResult {
        // Two output locks are acquired in increasing ordinal order so two
        // outputs stealing from each other cannot deadlock.
        match for_output {
            Some(fo) if fo != from_output => {
                let (lo_idx, hi_idx) = if from_output < fo {
                    (from_output, fo)
                } else {
                    (fo, from_output)
                };
                let mut lo = lock(&sched.core.outputs[lo_idx].ready_queue);
                let mut hi = lock(&sched.core.outputs[hi_idx].ready_queue);
                let rq = if lo_idx == from_output { &mut lo } else { &mut hi };
                self.pop_from_ready_queue_hold_locks(sched, from_output, for_output, rq, false)
            }
            _ => {
                let mut rq = lock(&sched.core.outputs[from_output].ready_queue);
                self.pop_from_ready_queue_hold_locks(
                    sched,
                    from_output,
                    for_output,
                    &mut rq,
                    false,
                )
            }
        }
    }

    /// Move ready-queue contents around so active outputs end up near the
    /// average load, honoring bindings. Approximate: concurrent steals are
    /// tolerated and corrected by the next pass.
    fn rebalance_queues(
        &self,
        sched: &SchedulerImpl,
        triggering_output: OutputIndex,
        inputs_to_add: Vec<InputIndex>,
    ) -> Result<()> {
        let claim = triggering_output as u64 + 1;
        if self
            .rebalancer
            .compare_exchange(0, claim, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Someone else is rebalancing.
            return Ok(());
        }
        let result = self.rebalance_body(sched, triggering_output, inputs_to_add);
        self.rebalancer.store(0, Ordering::Release);
        result
    }

    fn rebalance_body(
        &self,
        sched: &SchedulerImpl,
        triggering_output: OutputIndex,
        mut inputs_to_add: Vec<InputIndex>,
    ) -> Result<()> {
        let now = sched.output_time(triggering_output);
        debug!(output = triggering_output, time = now, "rebalancing run queues");
        // Update the time first so other outputs stop piling in here.
        self.last_rebalance_time.store(now, Ordering::Release);
        sched.core.outputs[triggering_output].stats.bump(StatKind::RunqueueRebalances);
        sched.log_queue_stats();

        // Starvation workaround: when every live input sits unscheduled
        // (schedule/switch directives missed their targets), dump the whole
        // pool back onto the ready queues.
        let unsched_size = lock(&self.unscheduled).queue.len();
        if unsched_size > 0
            && sched.core.live_input_count.load(Ordering::Acquire) == unsched_size
        {
            debug!(entries = unsched_size, "moving entire unscheduled pool to ready queues");
            {
                let mut pool = lock(&self.unscheduled);
                while let Some(idx) = pool.queue.pop() {
                    inputs_to_add.push(idx);
                }
            }
            for &idx in &inputs_to_add {
                lock(&sched.core.inputs[idx]).unscheduled = false;
            }
        }

        let live_inputs = sched.core.live_input_count.load(Ordering::Acquire);
        let live_outputs = sched.core.outputs.iter().filter(|o| o.is_active()).count();
        if live_outputs == 0 {
            return match inputs_to_add.first() {
                Some(&input) => Err(SchedulerError::ImpossibleBinding { input }),
                None => Ok(()),
            };
        }
        let avg = live_inputs as f64 / live_outputs as f64;
        let ceil = avg.ceil() as usize;
        let floor = avg.floor() as usize;
        let mut iteration = 0;
        loop {
            trace!(
                iteration,
                pending = inputs_to_add.len(),
                avg,
                floor,
                ceil,
                "rebalance pass"
            );
            for i in 0..sched.core.outputs.len() {
                if !sched.core.outputs[i].is_active() {
                    continue;
                }
                let mut rq = lock(&sched.core.outputs[i].ready_queue);
                // Shed only on the first pass; later passes may exceed the
                // ceiling because of binding constraints. Shedding pops from
                // the back so next-to-run entries keep their position.
                while iteration == 0 && rq.queue.len() > ceil {
                    let popped =
                        self.pop_from_ready_queue_hold_locks(sched, i, None, &mut rq, true);
                    match popped.input {
                        Some(idx) => {
                            trace!(output = i, input = idx, "rebalance: shedding");
                            inputs_to_add.push(idx);
                        }
                        // Only blocked entries left: they stay put.
                        None => break,
                    }
                }
                let mut incompatible = Vec::new();
                while rq.queue.len() < ceil || iteration > 1 {
                    let Some(ordinal) = inputs_to_add.pop() else {
                        break;
                    };
                    let mut inp = lock(&sched.core.inputs[ordinal]);
                    if inp.binding_allows(i) {
                        trace!(output = i, input = ordinal, "rebalance: taking");
                        self.add_to_ready_queue_hold_locks(i, &mut rq, &mut inp);
                    } else {
                        incompatible.push(ordinal);
                    }
                }
                inputs_to_add.extend(incompatible);
            }
            iteration += 1;
            if iteration >= 3 && !inputs_to_add.is_empty() {
                // Possible with bindings limited to inactive outputs.
                warn!(stranded = inputs_to_add.len(), "rebalance hit impossible binding");
                return Err(SchedulerError::ImpossibleBinding { input: inputs_to_add[0] });
            }
            if inputs_to_add.is_empty() {
                return Ok(());
            }
        }
    }

    /// Whether the just-finished syscall should block the input.
    ///
    /// The caller must hold the input's lock.
    fn syscall_incurs_switch(&self, sched: &SchedulerImpl, input: &InputState) -> (bool, u64) {
        let opts = &sched.core.options;
        let post_time = input.reader.last_timestamp();
        if input.reader.version() < TRACE_VERSION_FREQUENT_TIMESTAMPS {
            // Legacy trace without syscall-bracketing timestamps: treat every
            // maybe-blocking syscall as blocking with a fixed duration.
            return (
                input.processing_maybe_blocking_syscall,
                sched.scale_blocked_time(opts.blocking_switch_threshold),
            );
        }
        let latency = post_time.saturating_sub(input.pre_syscall_timestamp);
        let threshold = if input.processing_maybe_blocking_syscall {
            opts.blocking_switch_threshold
        } else {
            opts.syscall_switch_threshold
        };
        let blocked_time = sched.scale_blocked_time(latency);
        trace!(
            input = input.index,
            latency,
            threshold,
            blocked_time,
            maybe_blocking = input.processing_maybe_blocking_syscall,
            "syscall latency check"
        );
        (latency >= threshold, blocked_time)
    }

    /// Unschedule the input, indefinitely or with a timeout.
    ///
    /// The caller must hold the input's lock.
    fn apply_unschedule(&self, sched: &SchedulerImpl, output: OutputIndex, input: &mut InputState) {
        if input.skip_next_unscheduled {
            // The modeled kernel holds at most one pending request; a prior
            // schedule request consumes this unschedule.
            input.skip_next_unscheduled = false;
            trace!(input = input.index, "unschedule ignored due to prior schedule request");
            return;
        }
        let opts = &sched.core.options;
        input.unscheduled = true;
        if !opts.honor_infinite_timeouts && input.syscall_timeout_arg == 0 {
            input.syscall_timeout_arg = opts.block_time_max_us.max(1);
        }
        if input.syscall_timeout_arg > 0 {
            // Clamp at 1: 0 means an infinite timeout for unscheduled inputs.
            input.blocked_time = sched.scale_blocked_time(input.syscall_timeout_arg).max(1);
            input.blocked_start_time = sched.output_time(output);
            trace!(input = input.index, blocked = input.blocked_time, "unscheduled with timeout");
        } else {
            trace!(input = input.index, "unscheduled indefinitely");
        }
    }

    /// Apply a marker's stateful effects. The caller holds the input's lock.
    ///
    /// Returns a `SyscallSchedule` target to wake once the lock is dropped.
    fn process_marker(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        local: &mut OutputLocal,
        input: &mut InputState,
        kind: MarkerKind,
        value: u64,
    ) -> Option<InputIndex> {
        let opts = &sched.core.options;
        match kind {
            MarkerKind::Syscall => {
                input.processing_syscall = true;
                input.pre_syscall_timestamp = input.reader.last_timestamp();
            }
            MarkerKind::MaybeBlockingSyscall => {
                input.processing_maybe_blocking_syscall = true;
                // Usually the timestamp came with a just-prior syscall
                // marker; synthetic sequences may have only the maybe.
                input.pre_syscall_timestamp = input.reader.last_timestamp();
            }
            MarkerKind::ContextSwitchStart => local.in_context_switch_code = true,
            // The end marker itself is still inside switch code; clear on the
            // next record.
            MarkerKind::ContextSwitchEnd => local.hit_switch_code_end = true,
            MarkerKind::SyscallTraceStart => local.in_syscall_code = true,
            MarkerKind::SyscallTraceEnd => local.hit_syscall_code_end = true,
            MarkerKind::Timestamp => {
                // Injected syscall sequences carry no timestamps.
                debug_assert!(!local.in_syscall_code);
            }
            MarkerKind::SyscallArgTimeout => {
                // Cleared at the post-syscall instruction.
                input.syscall_timeout_arg = value;
            }
            MarkerKind::DirectThreadSwitch => {
                if !opts.honor_direct_switches {
                    return None;
                }
                sched.core.outputs[output].stats.bump(StatKind::DirectSwitchAttempts);
                let target_tid = value as i64;
                match sched.core.tid2input.get(&(input.workload, target_tid)) {
                    Some(&target) => input.switch_to_input = Some(target),
                    None => {
                        warn!(tid = target_tid, "no input for direct switch target");
                    }
                }
                self.apply_unschedule(sched, output, input);
            }
            MarkerKind::SyscallUnschedule => {
                if !opts.honor_direct_switches {
                    return None;
                }
                self.apply_unschedule(sched, output, input);
            }
            MarkerKind::SyscallSchedule => {
                if !opts.honor_direct_switches {
                    return None;
                }
                let target_tid = value as i64;
                match sched.core.tid2input.get(&(input.workload, target_tid)) {
                    Some(&target) => {
                        trace!(input = input.index, wake = target, "re-schedule request");
                        return Some(target);
                    }
                    None => {
                        warn!(tid = target_tid, "no input for re-schedule target");
                    }
                }
            }
            _ => {}
        }
        None
    }
}

impl SchedulingMode for DynamicMode {
    fn set_initial_schedule(&self, sched: &SchedulerImpl) -> Result<()> {
        let core = &sched.core;
        if core.options.deps == crate::options::DependencyMode::Timestamps {
            // Base timestamp per workload: the min first timestamp, so inputs
            // from different workloads mix by relative age.
            for (w, workload) in core.workloads.iter().enumerate() {
                let mut min_time = u64::MAX;
                for &i in &workload.inputs {
                    min_time = min_time.min(lock(&core.inputs[i]).next_timestamp);
                }
                if workload.inputs.is_empty() {
                    return Err(SchedulerError::param(format!("workload {w} has no inputs")));
                }
                for &i in &workload.inputs {
                    let mut inp = lock(&core.inputs[i]);
                    inp.base_timestamp = min_time;
                    inp.order_by_timestamp = true;
                }
            }
        }
        // Sort all inputs by priority and relative time, then deal them
        // round-robin, taking the first binding where one exists. Imperfect
        // with many bindings or output limits; the rebalance below corrects.
        let mut allq: IndexedPriorityQueue<InputIndex, ReadyKey> = IndexedPriorityQueue::new();
        for i in 0..core.inputs.len() {
            let mut inp = lock(&core.inputs[i]);
            inp.queue_counter = i as u64;
            let key = inp.ready_key(inp.queue_counter);
            allq.push(i, key);
        }
        let mut rr_output = 0;
        while let Some(idx) = allq.pop() {
            let target = {
                let inp = lock(&core.inputs[idx]);
                match inp.binding.iter().next() {
                    Some(&bound) => bound,
                    None => {
                        let t = rr_output;
                        rr_output = (rr_output + 1) % core.outputs.len();
                        t
                    }
                }
            };
            self.add_to_ready_queue(sched, target, idx);
        }
        self.rebalance_queues(sched, 0, Vec::new())
            .map_err(|e| SchedulerError::param(format!("initial rebalance failed: {e}")))?;
        for i in 0..core.outputs.len() {
            let mut local = lock(&core.outputs[i].local);
            let popped = self.pop_from_ready_queue(sched, i, Some(i));
            match popped.input {
                Some(idx) => sched.set_cur_input(i, &mut local, Some(idx))?,
                None => {
                    // Try to steal: the round-robin layout above ignores
                    // output limits and other pop-time constraints.
                    match self.eof_or_idle_for_mode(sched, i, &mut local, None)? {
                        EofOrIdle::Stole => {}
                        _ => sched.set_cur_input(i, &mut local, None)?,
                    }
                }
            }
        }
        Ok(())
    }

    fn swap_out_input(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        input: InputIndex,
    ) -> Result<()> {
        let (at_eof, workload) = {
            let inp = lock(&sched.core.inputs[input]);
            debug_assert!(inp.cur_output.is_none());
            (inp.at_eof, inp.workload)
        };
        // Once on the queue others can see and pop it.
        if !at_eof {
            self.add_to_ready_queue(sched, output, input);
        }
        let wl = &sched.core.workloads[workload];
        if wl.output_limit > 0 {
            wl.live_output_count.fetch_sub(1, Ordering::Release);
        }
        Ok(())
    }

    fn swap_in_input(
        &self,
        sched: &SchedulerImpl,
        _output: OutputIndex,
        input: InputIndex,
    ) -> Result<()> {
        let workload = lock(&sched.core.inputs[input]).workload;
        let wl = &sched.core.workloads[workload];
        if wl.output_limit > 0 {
            wl.live_output_count.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    fn pick_next_input_for_mode(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        local: &mut OutputLocal,
        blocked_time: u64,
        prev_index: Option<InputIndex>,
    ) -> Result<Pick> {
        let core = &sched.core;
        let cur_time = sched.output_time(output);

        // Rebalance check, guarded against time regression.
        let last = self.last_rebalance_time.load(Ordering::Acquire);
        if last == 0 {
            self.last_rebalance_time.store(cur_time, Ordering::Release);
        } else if cur_time > last
            && cur_time - last >= core.options.us_to_time_units(core.options.rebalance_period_us)
            && self.rebalancer.load(Ordering::Acquire) == 0
        {
            debug!(output, time = cur_time, last, "rebalance period elapsed");
            self.rebalance_queues(sched, output, Vec::new())?;
        }

        // Record the outgoing input's block time.
        if blocked_time > 0 {
            if let Some(prev) = prev_index {
                let mut pin = lock(&core.inputs[prev]);
                if pin.blocked_time == 0 {
                    trace!(output, input = prev, blocked_time, "blocking outgoing input");
                    pin.blocked_time = blocked_time;
                    pin.blocked_start_time = cur_time;
                }
            }
        }

        let mut index: Option<InputIndex> = None;

        // Direct switch: consume the outgoing input's target hint.
        let target = prev_index.and_then(|prev| lock(&core.inputs[prev]).switch_to_input.take());
        if let Some(t) = target {
            let containing = lock(&core.inputs[t]).containing_output;
            if let Some(t_out) = containing {
                // Lock order: the target's output queue, then the target.
                let mut rq = lock(&core.outputs[t_out].ready_queue);
                let mut tin = lock(&core.inputs[t]);
                if rq.queue.contains(&t) {
                    rq.queue.erase(&t);
                    if tin.blocked_time > 0 {
                        rq.num_blocked = rq.num_blocked.saturating_sub(1);
                        tin.blocked_time = 0;
                        tin.unscheduled = false;
                    }
                    if tin.containing_output != Some(output) {
                        core.outputs[output].stats.bump(StatKind::Migrations);
                    }
                    core.outputs[output].stats.bump(StatKind::DirectSwitchSuccesses);
                    debug!(output, from = ?prev_index, to = t, "direct switch");
                    index = Some(t);
                }
                // Else the target is actively running elsewhere.
            }
            if index.is_none() {
                let mut tin = lock(&core.inputs[t]);
                let mut pool = lock(&self.unscheduled);
                if pool.queue.contains(&t) {
                    tin.unscheduled = false;
                    pool.queue.erase(&t);
                    if tin.prev_output.is_some() && tin.prev_output != Some(output) {
                        core.outputs[output].stats.bump(StatKind::Migrations);
                    }
                    core.outputs[output].stats.bump(StatKind::DirectSwitchSuccesses);
                    debug!(output, to = t, "direct switch from unscheduled pool");
                    index = Some(t);
                }
                drop(pool);
                if index.is_none() {
                    // The target runs elsewhere: treat this as a dynamic
                    // switch to whoever is available, but make sure the
                    // missed target does not wait indefinitely.
                    debug!(missed = t, "direct switch target is running elsewhere");
                    tin.skip_next_unscheduled = true;
                }
            }
        }

        if let Some(idx) = index {
            return Ok(Pick::Input(idx));
        }

        if self.ready_queue_empty(sched, output) && blocked_time == 0 {
            // Nothing else to run: stick with the current input or go
            // idle/eof.
            let Some(prev) = prev_index else {
                return self.eof_or_idle_as_pick(sched, output, local, prev_index);
            };
            let pin = lock(&core.inputs[prev]);
            if pin.at_eof || pin.unscheduled {
                drop(pin);
                return self.eof_or_idle_as_pick(sched, output, local, prev_index);
            }
            return Ok(Pick::Input(prev));
        }

        // Give up the input before going to the queue so we are visible in
        // it ourselves; FIFO order then switches us out for an equal-priority
        // waiter.
        sched.set_cur_input(output, local, None)?;
        let popped = self.pop_from_ready_queue(sched, output, Some(output));
        match popped.input {
            Some(idx) => Ok(Pick::Input(idx)),
            None if popped.only_blocked => {
                if core.is_recording() {
                    sched.record_idle_segment(output);
                }
                Ok(Pick::Idle)
            }
            None => self.eof_or_idle_as_pick(sched, output, local, prev_index),
        }
    }

    fn check_for_input_switch(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        local: &mut OutputLocal,
        record: &TraceRecord,
        input: &mut InputState,
        cur_time: u64,
    ) -> Result<SwitchDecision> {
        let opts = &sched.core.options;
        let out = &sched.core.outputs[output];
        let mut decision = SwitchDecision::default();

        // Post-syscall switching, delayed to the next instruction boundary
        // and past any injected syscall code.
        if (input.processing_syscall || input.processing_maybe_blocking_syscall)
            && record.is_instr_boundary()
            && !local.in_syscall_code
        {
            if input.switch_to_input.is_some() {
                // The switch request overrides any latency threshold.
                decision.need_new_input = true;
                trace!(output, input = input.index, "direct switch on syscall boundary");
            } else if input.blocked_time > 0 {
                // Another path already decided this input should block.
                decision.need_new_input = true;
                decision.blocked_time = input.blocked_time;
            } else if input.unscheduled {
                decision.need_new_input = true;
                trace!(output, input = input.index, "input going unscheduled");
            } else {
                let (switches, blocked_time) = self.syscall_incurs_switch(sched, input);
                if switches {
                    decision.need_new_input = true;
                    decision.blocked_time = blocked_time;
                    trace!(output, input = input.index, "blocking syscall");
                }
            }
            input.clear_syscall_state();
        }

        if local.hit_switch_code_end {
            // Delayed so the end marker itself still counts as switch code.
            local.in_context_switch_code = false;
            local.hit_switch_code_end = false;
            // Back on the clock.
            if opts.quantum_unit == QuantumUnit::Time {
                input.prev_time_in_quantum = cur_time;
            }
        }
        if local.hit_syscall_code_end {
            local.in_syscall_code = false;
            local.hit_syscall_code_end = false;
            if opts.quantum_unit == QuantumUnit::Time {
                input.prev_time_in_quantum = cur_time;
            }
        }

        if let Some((kind, value)) = record.as_marker() {
            decision.deferred_schedule =
                self.process_marker(sched, output, local, input, kind, value);
        }

        if opts.quantum_unit == QuantumUnit::Instructions {
            if record.is_instr_boundary() && !local.in_context_switch_code {
                input.instrs_in_quantum += 1;
                if input.instrs_in_quantum > opts.quantum_duration_instrs {
                    if local.in_syscall_code {
                        trace!(
                            output,
                            input = input.index,
                            "delaying quantum preempt inside syscall code"
                        );
                    } else {
                        // Prefer a switch even if this input has the oldest
                        // timestamp: switch rate beats timestamp order.
                        trace!(output, input = input.index, "instr quantum expired");
                        decision.preempt = true;
                        decision.need_new_input = true;
                        input.instrs_in_quantum = 0;
                        out.stats.bump(StatKind::QuantumPreempts);
                    }
                }
            }
        } else if opts.quantum_unit == QuantumUnit::Time && opts.time_units_per_us > 0.0 {
            if cur_time == 0 || cur_time < input.prev_time_in_quantum {
                warn!(
                    output,
                    cur_time,
                    prev = input.prev_time_in_quantum,
                    "non-monotone simulation time"
                );
                return Err(SchedulerError::Invalid("simulation time went backward".into()));
            }
            input.time_spent_in_quantum += cur_time - input.prev_time_in_quantum;
            input.prev_time_in_quantum = cur_time;
            let elapsed_us = input.time_spent_in_quantum as f64 / opts.time_units_per_us;
            if elapsed_us >= opts.quantum_duration_us as f64
                // Switches happen on instruction boundaries only.
                && record.is_instr_boundary()
            {
                if local.in_syscall_code {
                    trace!(
                        output,
                        input = input.index,
                        "delaying quantum preempt inside syscall code"
                    );
                } else {
                    trace!(output, input = input.index, "time quantum expired");
                    decision.preempt = true;
                    decision.need_new_input = true;
                    input.time_spent_in_quantum = 0;
                    out.stats.bump(StatKind::QuantumPreempts);
                }
            }
        }
        Ok(decision)
    }

    fn apply_deferred_schedule(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        target: InputIndex,
    ) -> Result<()> {
        let core = &sched.core;
        let mut tin = lock(&core.inputs[target]);
        if tin.at_eof {
            trace!(wake = target, "re-schedule target at eof; ignoring");
            return Ok(());
        }
        if !tin.unscheduled {
            // Already scheduled: consume the next unschedule instead.
            trace!(wake = target, "re-schedule target will skip next unschedule");
            tin.skip_next_unscheduled = true;
            return Ok(());
        }
        tin.unscheduled = false;
        let on_pool = {
            let mut pool = lock(&self.unscheduled);
            pool.queue.erase(&target)
        };
        if on_pool {
            let resume = tin.prev_output.unwrap_or(output);
            // No locks may be held across add_to_ready_queue. The input is
            // on no queue at this point, so a competing schedule request
            // finds nothing to do until it lands on the new queue.
            drop(tin);
            self.add_to_ready_queue(sched, resume, target);
            return Ok(());
        }
        // Unscheduled with a timeout: it sits on a ready queue; erase the
        // remaining block time so it runs promptly.
        if tin.blocked_time > 0 {
            let t_out = tin.containing_output;
            match t_out {
                Some(to) => {
                    drop(tin);
                    let mut rq = lock(&core.outputs[to].ready_queue);
                    let mut tin2 = lock(&core.inputs[target]);
                    if rq.queue.contains(&target) {
                        rq.num_blocked = rq.num_blocked.saturating_sub(1);
                    }
                    // Cleared under the queue lock to synchronize with pops.
                    tin2.blocked_time = 0;
                }
                // Mid-rebalance: no owner.
                None => tin.blocked_time = 0,
            }
        }
        Ok(())
    }

    fn eof_or_idle_for_mode(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        local: &mut OutputLocal,
        _prev_input: Option<InputIndex>,
    ) -> Result<EofOrIdle> {
        let core = &sched.core;
        let live = core.live_input_count.load(Ordering::Acquire);
        if live == 0 {
            return Ok(EofOrIdle::Eof);
        }
        if (live as f64) <= core.inputs.len() as f64 * core.options.exit_if_fraction_inputs_left
        {
            debug!(output, live, "exiting early with few live inputs left");
            return Ok(EofOrIdle::Eof);
        }
        // Before going idle, try to steal work, starting at output+1 so the
        // low-ordinal outputs are not everyone's victim. One attempt per
        // transition to idle; rebalancing takes over after that.
        if !local.tried_to_steal_on_idle {
            local.tried_to_steal_on_idle = true;
            for i in 1..core.outputs.len() {
                let target = (output + i) % core.outputs.len();
                let popped = self.pop_from_ready_queue(sched, target, Some(output));
                if let Some(idx) = popped.input {
                    sched.set_cur_input(output, local, Some(idx))?;
                    core.outputs[output].stats.bump(StatKind::RunqueueSteals);
                    debug!(output, input = idx, from = target, "stole input on idle");
                    return Ok(EofOrIdle::Stole);
                }
            }
            trace!(output, "found nothing to steal");
        }
        Ok(EofOrIdle::Idle)
    }

    fn set_output_active(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        local: &mut OutputLocal,
        active: bool,
    ) -> Result<()> {
        let out = &sched.core.outputs[output];
        if out.active.load(Ordering::Acquire) == active {
            return Ok(());
        }
        out.active.store(active, Ordering::Release);
        debug!(output, active, "output activity changed");
        let mut ordinals = Vec::new();
        if !active {
            // Hand the current input and the whole queue to other outputs.
            if let Some(cur) = local.cur_input {
                {
                    let mut inp = lock(&sched.core.inputs[cur]);
                    if inp.queue.is_empty() {
                        // Not sitting on a just-read undelivered record.
                        inp.switching_pre_instruction = true;
                    }
                }
                sched.set_cur_input(output, local, None)?;
            }
            let mut rq = lock(&out.ready_queue);
            while let Some(idx) = rq.queue.pop() {
                ordinals.push(idx);
            }
            rq.num_blocked = 0;
        } else {
            local.waiting = true;
        }
        self.rebalance_queues(sched, output, ordinals)
    }
}

impl DynamicMode {
    fn eof_or_idle_as_pick(
        &self,
        sched: &SchedulerImpl,
        output: OutputIndex,
        local: &mut OutputLocal,
        prev_input: Option<InputIndex>,
    ) -> Result<Pick> {
        match self.eof_or_idle_for_mode(sched, output, local, prev_input)? {
            EofOrIdle::Eof => Ok(Pick::Eof),
            EofOrIdle::Idle => Ok(Pick::Idle),
            // The steal installed the stolen input as cur_input.
            EofOrIdle::Stole => match local.cur_input {
                Some(idx) => Ok(Pick::Input(idx)),
                None => Ok(Pick::Idle),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::output::StatKind;
    use crate::{
        InputSpec, Poll, Scheduler, SchedulerError, SchedulerOptions, Stream, WorkloadSpec,
    };
    use trace_model::{MarkerKind, TraceBuilder, TraceRecord, VecReader};

    fn input(tid: i64, records: Vec<TraceRecord>) -> InputSpec {
        InputSpec::new(Box::new(VecReader::new(format!("t{tid}"), records)), tid)
    }

    /// Opt into scheduler logs via RUST_LOG when debugging a test.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    /// Options tuned so tests finish: 1:1 time scale and fast unblocks.
    fn test_options() -> SchedulerOptions {
        SchedulerOptions {
            time_units_per_us: 1.0,
            block_time_multiplier: 1.0,
            block_time_max_us: 1,
            ..Default::default()
        }
    }

    /// Drive to EOF, collecting (input, record) pairs; panics if the stream
    /// idles forever.
    fn drain(stream: &mut Stream) -> Vec<(usize, TraceRecord)> {
        let mut out = Vec::new();
        let mut spins = 0;
        loop {
            match stream.next_record(0).unwrap() {
                Poll::Record(rec) => {
                    spins = 0;
                    out.push((stream.input_ordinal().unwrap(), rec));
                }
                Poll::Eof => return out,
                Poll::Idle | Poll::Wait => {
                    spins += 1;
                    assert!(spins < 10_000, "stream idled forever");
                }
            }
        }
    }

    fn instr_inputs(records: &[(usize, TraceRecord)]) -> Vec<usize> {
        records
            .iter()
            .filter(|(_, r)| r.is_instr())
            .map(|(i, _)| *i)
            .collect()
    }

    #[test]
    fn test_single_input_runs_to_eof() {
        init_tracing();
        let trace = TraceBuilder::new(100, 10).instrs(100).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(100, trace)])],
            1,
            test_options(),
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let mut instrs = 0;
        loop {
            match stream.next_record(0).unwrap() {
                Poll::Record(rec) => {
                    if rec.is_instr() {
                        instrs += 1;
                        assert_eq!(stream.instruction_ordinal(), instrs);
                    }
                }
                Poll::Eof => break,
                other => panic!("unexpected poll {other:?}"),
            }
        }
        assert_eq!(instrs, 100);
        assert_eq!(stream.instruction_ordinal(), 100);
        // A drained stream stays at EOF.
        assert_eq!(stream.next_record(0).unwrap(), Poll::Eof);
    }

    #[test]
    fn test_instr_quantum_round_robin() {
        let mut options = test_options();
        options.quantum_duration_instrs = 3;
        let a = TraceBuilder::new(1, 10).instrs(9).exit();
        let b = TraceBuilder::new(2, 10).instrs(9).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a), input(2, b)])],
            1,
            options,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let records = drain(&mut stream);
        let pattern = instr_inputs(&records);
        assert_eq!(
            pattern,
            vec![0, 0, 0, 1, 1, 1, 0, 0, 0, 1, 1, 1, 0, 0, 0, 1, 1, 1]
        );
        assert_eq!(stream.schedule_statistic(StatKind::QuantumPreempts), 4);
    }

    #[test]
    fn test_direct_switch_success() {
        let a = TraceBuilder::new(1, 100)
            .instrs(2)
            .timestamp(200)
            .marker(MarkerKind::Syscall, 39)
            .marker(MarkerKind::DirectThreadSwitch, 2)
            .timestamp(210)
            .instrs(2)
            .exit();
        let b = TraceBuilder::new(2, 100).instrs(3).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a), input(2, b)])],
            1,
            test_options(),
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let records = drain(&mut stream);
        let pattern = instr_inputs(&records);
        // A's two pre-syscall instructions, then B via the direct switch,
        // then A's post-syscall remainder once its block expires.
        assert_eq!(pattern, vec![0, 0, 1, 1, 1, 0, 0]);
        assert_eq!(stream.schedule_statistic(StatKind::DirectSwitchAttempts), 1);
        assert_eq!(stream.schedule_statistic(StatKind::DirectSwitchSuccesses), 1);
        assert_eq!(stream.schedule_statistic(StatKind::Migrations), 0);
    }

    #[test]
    fn test_unschedule_and_reschedule() {
        let mut options = test_options();
        options.honor_infinite_timeouts = true;
        let a = TraceBuilder::new(1, 100)
            .instrs(1)
            .timestamp(200)
            .marker(MarkerKind::Syscall, 202)
            .marker(MarkerKind::SyscallUnschedule, 0)
            .timestamp(210)
            .instrs(3)
            .exit();
        // B wakes A partway through its own run.
        let b = TraceBuilder::new(2, 100)
            .instrs(2)
            .marker(MarkerKind::SyscallSchedule, 1)
            .instrs(2)
            .exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a), input(2, b)])],
            1,
            options,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let records = drain(&mut stream);
        let pattern = instr_inputs(&records);
        // A runs 1 instr, unschedules; B runs fully; A resumes.
        assert_eq!(pattern, vec![0, 1, 1, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn test_unschedule_without_reschedule_idles() {
        let mut options = test_options();
        options.honor_infinite_timeouts = true;
        let a = TraceBuilder::new(1, 100)
            .instrs(1)
            .timestamp(200)
            .marker(MarkerKind::Syscall, 202)
            .marker(MarkerKind::SyscallUnschedule, 0)
            .timestamp(210)
            .instrs(3)
            .exit();
        let b = TraceBuilder::new(2, 100).instrs(2).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a), input(2, b)])],
            1,
            options,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let mut idles = 0;
        for _ in 0..200 {
            match stream.next_record(0).unwrap() {
                Poll::Idle => idles += 1,
                Poll::Record(_) => assert_eq!(idles, 0, "no records after going idle"),
                Poll::Eof => panic!("must not report eof while an input is unscheduled"),
                Poll::Wait => {}
            }
        }
        assert!(idles > 0);
    }

    #[test]
    fn test_exit_fraction_cuts_idle_tail() {
        let mut options = test_options();
        options.honor_infinite_timeouts = true;
        options.exit_if_fraction_inputs_left = 0.5;
        let a = TraceBuilder::new(1, 100)
            .instrs(1)
            .timestamp(200)
            .marker(MarkerKind::Syscall, 202)
            .marker(MarkerKind::SyscallUnschedule, 0)
            .timestamp(210)
            .instrs(3)
            .exit();
        let b = TraceBuilder::new(2, 100).instrs(2).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a), input(2, b)])],
            1,
            options,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        // With half the inputs stuck unscheduled, the stream ends instead of
        // idling forever.
        let records = drain(&mut stream);
        assert_eq!(instr_inputs(&records), vec![0, 1, 1]);
    }

    #[test]
    fn test_blocked_syscall_expiry() {
        let mut options = test_options();
        options.blocking_switch_threshold = 100;
        options.block_time_max_us = 1_000_000;
        let a = TraceBuilder::new(1, 100)
            .instrs(1)
            .syscall(0, true, 1000, 1200)
            .instrs(1)
            .exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a)])],
            1,
            options,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        // Pre-switch records at t=500.
        let mut saw_instr = false;
        loop {
            match stream.next_record(500).unwrap() {
                Poll::Record(r) if r.is_instr() && saw_instr => {
                    panic!("second instr must wait for the block to expire")
                }
                Poll::Record(r) if r.is_instr() => saw_instr = true,
                Poll::Record(_) => {}
                Poll::Idle => break,
                other => panic!("unexpected poll {other:?}"),
            }
        }
        // Latency 200us * multiplier 1 = 200 units from t=500: still blocked.
        assert_eq!(stream.next_record(600).unwrap(), Poll::Idle);
        // Expired: the post-syscall instruction arrives.
        match stream.next_record(800).unwrap() {
            Poll::Record(r) => assert!(r.is_instr()),
            other => panic!("expected the post-syscall instr, got {other:?}"),
        }
    }

    #[test]
    fn test_legacy_trace_blocks_every_maybe_blocking_syscall() {
        let a_records = TraceBuilder::with_version(1, 100, 5)
            .instrs(1)
            .syscall(0, true, 1000, 1001)
            .instrs(2)
            .exit();
        let b_records = TraceBuilder::with_version(2, 100, 5).instrs(2).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![
                input(1, a_records),
                input(2, b_records),
            ])],
            1,
            test_options(),
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let records = drain(&mut stream);
        // Even a 1us latency switches on a legacy trace.
        assert_eq!(instr_inputs(&records), vec![0, 1, 1, 0, 0]);
    }

    #[test]
    fn test_current_trace_ignores_fast_syscall() {
        let a_records = TraceBuilder::new(1, 100)
            .instrs(1)
            .syscall(0, true, 1000, 1001)
            .instrs(2)
            .exit();
        let b_records = TraceBuilder::new(2, 100).instrs(2).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![
                input(1, a_records),
                input(2, b_records),
            ])],
            1,
            test_options(),
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let records = drain(&mut stream);
        // 1us latency is under the 500us threshold: A keeps the core.
        assert_eq!(instr_inputs(&records), vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_time_quantum_preempts() {
        let mut options = test_options();
        options.quantum_unit = crate::QuantumUnit::Time;
        options.quantum_duration_us = 10;
        let a = TraceBuilder::new(1, 10).instrs(10).exit();
        let b = TraceBuilder::new(2, 10).instrs(10).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a), input(2, b)])],
            1,
            options,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let mut t = 100;
        let mut inputs_seen = std::collections::BTreeSet::new();
        loop {
            t += 3;
            match stream.next_record(t).unwrap() {
                Poll::Record(r) => {
                    if r.is_instr() {
                        inputs_seen.insert(stream.input_ordinal().unwrap());
                    }
                }
                Poll::Eof => break,
                _ => {}
            }
        }
        assert_eq!(inputs_seen.len(), 2);
        assert!(stream.schedule_statistic(StatKind::QuantumPreempts) >= 1);
    }

    #[test]
    fn test_time_regression_is_invalid() {
        let mut options = test_options();
        options.quantum_unit = crate::QuantumUnit::Time;
        options.quantum_duration_us = 1000;
        let a = TraceBuilder::new(1, 10).instrs(10).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a)])],
            1,
            options,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        assert!(matches!(stream.next_record(100), Ok(Poll::Record(_))));
        assert!(matches!(
            stream.next_record(50),
            Err(SchedulerError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_time_units_disables_time_quantum() {
        let mut options = test_options();
        options.quantum_unit = crate::QuantumUnit::Time;
        options.quantum_duration_us = 1;
        options.time_units_per_us = 0.0;
        let a = TraceBuilder::new(1, 10).instrs(20).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a)])],
            1,
            options,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let records = drain(&mut stream);
        assert_eq!(records.iter().filter(|(_, r)| r.is_instr()).count(), 20);
        assert_eq!(stream.schedule_statistic(StatKind::QuantumPreempts), 0);
    }

    #[test]
    fn test_steal_on_idle() {
        let mut options = test_options();
        options.migration_threshold_us = 0;
        let traces: Vec<_> = (1..=3)
            .map(|tid| input(tid, TraceBuilder::new(tid, 10).instrs(4).exit()))
            .collect();
        let sched = Scheduler::new(vec![WorkloadSpec::new(traces)], 2, options).unwrap();
        // Round-robin init: inputs 0 and 2 on output 0, input 1 on output 1.
        let mut s1 = sched.stream(1).unwrap();
        let mut pattern = Vec::new();
        let mut spins = 0;
        // Output 1 finishes input 1, then steals input 2 from output 0.
        // Stop once the stolen input is fully consumed; input 0 still sits
        // on output 0 so this stream alone never reaches EOF.
        while pattern.len() < 8 {
            match s1.next_record(0).unwrap() {
                Poll::Record(rec) => {
                    spins = 0;
                    if rec.is_instr() {
                        pattern.push(s1.input_ordinal().unwrap());
                    }
                }
                Poll::Eof => break,
                _ => {
                    spins += 1;
                    assert!(spins < 100, "output 1 failed to steal");
                }
            }
        }
        assert_eq!(pattern, vec![1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(s1.schedule_statistic(StatKind::RunqueueSteals), 1);
    }

    #[test]
    fn test_workload_output_limit() {
        let mut options = test_options();
        options.block_time_max_us = 2_500;
        let a = TraceBuilder::new(1, 10).instrs(3).exit();
        let b = TraceBuilder::new(2, 10).instrs(3).exit();
        let workload =
            WorkloadSpec::new(vec![input(1, a), input(2, b)]).with_output_limit(1);
        let sched = Scheduler::new(vec![workload], 2, options).unwrap();
        let mut s0 = sched.stream(0).unwrap();
        let mut s1 = sched.stream(1).unwrap();
        // While input 0 runs on output 0, the limit keeps input 1 parked.
        assert_eq!(s1.next_record(0).unwrap(), Poll::Idle);
        assert!(s1.schedule_statistic(StatKind::HitOutputLimit) >= 1);
        // Drain output 0: input 0's records, then idle (input 1 is on
        // output 1's queue and the migration threshold fences stealing).
        let mut spins = 0;
        loop {
            match s0.next_record(0).unwrap() {
                Poll::Record(_) => spins = 0,
                Poll::Idle | Poll::Wait => {
                    spins += 1;
                    if spins > 3 {
                        break;
                    }
                }
                Poll::Eof => break,
            }
        }
        // The slot freed up: input 1 now runs on its own output.
        let records = drain(&mut s1);
        assert_eq!(instr_inputs(&records), vec![1, 1, 1]);
    }

    #[test]
    fn test_rebalance_after_reactivation() {
        let mut options = test_options();
        options.migration_threshold_us = 0;
        let traces: Vec<_> = (1..=6)
            .map(|tid| input(tid, TraceBuilder::new(tid, 10).instrs(5).exit()))
            .collect();
        let sched = Scheduler::new(vec![WorkloadSpec::new(traces)], 2, options).unwrap();
        let mut s0 = sched.stream(0).unwrap();
        let mut s1 = sched.stream(1).unwrap();
        // Deactivation hands output 1's work to output 0.
        s1.set_active(false).unwrap();
        assert_eq!(s1.next_record(0).unwrap(), Poll::Idle);
        // Reactivation rebalances a share back.
        s1.set_active(true).unwrap();
        // Drive both outputs side by side until each reports EOF.
        let mut r0 = Vec::new();
        let mut r1 = Vec::new();
        let (mut done0, mut done1) = (false, false);
        let mut spins = 0;
        while !(done0 && done1) {
            for (stream, records, done) in
                [(&mut s0, &mut r0, &mut done0), (&mut s1, &mut r1, &mut done1)]
            {
                if *done {
                    continue;
                }
                match stream.next_record(0).unwrap() {
                    Poll::Record(rec) => {
                        spins = 0;
                        records.push(rec);
                    }
                    Poll::Eof => *done = true,
                    _ => {
                        spins += 1;
                        assert!(spins < 10_000, "outputs idled forever");
                    }
                }
            }
        }
        assert!(
            r1.iter().any(|r| r.is_instr()),
            "reactivated output received work"
        );
        assert!(s1.schedule_statistic(StatKind::RunqueueRebalances) >= 2);
        // Nothing was lost across the shuffle.
        let total_instrs = r0.iter().chain(r1.iter()).filter(|r| r.is_instr()).count();
        assert_eq!(total_instrs, 30);
    }

    #[test]
    fn test_rebalance_period_triggers() {
        let mut options = test_options();
        options.quantum_duration_instrs = 2;
        options.rebalance_period_us = 10;
        let a = TraceBuilder::new(1, 10).instrs(12).exit();
        let b = TraceBuilder::new(2, 10).instrs(12).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a), input(2, b)])],
            1,
            options,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let mut t = 0;
        loop {
            t += 100;
            match stream.next_record(t).unwrap() {
                Poll::Eof => break,
                _ => {}
            }
        }
        assert!(stream.schedule_statistic(StatKind::RunqueueRebalances) >= 1);
    }

    #[test]
    fn test_impossible_binding() {
        let a = TraceBuilder::new(1, 10).instrs(3).exit();
        let b = TraceBuilder::new(2, 10).instrs(3).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![
                input(1, a).with_binding([0]),
                input(2, b).with_binding([0]),
            ])],
            2,
            test_options(),
        )
        .unwrap();
        let mut s0 = sched.stream(0).unwrap();
        // Deactivating the only output these inputs may run on leaves the
        // rebalancer nowhere to put them.
        assert!(matches!(
            s0.set_active(false),
            Err(SchedulerError::ImpossibleBinding { .. })
        ));
    }

    #[test]
    fn test_switch_sequence_injection() {
        let mut options = test_options();
        options.quantum_duration_instrs = 2;
        options.switch_sequence = vec![
            TraceRecord::marker(MarkerKind::ContextSwitchStart, 0),
            TraceRecord::instr(0xc000),
            TraceRecord::marker(MarkerKind::ContextSwitchEnd, 0),
        ];
        let a = TraceBuilder::new(1, 10).instrs(4).exit();
        let b = TraceBuilder::new(2, 10).instrs(4).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![input(1, a), input(2, b)])],
            1,
            options,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        let mut saw_switch_code = false;
        let mut spins = 0;
        loop {
            match stream.next_record(0).unwrap() {
                Poll::Record(rec) => {
                    spins = 0;
                    if rec.is_marker(MarkerKind::ContextSwitchStart) {
                        saw_switch_code = true;
                        assert!(stream.is_record_kernel());
                        assert!(stream.is_record_synthetic());
                    }
                }
                Poll::Eof => break,
                _ => {
                    spins += 1;
                    assert!(spins < 10_000, "stream idled forever");
                }
            }
        }
        assert!(saw_switch_code, "switch sequence was injected");
        // The injected instructions do not count toward the quantum, so the
        // trace instructions still alternate in pairs.
        assert!(stream.schedule_statistic(StatKind::QuantumPreempts) >= 2);
    }

    #[test]
    fn test_binding_respected_by_picker() {
        let mut options = test_options();
        options.migration_threshold_us = 0;
        let a = TraceBuilder::new(1, 10).instrs(4).exit();
        let b = TraceBuilder::new(2, 10).instrs(4).exit();
        let sched = Scheduler::new(
            vec![WorkloadSpec::new(vec![
                input(1, a).with_binding([1]),
                input(2, b).with_binding([1]),
            ])],
            2,
            options,
        )
        .unwrap();
        // Everything is bound to output 1; output 0 must never run anything.
        let mut s0 = sched.stream(0).unwrap();
        let mut s1 = sched.stream(1).unwrap();
        for _ in 0..5 {
            assert!(matches!(s0.next_record(0).unwrap(), Poll::Idle));
        }
        let records = drain(&mut s1);
        assert_eq!(records.iter().filter(|(_, r)| r.is_instr()).count(), 8);
        assert_eq!(s0.schedule_statistic(StatKind::RunqueueSteals), 0);
    }
}
