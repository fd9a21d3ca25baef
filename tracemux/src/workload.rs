//! Workload and input specifications
//!
//! What the embedding tool hands to [`crate::Scheduler::new`]: grouped inputs
//! with their scheduling modifiers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::AtomicUsize;
use trace_model::TraceReader;

/// Index of an input in the scheduler's input vector; stable identity.
pub type InputIndex = usize;
/// Index of an output (consumer stream / simulated core).
pub type OutputIndex = usize;

/// A 1-based inclusive instruction range of interest.
///
/// `stop == 0` means "until end of trace".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrRange {
    pub start: u64,
    pub stop: u64,
}

impl InstrRange {
    pub fn new(start: u64, stop: u64) -> Self {
        Self { start, stop }
    }
}

/// One recorded thread or shard handed to the scheduler.
pub struct InputSpec {
    /// The record source.
    pub reader: Box<dyn TraceReader>,
    /// Recorded thread id.
    pub tid: i64,
    /// Recorded process id.
    pub pid: i64,
    /// Higher runs first.
    pub priority: i32,
    /// Outputs this input may run on; empty means any.
    pub binding: BTreeSet<OutputIndex>,
    /// Ordered instruction ranges to keep; everything between is skipped.
    pub regions_of_interest: Vec<InstrRange>,
}

impl InputSpec {
    /// An unconstrained input around a reader.
    pub fn new(reader: Box<dyn TraceReader>, tid: i64) -> Self {
        Self {
            reader,
            tid,
            pid: 0,
            priority: 0,
            binding: BTreeSet::new(),
            regions_of_interest: Vec::new(),
        }
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Restrict which outputs may run this input.
    pub fn with_binding(mut self, outputs: impl IntoIterator<Item = OutputIndex>) -> Self {
        self.binding = outputs.into_iter().collect();
        self
    }

    /// Limit the trace to the given instruction ranges.
    pub fn with_regions(mut self, regions: Vec<InstrRange>) -> Self {
        self.regions_of_interest = regions;
        self
    }
}

/// A group of inputs sharing workload-scope controls.
pub struct WorkloadSpec {
    /// The inputs in this workload.
    pub inputs: Vec<InputSpec>,
    /// Max inputs of this workload running simultaneously; 0 = unlimited.
    pub output_limit: usize,
}

impl WorkloadSpec {
    pub fn new(inputs: Vec<InputSpec>) -> Self {
        Self { inputs, output_limit: 0 }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }
}

/// Live workload-scope scheduling state.
#[derive(Debug)]
pub(crate) struct WorkloadState {
    /// Read-only after init.
    pub output_limit: usize,
    /// Count of this workload's inputs currently running on outputs.
    pub live_output_count: AtomicUsize,
    /// Input ordinals belonging to this workload; read-only after init.
    pub inputs: Vec<InputIndex>,
}

impl WorkloadState {
    pub fn new(output_limit: usize, inputs: Vec<InputIndex>) -> Self {
        Self {
            output_limit,
            live_output_count: AtomicUsize::new(0),
            inputs,
        }
    }
}
