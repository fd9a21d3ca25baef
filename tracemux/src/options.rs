//! Scheduler configuration
//!
//! Options mirror the tuning surface of the dynamic scheduler; everything has
//! a default tuned for instruction-count simulation time.

use crate::error::{Result, SchedulerError};
use crate::schedule_file::{ArchiveReaderBox, ArchiveWriterBox};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How inputs are mapped onto outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MappingStrategy {
    /// Dynamic rescheduling: any input may run on any output.
    #[default]
    AnyOutput,
    /// Static assignment; each input stays on one output.
    ConsistentOutput,
    /// Follow the as-traced cpu placement.
    RecordedOutput,
    /// Deterministically replay a schedule recorded by a prior run.
    AsPreviously,
}

/// Cross-input ordering requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyMode {
    /// No ordering beyond per-input order.
    #[default]
    None,
    /// Honor trace-buffer timestamp ordering across inputs.
    Timestamps,
}

/// Unit for the preemption quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuantumUnit {
    /// Retired instruction count.
    #[default]
    Instructions,
    /// Simulation time supplied by the consumer.
    Time,
}

bitflags! {
    /// Behavior toggles that do not warrant their own option.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SchedulerFlags: u32 {
        /// Stream ordinals report the current input's ordinals rather than
        /// output-local counts.
        const USE_INPUT_ORDINALS = 1 << 0;
    }
}

/// Scheduler configuration
///
/// The serializable fields load from TOML the same way daemon configs do; the
/// archive stream handles are attached programmatically.
#[derive(Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// Input-to-output mapping strategy
    #[serde(default)]
    pub mapping: MappingStrategy,

    /// Cross-input dependency handling
    #[serde(default)]
    pub deps: DependencyMode,

    /// Quantum measurement unit
    #[serde(default)]
    pub quantum_unit: QuantumUnit,

    /// Quantum length in instructions (for [`QuantumUnit::Instructions`])
    #[serde(default = "default_quantum_instrs")]
    pub quantum_duration_instrs: u64,

    /// Quantum length in simulated microseconds (for [`QuantumUnit::Time`])
    #[serde(default = "default_quantum_us")]
    pub quantum_duration_us: u64,

    /// Simulation time units per microsecond; 0 disables time-based quanta
    #[serde(default = "default_time_units_per_us")]
    pub time_units_per_us: f64,

    /// Syscall latency (us) above which a maybe-blocking syscall switches
    #[serde(default = "default_blocking_switch_threshold")]
    pub blocking_switch_threshold: u64,

    /// Syscall latency (us) above which any syscall switches
    #[serde(default = "default_syscall_switch_threshold")]
    pub syscall_switch_threshold: u64,

    /// Multiplier applied to observed latency to derive block time
    #[serde(default = "default_block_time_multiplier")]
    pub block_time_multiplier: f64,

    /// Cap on any single block duration, in microseconds
    #[serde(default = "default_block_time_max_us")]
    pub block_time_max_us: u64,

    /// Minimum time (us) off an output before an input may migrate to another
    #[serde(default = "default_migration_threshold_us")]
    pub migration_threshold_us: u64,

    /// Period (us) between run-queue rebalances
    #[serde(default = "default_rebalance_period_us")]
    pub rebalance_period_us: u64,

    /// Exit once the live-input fraction drops below this
    #[serde(default)]
    pub exit_if_fraction_inputs_left: f64,

    /// Honor direct-switch and unschedule/schedule markers
    #[serde(default = "default_true")]
    pub honor_direct_switches: bool,

    /// Allow indefinite unscheduled waits (else clamp to `block_time_max_us`)
    #[serde(default)]
    pub honor_infinite_timeouts: bool,

    /// Pop a random ready entry instead of the best one (schedule fuzzing)
    #[serde(default)]
    pub randomize_next_input: bool,

    /// Behavior flag set
    #[serde(skip)]
    pub flags: SchedulerFlags,

    /// Record sequence injected at context switches, if any
    #[serde(skip)]
    pub switch_sequence: Vec<trace_model::TraceRecord>,

    /// Archive to record the dynamic schedule into
    #[serde(skip)]
    pub schedule_record_ostream: Option<ArchiveWriterBox>,

    /// Archive holding a previously recorded schedule to replay
    #[serde(skip)]
    pub schedule_replay_istream: Option<ArchiveReaderBox>,

    /// Archive holding the as-traced cpu schedule to replay
    #[serde(skip)]
    pub replay_as_traced_istream: Option<ArchiveReaderBox>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            mapping: MappingStrategy::default(),
            deps: DependencyMode::default(),
            quantum_unit: QuantumUnit::default(),
            quantum_duration_instrs: default_quantum_instrs(),
            quantum_duration_us: default_quantum_us(),
            time_units_per_us: default_time_units_per_us(),
            blocking_switch_threshold: default_blocking_switch_threshold(),
            syscall_switch_threshold: default_syscall_switch_threshold(),
            block_time_multiplier: default_block_time_multiplier(),
            block_time_max_us: default_block_time_max_us(),
            migration_threshold_us: default_migration_threshold_us(),
            rebalance_period_us: default_rebalance_period_us(),
            exit_if_fraction_inputs_left: 0.0,
            honor_direct_switches: true,
            honor_infinite_timeouts: false,
            randomize_next_input: false,
            flags: SchedulerFlags::empty(),
            switch_sequence: Vec::new(),
            schedule_record_ostream: None,
            schedule_replay_istream: None,
            replay_as_traced_istream: None,
        }
    }
}

fn default_quantum_instrs() -> u64 {
    10_000_000
}

fn default_quantum_us() -> u64 {
    5_000
}

fn default_time_units_per_us() -> f64 {
    100.0
}

fn default_blocking_switch_threshold() -> u64 {
    500
}

fn default_syscall_switch_threshold() -> u64 {
    30_000
}

fn default_block_time_multiplier() -> f64 {
    3.0
}

fn default_block_time_max_us() -> u64 {
    2_500
}

fn default_migration_threshold_us() -> u64 {
    500
}

fn default_rebalance_period_us() -> u64 {
    50_000
}

fn default_true() -> bool {
    true
}

impl SchedulerOptions {
    /// Load options from a TOML document.
    pub fn from_toml_str(doc: &str) -> Result<Self> {
        let options: SchedulerOptions =
            toml::from_str(doc).map_err(|e| SchedulerError::param(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Check option consistency; called by the scheduler constructor.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.exit_if_fraction_inputs_left) {
            return Err(SchedulerError::param(
                "exit_if_fraction_inputs_left must be within [0,1]",
            ));
        }
        if self.block_time_multiplier < 0.0 {
            return Err(SchedulerError::param("block_time_multiplier must be >= 0"));
        }
        if self.time_units_per_us < 0.0 {
            return Err(SchedulerError::param("time_units_per_us must be >= 0"));
        }
        if self.quantum_unit == QuantumUnit::Instructions && self.quantum_duration_instrs == 0 {
            return Err(SchedulerError::param("quantum_duration_instrs must be > 0"));
        }
        if self.quantum_unit == QuantumUnit::Time
            && self.quantum_duration_us == 0
            && self.time_units_per_us > 0.0
        {
            return Err(SchedulerError::param("quantum_duration_us must be > 0"));
        }
        if self.mapping == MappingStrategy::AsPreviously {
            if self.schedule_replay_istream.is_none() {
                return Err(SchedulerError::param(
                    "as_previously mapping requires a schedule replay stream",
                ));
            }
            if self.schedule_record_ostream.is_some() {
                return Err(SchedulerError::param(
                    "cannot record a schedule while replaying one",
                ));
            }
        } else if self.schedule_replay_istream.is_some() {
            return Err(SchedulerError::param(
                "schedule replay stream requires as_previously mapping",
            ));
        }
        if self.replay_as_traced_istream.is_some()
            && self.mapping != MappingStrategy::RecordedOutput
        {
            return Err(SchedulerError::param(
                "as-traced replay stream requires recorded_output mapping",
            ));
        }
        if self.schedule_record_ostream.is_some() && self.mapping != MappingStrategy::AnyOutput
        {
            return Err(SchedulerError::param(
                "schedule recording requires dynamic (any_output) mapping",
            ));
        }
        Ok(())
    }

    /// Convert a microsecond count to simulation time units.
    pub fn us_to_time_units(&self, us: u64) -> u64 {
        (us as f64 * self.time_units_per_us) as u64
    }
}

impl fmt::Debug for SchedulerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerOptions")
            .field("mapping", &self.mapping)
            .field("deps", &self.deps)
            .field("quantum_unit", &self.quantum_unit)
            .field("quantum_duration_instrs", &self.quantum_duration_instrs)
            .field("quantum_duration_us", &self.quantum_duration_us)
            .field("time_units_per_us", &self.time_units_per_us)
            .field("blocking_switch_threshold", &self.blocking_switch_threshold)
            .field("syscall_switch_threshold", &self.syscall_switch_threshold)
            .field("block_time_multiplier", &self.block_time_multiplier)
            .field("block_time_max_us", &self.block_time_max_us)
            .field("migration_threshold_us", &self.migration_threshold_us)
            .field("rebalance_period_us", &self.rebalance_period_us)
            .field(
                "exit_if_fraction_inputs_left",
                &self.exit_if_fraction_inputs_left,
            )
            .field("honor_direct_switches", &self.honor_direct_switches)
            .field("honor_infinite_timeouts", &self.honor_infinite_timeouts)
            .field("randomize_next_input", &self.randomize_next_input)
            .field("flags", &self.flags)
            .field("recording", &self.schedule_record_ostream.is_some())
            .field("replaying", &self.schedule_replay_istream.is_some())
            .field("as_traced", &self.replay_as_traced_istream.is_some())
            .finish()
    }
}
