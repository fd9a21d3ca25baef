//! # Tracemux
//!
//! A trace-replay scheduler: takes recorded per-thread instruction/memory
//! trace streams (inputs) and multiplexes them onto a chosen number of
//! consumer streams (outputs) that analysis tools drive record-by-record.
//!
//! Three operating modes share one engine:
//! - **Dynamic** ([`MappingStrategy::AnyOutput`]): live rescheduling with
//!   time-slice quanta, syscall blocking, direct-switch hints, per-output run
//!   queues with migration, periodic rebalancing, and work stealing.
//! - **Replay** ([`MappingStrategy::AsPreviously`], or
//!   [`MappingStrategy::RecordedOutput`] with an as-traced stream):
//!   deterministic replay of a recorded schedule.
//! - **Fixed**: static round-robin assignment or single-stream timestamp
//!   interleaving.
//!
//! ```no_run
//! use tracemux::{InputSpec, Poll, Scheduler, SchedulerOptions, WorkloadSpec};
//! use trace_model::{TraceBuilder, VecReader};
//!
//! # fn main() -> tracemux::Result<()> {
//! let reader = VecReader::new("t1", TraceBuilder::new(100, 10).instrs(50).exit());
//! let workload = WorkloadSpec::new(vec![InputSpec::new(Box::new(reader), 100)]);
//! let scheduler = Scheduler::new(vec![workload], 1, SchedulerOptions::default())?;
//! let mut stream = scheduler.stream(0).unwrap();
//! while let Poll::Record(record) = stream.next_record(0)? {
//!     // feed the analysis tool
//!     let _ = record;
//! }
//! # Ok(())
//! # }
//! ```

mod core;
mod dynamic;
mod error;
mod fixed;
mod input;
mod options;
mod output;
mod queue;
mod replay;
mod schedule_file;
mod stream;
mod workload;

pub use crate::core::Scheduler;
pub use error::{Result, SchedulerError};
pub use options::{
    DependencyMode, MappingStrategy, QuantumUnit, SchedulerFlags, SchedulerOptions,
};
pub use output::StatKind;
pub use queue::IndexedPriorityQueue;
pub use schedule_file::{
    component_name, ArchiveReader, ArchiveWriter, CpuScheduleEntry, MemArchive,
    MemArchiveReader, MemArchiveWriter, ScheduleSegment, SegmentKind,
};
pub use stream::{Poll, Stream};
pub use workload::{InputIndex, InputSpec, InstrRange, OutputIndex, WorkloadSpec};
