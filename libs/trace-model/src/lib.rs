//! # Trace Model
//!
//! Shared record model and reader seam for the tracemux scheduling stack.
//!
//! This library defines what a trace *is* to the rest of the system:
//! - [`TraceRecord`] / [`MarkerKind`]: the tagged record union and the marker
//!   vocabulary the scheduler interprets
//! - [`TraceReader`]: the lazy per-input record cursor the scheduler drives
//! - [`VecReader`] / [`TraceBuilder`]: in-memory traces for tests and tools
//!
//! Decoding real on-disk trace formats into these types is the job of the
//! ingestion layer upstream of this workspace.

mod builder;
mod reader;
mod record;

pub use builder::*;
pub use reader::*;
pub use record::*;
