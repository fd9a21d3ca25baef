//! Recorded-schedule archive format
//!
//! A recorded schedule is an archive of per-output components. Each component
//! opens with a `Version` record, carries segment records in chronological
//! order, and ends with a `Footer`. Records are fixed-layout little-endian so
//! files replay across platforms.

use crate::error::{Result, SchedulerError};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

/// Current version stamped into each component.
pub const SCHEDULE_VERSION_CURRENT: u32 = 0;

/// Serialized size of one schedule record.
pub const SEGMENT_BYTES: usize = 32;

/// Serialized size of one as-traced cpu schedule entry.
pub const CPU_ENTRY_BYTES: usize = 24;

/// Segment record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SegmentKind {
    /// One thread sequence between context switches.
    Default = 0,
    /// First record of each component; `input` holds the version.
    Version = 1,
    /// Final record of each component.
    Footer = 2,
    /// Skip ahead to the next region of interest.
    Skip = 3,
    /// A synthetic thread exit must be supplied.
    SyntheticEnd = 4,
    /// Idle period; duration in microseconds (legacy).
    Idle = 5,
    /// Idle period; duration as a count of idle records.
    IdleByCount = 6,
}

impl SegmentKind {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Default,
            1 => Self::Version,
            2 => Self::Footer,
            3 => Self::Skip,
            4 => Self::SyntheticEnd,
            5 => Self::Idle,
            6 => Self::IdleByCount,
            _ => return None,
        })
    }
}

/// One schedule segment.
///
/// Field meanings vary by kind: for `Version` the `input` field holds the
/// version; for the idle kinds `start_instruction` holds the duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSegment {
    pub kind: SegmentKind,
    pub input: u32,
    /// Input instruction ordinal of the starting point (or idle duration).
    pub start_instruction: u64,
    /// Input instruction ordinal, exclusive; `u64::MAX` means run to EOF.
    pub stop_instruction: u64,
    /// Wall-clock microseconds, keeping context switches ordered on replay.
    pub timestamp: u64,
}

impl ScheduleSegment {
    pub fn new(
        kind: SegmentKind,
        input: u32,
        start_instruction: u64,
        stop_instruction: u64,
        timestamp: u64,
    ) -> Self {
        Self { kind, input, start_instruction, stop_instruction, timestamp }
    }

    /// Idle duration for the idle kinds.
    pub fn idle_duration(&self) -> u64 {
        self.start_instruction
    }

    /// Encode as the 32-byte on-disk layout.
    pub fn encode(&self) -> [u8; SEGMENT_BYTES] {
        let mut buf = [0u8; SEGMENT_BYTES];
        buf[0..4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.input.to_le_bytes());
        buf[8..16].copy_from_slice(&self.start_instruction.to_le_bytes());
        buf[16..24].copy_from_slice(&self.stop_instruction.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    /// Decode the 32-byte on-disk layout.
    pub fn decode(buf: &[u8; SEGMENT_BYTES]) -> Result<Self> {
        let kind = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let kind = SegmentKind::from_u32(kind).ok_or_else(|| {
            SchedulerError::ReplayMismatch(format!("unknown segment kind {kind}"))
        })?;
        Ok(Self {
            kind,
            input: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            start_instruction: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            stop_instruction: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        })
    }
}

/// One as-traced schedule entry: which input ran where, starting when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuScheduleEntry {
    pub input: u32,
    pub cpu: u32,
    pub start_instruction: u64,
    pub timestamp: u64,
}

impl CpuScheduleEntry {
    pub fn encode(&self) -> [u8; CPU_ENTRY_BYTES] {
        let mut buf = [0u8; CPU_ENTRY_BYTES];
        buf[0..4].copy_from_slice(&self.input.to_le_bytes());
        buf[4..8].copy_from_slice(&self.cpu.to_le_bytes());
        buf[8..16].copy_from_slice(&self.start_instruction.to_le_bytes());
        buf[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; CPU_ENTRY_BYTES]) -> Self {
        Self {
            input: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            cpu: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            start_instruction: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}

/// Name of the archive component holding one output's sequence.
pub fn component_name(output: usize) -> String {
    format!("core.{output}")
}

/// Write side of a schedule archive.
pub trait ArchiveWriter: Send {
    /// Start a new named component; subsequent writes append to it.
    fn open_component(&mut self, name: &str) -> io::Result<()>;
    /// Append bytes to the open component.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// Read side of a schedule archive.
pub trait ArchiveReader: Send {
    /// Open a named component for reading. Returns false if absent.
    fn open_component(&mut self, name: &str) -> io::Result<bool>;
    /// Fill `buf` from the open component. Returns false on clean EOF;
    /// a partial record is an error.
    fn read_record(&mut self, buf: &mut [u8]) -> io::Result<bool>;
}

pub type ArchiveWriterBox = Box<dyn ArchiveWriter>;
pub type ArchiveReaderBox = Box<dyn ArchiveReader>;

#[derive(Debug, Default)]
struct MemArchiveStore {
    components: HashMap<String, Vec<u8>>,
    order: Vec<String>,
}

/// In-memory archive shared between a writer and later readers.
///
/// The handle is cheap to clone; all clones see the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemArchive {
    store: Arc<Mutex<MemArchiveStore>>,
}

impl MemArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer appending into this archive.
    pub fn writer(&self) -> MemArchiveWriter {
        MemArchiveWriter { store: self.store.clone(), cur: None }
    }

    /// A reader over this archive's current contents.
    pub fn reader(&self) -> MemArchiveReader {
        MemArchiveReader { store: self.store.clone(), cur: None, pos: 0 }
    }

    /// Component names in creation order.
    pub fn component_names(&self) -> Vec<String> {
        self.store.lock().unwrap_or_else(|p| p.into_inner()).order.clone()
    }
}

/// Writer half of [`MemArchive`].
#[derive(Debug)]
pub struct MemArchiveWriter {
    store: Arc<Mutex<MemArchiveStore>>,
    cur: Option<String>,
}

impl ArchiveWriter for MemArchiveWriter {
    fn open_component(&mut self, name: &str) -> io::Result<()> {
        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        if !store.components.contains_key(name) {
            store.components.insert(name.to_string(), Vec::new());
            store.order.push(name.to_string());
        }
        self.cur = Some(name.to_string());
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let Some(cur) = self.cur.clone() else {
            return Err(io::Error::new(io::ErrorKind::Other, "no open component"));
        };
        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        store.components.entry(cur).or_default().extend_from_slice(buf);
        Ok(())
    }
}

/// Reader half of [`MemArchive`].
#[derive(Debug)]
pub struct MemArchiveReader {
    store: Arc<Mutex<MemArchiveStore>>,
    cur: Option<String>,
    pos: usize,
}

impl ArchiveReader for MemArchiveReader {
    fn open_component(&mut self, name: &str) -> io::Result<bool> {
        let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        if !store.components.contains_key(name) {
            return Ok(false);
        }
        self.cur = Some(name.to_string());
        self.pos = 0;
        Ok(true)
    }

    fn read_record(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let Some(cur) = &self.cur else {
            return Err(io::Error::new(io::ErrorKind::Other, "no open component"));
        };
        let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        let Some(data) = store.components.get(cur) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "component vanished"));
        };
        if self.pos >= data.len() {
            return Ok(false);
        }
        if self.pos + buf.len() > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated archive record",
            ));
        }
        buf.copy_from_slice(&data[self.pos..self.pos + buf.len()]);
        self.pos += buf.len();
        Ok(true)
    }
}

/// Read one component's segment sequence, validating version and footer.
pub fn read_component(
    reader: &mut dyn ArchiveReader,
    name: &str,
) -> Result<Option<Vec<ScheduleSegment>>> {
    if !reader.open_component(name)? {
        return Ok(None);
    }
    let mut segments = Vec::new();
    let mut buf = [0u8; SEGMENT_BYTES];
    let mut saw_version = false;
    let mut saw_footer = false;
    while reader.read_record(&mut buf)? {
        let seg = ScheduleSegment::decode(&buf)?;
        match seg.kind {
            SegmentKind::Version => {
                if seg.input != SCHEDULE_VERSION_CURRENT {
                    return Err(SchedulerError::ReplayMismatch(format!(
                        "unsupported schedule version {}",
                        seg.input
                    )));
                }
                saw_version = true;
            }
            SegmentKind::Footer => {
                saw_footer = true;
                break;
            }
            _ => segments.push(seg),
        }
    }
    if !saw_version {
        return Err(SchedulerError::ReplayMismatch(format!(
            "component {name} missing version record"
        )));
    }
    if !saw_footer {
        return Err(SchedulerError::ReplayMismatch(format!(
            "component {name} missing footer"
        )));
    }
    Ok(Some(segments))
}

/// Write one component: version, segments, footer.
pub fn write_component(
    writer: &mut dyn ArchiveWriter,
    name: &str,
    segments: &[ScheduleSegment],
) -> Result<()> {
    writer.open_component(name)?;
    let version =
        ScheduleSegment::new(SegmentKind::Version, SCHEDULE_VERSION_CURRENT, 0, 0, 0);
    writer.write_all(&version.encode())?;
    for seg in segments {
        writer.write_all(&seg.encode())?;
    }
    let footer = ScheduleSegment::new(SegmentKind::Footer, 0, 0, 0, 0);
    writer.write_all(&footer.encode())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_codec_roundtrip() {
        let seg = ScheduleSegment::new(SegmentKind::Default, 3, 100, 250, 987654);
        let decoded = ScheduleSegment::decode(&seg.encode()).unwrap();
        assert_eq!(seg, decoded);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = [0u8; SEGMENT_BYTES];
        buf[0..4].copy_from_slice(&99u32.to_le_bytes());
        assert!(ScheduleSegment::decode(&buf).is_err());
    }

    #[test]
    fn test_component_roundtrip() {
        let archive = MemArchive::new();
        let segments = vec![
            ScheduleSegment::new(SegmentKind::Default, 0, 0, 50, 10),
            ScheduleSegment::new(SegmentKind::IdleByCount, 0, 7, 0, 20),
            ScheduleSegment::new(SegmentKind::Default, 1, 0, u64::MAX, 30),
        ];
        write_component(&mut archive.writer(), &component_name(0), &segments).unwrap();

        let read = read_component(&mut archive.reader(), &component_name(0))
            .unwrap()
            .unwrap();
        assert_eq!(read, segments);
        // Absent components read as None.
        assert!(read_component(&mut archive.reader(), &component_name(1))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_missing_footer_rejected() {
        let archive = MemArchive::new();
        let mut w = archive.writer();
        w.open_component("core.0").unwrap();
        let version =
            ScheduleSegment::new(SegmentKind::Version, SCHEDULE_VERSION_CURRENT, 0, 0, 0);
        w.write_all(&version.encode()).unwrap();
        assert!(read_component(&mut archive.reader(), "core.0").is_err());
    }

    #[test]
    fn test_cpu_entry_codec() {
        let entry = CpuScheduleEntry { input: 2, cpu: 11, start_instruction: 400, timestamp: 12345 };
        assert_eq!(CpuScheduleEntry::decode(&entry.encode()), entry);
    }
}
