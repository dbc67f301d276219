//! WAL segment bookkeeping.
//!
//! Tracks which segments exist, which are still retained and which each
//! replica has acknowledged. Retained segments always form one contiguous
//! range ending at the open segment, and only a prefix of that range is
//! ever discarded.
//!
//! The discard boundary is
//! `min(max(retain floor, newest - keep_segments), oldest unacknowledged)`,
//! so a replica that is behind pins everything it still needs.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};

/// One WAL segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalSegment {
    pub sequence_number: u64,
    pub timeline: u32,
    /// CRC32 over the records written to the segment.
    pub checksum: u32,
    pub created_at: Timestamp,
    pub retained: bool,
    pub record_count: u64,
}

/// Position of an appended record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn {
    pub timeline: u32,
    /// Segment holding the record.
    pub segment: u64,
    /// Record sequence number within the timeline.
    pub record: u64,
}

/// Segment boundary produced by a rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationOutcome {
    pub closed: u64,
    pub opened: u64,
    /// Segments released by retention during this rotation.
    pub discarded: Vec<WalSegment>,
}

/// WAL segment manager for one member.
#[derive(Debug, Clone)]
pub struct WalManager {
    /// Retained segments; the last one is open.
    segments: VecDeque<WalSegment>,
    /// Running CRC32 of the open segment.
    running_crc: u32,
    timeline: u32,
    next_record: u64,
    retain_floor: u64,
    keep_segments: u64,
    acks: BTreeMap<String, u64>,
}

impl WalManager {
    /// Start at segment 1 on timeline 1.
    pub fn new(keep_segments: u64) -> Self {
        Self::starting_at(1, 1, keep_segments)
    }

    /// Start with `segment` open on `timeline`.
    pub fn starting_at(segment: u64, timeline: u32, keep_segments: u64) -> Self {
        let mut segments = VecDeque::new();
        segments.push_back(Self::fresh_segment(segment.max(1), timeline));
        Self {
            segments,
            running_crc: 0,
            timeline,
            next_record: 1,
            retain_floor: 0,
            keep_segments,
            acks: BTreeMap::new(),
        }
    }

    fn fresh_segment(sequence_number: u64, timeline: u32) -> WalSegment {
        WalSegment {
            sequence_number,
            timeline,
            checksum: 0,
            created_at: Timestamp::now(),
            retained: true,
            record_count: 0,
        }
    }

    fn open_segment_mut(&mut self) -> Result<&mut WalSegment> {
        self.segments
            .back_mut()
            .ok_or_else(|| Error::MissingField("open WAL segment".into()))
    }

    /// Number of the segment currently being written.
    pub fn current_segment(&self) -> u64 {
        self.segments.back().map(|s| s.sequence_number).unwrap_or(0)
    }

    pub fn oldest_retained(&self) -> Option<u64> {
        self.segments.front().map(|s| s.sequence_number)
    }

    pub fn timeline(&self) -> u32 {
        self.timeline
    }

    pub fn retained_count(&self) -> usize {
        self.segments.len()
    }

    pub fn retain_floor(&self) -> u64 {
        self.retain_floor
    }

    /// Change how many closed segments are kept and apply retention.
    ///
    /// Segments already released stay released when the count grows.
    pub fn set_keep_segments(&mut self, keep_segments: u64) -> Vec<WalSegment> {
        self.keep_segments = keep_segments;
        self.prune()
    }

    /// Append a record to the open segment.
    pub fn append(&mut self, record: &[u8]) -> Result<Lsn> {
        let mut hasher = crc32fast::Hasher::new_with_initial(self.running_crc);
        hasher.update(record);
        let checksum = hasher.finalize();
        self.running_crc = checksum;
        let timeline = self.timeline;
        let sequence = self.next_record;
        let segment = self.open_segment_mut()?;
        segment.record_count += 1;
        segment.checksum = checksum;
        let lsn = Lsn {
            timeline,
            segment: segment.sequence_number,
            record: sequence,
        };
        self.next_record += 1;
        Ok(lsn)
    }

    /// Close the open segment, open the next one and apply retention.
    pub fn rotate(&mut self) -> Result<RotationOutcome> {
        let closed = self.current_segment();
        self.running_crc = 0;
        let opened = closed + 1;
        self.segments
            .push_back(Self::fresh_segment(opened, self.timeline));
        let discarded = self.prune();
        debug!(closed, opened, discarded = discarded.len(), "Rotated WAL segment");
        Ok(RotationOutcome {
            closed,
            opened,
            discarded,
        })
    }

    /// First segment that must be kept.
    pub fn effective_floor(&self) -> u64 {
        let keep_floor = self.current_segment().saturating_sub(self.keep_segments);
        let floor = self.retain_floor.max(keep_floor);
        match self.acks.values().min() {
            Some(slowest) => floor.min(slowest.saturating_add(1)),
            None => floor,
        }
    }

    fn prune(&mut self) -> Vec<WalSegment> {
        let floor = self.effective_floor();
        let mut discarded = Vec::new();
        // Never discard the open segment
        while self.segments.len() > 1
            && self
                .segments
                .front()
                .is_some_and(|s| s.sequence_number < floor)
        {
            if let Some(mut segment) = self.segments.pop_front() {
                segment.retained = false;
                discarded.push(segment);
            }
        }
        discarded
    }

    /// Release segments older than `seq`.
    ///
    /// The floor only moves forward; asking to retain segments that were
    /// already released fails with `RetentionRegression`.
    pub fn retain_from(&mut self, seq: u64) -> Result<Vec<WalSegment>> {
        let current = self
            .retain_floor
            .max(self.oldest_retained().unwrap_or(0));
        if seq < current {
            return Err(Error::RetentionRegression {
                requested: seq,
                current,
            });
        }
        self.retain_floor = seq;
        Ok(self.prune())
    }

    /// Retained segments with a sequence number greater than `seq`, in order.
    pub fn segments_since(&self, seq: u64) -> Vec<WalSegment> {
        self.segments
            .iter()
            .filter(|s| s.sequence_number > seq)
            .cloned()
            .collect()
    }

    /// Segments a member needs after acknowledging `acked`.
    ///
    /// Without a known position the member is rebuilt from a base backup
    /// and gets every retained segment. With one, it fails with `DataGap`
    /// when any segment after `acked` was already released.
    pub fn catch_up_from(&self, acked: Option<u64>) -> Result<Vec<WalSegment>> {
        let Some(acked) = acked else {
            return Ok(self.segments_since(0));
        };
        let required_from = acked
            .checked_add(1)
            .ok_or_else(|| Error::Validation(format!("WAL position {} is out of range", acked)))?;
        let oldest = self.oldest_retained();
        if oldest.is_none_or(|o| o > required_from) && required_from <= self.current_segment() {
            return Err(Error::DataGap {
                required_from,
                oldest_retained: oldest,
            });
        }
        Ok(self.segments_since(required_from.saturating_sub(1)))
    }

    /// Record that `member` replayed everything up to `segment`.
    pub fn acknowledge(&mut self, member: &str, segment: u64) {
        let entry = self.acks.entry(member.to_string()).or_insert(segment);
        *entry = (*entry).max(segment);
    }

    /// Stop pinning segments for `member`.
    pub fn forget(&mut self, member: &str) -> Option<u64> {
        self.acks.remove(member)
    }

    pub fn acknowledged(&self, member: &str) -> Option<u64> {
        self.acks.get(member).copied()
    }

    /// Start a new timeline after promotion. Returns the new timeline.
    pub fn open_timeline(&mut self) -> Result<u32> {
        self.rotate()?;
        self.timeline += 1;
        self.next_record = 1;
        let timeline = self.timeline;
        self.open_segment_mut()?.timeline = timeline;
        info!(timeline, segment = self.current_segment(), "Opened new WAL timeline");
        Ok(timeline)
    }

    /// Follow another member's timeline (after cloning or following a new primary).
    pub fn adopt_timeline(&mut self, timeline: u32) -> Result<()> {
        if timeline > self.timeline {
            self.timeline = timeline;
            self.next_record = 1;
            self.open_segment_mut()?.timeline = timeline;
        }
        Ok(())
    }

    /// Rotate until `segment` is the open segment. Returns the rotations.
    pub fn sync_to(&mut self, segment: u64) -> Result<Vec<RotationOutcome>> {
        let mut rotations = Vec::new();
        while self.current_segment() < segment {
            rotations.push(self.rotate()?);
        }
        Ok(rotations)
    }
}

/// Error parsing a PostgreSQL WAL file name.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WalNameError {
    #[error("WAL file name must be 24 hex digits, got {0} characters")]
    Length(usize),
    #[error("WAL file name is not hexadecimal: {0}")]
    NotHex(String),
}

/// A PostgreSQL WAL file name: `TTTTTTTTXXXXXXXXYYYYYYYY`.
///
/// `X` is the high and `Y` the low part of the segment number, with 0x100
/// segments per high value (16 MiB segments).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalFileName {
    pub timeline: u32,
    pub segment: u64,
}

const SEGMENTS_PER_XLOGID: u64 = 0x100;

impl FromStr for WalFileName {
    type Err = WalNameError;

    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        let name = name.trim();
        if name.len() != 24 {
            return Err(WalNameError::Length(name.len()));
        }
        let part = |range: std::ops::Range<usize>| {
            name.get(range)
                .and_then(|p| u32::from_str_radix(p, 16).ok())
                .ok_or_else(|| WalNameError::NotHex(name.to_string()))
        };
        let timeline = part(0..8)?;
        let log = u64::from(part(8..16)?);
        let seg = u64::from(part(16..24)?);
        Ok(Self {
            timeline,
            segment: log * SEGMENTS_PER_XLOGID + seg,
        })
    }
}

impl fmt::Display for WalFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}{:08X}{:08X}",
            self.timeline,
            self.segment / SEGMENTS_PER_XLOGID,
            self.segment % SEGMENTS_PER_XLOGID
        )
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;

    #[test]
    fn test_append_returns_increasing_positions() {
        let mut wal = WalManager::new(4);
        let a = wal.append(b"a").unwrap();
        let b = wal.append(b"b").unwrap();
        assert!(b > a);
        assert_eq!(b.record, 2);
        assert_eq!(b.segment, 1);
        assert_ne!(wal.segments_since(0)[0].checksum, 0);
    }

    #[test]
    fn test_checksum_depends_on_content() {
        let mut one = WalManager::new(4);
        let mut two = WalManager::new(4);
        one.append(b"insert 1").unwrap();
        two.append(b"insert 2").unwrap();
        assert_ne!(one.segments_since(0)[0].checksum, two.segments_since(0)[0].checksum);
    }

    #[test]
    fn test_rotation_keeps_configured_segments() {
        let mut wal = WalManager::new(2);
        for _ in 0..5 {
            wal.rotate().unwrap();
        }
        // Open segment 6, keep two closed ones before it
        assert_eq!(wal.current_segment(), 6);
        assert_eq!(wal.oldest_retained(), Some(4));
    }

    #[test]
    fn test_lagging_replica_pins_segments() {
        let mut wal = WalManager::new(1);
        wal.acknowledge("pg-1", 2);
        for _ in 0..6 {
            wal.rotate().unwrap();
        }
        assert_eq!(wal.oldest_retained(), Some(3));
        wal.catch_up_from(Some(2)).unwrap();

        wal.acknowledge("pg-1", 6);
        let outcome = wal.rotate().unwrap();
        assert!(outcome.discarded.iter().all(|s| !s.retained));
        assert_eq!(wal.oldest_retained(), Some(7));
    }

    #[test]
    fn test_acknowledge_is_monotonic() {
        let mut wal = WalManager::new(1);
        wal.acknowledge("pg-1", 5);
        wal.acknowledge("pg-1", 3);
        assert_eq!(wal.acknowledged("pg-1"), Some(5));
        assert_eq!(wal.forget("pg-1"), Some(5));
        assert_eq!(wal.acknowledged("pg-1"), None);
    }

    #[test]
    fn test_retain_from_is_monotonic() {
        let mut wal = WalManager::new(100);
        for _ in 0..5 {
            wal.rotate().unwrap();
        }
        let released = wal.retain_from(3).unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(wal.oldest_retained(), Some(3));
        match wal.retain_from(2) {
            Err(Error::RetentionRegression { requested, current }) => {
                assert_eq!(requested, 2);
                assert_eq!(current, 3);
            }
            other => panic!("expected RetentionRegression, got {:?}", other),
        }
    }

    #[test]
    fn test_catch_up_reports_data_gap() {
        let mut wal = WalManager::new(1);
        for _ in 0..5 {
            wal.rotate().unwrap();
        }
        match wal.catch_up_from(Some(1)) {
            Err(Error::DataGap {
                required_from,
                oldest_retained,
            }) => {
                assert_eq!(required_from, 2);
                assert_eq!(oldest_retained, Some(5));
            }
            other => panic!("expected DataGap, got {:?}", other),
        }
        let segments = wal.catch_up_from(Some(4)).unwrap();
        assert_eq!(segments.first().unwrap().sequence_number, 5);

        // A member without a position takes a base backup plus what is retained
        assert_eq!(wal.catch_up_from(None).unwrap().len(), 2);
    }

    #[test]
    fn test_open_timeline_resets_record_numbers() {
        let mut wal = WalManager::new(4);
        wal.append(b"a").unwrap();
        wal.append(b"b").unwrap();
        let timeline = wal.open_timeline().unwrap();
        assert_eq!(timeline, 2);
        let lsn = wal.append(b"c").unwrap();
        assert_eq!(lsn.record, 1);
        assert_eq!(lsn.timeline, 2);
        assert_eq!(lsn.segment, 2);
    }

    #[test]
    fn test_sync_to_rotates_forward_only() {
        let mut wal = WalManager::new(8);
        assert_eq!(wal.sync_to(4).unwrap().len(), 3);
        assert!(wal.sync_to(2).unwrap().is_empty());
        assert_eq!(wal.current_segment(), 4);
    }

    #[test]
    fn test_wal_file_name_parsing() {
        let name: WalFileName = "000000020000000100000003".parse().unwrap();
        assert_eq!(name.timeline, 2);
        assert_eq!(name.segment, 0x103);
        assert_eq!(name.to_string(), "000000020000000100000003");

        assert_eq!(
            "0000".parse::<WalFileName>(),
            Err(WalNameError::Length(4))
        );
        assert!(matches!(
            "00000002000000010000000G".parse::<WalFileName>(),
            Err(WalNameError::NotHex(_))
        ));
    }
}
