//! RecordLog: a per-process ring of application events (`spec.md` §4.6,
//! component C6).
//!
//! Writers are application threads (one per CPU, in practice); the single
//! reader is the Controller via [`crate::app::sampler::ApplicationSampler`].
//! The main ring is a lock-free MPSC queue (`crossbeam_queue::ArrayQueue`,
//! already in the teacher's dependency graph); the short-region auxiliary
//! ring, which can be written far more often than the Controller drains it,
//! coalesces repeated `(hash, cpu)` overflow into a single running count
//! behind a short-held mutex rather than growing unboundedly.

use std::collections::HashMap;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::types::Time;

/// The kind of event recorded in a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A thread entered a region, identified by its hash.
    RegionEntry,
    /// A thread exited the region it most recently entered.
    RegionExit,
    /// An epoch boundary was crossed.
    EpochCount,
    /// A scheduling hint changed.
    Hint,
    /// A short (sub-sampling-period) region occurrence, recorded in the
    /// auxiliary ring and referenced here by its numeric handle.
    ShortRegion,
}

impl EventKind {
    /// The event's name, as used in trace column headers.
    #[must_use]
    pub const fn event_name(self) -> &'static str {
        match self {
            EventKind::RegionEntry => "REGION_ENTRY",
            EventKind::RegionExit => "REGION_EXIT",
            EventKind::EpochCount => "EPOCH_COUNT",
            EventKind::Hint => "HINT",
            EventKind::ShortRegion => "SHORT_REGION",
        }
    }

    /// Parses an event name back to its [`EventKind`].
    pub fn event_type(name: &str) -> Result<Self> {
        match name {
            "REGION_ENTRY" => Ok(EventKind::RegionEntry),
            "REGION_EXIT" => Ok(EventKind::RegionExit),
            "EPOCH_COUNT" => Ok(EventKind::EpochCount),
            "HINT" => Ok(EventKind::Hint),
            "SHORT_REGION" => Ok(EventKind::ShortRegion),
            other => Err(Error::invalid(format!("unknown event kind: {other}"))),
        }
    }
}

/// One recorded application event.
#[derive(Debug, Clone, Copy)]
pub struct Record {
    /// When the event was recorded, monotone within a process.
    pub time: Time,
    /// The CPU the recording thread was running on.
    pub cpu: usize,
    /// The event kind.
    pub kind: EventKind,
    /// A payload whose meaning depends on `kind`: the region hash for
    /// `RegionEntry`/`RegionExit`, the hint bitmask for `Hint`, the epoch
    /// counter for `EpochCount`, or the short-region handle for
    /// `ShortRegion`.
    pub value: u64,
}

/// A coalesced short-region occurrence: one region hash observed
/// repeatedly on one CPU between Controller drains.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShortRegionAux {
    /// Number of occurrences coalesced into this entry.
    pub count: u64,
    /// Total time spent in the region across those occurrences, seconds.
    pub total_time: f64,
}

const RING_CAPACITY: usize = 4096;

/// A per-process ring of application events plus a coalescing short-region
/// auxiliary table.
pub struct RecordLog {
    ring: ArrayQueue<Record>,
    short_region: Mutex<HashMap<(u64, usize), ShortRegionAux>>,
    next_handle: std::sync::atomic::AtomicU32,
    handle_to_key: Mutex<HashMap<u32, (u64, usize)>>,
    last_time: std::sync::atomic::AtomicU64,
}

impl RecordLog {
    /// Constructs an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ring: ArrayQueue::new(RING_CAPACITY),
            short_region: Mutex::new(HashMap::new()),
            next_handle: std::sync::atomic::AtomicU32::new(0),
            handle_to_key: Mutex::new(HashMap::new()),
            last_time: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Appends a record. Event timestamps must be monotone within a
    /// process (`spec.md` §4.6); out-of-order timestamps are rejected
    /// rather than silently accepted, so a misbehaving instrumentation
    /// call site is caught immediately instead of corrupting downstream
    /// accumulation.
    pub fn push(&self, time: Time, cpu: usize, kind: EventKind, value: u64) -> Result<()> {
        let prev = self.last_time.load(std::sync::atomic::Ordering::Acquire);
        if time.as_nanos() < prev {
            return Err(Error::logic("RecordLog event timestamps must be monotone"));
        }
        self.last_time
            .store(time.as_nanos(), std::sync::atomic::Ordering::Release);
        let record = Record {
            time,
            cpu,
            kind,
            value,
        };
        if self.ring.push(record).is_err() {
            // Ring full: coalesce into the short-region aux table rather
            // than drop the event outright.
            let key = (value, cpu);
            let mut aux = self.short_region.lock();
            let entry = aux.entry(key).or_default();
            entry.count += 1;
        }
        Ok(())
    }

    /// Registers a short-region occurrence, returning a handle the caller
    /// encodes into a `ShortRegion` record's `value` field.
    pub fn register_short_region(&self, hash: u64, cpu: usize, elapsed_secs: f64) -> u32 {
        let key = (hash, cpu);
        {
            let mut aux = self.short_region.lock();
            let entry = aux.entry(key).or_default();
            entry.count += 1;
            entry.total_time += elapsed_secs;
        }
        let handle = self
            .next_handle
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        self.handle_to_key.lock().insert(handle, key);
        handle
    }

    /// Looks up a short-region handle's coalesced aggregate.
    pub fn get_short_region(&self, handle: u32) -> Result<(u64, u64, f64)> {
        let key = *self
            .handle_to_key
            .lock()
            .get(&handle)
            .ok_or_else(|| Error::invalid(format!("unknown short_region handle: {handle}")))?;
        let aux = self
            .short_region
            .lock()
            .get(&key)
            .copied()
            .unwrap_or_default();
        Ok((key.0, aux.count, aux.total_time))
    }

    /// Drains every record currently in the ring, in push order.
    pub fn drain(&self) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(r) = self.ring.pop() {
            out.push(r);
        }
        out
    }
}

impl Default for RecordLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_records_in_push_order() {
        let log = RecordLog::new();
        log.push(Time::from_nanos(1), 0, EventKind::RegionEntry, 0xAB)
            .unwrap();
        log.push(Time::from_nanos(2), 0, EventKind::RegionExit, 0xAB)
            .unwrap();
        let drained = log.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, EventKind::RegionEntry);
        assert_eq!(drained[1].kind, EventKind::RegionExit);
    }

    #[test]
    fn non_monotone_timestamp_is_rejected() {
        let log = RecordLog::new();
        log.push(Time::from_nanos(10), 0, EventKind::RegionEntry, 1)
            .unwrap();
        assert!(log
            .push(Time::from_nanos(5), 0, EventKind::RegionEntry, 1)
            .is_err());
    }

    #[test]
    fn short_region_coalesces_repeated_occurrences() {
        let log = RecordLog::new();
        let h = log.register_short_region(0x42, 3, 0.001);
        log.register_short_region(0x42, 3, 0.002);
        let (hash, count, total) = log.get_short_region(h).unwrap();
        assert_eq!(hash, 0x42);
        assert_eq!(count, 2);
        assert!((total - 0.003).abs() < 1e-12);
    }

    #[test]
    fn event_name_roundtrips_through_event_type() {
        for kind in [
            EventKind::RegionEntry,
            EventKind::RegionExit,
            EventKind::EpochCount,
            EventKind::Hint,
            EventKind::ShortRegion,
        ] {
            assert_eq!(EventKind::event_type(kind.event_name()).unwrap(), kind);
        }
        assert!(EventKind::event_type("NOT_A_KIND").is_err());
    }
}
