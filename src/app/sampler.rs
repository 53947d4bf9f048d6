//! ApplicationSampler: merges per-process [`RecordLog`]s into one ordered
//! stream for the Controller (`spec.md` §4.7, component C7).

use std::collections::HashMap;
use std::sync::Arc;

use crate::app::record_log::{Record, RecordLog};
use crate::error::{Error, Result};

/// A pluggable transform applied to records as they are drained from a
/// process's [`RecordLog`], e.g. to remap hints or filter noise regions
/// before they reach the Controller.
pub trait RecordFilter: Send {
    /// Transforms one drained record, or drops it by returning `None`.
    fn filter(&mut self, record: Record) -> Option<Record>;
}

/// The identity filter: passes every record through unchanged.
pub struct PassThrough;

impl RecordFilter for PassThrough {
    fn filter(&mut self, record: Record) -> Option<Record> {
        Some(record)
    }
}

struct ProcessEntry {
    log: Arc<RecordLog>,
    filter: Box<dyn RecordFilter>,
}

/// Merges every attached process's [`RecordLog`] into one ordered record
/// stream, applying each process's [`RecordFilter`] as it drains.
pub struct ApplicationSampler {
    processes: HashMap<u32, ProcessEntry>,
    merged: Vec<Record>,
}

impl ApplicationSampler {
    /// Constructs a sampler with no attached processes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            processes: HashMap::new(),
            merged: Vec::new(),
        }
    }

    /// Attaches a process's record log, with an optional filter (defaults
    /// to [`PassThrough`] when `None`).
    pub fn attach_process(
        &mut self,
        pid: u32,
        log: Arc<RecordLog>,
        filter: Option<Box<dyn RecordFilter>>,
    ) {
        self.processes.insert(
            pid,
            ProcessEntry {
                log,
                filter: filter.unwrap_or_else(|| Box::new(PassThrough)),
            },
        );
    }

    /// Detaches a process, e.g. once it has exited.
    pub fn detach_process(&mut self, pid: u32) {
        self.processes.remove(&pid);
    }

    /// Drains every attached process's log, filters each record, and
    /// stores the ordered union for the next [`ApplicationSampler::get_records`].
    ///
    /// Ordering across processes is by time, stable on ties in attachment
    /// order; within one process, drain order is preserved.
    pub fn update_records(&mut self) {
        let mut all = Vec::new();
        for entry in self.processes.values_mut() {
            for record in entry.log.drain() {
                if let Some(r) = entry.filter.filter(record) {
                    all.push(r);
                }
            }
        }
        all.sort_by_key(|r| r.time);
        self.merged = all;
    }

    /// Returns the merged record vector produced by the last
    /// [`ApplicationSampler::update_records`] call.
    #[must_use]
    pub fn get_records(&self) -> &[Record] {
        &self.merged
    }

    /// Looks up a short-region aggregate by its numeric handle, carried in
    /// a `ShortRegion` record's `value` field. The handle must have been
    /// issued by `pid`'s own log.
    pub fn get_short_region(&self, pid: u32, handle: u32) -> Result<(u64, u64, f64)> {
        let entry = self
            .processes
            .get(&pid)
            .ok_or_else(|| Error::invalid(format!("no attached process: {pid}")))?;
        entry.log.get_short_region(handle)
    }
}

impl Default for ApplicationSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::record_log::EventKind;
    use crate::types::Time;

    #[test]
    fn update_records_merges_across_processes_in_time_order() {
        let mut sampler = ApplicationSampler::new();
        let log_a = Arc::new(RecordLog::new());
        let log_b = Arc::new(RecordLog::new());
        log_a
            .push(Time::from_nanos(20), 0, EventKind::RegionEntry, 1)
            .unwrap();
        log_b
            .push(Time::from_nanos(10), 1, EventKind::RegionEntry, 2)
            .unwrap();
        sampler.attach_process(100, log_a, None);
        sampler.attach_process(200, log_b, None);

        sampler.update_records();
        let records = sampler.get_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value, 2);
        assert_eq!(records[1].value, 1);
    }

    struct DropHints;
    impl RecordFilter for DropHints {
        fn filter(&mut self, record: Record) -> Option<Record> {
            if record.kind == EventKind::Hint {
                None
            } else {
                Some(record)
            }
        }
    }

    #[test]
    fn filter_can_drop_records() {
        let mut sampler = ApplicationSampler::new();
        let log = Arc::new(RecordLog::new());
        log.push(Time::from_nanos(1), 0, EventKind::Hint, 1).unwrap();
        log.push(Time::from_nanos(2), 0, EventKind::RegionEntry, 2)
            .unwrap();
        sampler.attach_process(1, log, Some(Box::new(DropHints)));
        sampler.update_records();
        assert_eq!(sampler.get_records().len(), 1);
        assert_eq!(sampler.get_records()[0].kind, EventKind::RegionEntry);
    }

    #[test]
    fn unattached_process_short_region_lookup_fails() {
        let sampler = ApplicationSampler::new();
        assert!(sampler.get_short_region(999, 0).is_err());
    }
}
