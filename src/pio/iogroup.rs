//! IOGroup: a collection of related signals/controls from one driver
//! (`spec.md` §4.3, component C3).

use std::collections::HashMap;
use std::path::Path;

use slab::Slab;

use crate::error::{Error, Result};
use crate::pio::driver::{CpufreqDriver, Driver};
use crate::types::{Aggregation, Behavior, Domain, Format, HandleId};

/// A `(name, domain, index)` triple identifying one pushed signal or
/// control, used as the dedupe key for [`PushTable`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    name: String,
    domain: Domain,
    index: u32,
}

/// Shared bookkeeping for the push/read_batch/write_batch protocol common
/// to every [`IoGroup`] implementation and to [`crate::pio::platform_io::PlatformIO`]
/// itself.
///
/// Implements the invariant from `spec.md` §3: a given `(name, domain,
/// index)` always returns the same handle until an explicit
/// [`PushTable::reset`], and once [`PushTable::lock`] has been called (on
/// the first `read_batch`/`write_batch`), new pushes are rejected with
/// [`crate::error::Kind::Logic`] until reset.
pub struct PushTable<T> {
    slots: Slab<(RequestKey, T)>,
    index: HashMap<RequestKey, HandleId>,
    locked: bool,
}

impl<T: Clone> Default for PushTable<T> {
    fn default() -> Self {
        Self {
            slots: Slab::new(),
            index: HashMap::new(),
            locked: false,
        }
    }
}

impl<T: Clone> PushTable<T> {
    /// Pushes `(name, domain, index)` with associated bookkeeping `value`,
    /// returning the stable handle for that triple.
    pub fn push(&mut self, name: &str, domain: Domain, index: u32, value: T) -> Result<HandleId> {
        let key = RequestKey {
            name: name.to_string(),
            domain,
            index,
        };
        if let Some(&h) = self.index.get(&key) {
            return Ok(h);
        }
        if self.locked {
            return Err(Error::logic(
                "push after read_batch/write_batch: call reset() first",
            ));
        }
        let slot = self.slots.insert((key.clone(), value));
        let handle = HandleId::new(slot as u32);
        self.index.insert(key, handle);
        Ok(handle)
    }

    /// Marks the table locked: no further pushes are accepted until
    /// [`PushTable::reset`]. Idempotent.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Clears all pushed entries and unlocks the table.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.locked = false;
    }

    /// The bookkeeping value associated with `handle`.
    pub fn get(&self, handle: HandleId) -> Result<&T> {
        self.slots
            .get(handle.index())
            .map(|(_, v)| v)
            .ok_or_else(|| Error::logic(format!("unknown handle {handle}")))
    }

    /// Mutable access to the bookkeeping value associated with `handle`.
    pub fn get_mut(&mut self, handle: HandleId) -> Result<&mut T> {
        self.slots
            .get_mut(handle.index())
            .map(|(_, v)| v)
            .ok_or_else(|| Error::logic(format!("unknown handle {handle}")))
    }

    /// Iterates all pushed `(handle, value)` pairs in push order.
    pub fn iter(&self) -> impl Iterator<Item = (HandleId, &T)> {
        self.slots
            .iter()
            .map(|(i, (_, v))| (HandleId::new(i as u32), v))
    }

    /// Whether `read_batch`/`write_batch` has been called since the last
    /// reset.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked
    }
}

/// Metadata describing one signal or control a driver/IOGroup exposes.
#[derive(Debug, Clone)]
pub struct SignalInfo {
    /// Native (most granular sensible) domain.
    pub domain: Domain,
    /// Combination rule when requested at a coarser domain.
    pub aggregation: Aggregation,
    /// Rendering rule for `format_function`.
    pub format: Format,
    /// Time-evolution class, governing `SampleAggregator` arithmetic.
    pub behavior: Behavior,
    /// Human-readable description.
    pub description: &'static str,
}

/// A collection of related signals/controls from one driver
/// (`spec.md` §4.3).
///
/// Error conventions: unknown names, wrong domains, or out-of-range indices
/// are [`crate::error::Kind::Invalid`]; hardware access failures are
/// [`crate::error::Kind::Runtime`]; a platform lacking the attribute
/// entirely is [`crate::error::Kind::Unsupported`] at push/read-signal time,
/// but resolves to `NaN` (not an error) for signals already pushed into a
/// batch, per `spec.md` §4.3.
pub trait IoGroup: Send {
    /// The IOGroup's identity, used by [`crate::pio::platform_io::PlatformIO`]
    /// for override tie-breaking on name collisions.
    fn name(&self) -> &'static str;

    /// All signal names this group exposes.
    fn signal_names(&self) -> Vec<&'static str>;

    /// All control names this group exposes.
    fn control_names(&self) -> Vec<&'static str>;

    /// Whether `name` is a known signal.
    fn is_valid_signal(&self, name: &str) -> bool {
        self.signal_names().contains(&name)
    }

    /// Whether `name` is a known control.
    fn is_valid_control(&self, name: &str) -> bool {
        self.control_names().contains(&name)
    }

    /// The native domain of signal `name`.
    fn signal_domain_type(&self, name: &str) -> Result<Domain>;

    /// The native domain of control `name`.
    fn control_domain_type(&self, name: &str) -> Result<Domain>;

    /// Registers `(name, domain, index)` for inclusion in the next
    /// `read_batch`, returning a stable handle.
    fn push_signal(&mut self, name: &str, domain: Domain, index: u32) -> Result<HandleId>;

    /// Registers `(name, domain, index)` for inclusion in the next
    /// `write_batch`, returning a stable handle.
    fn push_control(&mut self, name: &str, domain: Domain, index: u32) -> Result<HandleId>;

    /// Reads every pushed signal in one coalesced pass. Atomic per batch: a
    /// caller never observes a partial update across the pushed set.
    fn read_batch(&mut self) -> Result<()>;

    /// Writes every pushed (and adjusted) control in one coalesced pass.
    fn write_batch(&mut self) -> Result<()>;

    /// The most recent `read_batch` value for a pushed signal handle.
    fn sample(&self, handle: HandleId) -> Result<f64>;

    /// Stages a value for a pushed control handle, applied on the next
    /// `write_batch`.
    fn adjust(&mut self, handle: HandleId, value: f64) -> Result<()>;

    /// Reads `(name, domain, index)` directly, bypassing the batch.
    fn read_signal(&self, name: &str, domain: Domain, index: u32) -> Result<f64>;

    /// Writes `(name, domain, index)` directly, bypassing the batch.
    fn write_control(&mut self, name: &str, domain: Domain, index: u32, value: f64) -> Result<()>;

    /// Snapshots every control this group knows how to save, writing one
    /// file inside `dir`.
    fn save_control(&mut self, dir: &Path) -> Result<()>;

    /// Restores controls from a snapshot previously written by
    /// [`IoGroup::save_control`].
    fn restore_control(&mut self, dir: &Path) -> Result<()>;

    /// The aggregator used to combine `name` across a coarser-than-native
    /// domain request.
    fn agg_function(&self, name: &str) -> Result<Aggregation>;

    /// The rendering rule for `name`.
    fn format_function(&self, name: &str) -> Result<Format>;

    /// A human-readable description of `name`.
    fn signal_description(&self, name: &str) -> Result<&str>;

    /// The time-evolution behavior of `name`.
    fn signal_behavior(&self, name: &str) -> Result<Behavior>;
}

/// An IOGroup over the [`CpufreqDriver`], exposing `CPUFREQ::*` signals and
/// controls at CPU domain.
pub struct CpufreqIoGroup {
    driver: CpufreqDriver,
    signal_push: PushTable<(String, Domain, u32)>,
    control_push: PushTable<(String, Domain, u32)>,
    samples: HashMap<HandleId, f64>,
    pending_writes: HashMap<HandleId, f64>,
    saved: HashMap<(String, u32), f64>,
}

impl CpufreqIoGroup {
    /// Constructs a group over the real `/sys/devices/system/cpu/cpufreq`
    /// tree.
    #[must_use]
    pub fn new() -> Self {
        Self::with_driver(CpufreqDriver::new())
    }

    /// Constructs a group over an arbitrary driver instance (e.g. one
    /// rooted at a fabricated sysfs tree for tests).
    #[must_use]
    pub fn with_driver(driver: CpufreqDriver) -> Self {
        Self {
            driver,
            signal_push: PushTable::default(),
            control_push: PushTable::default(),
            samples: HashMap::new(),
            pending_writes: HashMap::new(),
            saved: HashMap::new(),
        }
    }

    fn signal_info(&self, name: &str) -> Result<SignalInfo> {
        match name {
            CpufreqDriver::CUR_FREQ => Ok(SignalInfo {
                domain: Domain::Cpu,
                aggregation: Aggregation::Average,
                format: Format::Integer,
                behavior: Behavior::Variable,
                description: "current scaling frequency, in Hz",
            }),
            CpufreqDriver::MAX_FREQ | CpufreqDriver::MIN_FREQ => Ok(SignalInfo {
                domain: Domain::Cpu,
                aggregation: Aggregation::SelectFirst,
                format: Format::Integer,
                behavior: Behavior::Constant,
                description: "scaling frequency policy bound, in Hz",
            }),
            other => Err(Error::invalid(format!("unknown cpufreq signal: {other}"))),
        }
    }
}

impl Default for CpufreqIoGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl IoGroup for CpufreqIoGroup {
    fn name(&self) -> &'static str {
        "CPUFREQ"
    }

    fn signal_names(&self) -> Vec<&'static str> {
        vec![
            CpufreqDriver::CUR_FREQ,
            CpufreqDriver::MAX_FREQ,
            CpufreqDriver::MIN_FREQ,
        ]
    }

    fn control_names(&self) -> Vec<&'static str> {
        vec![CpufreqDriver::MAX_FREQ, CpufreqDriver::MIN_FREQ]
    }

    fn signal_domain_type(&self, name: &str) -> Result<Domain> {
        Ok(self.signal_info(name)?.domain)
    }

    fn control_domain_type(&self, name: &str) -> Result<Domain> {
        if self.is_valid_control(name) {
            Ok(Domain::Cpu)
        } else {
            Err(Error::invalid(format!("unknown cpufreq control: {name}")))
        }
    }

    fn push_signal(&mut self, name: &str, domain: Domain, index: u32) -> Result<HandleId> {
        if !self.is_valid_signal(name) {
            return Err(Error::invalid(format!("unknown cpufreq signal: {name}")));
        }
        self.signal_push
            .push(name, domain, index, (name.to_string(), domain, index))
    }

    fn push_control(&mut self, name: &str, domain: Domain, index: u32) -> Result<HandleId> {
        if !self.is_valid_control(name) {
            return Err(Error::invalid(format!("unknown cpufreq control: {name}")));
        }
        self.control_push
            .push(name, domain, index, (name.to_string(), domain, index))
    }

    fn read_batch(&mut self) -> Result<()> {
        self.signal_push.lock();
        let mut fresh = HashMap::new();
        for (handle, (name, _domain, index)) in self.signal_push.iter() {
            let path = format!("policy{index}/{}", sysfs_leaf(name));
            let value = self
                .driver
                .read_raw(std::path::Path::new(&path))
                .unwrap_or(f64::NAN);
            fresh.insert(handle, value);
        }
        tracing::trace!(group = "cpufreq", count = fresh.len(), "read_batch");
        self.samples = fresh;
        Ok(())
    }

    fn write_batch(&mut self) -> Result<()> {
        self.control_push.lock();
        let mut written = 0usize;
        for (handle, (name, _domain, index)) in self.control_push.iter() {
            if let Some(&value) = self.pending_writes.get(&handle) {
                let path = format!("policy{index}/{}", sysfs_leaf(name));
                self.driver.write_raw(std::path::Path::new(&path), value)?;
                written += 1;
            }
        }
        tracing::trace!(group = "cpufreq", count = written, "write_batch");
        Ok(())
    }

    fn sample(&self, handle: HandleId) -> Result<f64> {
        self.samples
            .get(&handle)
            .copied()
            .ok_or_else(|| Error::logic(format!("sample before read_batch for {handle}")))
    }

    fn adjust(&mut self, handle: HandleId, value: f64) -> Result<()> {
        self.control_push.get(handle)?;
        self.pending_writes.insert(handle, value);
        Ok(())
    }

    fn read_signal(&self, name: &str, _domain: Domain, index: u32) -> Result<f64> {
        if !self.is_valid_signal(name) {
            return Err(Error::invalid(format!("unknown cpufreq signal: {name}")));
        }
        let path = format!("policy{index}/{}", sysfs_leaf(name));
        self.driver.read_raw(std::path::Path::new(&path))
    }

    fn write_control(&mut self, name: &str, _domain: Domain, index: u32, value: f64) -> Result<()> {
        if !self.is_valid_control(name) {
            return Err(Error::invalid(format!("unknown cpufreq control: {name}")));
        }
        let path = format!("policy{index}/{}", sysfs_leaf(name));
        self.driver.write_raw(std::path::Path::new(&path), value)
    }

    fn save_control(&mut self, dir: &Path) -> Result<()> {
        self.saved.clear();
        for (handle, (name, _domain, index)) in self.control_push.iter() {
            let current = match self.pending_writes.get(&handle) {
                Some(&value) => value,
                None => {
                    let path = format!("policy{index}/{}", sysfs_leaf(name));
                    self.driver.read_raw(std::path::Path::new(&path))?
                }
            };
            self.saved.insert((name.clone(), *index), current);
        }
        let mut lines = Vec::new();
        for ((name, index), value) in &self.saved {
            lines.push(format!("{name}\t{index}\t{value}"));
        }
        std::fs::write(dir.join("cpufreq.save"), lines.join("\n")).map_err(Error::from)
    }

    fn restore_control(&mut self, dir: &Path) -> Result<()> {
        let text = std::fs::read_to_string(dir.join("cpufreq.save")).map_err(Error::from)?;
        for line in text.lines() {
            let mut parts = line.splitn(3, '\t');
            let (Some(name), Some(index), Some(value)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let index: u32 = index
                .parse()
                .map_err(|_| Error::file_parse("malformed cpufreq save file"))?;
            let value: f64 = value
                .parse()
                .map_err(|_| Error::file_parse("malformed cpufreq save file"))?;
            self.write_control(name, Domain::Cpu, index, value)?;
        }
        Ok(())
    }

    fn agg_function(&self, name: &str) -> Result<Aggregation> {
        Ok(self.signal_info(name)?.aggregation)
    }

    fn format_function(&self, name: &str) -> Result<Format> {
        Ok(self.signal_info(name)?.format)
    }

    fn signal_description(&self, name: &str) -> Result<&str> {
        Ok(match name {
            CpufreqDriver::CUR_FREQ => "current scaling frequency, in Hz",
            CpufreqDriver::MAX_FREQ | CpufreqDriver::MIN_FREQ => {
                "scaling frequency policy bound, in Hz"
            }
            other => return Err(Error::invalid(format!("unknown cpufreq signal: {other}"))),
        })
    }

    fn signal_behavior(&self, name: &str) -> Result<Behavior> {
        Ok(self.signal_info(name)?.behavior)
    }
}

fn sysfs_leaf(name: &str) -> &'static str {
    match name {
        CpufreqDriver::CUR_FREQ => "scaling_cur_freq",
        CpufreqDriver::MAX_FREQ => "scaling_max_freq",
        _ => "scaling_min_freq",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, CpufreqIoGroup) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("policy0")).unwrap();
        std::fs::write(dir.path().join("policy0/scaling_cur_freq"), "1200000").unwrap();
        std::fs::write(dir.path().join("policy0/scaling_max_freq"), "2400000").unwrap();
        let driver = CpufreqDriver::with_root(dir.path().to_path_buf());
        (dir, CpufreqIoGroup::with_driver(driver))
    }

    #[test]
    fn push_is_idempotent_for_same_request() {
        let (_dir, mut group) = fixture();
        let h1 = group
            .push_signal(CpufreqDriver::CUR_FREQ, Domain::Cpu, 0)
            .unwrap();
        let h2 = group
            .push_signal(CpufreqDriver::CUR_FREQ, Domain::Cpu, 0)
            .unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn push_after_read_batch_is_rejected_until_reset() {
        let (_dir, mut group) = fixture();
        group
            .push_signal(CpufreqDriver::CUR_FREQ, Domain::Cpu, 0)
            .unwrap();
        group.read_batch().unwrap();
        let err = group.push_signal(CpufreqDriver::MAX_FREQ, Domain::Cpu, 0);
        assert!(err.is_err());
    }

    #[test]
    fn sample_matches_read_signal_after_batch() {
        let (_dir, mut group) = fixture();
        let h = group
            .push_signal(CpufreqDriver::CUR_FREQ, Domain::Cpu, 0)
            .unwrap();
        group.read_batch().unwrap();
        let batched = group.sample(h).unwrap();
        let direct = group.read_signal(CpufreqDriver::CUR_FREQ, Domain::Cpu, 0).unwrap();
        assert_eq!(batched, direct);
    }

    #[test]
    fn sample_before_read_batch_is_logic_error() {
        let (_dir, mut group) = fixture();
        let h = group
            .push_signal(CpufreqDriver::CUR_FREQ, Domain::Cpu, 0)
            .unwrap();
        assert!(group.sample(h).is_err());
    }

    #[test]
    fn save_then_restore_returns_control_to_its_saved_value() {
        let (_dir, mut group) = fixture();
        let h = group
            .push_control(CpufreqDriver::MAX_FREQ, Domain::Cpu, 0)
            .unwrap();

        let save_dir = tempfile::tempdir().unwrap();
        group.save_control(save_dir.path()).unwrap();

        group.adjust(h, 1_800_000.0).unwrap();
        group.write_batch().unwrap();
        assert_eq!(
            group
                .read_signal(CpufreqDriver::MAX_FREQ, Domain::Cpu, 0)
                .unwrap(),
            1_800_000.0
        );

        group.restore_control(save_dir.path()).unwrap();
        assert_eq!(
            group
                .read_signal(CpufreqDriver::MAX_FREQ, Domain::Cpu, 0)
                .unwrap(),
            2_400_000.0
        );
    }
}
