//! ApplicationStatus: a lock-free per-CPU status cell (`spec.md` §4.6,
//! component C6).
//!
//! One cell per CPU is written only by the application thread currently
//! running on that CPU and read only by the Controller; a
//! `parking_lot::Mutex` per cell would serialize the application's hot
//! path behind the Controller's sampling cadence, so each cell is instead
//! a small set of atomics, mirroring the lock-free per-CPU design the
//! original implementation uses for the same reason.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::error::{Error, Result};

/// A scheduling/region hint; must be a power of two (`spec.md` §4.6) so
/// multiple hints can be OR-combined into one bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hint(u64);

impl Hint {
    /// No hint asserted.
    pub const UNSET: Self = Self(0);
    /// The region is compute-bound.
    pub const COMPUTE: Self = Self(1 << 0);
    /// The region is memory-bandwidth-bound.
    pub const MEMORY: Self = Self(1 << 1);
    /// The region is network-bound.
    pub const NETWORK: Self = Self(1 << 2);
    /// The region is blocked on I/O.
    pub const IO: Self = Self(1 << 3);
    /// The region runs serially (no parallel work available).
    pub const SERIAL: Self = Self(1 << 4);
    /// The region runs in a parallel section.
    pub const PARALLEL: Self = Self(1 << 5);
    /// Unclassified.
    pub const UNKNOWN: Self = Self(1 << 6);
    /// Explicitly excluded from region-aware control.
    pub const IGNORE: Self = Self(1 << 7);

    /// Constructs a `Hint` from a raw bitmask, rejecting anything that
    /// isn't a single power of two (or zero for [`Hint::UNSET`]).
    pub fn from_bits(bits: u64) -> Result<Self> {
        if bits != 0 && bits & (bits - 1) != 0 {
            return Err(Error::invalid(format!(
                "hint {bits:#x} is not a power of two"
            )));
        }
        Ok(Self(bits))
    }

    /// The raw bitmask.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }
}

/// One CPU's status cell.
struct Cell {
    /// Low 32 bits: region hash. High 32 bits reserved (always zero);
    /// enforced at `set_hash`.
    hash: AtomicU64,
    hint: AtomicU64,
    total_work_units: AtomicI64,
    completed_work_units: AtomicI64,
}

impl Cell {
    const fn new() -> Self {
        Self {
            hash: AtomicU64::new(crate::hash::UNMARKED),
            hint: AtomicU64::new(Hint::UNSET.0),
            total_work_units: AtomicI64::new(0),
            completed_work_units: AtomicI64::new(0),
        }
    }
}

/// A per-CPU table of application status cells (`spec.md` §4.6).
///
/// Indexed by logical CPU number up to `num_cpu`, matching
/// [`crate::topology::Topology::num_domain`] for [`crate::types::Domain::Cpu`].
pub struct ApplicationStatus {
    cells: Vec<Cell>,
}

impl ApplicationStatus {
    /// Constructs a table sized for `num_cpu` CPUs, all cells cleared.
    #[must_use]
    pub fn new(num_cpu: usize) -> Self {
        let mut cells = Vec::with_capacity(num_cpu);
        cells.resize_with(num_cpu, Cell::new);
        Self { cells }
    }

    fn cell(&self, cpu: usize) -> Result<&Cell> {
        self.cells
            .get(cpu)
            .ok_or_else(|| Error::invalid(format!("invalid CPU index: {cpu}")))
    }

    /// Sets the scheduling hint active on `cpu`.
    pub fn set_hint(&self, cpu: usize, hint: Hint) -> Result<()> {
        self.cell(cpu)?.hint.store(hint.0, Ordering::Release);
        Ok(())
    }

    /// Returns the scheduling hint currently active on `cpu`.
    pub fn get_hint(&self, cpu: usize) -> Result<Hint> {
        Ok(Hint(self.cell(cpu)?.hint.load(Ordering::Acquire)))
    }

    /// Sets the region hash active on `cpu`. Bits set above the low 32
    /// (`spec.md` §4.6) are rejected.
    pub fn set_hash(&self, cpu: usize, hash: u64) -> Result<()> {
        if hash > u64::from(u32::MAX) {
            return Err(Error::invalid(format!(
                "region hash {hash:#x} has bits set outside the low 32"
            )));
        }
        self.cell(cpu)?.hash.store(hash, Ordering::Release);
        Ok(())
    }

    /// Returns the region hash active on `cpu`.
    pub fn get_hash(&self, cpu: usize) -> Result<u64> {
        Ok(self.cell(cpu)?.hash.load(Ordering::Acquire))
    }

    /// Sets the total work-unit count for the region currently active on
    /// `cpu`, resetting `completed_work_units` to zero. `n < 0` is
    /// rejected.
    pub fn set_total_work_units(&self, cpu: usize, n: i64) -> Result<()> {
        if n < 0 {
            return Err(Error::invalid(format!("negative work unit total: {n}")));
        }
        let cell = self.cell(cpu)?;
        cell.total_work_units.store(n, Ordering::Release);
        cell.completed_work_units.store(0, Ordering::Release);
        Ok(())
    }

    /// Increments the completed work-unit count for `cpu` by one.
    ///
    /// # Errors
    ///
    /// [`crate::error::Kind::Runtime`] if `cpu` has already completed its
    /// declared `total_work_units` (`spec.md` §8: "the `n+1`st increment
    /// fails `runtime`") — progress is monotone from `0` to `1` and never
    /// overshoots.
    pub fn increment_work_unit(&self, cpu: usize) -> Result<()> {
        let cell = self.cell(cpu)?;
        let total = cell.total_work_units.load(Ordering::Acquire);
        let mut current = cell.completed_work_units.load(Ordering::Acquire);
        loop {
            if current >= total {
                return Err(Error::runtime(format!(
                    "cpu {cpu} has already completed its declared work-unit total"
                )));
            }
            match cell.completed_work_units.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns the fraction of work completed on `cpu`, in `[0, 1]`, or
    /// `NaN` when no total has been declared (`total_work_units == 0`).
    pub fn get_work_progress(&self, cpu: usize) -> Result<f64> {
        let cell = self.cell(cpu)?;
        let total = cell.total_work_units.load(Ordering::Acquire);
        if total == 0 {
            return Ok(f64::NAN);
        }
        let done = cell.completed_work_units.load(Ordering::Acquire);
        Ok((done as f64 / total as f64).clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_nan_with_no_total_declared() {
        let status = ApplicationStatus::new(4);
        assert!(status.get_work_progress(0).unwrap().is_nan());
    }

    #[test]
    fn progress_tracks_increments() {
        let status = ApplicationStatus::new(4);
        status.set_total_work_units(0, 4).unwrap();
        status.increment_work_unit(0).unwrap();
        assert_eq!(status.get_work_progress(0).unwrap(), 0.25);
        for _ in 0..3 {
            status.increment_work_unit(0).unwrap();
        }
        assert_eq!(status.get_work_progress(0).unwrap(), 1.0);
    }

    #[test]
    fn increment_past_declared_total_fails() {
        let status = ApplicationStatus::new(1);
        status.set_total_work_units(0, 2).unwrap();
        status.increment_work_unit(0).unwrap();
        status.increment_work_unit(0).unwrap();
        assert_eq!(status.get_work_progress(0).unwrap(), 1.0);
        assert!(status.increment_work_unit(0).is_err());
    }

    #[test]
    fn negative_total_is_rejected() {
        let status = ApplicationStatus::new(1);
        assert!(status.set_total_work_units(0, -1).is_err());
    }

    #[test]
    fn invalid_cpu_index_is_rejected() {
        let status = ApplicationStatus::new(2);
        assert!(status.set_hint(5, Hint::COMPUTE).is_err());
    }

    #[test]
    fn non_power_of_two_hint_is_rejected() {
        assert!(Hint::from_bits(3).is_err());
        assert!(Hint::from_bits(4).is_ok());
        assert!(Hint::from_bits(0).is_ok());
    }

    #[test]
    fn hash_with_high_bits_set_is_rejected() {
        let status = ApplicationStatus::new(1);
        assert!(status.set_hash(0, 1u64 << 40).is_err());
        assert!(status.set_hash(0, 0xDEAD_BEEF).is_ok());
    }
}
