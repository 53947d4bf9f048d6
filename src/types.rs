//! Core data types shared across the control plane: domains, handles,
//! timestamps, and signal/control metadata (`spec.md` §3).

use std::fmt;

/// A topological granularity at which signals and controls are addressed.
///
/// Domains form a partial order under containment (`cpu ⊂ core ⊂ package ⊂
/// board`); see [`Domain::contains`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum Domain {
    /// The entire node. `num_domain(Board) == 1` always.
    Board,
    /// A CPU package (socket).
    Package,
    /// A physical core.
    Core,
    /// A logical CPU (hardware thread).
    Cpu,
    /// A memory controller/NUMA affinity domain.
    Memory,
    /// Memory local to one package.
    PackageMemory,
    /// A network interface controller.
    Nic,
    /// A NIC local to one package.
    PackageNic,
    /// An accelerator device (e.g. GPU).
    Accelerator,
    /// An accelerator local to one package.
    PackageAccelerator,
}

impl Domain {
    /// All domains, board-to-finest order used for nesting comparisons.
    pub const ALL: [Domain; 10] = [
        Domain::Board,
        Domain::Package,
        Domain::Core,
        Domain::Cpu,
        Domain::Memory,
        Domain::PackageMemory,
        Domain::Nic,
        Domain::PackageNic,
        Domain::Accelerator,
        Domain::PackageAccelerator,
    ];

    /// Returns the domain this domain nests directly inside, if any.
    ///
    /// `Board` is the root and nests inside nothing. Per-package domains
    /// (`PackageMemory`, `PackageNic`, `PackageAccelerator`) nest inside
    /// `Package`; `Core`/`Memory`/`Nic`/`Accelerator` nest inside `Board`
    /// directly in the general case (the `Topology` resolves the concrete
    /// containment index; this is only the *type* relationship).
    #[must_use]
    pub const fn parent(self) -> Option<Domain> {
        match self {
            Domain::Board => None,
            Domain::Package => Some(Domain::Board),
            Domain::Core => Some(Domain::Package),
            Domain::Cpu => Some(Domain::Core),
            Domain::Memory
            | Domain::Nic
            | Domain::Accelerator => Some(Domain::Board),
            Domain::PackageMemory | Domain::PackageNic | Domain::PackageAccelerator => {
                Some(Domain::Package)
            }
        }
    }

    /// Whether `self` is the same as, or strictly nested inside, `outer`.
    #[must_use]
    pub fn nests_in(self, outer: Domain) -> bool {
        let mut cur = self;
        loop {
            if cur == outer {
                return true;
            }
            match cur.parent() {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Domain::Board => "board",
            Domain::Package => "package",
            Domain::Core => "core",
            Domain::Cpu => "cpu",
            Domain::Memory => "memory",
            Domain::PackageMemory => "package_memory",
            Domain::Nic => "nic",
            Domain::PackageNic => "package_nic",
            Domain::Accelerator => "accelerator",
            Domain::PackageAccelerator => "package_accelerator",
        };
        f.write_str(s)
    }
}

/// A stable handle returned by `push_signal`/`push_control`.
///
/// Distinct newtypes for signal and control handles would prevent mixing
/// them up entirely, but the PIO batch registry intentionally shares one
/// handle space (a signal and a control pushed in sequence never collide)
/// so a single `HandleId` is used and misuse (e.g. calling `sample` on a
/// control handle) is caught at runtime with [`crate::error::Kind::Logic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u32);

impl HandleId {
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A monotonic timestamp with nanosecond resolution.
///
/// Mirrors the role of `geopm_time_s` in the original implementation: every
/// timestamp in a shared-memory region or a record log uses this type so
/// that freshness/ordering comparisons are a single `Ord` implementation
/// rather than ad hoc `SystemTime` arithmetic at each call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The zero instant.
    pub const ZERO: Self = Self(0);

    /// Constructs a `Time` from nanoseconds since an arbitrary fixed epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Returns nanoseconds since the fixed epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the current monotonic time, relative to process start.
    #[must_use]
    pub fn now() -> Self {
        static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(std::time::Instant::now);
        Self(start.elapsed().as_nanos() as u64)
    }

    /// Seconds between `self` and `earlier`, saturating at zero if `self`
    /// precedes `earlier`.
    #[must_use]
    pub fn duration_since_secs(self, earlier: Self) -> f64 {
        self.0.saturating_sub(earlier.0) as f64 / 1e9
    }

    /// Adds a duration expressed in seconds, saturating on overflow.
    #[must_use]
    pub fn add_secs(self, secs: f64) -> Self {
        let nanos = (secs.max(0.0) * 1e9) as u64;
        Self(self.0.saturating_add(nanos))
    }
}

/// How an aggregator combines multiple native-domain values into one
/// coarser-domain value (`spec.md` §3 "Signal metadata").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Arithmetic sum.
    Sum,
    /// Arithmetic mean.
    Average,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
    /// Median.
    Median,
    /// Sample standard deviation.
    Stddev,
    /// Logical AND (non-zero is true).
    LogicalAnd,
    /// Logical OR (non-zero is true).
    LogicalOr,
    /// Combine region hashes: the common hash if all agree, else the
    /// reserved "unmarked" hash (`0`).
    RegionHash,
    /// All inputs must agree; disagreement is a `Logic` error.
    ExpectSame,
    /// Take the first input verbatim.
    SelectFirst,
}

impl Aggregation {
    /// Combines a non-empty slice of values according to this aggregator.
    ///
    /// Returns `NaN` for an empty slice; callers must not invoke this with
    /// zero inputs in practice since a pushed signal always resolves to at
    /// least one native-domain reading.
    #[must_use]
    pub fn combine(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return f64::NAN;
        }
        match self {
            Aggregation::Sum => values.iter().copied().filter(|v| !v.is_nan()).sum(),
            Aggregation::Average => {
                let present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
                if present.is_empty() {
                    f64::NAN
                } else {
                    present.iter().sum::<f64>() / present.len() as f64
                }
            }
            Aggregation::Min => values
                .iter()
                .copied()
                .filter(|v| !v.is_nan())
                .fold(f64::INFINITY, f64::min),
            Aggregation::Max => values
                .iter()
                .copied()
                .filter(|v| !v.is_nan())
                .fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Median => {
                let mut present: Vec<f64> =
                    values.iter().copied().filter(|v| !v.is_nan()).collect();
                if present.is_empty() {
                    return f64::NAN;
                }
                present.sort_by(|a, b| a.partial_cmp(b).unwrap());
                let mid = present.len() / 2;
                if present.len() % 2 == 0 {
                    (present[mid - 1] + present[mid]) / 2.0
                } else {
                    present[mid]
                }
            }
            Aggregation::Stddev => {
                let present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
                if present.is_empty() {
                    return f64::NAN;
                }
                let mean = present.iter().sum::<f64>() / present.len() as f64;
                let var =
                    present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / present.len() as f64;
                var.sqrt()
            }
            Aggregation::LogicalAnd => {
                if values.iter().all(|v| *v != 0.0) {
                    1.0
                } else {
                    0.0
                }
            }
            Aggregation::LogicalOr => {
                if values.iter().any(|v| *v != 0.0) {
                    1.0
                } else {
                    0.0
                }
            }
            Aggregation::RegionHash => {
                let first = values[0];
                if values.iter().all(|v| *v == first) {
                    first
                } else {
                    0.0
                }
            }
            Aggregation::ExpectSame => values[0],
            Aggregation::SelectFirst => values[0],
        }
    }
}

/// How a signal's string representation should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Fixed-point decimal.
    Decimal,
    /// Plain integer.
    Integer,
    /// Hexadecimal (`0x...`).
    Hex,
    /// Bitmask, rendered as `0b...`.
    Bitmask,
}

impl Format {
    /// Renders `value` according to this format.
    #[must_use]
    pub fn render(self, value: f64) -> String {
        match self {
            Format::Decimal => format!("{value:.6}"),
            Format::Integer => format!("{}", value as i64),
            Format::Hex => format!("{:#x}", value as i64),
            Format::Bitmask => format!("{:#b}", value as i64),
        }
    }
}

/// How a signal's value evolves over time; governs `SampleAggregator`
/// arithmetic (`spec.md` §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Never changes after being read once (e.g. a TDP constant).
    Constant,
    /// Monotonically non-decreasing (e.g. cumulative energy, cycles).
    Monotone,
    /// Instantaneous, can move in either direction (e.g. power, frequency).
    Variable,
    /// A categorical/string-like value (e.g. a region hash); not
    /// accumulated, only the latest observation is meaningful.
    Label,
}

/// Returns `true` iff `x` is a present (non-`NaN`) value.
///
/// This is the *only* distinction the PIO boundary makes between "present"
/// and "absent" (`spec.md` §4.4).
#[must_use]
pub fn is_valid_value(x: f64) -> bool {
    !x.is_nan()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_nesting() {
        assert!(Domain::Cpu.nests_in(Domain::Core));
        assert!(Domain::Cpu.nests_in(Domain::Package));
        assert!(Domain::Cpu.nests_in(Domain::Board));
        assert!(!Domain::Package.nests_in(Domain::Core));
        assert!(Domain::Board.nests_in(Domain::Board));
    }

    #[test]
    fn aggregation_sum_ignores_nan() {
        assert_eq!(Aggregation::Sum.combine(&[1.0, f64::NAN, 2.0]), 3.0);
    }

    #[test]
    fn aggregation_region_hash_disagreement_is_unmarked() {
        assert_eq!(Aggregation::RegionHash.combine(&[1.0, 2.0]), 0.0);
        assert_eq!(Aggregation::RegionHash.combine(&[5.0, 5.0]), 5.0);
    }

    #[test]
    fn valid_value_excludes_nan() {
        assert!(is_valid_value(1.0));
        assert!(!is_valid_value(f64::NAN));
    }
}
