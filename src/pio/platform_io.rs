//! PlatformIO: the unified registry over IOGroups (`spec.md` §4.4,
//! component C4).

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::pio::iogroup::IoGroup;
use crate::types::{Aggregation, Behavior, Domain, HandleId};

/// A derived signal: a named combination of other (already-registered)
/// signals, resolved at `sample` time by recursively sampling its parents.
struct DerivedSignal {
    /// How to combine the parents' sampled values.
    combine: fn(&[f64]) -> f64,
    /// The `(name, domain, index)` of each parent, in the order `combine`
    /// expects them.
    parents: Vec<(String, Domain, u32)>,
}

enum HandleKind {
    /// A handle owned by IOGroup `group_index`, stored under its own
    /// `HandleId` in that group.
    Native {
        group_index: usize,
        native_handle: HandleId,
    },
    /// A derived signal handle; its parents are pushed into their own
    /// IOGroups and resolved recursively on `sample`.
    Derived(DerivedSignal),
}

/// The unified registry over every registered [`IoGroup`].
///
/// On a name collision between groups, the *last*-registered group wins
/// (`spec.md` §4.4 "enables override"); see the tie-break note for
/// simultaneous registration order recorded in `DESIGN.md`.
pub struct PlatformIO {
    groups: Vec<Box<dyn IoGroup>>,
    /// Maps a signal name to the index of the group that currently owns it
    /// (last write wins).
    signal_owner: HashMap<String, usize>,
    control_owner: HashMap<String, usize>,
    aliases: HashMap<&'static str, &'static str>,
    handles: Vec<HandleKind>,
    handle_is_control: Vec<bool>,
    derived_parent_handles: HashMap<HandleId, Vec<(usize, HandleId)>>,
    locked: bool,
}

impl PlatformIO {
    /// Constructs an empty registry with no IOGroups.
    #[must_use]
    pub fn new() -> Self {
        let mut aliases = HashMap::new();
        // CPU_POWER is a derived alias: per-package ENERGY_PACKAGE divided
        // by elapsed TIME, summed across packages (`spec.md` §4.4).
        aliases.insert("CPU_POWER", "CPU_POWER");
        Self {
            groups: Vec::new(),
            signal_owner: HashMap::new(),
            control_owner: HashMap::new(),
            aliases,
            handles: Vec::new(),
            handle_is_control: Vec::new(),
            derived_parent_handles: HashMap::new(),
            locked: false,
        }
    }

    /// Registers an IOGroup, indexing its signal/control names. A name
    /// already owned by an earlier group is overridden (`spec.md` §4.4).
    pub fn register_iogroup(&mut self, group: Box<dyn IoGroup>) {
        let idx = self.groups.len();
        for name in group.signal_names() {
            self.signal_owner.insert(name.to_string(), idx);
        }
        for name in group.control_names() {
            self.control_owner.insert(name.to_string(), idx);
        }
        self.groups.push(group);
    }

    fn resolve_signal_owner(&self, name: &str) -> Result<usize> {
        self.signal_owner
            .get(name)
            .copied()
            .ok_or_else(|| Error::invalid(format!("unknown signal: {name}")))
    }

    fn resolve_control_owner(&self, name: &str) -> Result<usize> {
        self.control_owner
            .get(name)
            .copied()
            .ok_or_else(|| Error::invalid(format!("unknown control: {name}")))
    }

    /// Pushes a signal for batched reading, resolving aliases and derived
    /// signals first.
    ///
    /// # Errors
    ///
    /// [`crate::error::Kind::Logic`] if called after the first
    /// [`PlatformIO::read_batch`] without an intervening
    /// [`PlatformIO::reset_batch`].
    pub fn push_signal(&mut self, name: &str, domain: Domain, index: u32) -> Result<HandleId> {
        if self.locked {
            return Err(Error::logic(
                "push_signal after read_batch: call reset_batch() first",
            ));
        }
        if name == "CPU_POWER" {
            return self.push_cpu_power(domain, index);
        }
        let owner = self.resolve_signal_owner(name)?;
        let native = self.groups[owner].push_signal(name, domain, index)?;
        let handle = HandleId::new(self.handles.len() as u32);
        self.handles.push(HandleKind::Native {
            group_index: owner,
            native_handle: native,
        });
        self.handle_is_control.push(false);
        Ok(handle)
    }

    fn push_cpu_power(&mut self, domain: Domain, index: u32) -> Result<HandleId> {
        // CPU_POWER = sum(ENERGY_PACKAGE@pkg) / TIME@board — a fixed
        // two-parent derivation regardless of requested domain, since power
        // is always board-wide in this simplified model. If the aliased
        // source fails, the alias fails with the same error kind
        // (`spec.md` §4.4 "PIO aliases never silently degrade").
        let energy_owner = self.resolve_signal_owner("ENERGY_PACKAGE")?;
        let time_owner = self.resolve_signal_owner("TIME")?;
        let energy_handle = self.groups[energy_owner].push_signal("ENERGY_PACKAGE", domain, index)?;
        let time_handle = self.groups[time_owner].push_signal("TIME", Domain::Board, 0)?;

        let derived = DerivedSignal {
            combine: |vals| {
                let energy = vals[0];
                let time = vals[1];
                if time == 0.0 { f64::NAN } else { energy / time }
            },
            parents: vec![
                ("ENERGY_PACKAGE".to_string(), domain, index),
                ("TIME".to_string(), Domain::Board, 0),
            ],
        };
        // Stash the native parent handles alongside the derivation so
        // `sample` does not need to re-push.
        let handle = HandleId::new(self.handles.len() as u32);
        self.handles.push(HandleKind::Derived(derived));
        self.handle_is_control.push(false);
        // Record parent native handles via a side table keyed by this
        // handle for `sample` to retrieve without re-resolving names.
        self.derived_parent_handles.insert(
            handle,
            vec![
                (energy_owner, energy_handle),
                (time_owner, time_handle),
            ],
        );
        Ok(handle)
    }

    /// Pushes a control for batched writing.
    pub fn push_control(&mut self, name: &str, domain: Domain, index: u32) -> Result<HandleId> {
        if self.locked {
            return Err(Error::logic(
                "push_control after write_batch: call reset_batch() first",
            ));
        }
        let owner = self.resolve_control_owner(name)?;
        let native = self.groups[owner].push_control(name, domain, index)?;
        let handle = HandleId::new(self.handles.len() as u32);
        self.handles.push(HandleKind::Native {
            group_index: owner,
            native_handle: native,
        });
        self.handle_is_control.push(true);
        Ok(handle)
    }

    /// Coalesces all pushed signals per owning IOGroup and invokes each
    /// group's `read_batch` exactly once (`spec.md` §4.4 "Batch planning").
    #[tracing::instrument(level = "trace", skip(self), fields(groups = self.groups.len()))]
    pub fn read_batch(&mut self) -> Result<()> {
        self.locked = true;
        for group in &mut self.groups {
            group.read_batch()?;
        }
        Ok(())
    }

    /// Invokes each group's `write_batch` exactly once.
    #[tracing::instrument(level = "trace", skip(self), fields(groups = self.groups.len()))]
    pub fn write_batch(&mut self) -> Result<()> {
        self.locked = true;
        for group in &mut self.groups {
            group.write_batch()?;
        }
        Ok(())
    }

    /// Clears all pushed handles and unlocks the registry for new pushes.
    pub fn reset_batch(&mut self) {
        self.locked = false;
        self.handles.clear();
        self.handle_is_control.clear();
        self.derived_parent_handles.clear();
    }

    /// The most recent batched value for `handle`.
    pub fn sample(&self, handle: HandleId) -> Result<f64> {
        let kind = self
            .handles
            .get(handle.index())
            .ok_or_else(|| Error::logic(format!("unknown handle {handle}")))?;
        match kind {
            HandleKind::Native {
                group_index,
                native_handle,
            } => self.groups[*group_index].sample(*native_handle),
            HandleKind::Derived(derived) => {
                let parent_handles = self
                    .derived_parent_handles
                    .get(&handle)
                    .ok_or_else(|| Error::logic("derived signal missing parent handles"))?;
                let mut values = Vec::with_capacity(parent_handles.len());
                for (group_index, native_handle) in parent_handles {
                    values.push(self.groups[*group_index].sample(*native_handle)?);
                }
                let _ = &derived.parents;
                Ok((derived.combine)(&values))
            }
        }
    }

    /// Stages `value` for a pushed control handle.
    pub fn adjust(&mut self, handle: HandleId, value: f64) -> Result<()> {
        match self
            .handles
            .get(handle.index())
            .ok_or_else(|| Error::logic(format!("unknown handle {handle}")))?
        {
            HandleKind::Native {
                group_index,
                native_handle,
            } => self.groups[*group_index].adjust(*native_handle, value),
            HandleKind::Derived(_) => Err(Error::logic("cannot adjust a derived signal")),
        }
    }

    /// Reads `(name, domain, index)` directly, bypassing the batch.
    pub fn read_signal(&self, name: &str, domain: Domain, index: u32) -> Result<f64> {
        let owner = self.resolve_signal_owner(name)?;
        self.groups[owner].read_signal(name, domain, index)
    }

    /// Writes `(name, domain, index)` directly, bypassing the batch.
    pub fn write_control(&mut self, name: &str, domain: Domain, index: u32, value: f64) -> Result<()> {
        let owner = self.resolve_control_owner(name)?;
        self.groups[owner].write_control(name, domain, index, value)
    }

    /// The native domain of `name`.
    pub fn signal_domain_type(&self, name: &str) -> Result<Domain> {
        let owner = self.resolve_signal_owner(name)?;
        self.groups[owner].signal_domain_type(name)
    }

    /// The native domain of control `name`, or [`Domain::Board`] mapped to
    /// an invalid error if the control is entirely unknown to every group
    /// (mirrors the "domain type invalid" sentinel of the original API).
    pub fn control_domain_type(&self, name: &str) -> Result<Domain> {
        let owner = self.resolve_control_owner(name)?;
        self.groups[owner].control_domain_type(name)
    }

    /// Whether `name` is known by any registered group.
    #[must_use]
    pub fn is_valid_signal(&self, name: &str) -> bool {
        self.signal_owner.contains_key(name) || name == "CPU_POWER"
    }

    /// Whether `name` is a known control.
    #[must_use]
    pub fn is_valid_control(&self, name: &str) -> bool {
        self.control_owner.contains_key(name)
    }

    /// The aggregator declared for `name`.
    pub fn agg_function(&self, name: &str) -> Result<Aggregation> {
        let owner = self.resolve_signal_owner(name)?;
        self.groups[owner].agg_function(name)
    }

    /// The behavior declared for `name`.
    pub fn signal_behavior(&self, name: &str) -> Result<Behavior> {
        let owner = self.resolve_signal_owner(name)?;
        self.groups[owner].signal_behavior(name)
    }

    /// Snapshots every registered group's controls into `dir`.
    pub fn save_control(&mut self, dir: &std::path::Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(Error::from)?;
        for group in &mut self.groups {
            group.save_control(dir)?;
        }
        Ok(())
    }

    /// Restores every registered group's controls from `dir`.
    pub fn restore_control(&mut self, dir: &std::path::Path) -> Result<()> {
        for group in &mut self.groups {
            group.restore_control(dir)?;
        }
        Ok(())
    }
}

impl Default for PlatformIO {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pio::iogroup::IoGroup;
    use crate::types::Format;
    use std::collections::HashMap as StdHashMap;
    use std::path::Path;

    /// A trivial in-memory IOGroup for exercising [`PlatformIO`] in
    /// isolation from any real driver.
    struct MockIoGroup {
        tag: &'static str,
        values: StdHashMap<&'static str, f64>,
        next_handle: u32,
        handle_names: StdHashMap<HandleId, &'static str>,
    }

    impl MockIoGroup {
        fn new(tag: &'static str, signal: &'static str, value: f64) -> Self {
            let mut values = StdHashMap::new();
            values.insert(signal, value);
            Self {
                tag,
                values,
                next_handle: 0,
                handle_names: StdHashMap::new(),
            }
        }
    }

    impl IoGroup for MockIoGroup {
        fn name(&self) -> &'static str {
            self.tag
        }

        fn signal_names(&self) -> Vec<&'static str> {
            self.values.keys().copied().collect()
        }

        fn control_names(&self) -> Vec<&'static str> {
            self.values.keys().copied().collect()
        }

        fn signal_domain_type(&self, _name: &str) -> Result<Domain> {
            Ok(Domain::Board)
        }

        fn control_domain_type(&self, _name: &str) -> Result<Domain> {
            Ok(Domain::Board)
        }

        fn push_signal(&mut self, name: &str, _domain: Domain, _index: u32) -> Result<HandleId> {
            let name = self
                .values
                .keys()
                .find(|k| **k == name)
                .copied()
                .ok_or_else(|| Error::invalid(format!("unknown signal: {name}")))?;
            let h = HandleId::new(self.next_handle);
            self.next_handle += 1;
            self.handle_names.insert(h, name);
            Ok(h)
        }

        fn push_control(&mut self, name: &str, domain: Domain, index: u32) -> Result<HandleId> {
            self.push_signal(name, domain, index)
        }

        fn read_batch(&mut self) -> Result<()> {
            Ok(())
        }

        fn write_batch(&mut self) -> Result<()> {
            Ok(())
        }

        fn sample(&self, handle: HandleId) -> Result<f64> {
            let name = self
                .handle_names
                .get(&handle)
                .ok_or_else(|| Error::logic(format!("unknown handle {handle}")))?;
            Ok(self.values[name])
        }

        fn adjust(&mut self, _handle: HandleId, _value: f64) -> Result<()> {
            Ok(())
        }

        fn read_signal(&self, name: &str, _domain: Domain, _index: u32) -> Result<f64> {
            self.values
                .get(name)
                .copied()
                .ok_or_else(|| Error::invalid(format!("unknown signal: {name}")))
        }

        fn write_control(&mut self, _n: &str, _d: Domain, _i: u32, _v: f64) -> Result<()> {
            Ok(())
        }

        fn save_control(&mut self, _dir: &Path) -> Result<()> {
            Ok(())
        }

        fn restore_control(&mut self, _dir: &Path) -> Result<()> {
            Ok(())
        }

        fn agg_function(&self, _name: &str) -> Result<Aggregation> {
            Ok(Aggregation::Average)
        }

        fn format_function(&self, _name: &str) -> Result<Format> {
            Ok(Format::Decimal)
        }

        fn signal_description(&self, _name: &str) -> Result<&str> {
            Ok("mock signal")
        }

        fn signal_behavior(&self, _name: &str) -> Result<Behavior> {
            Ok(Behavior::Variable)
        }
    }

    #[test]
    fn later_registration_overrides_name_owner() {
        let mut pio = PlatformIO::new();
        pio.register_iogroup(Box::new(MockIoGroup::new("FIRST", "SHARED", 1.0)));
        pio.register_iogroup(Box::new(MockIoGroup::new("SECOND", "SHARED", 2.0)));
        let h = pio.push_signal("SHARED", Domain::Board, 0).unwrap();
        pio.read_batch().unwrap();
        assert_eq!(pio.sample(h).unwrap(), 2.0);
    }

    #[test]
    fn cpu_power_derives_from_energy_and_time() {
        let mut pio = PlatformIO::new();
        pio.register_iogroup(Box::new(MockIoGroup::new("ENERGY", "ENERGY_PACKAGE", 200.0)));
        pio.register_iogroup(Box::new(MockIoGroup::new("TIME", "TIME", 4.0)));
        let h = pio.push_signal("CPU_POWER", Domain::Package, 0).unwrap();
        pio.read_batch().unwrap();
        assert_eq!(pio.sample(h).unwrap(), 50.0);
    }

    #[test]
    fn derived_signal_cannot_be_adjusted() {
        let mut pio = PlatformIO::new();
        pio.register_iogroup(Box::new(MockIoGroup::new("ENERGY", "ENERGY_PACKAGE", 200.0)));
        pio.register_iogroup(Box::new(MockIoGroup::new("TIME", "TIME", 4.0)));
        let h = pio.push_signal("CPU_POWER", Domain::Package, 0).unwrap();
        assert!(pio.adjust(h, 10.0).is_err());
    }

    #[test]
    fn push_after_lock_requires_reset() {
        let mut pio = PlatformIO::new();
        pio.register_iogroup(Box::new(MockIoGroup::new("A", "SIG", 1.0)));
        pio.push_signal("SIG", Domain::Board, 0).unwrap();
        pio.read_batch().unwrap();
        assert!(pio.push_signal("SIG", Domain::Board, 1).is_err());
        pio.reset_batch();
        assert!(pio.push_signal("SIG", Domain::Board, 1).is_ok());
    }

    #[test]
    fn unknown_signal_is_invalid_error() {
        let pio = PlatformIO::new();
        assert!(!pio.is_valid_signal("NOPE"));
        assert!(pio.read_signal("NOPE", Domain::Board, 0).is_err());
    }
}
