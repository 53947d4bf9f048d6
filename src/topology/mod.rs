//! Platform topology enumeration (`spec.md` §4.1, component C1).
//!
//! Resolves the nesting of `board/package/core/cpu/memory/...` domains for
//! the current host and answers containment queries. Constructed once per
//! process on first use (the "Topology cache" lifecycle of `spec.md` §3);
//! [`Topology::create_cache`] persists the resolved mapping so a forked
//! [`crate::pio::batch_server::BatchServer`] child does not need to
//! re-enumerate `/sys`.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Domain;

/// Per-CPU topology coordinates: which core/package/memory domain a given
/// CPU index belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CpuCoords {
    package: u32,
    core: u32,
    memory: u32,
}

/// The resolved platform topology for one host.
///
/// Accelerator and NIC enumeration is driver-dependent and, absent any
/// detected devices, both domains have cardinality zero — callers must not
/// assume `num_domain(Accelerator) > 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    cpu_coords: Vec<CpuCoords>,
    num_package: u32,
    num_core: u32,
    num_memory: u32,
    num_nic: u32,
    num_package_nic: u32,
    num_accelerator: u32,
    num_package_accelerator: u32,
}

impl Topology {
    /// Detects the topology of the current host by reading `/sys`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Kind::Unsupported`] ("platform-unsupported")
    /// if no CPUs can be enumerated or the per-CPU attributes are
    /// inconsistent (e.g. a CPU reports a `core_id`/`physical_package_id`
    /// pair that cannot be parsed).
    pub fn detect() -> Result<Self> {
        Self::detect_from_root(Path::new("/sys/devices/system"))
    }

    /// Like [`Topology::detect`] but reading from an arbitrary root,
    /// letting tests point at a fabricated sysfs tree instead of the real
    /// one.
    pub fn detect_from_root(sys_root: &Path) -> Result<Self> {
        let cpu_root = sys_root.join("cpu");
        let cpu_ids = Self::read_cpu_list(&cpu_root.join("online"))
            .or_else(|_| Self::read_cpu_list(&cpu_root.join("present")))?;
        if cpu_ids.is_empty() {
            return Err(Error::unsupported(
                "platform-unsupported: no CPUs enumerated",
            ));
        }

        let node_of_cpu = Self::read_numa_membership(sys_root, &cpu_ids);

        let mut package_ids = BTreeSet::new();
        let mut core_keys = BTreeSet::new(); // (package_id, core_id)
        let mut node_ids = BTreeSet::new();
        let mut raw = Vec::with_capacity(cpu_ids.len());

        for &cpu in &cpu_ids {
            let topo_dir = cpu_root.join(format!("cpu{cpu}/topology"));
            let package_id = Self::read_u32(&topo_dir.join("physical_package_id"))
                .unwrap_or(0);
            let core_id = Self::read_u32(&topo_dir.join("core_id")).unwrap_or(cpu);
            let node_id = node_of_cpu.get(&cpu).copied().unwrap_or(0);

            package_ids.insert(package_id);
            core_keys.insert((package_id, core_id));
            node_ids.insert(node_id);
            raw.push((cpu, package_id, core_id, node_id));
        }

        let package_index: std::collections::HashMap<u32, u32> = package_ids
            .iter()
            .enumerate()
            .map(|(i, &p)| (p, i as u32))
            .collect();
        let core_index: std::collections::HashMap<(u32, u32), u32> = core_keys
            .iter()
            .enumerate()
            .map(|(i, &k)| (k, i as u32))
            .collect();
        let node_index: std::collections::HashMap<u32, u32> = node_ids
            .iter()
            .enumerate()
            .map(|(i, &n)| (n, i as u32))
            .collect();

        // Dense-reindex CPU ids themselves: cpu domain index != OS cpu id in
        // general (offline CPUs create gaps).
        let mut cpu_coords = Vec::with_capacity(raw.len());
        for (_, package_id, core_id, node_id) in raw {
            cpu_coords.push(CpuCoords {
                package: package_index[&package_id],
                core: core_index[&(package_id, core_id)],
                memory: node_index[&node_id],
            });
        }

        Ok(Self {
            cpu_coords,
            num_package: package_index.len() as u32,
            num_core: core_index.len() as u32,
            num_memory: node_index.len() as u32,
            num_nic: 0,
            num_package_nic: 0,
            num_accelerator: 0,
            num_package_accelerator: 0,
        })
    }

    /// Builds a topology directly from already-resolved cardinalities and
    /// per-CPU coordinates, for tests and for accelerator/NIC drivers that
    /// enumerate their own devices and fold the counts in.
    #[must_use]
    pub fn from_parts(
        num_package: u32,
        num_core_per_package: u32,
        cpus_per_core: u32,
        num_memory: u32,
    ) -> Self {
        let mut cpu_coords = Vec::new();
        for package in 0..num_package {
            for core_in_pkg in 0..num_core_per_package {
                let core = package * num_core_per_package + core_in_pkg;
                for _ in 0..cpus_per_core {
                    let memory = if num_memory == 0 {
                        0
                    } else {
                        package % num_memory.max(1)
                    };
                    cpu_coords.push(CpuCoords {
                        package,
                        core,
                        memory,
                    });
                }
            }
        }
        Self {
            cpu_coords,
            num_package,
            num_core: num_package * num_core_per_package,
            num_memory: num_memory.max(1),
            num_nic: 0,
            num_package_nic: 0,
            num_accelerator: 0,
            num_package_accelerator: 0,
        }
    }

    /// Sets the accelerator cardinality (and its per-package variant),
    /// consuming and returning `self` for use in a builder chain right
    /// after construction.
    #[must_use]
    pub fn with_accelerators(mut self, total: u32, per_package: u32) -> Self {
        self.num_accelerator = total;
        self.num_package_accelerator = per_package;
        self
    }

    /// The cardinality of `domain` on this host.
    #[must_use]
    pub fn num_domain(&self, domain: Domain) -> u32 {
        match domain {
            Domain::Board => 1,
            Domain::Package => self.num_package,
            Domain::Core => self.num_core,
            Domain::Cpu => self.cpu_coords.len() as u32,
            Domain::Memory => self.num_memory,
            Domain::PackageMemory => self.num_package,
            Domain::Nic => self.num_nic,
            Domain::PackageNic => self.num_package_nic,
            Domain::Accelerator => self.num_accelerator,
            Domain::PackageAccelerator => self.num_package_accelerator,
        }
    }

    /// The index of the `domain` instance that contains `cpu_index`.
    ///
    /// # Errors
    ///
    /// [`crate::error::Kind::Invalid`] if `cpu_index` is out of range.
    pub fn domain_idx(&self, domain: Domain, cpu_index: u32) -> Result<u32> {
        let coords = self
            .cpu_coords
            .get(cpu_index as usize)
            .ok_or_else(|| Error::invalid(format!("cpu index out of range: {cpu_index}")))?;
        Ok(match domain {
            Domain::Board => 0,
            Domain::Package | Domain::PackageMemory | Domain::PackageNic | Domain::PackageAccelerator => {
                coords.package
            }
            Domain::Core => coords.core,
            Domain::Cpu => cpu_index,
            Domain::Memory => coords.memory,
            Domain::Nic | Domain::Accelerator => 0,
        })
    }

    /// The set of `inner`-domain indices contained within
    /// `(outer, outer_idx)`.
    ///
    /// # Errors
    ///
    /// [`crate::error::Kind::Invalid`] if `inner` is not nested in `outer`,
    /// or if `outer_idx` is out of range for `outer`.
    pub fn domain_nested(
        &self,
        inner: Domain,
        outer: Domain,
        outer_idx: u32,
    ) -> Result<BTreeSet<u32>> {
        if !inner.nests_in(outer) {
            return Err(Error::invalid(format!(
                "{inner} is not nested in {outer}"
            )));
        }
        if outer_idx >= self.num_domain(outer) {
            return Err(Error::invalid(format!(
                "{outer} index {outer_idx} out of range"
            )));
        }
        if inner == outer {
            return Ok(BTreeSet::from([outer_idx]));
        }

        let mut out = BTreeSet::new();
        for cpu in 0..self.cpu_coords.len() as u32 {
            if self.domain_idx(outer, cpu)? == outer_idx {
                out.insert(self.domain_idx(inner, cpu)?);
            }
        }
        Ok(out)
    }

    /// Persists the resolved topology to `path` as JSON so that a child
    /// process (notably the batch server) can load it with
    /// [`Topology::from_cache`] instead of re-enumerating `/sys`.
    pub fn create_cache(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json).map_err(Error::from)
    }

    /// Loads a topology previously written by [`Topology::create_cache`].
    pub fn from_cache(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(Error::from)?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }

    fn read_cpu_list(path: &Path) -> Result<Vec<u32>> {
        let text = fs::read_to_string(path).map_err(Error::from)?;
        Self::parse_list(text.trim())
    }

    /// Parses a Linux list-range string like `0-3,8,10-11` into indices.
    fn parse_list(text: &str) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        for part in text.split(',').filter(|s| !s.is_empty()) {
            if let Some((start, end)) = part.split_once('-') {
                let start: u32 = start
                    .trim()
                    .parse()
                    .map_err(|_| Error::unsupported("platform-unsupported: bad cpu list"))?;
                let end: u32 = end
                    .trim()
                    .parse()
                    .map_err(|_| Error::unsupported("platform-unsupported: bad cpu list"))?;
                out.extend(start..=end);
            } else {
                let v: u32 = part
                    .trim()
                    .parse()
                    .map_err(|_| Error::unsupported("platform-unsupported: bad cpu list"))?;
                out.push(v);
            }
        }
        Ok(out)
    }

    fn read_u32(path: &Path) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    fn read_numa_membership(
        sys_root: &Path,
        cpu_ids: &[u32],
    ) -> std::collections::HashMap<u32, u32> {
        let mut map = std::collections::HashMap::new();
        let node_root = sys_root.join("node");
        let Ok(entries) = fs::read_dir(&node_root) else {
            return map;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(node_num) = name.strip_prefix("node").and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if let Ok(cpus) = Self::read_cpu_list(&entry.path().join("cpulist")) {
                for cpu in cpus {
                    if cpu_ids.contains(&cpu) {
                        map.insert(cpu, node_num);
                    }
                }
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo() -> Topology {
        // 2 packages, 2 cores/package, 2 cpus/core = 8 cpus, 2 memory domains.
        Topology::from_parts(2, 2, 2, 2)
    }

    #[test]
    fn board_is_singleton() {
        assert_eq!(topo().num_domain(Domain::Board), 1);
    }

    #[test]
    fn cpu_nests_in_core_package_board() {
        let t = topo();
        let core0 = t.domain_idx(Domain::Core, 0).unwrap();
        let pkg0 = t.domain_idx(Domain::Package, 0).unwrap();
        let siblings = t.domain_nested(Domain::Cpu, Domain::Core, core0).unwrap();
        assert_eq!(siblings.len(), 2);
        let cpus_in_pkg = t
            .domain_nested(Domain::Cpu, Domain::Package, pkg0)
            .unwrap();
        assert_eq!(cpus_in_pkg.len(), 4);
    }

    #[test]
    fn domain_nested_rejects_non_nesting_pair() {
        let t = topo();
        assert!(t.domain_nested(Domain::Package, Domain::Core, 0).is_err());
    }

    #[test]
    fn cache_round_trips() {
        let t = topo();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topo.json");
        t.create_cache(&path).unwrap();
        let loaded = Topology::from_cache(&path).unwrap();
        assert_eq!(loaded.num_domain(Domain::Cpu), t.num_domain(Domain::Cpu));
    }

    #[test]
    fn parse_list_handles_ranges_and_singletons() {
        assert_eq!(Topology::parse_list("0-3,8,10-11").unwrap(), vec![0, 1, 2, 3, 8, 10, 11]);
    }
}
