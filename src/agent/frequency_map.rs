//! The FrequencyMap agent (`spec.md` §4.12.4): sets per-CPU frequency from
//! a region-hash-keyed map, falling back to a hint-based default.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::agent::{Agent, ReportField};
use crate::app::Hint;
use crate::error::Result;
use crate::pio::PlatformIO;
use crate::types::{Domain, HandleId};

const POLICY_NAMES: &[&str] = &["FREQ_MIN", "FREQ_MAX"];
const SAMPLE_NAMES: &[&str] = &["CPU_FREQUENCY_CONTROL"];

/// Parses `GEOPM_FREQUENCY_MAP`, a JSON object mapping a decimal or
/// `0x`-prefixed hex region hash string to a frequency in Hz, e.g.
/// `{"0x1234abcd": 1.8e9}`.
fn configured_region_map() -> HashMap<u64, f64> {
    let Ok(raw) = std::env::var("GEOPM_FREQUENCY_MAP") else {
        return HashMap::new();
    };
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(&raw)
    else {
        return HashMap::new();
    };
    map.into_iter()
        .filter_map(|(k, v)| {
            let hash = if let Some(hex) = k.strip_prefix("0x") {
                u64::from_str_radix(hex, 16).ok()?
            } else {
                k.parse::<u64>().ok()?
            };
            Some((hash, v.as_f64()?))
        })
        .collect()
}

/// The default frequency bound for a hint with no region-specific entry
/// (`spec.md` §4.12.4): bandwidth- or I/O-bound hints get `FREQ_MIN`;
/// compute-bound and unclassified hints get `FREQ_MAX`.
fn hint_default_is_min(hint: Hint) -> bool {
    hint == Hint::MEMORY || hint == Hint::NETWORK || hint == Hint::IO
}

/// The FrequencyMap agent: on each tick, reads the current region hash and
/// hint and writes `CPU_FREQUENCY_CONTROL` per the configured (or
/// hint-based default) map.
pub struct FrequencyMapAgent {
    platform_io: Arc<Mutex<PlatformIO>>,
    region_map: HashMap<u64, f64>,
    hash_handle: Option<HandleId>,
    hint_handle: Option<HandleId>,
    freq_handle: Option<HandleId>,
    freq_min: f64,
    freq_max: f64,
    last_region_hash: u64,
    last_hint: Hint,
    last_written: Option<f64>,
}

impl FrequencyMapAgent {
    /// Constructs a frequency map agent over `platform_io`, reading its
    /// region map from `GEOPM_FREQUENCY_MAP` at [`Agent::init`] time.
    #[must_use]
    pub fn new(platform_io: Arc<Mutex<PlatformIO>>) -> Self {
        Self {
            platform_io,
            region_map: HashMap::new(),
            hash_handle: None,
            hint_handle: None,
            freq_handle: None,
            freq_min: 0.0,
            freq_max: 0.0,
            last_region_hash: 0,
            last_hint: Hint::UNSET,
            last_written: None,
        }
    }

    fn target_frequency(&self) -> f64 {
        if let Some(&freq) = self.region_map.get(&self.last_region_hash) {
            return freq.clamp(self.freq_min, self.freq_max);
        }
        if hint_default_is_min(self.last_hint) {
            self.freq_min
        } else {
            self.freq_max
        }
    }
}

impl Agent for FrequencyMapAgent {
    fn policy_names(&self) -> &'static [&'static str] {
        POLICY_NAMES
    }

    fn sample_names(&self) -> &'static [&'static str] {
        SAMPLE_NAMES
    }

    fn init(&mut self, _level: u32, _fan_in: &[usize], _is_level_root: bool) -> Result<()> {
        self.region_map = configured_region_map();
        let mut pio = self.platform_io.lock();
        self.hash_handle = Some(pio.push_signal("REGION_HASH", Domain::Cpu, 0)?);
        self.hint_handle = Some(pio.push_signal("REGION_HINT", Domain::Cpu, 0)?);
        self.freq_handle = Some(pio.push_control("CPU_FREQUENCY_CONTROL", Domain::Cpu, 0)?);
        Ok(())
    }

    fn split_policy(&mut self, in_policy: &[f64], out_policy: &mut [Vec<f64>]) -> Result<()> {
        for slot in out_policy.iter_mut() {
            slot.clear();
            slot.extend_from_slice(in_policy);
        }
        Ok(())
    }

    fn do_send_policy(&self) -> bool {
        true
    }

    fn aggregate_sample(&mut self, in_samples: &[Vec<f64>], out_sample: &mut Vec<f64>) -> Result<()> {
        out_sample.clear();
        if in_samples.is_empty() {
            return Ok(());
        }
        let mean = in_samples.iter().map(|s| s[0]).sum::<f64>() / in_samples.len() as f64;
        out_sample.push(mean);
        Ok(())
    }

    fn do_send_sample(&self) -> bool {
        true
    }

    fn adjust_platform(&mut self, in_policy: &[f64]) -> Result<()> {
        self.freq_min = in_policy.first().copied().unwrap_or(0.0);
        self.freq_max = in_policy.get(1).copied().unwrap_or(self.freq_min);
        let target = self.target_frequency();

        let mut pio = self.platform_io.lock();
        if let Some(handle) = self.freq_handle {
            pio.adjust(handle, target)?;
        }
        self.last_written = Some(target);
        Ok(())
    }

    fn do_write_batch(&self) -> bool {
        self.last_written.is_some()
    }

    fn sample_platform(&mut self, out_sample: &mut Vec<f64>) -> Result<()> {
        let pio = self.platform_io.lock();
        if let Some(handle) = self.hash_handle {
            self.last_region_hash = pio.sample(handle)?.max(0.0) as u64;
        }
        if let Some(handle) = self.hint_handle {
            let bits = pio.sample(handle)?.max(0.0) as u64;
            self.last_hint = Hint::from_bits(bits).unwrap_or(Hint::UNSET);
        }
        drop(pio);

        out_sample.clear();
        out_sample.push(self.last_written.unwrap_or(f64::NAN));
        Ok(())
    }

    fn report_header(&self) -> Vec<ReportField> {
        vec![("agent", "frequency_map".to_string())]
    }
}
