//! The Monitor agent (`spec.md` §4.12.1): no policy, just observes a
//! configured set of signals.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::agent::{Agent, ReportField};
use crate::error::Result;
use crate::pio::PlatformIO;
use crate::types::{Aggregation, Domain, Format, HandleId};

const DEFAULT_SIGNALS: &[&str] = &["CPU_POWER", "ENERGY_PACKAGE", "TIME"];

fn configured_signals() -> Vec<String> {
    match std::env::var("GEOPM_MONITOR_SIGNALS") {
        Ok(list) if !list.trim().is_empty() => {
            list.split(',').map(str::trim).map(str::to_string).collect()
        }
        _ => DEFAULT_SIGNALS.iter().map(|s| s.to_string()).collect(),
    }
}

struct MonitoredSignal {
    name: String,
    handle: HandleId,
    aggregation: Aggregation,
}

/// Samples a fixed (or `GEOPM_MONITOR_SIGNALS`-configured) list of signals
/// at board domain and emits them verbatim as trace columns.
pub struct MonitorAgent {
    platform_io: Arc<Mutex<PlatformIO>>,
    signals: Vec<MonitoredSignal>,
    last_sample: Vec<f64>,
}

impl MonitorAgent {
    /// Constructs a monitor over `platform_io`, not yet pushed.
    #[must_use]
    pub fn new(platform_io: Arc<Mutex<PlatformIO>>) -> Self {
        Self {
            platform_io,
            signals: Vec::new(),
            last_sample: Vec::new(),
        }
    }
}

impl Agent for MonitorAgent {
    fn policy_names(&self) -> &'static [&'static str] {
        &[]
    }

    fn sample_names(&self) -> &'static [&'static str] {
        &[]
    }

    fn init(&mut self, _level: u32, _fan_in: &[usize], _is_level_root: bool) -> Result<()> {
        let mut pio = self.platform_io.lock();
        for name in configured_signals() {
            let handle = pio.push_signal(&name, Domain::Board, 0)?;
            let aggregation = pio.agg_function(&name).unwrap_or(Aggregation::Average);
            self.signals.push(MonitoredSignal {
                name,
                handle,
                aggregation,
            });
        }
        Ok(())
    }

    fn split_policy(&mut self, _in_policy: &[f64], _out_policy: &mut [Vec<f64>]) -> Result<()> {
        Ok(())
    }

    fn do_send_policy(&self) -> bool {
        false
    }

    fn aggregate_sample(&mut self, in_samples: &[Vec<f64>], out_sample: &mut Vec<f64>) -> Result<()> {
        out_sample.clear();
        if in_samples.is_empty() {
            return Ok(());
        }
        for (i, monitored) in self.signals.iter().enumerate() {
            let column: Vec<f64> = in_samples.iter().map(|s| s[i]).collect();
            out_sample.push(monitored.aggregation.combine(&column));
        }
        Ok(())
    }

    fn do_send_sample(&self) -> bool {
        true
    }

    fn adjust_platform(&mut self, _in_policy: &[f64]) -> Result<()> {
        Ok(())
    }

    fn do_write_batch(&self) -> bool {
        false
    }

    fn sample_platform(&mut self, out_sample: &mut Vec<f64>) -> Result<()> {
        let pio = self.platform_io.lock();
        out_sample.clear();
        for monitored in &self.signals {
            out_sample.push(pio.sample(monitored.handle)?);
        }
        self.last_sample.clone_from(out_sample);
        Ok(())
    }

    fn report_header(&self) -> Vec<ReportField> {
        vec![("agent", "monitor".to_string())]
    }

    fn trace_names(&self) -> Vec<&'static str> {
        // Leaked once per process: trace column names are long-lived for
        // the life of the Controller, matching the `&'static str` trait
        // signature without re-threading ownership through every tick.
        self.signals
            .iter()
            .map(|s| Box::leak(s.name.clone().into_boxed_str()) as &'static str)
            .collect()
    }

    fn trace_formats(&self) -> Vec<Format> {
        vec![Format::Decimal; self.signals.len()]
    }

    fn trace_values(&self) -> Vec<f64> {
        self.last_sample.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_signals_default_when_env_unset() {
        std::env::remove_var("GEOPM_MONITOR_SIGNALS");
        assert_eq!(configured_signals(), vec!["CPU_POWER", "ENERGY_PACKAGE", "TIME"]);
    }

    #[test]
    fn configured_signals_reads_comma_separated_env() {
        std::env::set_var("GEOPM_MONITOR_SIGNALS", "TIME, ENERGY_PACKAGE");
        assert_eq!(configured_signals(), vec!["TIME", "ENERGY_PACKAGE"]);
        std::env::remove_var("GEOPM_MONITOR_SIGNALS");
    }
}
