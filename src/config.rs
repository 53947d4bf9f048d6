//! Process-startup configuration, resolved once from the environment
//! variables of `spec.md` §6 into a typed, explicitly-constructed value.
//!
//! Per the "Global state" design note in `spec.md` §9, nothing here is a
//! lazily-initialized module-scope singleton: callers build a [`Config`] at
//! process startup (typically via [`Config::from_env`]) and thread it
//! through to the collaborators that need it (`Daemon`, `FrequencyMap`
//! agent, `ApplicationSampler`), which keeps tests free to substitute their
//! own values instead of mutating process environment.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::{Error, Result};

/// Verbosity of the end-of-run report. Parsing is permissive: an unknown
/// value falls back to `Default`, matching the "fail-open" posture of an
/// optional diagnostics toggle rather than aborting a control loop over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportVerbosity {
    /// Summary-only report.
    #[default]
    Default,
    /// Per-region detail included.
    Detailed,
    /// Full trace-equivalent detail.
    Debug,
}

/// Daemon and agent configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// `ENDPOINT_NAME` — the shared-memory endpoint name the Daemon opens
    /// and the Controller's root agent attaches to.
    pub endpoint_name: String,
    /// `POLICYSTORE_PATH` — path to the persistent `PolicyStore` file.
    pub policystore_path: String,
    /// `FREQUENCY_MAP` — region name → frequency (Hz) map for the
    /// `frequency_map` agent, parsed from a JSON object.
    pub frequency_map: HashMap<String, f64>,
    /// `REGION_BARRIER` — whether application threads must synchronize at
    /// region boundaries before a sample is considered complete.
    pub region_barrier: bool,
    /// `PROFILE_TIMEOUT` — seconds an application profile session waits for
    /// attach before giving up.
    pub profile_timeout: Duration,
    /// `REPORT_VERBOSITY`.
    pub report_verbosity: ReportVerbosity,
    /// `MONITOR_AGENT_SIGNALS` — extra signal names the `monitor` agent
    /// traces in addition to its built-in list.
    pub monitor_agent_signals: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_name: "geopm_endpoint".to_string(),
            policystore_path: "/tmp/geopm_policystore.db".to_string(),
            frequency_map: HashMap::new(),
            region_barrier: false,
            profile_timeout: Duration::from_secs(5),
            report_verbosity: ReportVerbosity::default(),
            monitor_agent_signals: Vec::new(),
        }
    }
}

impl Config {
    /// Resolves configuration from the process environment, falling back to
    /// [`Config::default`] for any variable that is unset.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Kind::FileParse`] if `FREQUENCY_MAP` is set
    /// but is not valid JSON, or [`crate::error::Kind::Invalid`] if
    /// `PROFILE_TIMEOUT` is set but is not a non-negative number.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("ENDPOINT_NAME") {
            cfg.endpoint_name = v;
        }
        if let Ok(v) = env::var("POLICYSTORE_PATH") {
            cfg.policystore_path = v;
        }
        if let Ok(v) = env::var("FREQUENCY_MAP") {
            let parsed: HashMap<String, f64> = serde_json::from_str(&v)?;
            cfg.frequency_map = parsed;
        }
        if let Ok(v) = env::var("REGION_BARRIER") {
            cfg.region_barrier = matches!(v.as_str(), "1" | "true" | "TRUE" | "yes");
        }
        if let Ok(v) = env::var("PROFILE_TIMEOUT") {
            let secs: f64 = v
                .parse()
                .map_err(|_| Error::invalid(format!("PROFILE_TIMEOUT not a number: {v}")))?;
            if secs < 0.0 {
                return Err(Error::invalid("PROFILE_TIMEOUT must be non-negative"));
            }
            cfg.profile_timeout = Duration::from_secs_f64(secs);
        }
        if let Ok(v) = env::var("REPORT_VERBOSITY") {
            cfg.report_verbosity = match v.to_lowercase().as_str() {
                "detailed" => ReportVerbosity::Detailed,
                "debug" => ReportVerbosity::Debug,
                _ => ReportVerbosity::Default,
            };
        }
        if let Ok(v) = env::var("MONITOR_AGENT_SIGNALS") {
            cfg.monitor_agent_signals = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.endpoint_name, "geopm_endpoint");
        assert!(cfg.frequency_map.is_empty());
    }

    #[test]
    fn monitor_signals_split_and_trim() {
        let mut cfg = Config::default();
        cfg.monitor_agent_signals = "A, B ,C".split(',').map(|s| s.trim().to_string()).collect();
        assert_eq!(cfg.monitor_agent_signals, vec!["A", "B", "C"]);
    }
}
