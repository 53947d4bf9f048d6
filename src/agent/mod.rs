//! The Agent contract and the concrete agents shipped with this crate
//! (`spec.md` §4.12, component C12).
//!
//! Every agent translates policy into platform adjustments at the leaves
//! of the Controller's tree, and reduces children's samples back up at
//! interior levels. Policy and sample vector lengths are declared
//! statically by [`Agent::policy_names`]/[`Agent::sample_names`]; any
//! mismatch at a tick boundary is a [`crate::error::Kind::Logic`] error,
//! never a silent truncation.

pub mod frequency_map;
pub mod monitor;
pub mod power_balancer;
pub mod power_governor;

use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Format;

pub use frequency_map::FrequencyMapAgent;
pub use monitor::MonitorAgent;
pub use power_balancer::PowerBalancerAgent;
pub use power_governor::{NodePowerGovernorAgent, PowerGovernorAgent};

/// One labeled value in a report section (`spec.md` §4.12
/// "report_header/host/region").
pub type ReportField = (&'static str, String);

/// The fixed control-loop cadence every agent's [`Agent::wait`] targets by
/// default (`spec.md` §4.13).
pub const DEFAULT_CADENCE: Duration = Duration::from_millis(5);

/// The behavior every agent in the Controller's tree implements.
pub trait Agent: Send {
    /// Names of this agent's policy slots, in vector order. The length of
    /// every policy vector this agent accepts or produces must equal
    /// `policy_names().len()`.
    fn policy_names(&self) -> &'static [&'static str];

    /// Names of this agent's sample slots, in vector order.
    fn sample_names(&self) -> &'static [&'static str];

    /// Called once before the control loop starts: pushes signals/controls
    /// and computes any per-level constant (e.g. how many children this
    /// node has, for averaging).
    fn init(&mut self, level: u32, fan_in: &[usize], is_level_root: bool) -> Result<()>;

    /// Validates and clamps an incoming policy to this agent's declared
    /// bounds. Rejects `NaN` in any slot where `NaN` is not a recognized
    /// sentinel (e.g. "reset to TDP").
    fn validate_policy(&self, policy: &mut [f64]) -> Result<()> {
        if policy.len() != self.policy_names().len() {
            return Err(Error::logic(format!(
                "policy has {} slots, expected {}",
                policy.len(),
                self.policy_names().len()
            )));
        }
        Ok(())
    }

    /// Distributes a received policy to this node's children. A no-op for
    /// leaves and for most ticks at interior levels — only called when
    /// this node is not a leaf.
    fn split_policy(&mut self, in_policy: &[f64], out_policy: &mut [Vec<f64>]) -> Result<()>;

    /// Whether [`Agent::split_policy`]'s last call produced a policy that
    /// actually differs from what was last sent (gates the downward send).
    fn do_send_policy(&self) -> bool;

    /// Reduces children's samples into this node's own sample. Only
    /// called when this node is not a leaf.
    fn aggregate_sample(&mut self, in_samples: &[Vec<f64>], out_sample: &mut Vec<f64>) -> Result<()>;

    /// Whether [`Agent::aggregate_sample`]'s last call produced a sample
    /// worth sending upward.
    fn do_send_sample(&self) -> bool;

    /// Applies the received policy to the platform via its pushed
    /// controls. Only called at leaves.
    fn adjust_platform(&mut self, in_policy: &[f64]) -> Result<()>;

    /// Whether [`Agent::adjust_platform`]'s last call changed any control
    /// (gates the `write_batch` call).
    fn do_write_batch(&self) -> bool;

    /// Produces this leaf's sample from its pushed signals.
    fn sample_platform(&mut self, out_sample: &mut Vec<f64>) -> Result<()>;

    /// Yields until the next cadence boundary.
    fn wait(&mut self) {
        std::thread::sleep(DEFAULT_CADENCE);
    }

    /// Top-of-report fields (agent name, policy summary, etc.).
    fn report_header(&self) -> Vec<ReportField> {
        Vec::new()
    }

    /// Per-host report fields.
    fn report_host(&self) -> Vec<ReportField> {
        Vec::new()
    }

    /// Per-region report fields for `region_hash`.
    fn report_region(&self, _region_hash: u64) -> Vec<ReportField> {
        Vec::new()
    }

    /// Extra trace column names this agent contributes, beyond its
    /// declared sample names.
    fn trace_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Rendering format for each [`Agent::trace_names`] column, in order.
    fn trace_formats(&self) -> Vec<Format> {
        Vec::new()
    }

    /// Current values for each [`Agent::trace_names`] column, in order.
    fn trace_values(&self) -> Vec<f64> {
        Vec::new()
    }

    /// One-shot policy application with no sampling loop (the admin
    /// `geopmctl --enforce`-equivalent path).
    fn enforce_policy(&mut self, policy: &[f64]) -> Result<()> {
        self.adjust_platform(policy)
    }
}

/// Converts one JSON policy slot value to `f64`, treating the string
/// sentinels `"NAN"`, `"nan"`, and `"NaN"` as [`f64::NAN`] (`spec.md` §6
/// "Agent/policy declaration": JSON has no numeric NaN literal, so the
/// missing-value sentinel is carried as a string).
fn policy_slot_value(value: &serde_json::Value) -> Result<f64> {
    match value {
        serde_json::Value::Number(_) => value
            .as_f64()
            .ok_or_else(|| Error::invalid("policy slot is not a finite number")),
        serde_json::Value::String(s) if s.eq_ignore_ascii_case("nan") => Ok(f64::NAN),
        _ => Err(Error::invalid("policy slot is not a number or a NaN sentinel")),
    }
}

/// Parses an agent policy from JSON, accepting both the documented named-key
/// object form and a plain ordered array (`SPEC_FULL.md` §4 EXPANSION: the
/// original additionally accepts an array for policies with no named keys).
/// The absence of a key in the object form, like an explicit `"NAN"` slot,
/// means missing (`spec.md` §6).
pub fn policy_from_json(json: &str, names: &[&str]) -> Result<Vec<f64>> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    match value {
        serde_json::Value::Array(items) => items.iter().map(policy_slot_value).collect(),
        serde_json::Value::Object(map) => names
            .iter()
            .map(|name| match map.get(*name) {
                Some(v) => policy_slot_value(v),
                None => Ok(f64::NAN),
            })
            .collect(),
        _ => Err(Error::invalid("policy JSON must be an object or array")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_from_json_accepts_named_object() {
        let names = ["POWER_LIMIT"];
        let parsed = policy_from_json(r#"{"POWER_LIMIT": 150.0}"#, &names).unwrap();
        assert_eq!(parsed, vec![150.0]);
    }

    #[test]
    fn policy_from_json_accepts_plain_array() {
        let names = ["FREQ_MIN", "FREQ_MAX"];
        let parsed = policy_from_json("[1.0, 2.0]", &names).unwrap();
        assert_eq!(parsed, vec![1.0, 2.0]);
    }

    #[test]
    fn policy_from_json_treats_missing_key_as_nan() {
        let names = ["POWER_LIMIT"];
        let parsed = policy_from_json("{}", &names).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].is_nan());
    }

    #[test]
    fn policy_from_json_accepts_nan_string_sentinel() {
        let names = ["FREQ_MIN", "FREQ_MAX"];
        let parsed = policy_from_json(r#"{"FREQ_MIN": "NAN", "FREQ_MAX": 2.0}"#, &names).unwrap();
        assert!(parsed[0].is_nan());
        assert_eq!(parsed[1], 2.0);
    }

    #[test]
    fn policy_from_json_rejects_non_numeric_non_nan_entry() {
        let names = ["POWER_LIMIT"];
        assert!(policy_from_json(r#"{"POWER_LIMIT": "oops"}"#, &names).is_err());
    }
}
