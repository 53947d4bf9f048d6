//! SampleAggregator: region- and epoch-scoped accumulation over pushed PIO
//! signals (`spec.md` §4.8, component C8).
//!
//! One [`SignalAccumulator`] is kept per pushed signal handle. Each call to
//! [`SampleAggregator::tick`] supplies the signal's latest batched value
//! together with the region hash and hint active when that value was
//! sampled; the accumulator folds it into the region/epoch totals
//! according to the signal's declared [`Behavior`].

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::hash::UNMARKED;
use crate::types::{Behavior, HandleId, Time};

struct SignalAccumulator {
    behavior: Behavior,
    last_value: Option<f64>,
    last_time: Option<Time>,
    /// Region hash attributed to the delta computed at the most recent
    /// tick (the region that was current on the *earlier* of the two
    /// ticks forming that delta, per `spec.md` §4.8).
    attribution_region: u64,
    region_totals: HashMap<u64, f64>,
    contiguous_region: u64,
    contiguous_total: f64,
    period_last: f64,
    last_observation: f64,
    running_total: f64,
    epoch_baseline: Option<f64>,
    last_epoch_mark: f64,
    epoch_last: f64,
    seen_first_epoch: bool,
}

impl SignalAccumulator {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            last_value: None,
            last_time: None,
            attribution_region: UNMARKED,
            region_totals: HashMap::new(),
            contiguous_region: UNMARKED,
            contiguous_total: 0.0,
            period_last: 0.0,
            last_observation: f64::NAN,
            running_total: 0.0,
            epoch_baseline: None,
            last_epoch_mark: 0.0,
            epoch_last: 0.0,
            seen_first_epoch: false,
        }
    }

    fn tick(&mut self, value: f64, region: u64, time: Time, epoch_boundary: bool) {
        self.last_observation = value;

        let delta = match self.behavior {
            Behavior::Monotone => {
                let d = self.last_value.map_or(0.0, |prev| (value - prev).max(0.0));
                self.last_value = Some(value);
                d
            }
            Behavior::Variable => {
                let dt = self
                    .last_time
                    .map_or(0.0, |prev| time.duration_since_secs(prev));
                self.last_time = Some(time);
                if value.is_nan() { 0.0 } else { value * dt }
            }
            Behavior::Constant | Behavior::Label => {
                // Not accumulated; only the latest observation matters.
                return;
            }
        };

        let attribute_to = if self.seen_first_epoch {
            self.attribution_region
        } else {
            UNMARKED
        };
        *self.region_totals.entry(attribute_to).or_insert(0.0) += delta;

        if attribute_to == self.contiguous_region {
            self.contiguous_total += delta;
        } else {
            self.contiguous_region = attribute_to;
            self.contiguous_total = delta;
        }

        self.period_last = delta;
        self.running_total += delta;
        self.attribution_region = region;

        if epoch_boundary {
            if self.epoch_baseline.is_none() {
                self.epoch_baseline = Some(self.running_total);
                self.last_epoch_mark = self.running_total;
            } else {
                self.epoch_last = self.running_total - self.last_epoch_mark;
                self.last_epoch_mark = self.running_total;
            }
            self.seen_first_epoch = true;
        }
    }

    fn sample_region(&self) -> f64 {
        match self.behavior {
            Behavior::Constant | Behavior::Label => self.last_observation,
            _ => self.region_totals.values().sum(),
        }
    }

    fn sample_region_hash(&self, hash: u64) -> f64 {
        match self.behavior {
            Behavior::Constant | Behavior::Label => self.last_observation,
            _ => self.region_totals.get(&hash).copied().unwrap_or(0.0),
        }
    }

    fn sample_region_last(&self) -> f64 {
        match self.behavior {
            Behavior::Constant | Behavior::Label => self.last_observation,
            _ => self.contiguous_total,
        }
    }

    fn sample_period_last(&self) -> f64 {
        self.period_last
    }

    fn sample_epoch(&self) -> f64 {
        match self.epoch_baseline {
            Some(baseline) => self.running_total - baseline,
            None => 0.0,
        }
    }

    fn sample_epoch_last(&self) -> f64 {
        self.epoch_last
    }
}

/// Region- and epoch-scoped accumulation over every pushed signal
/// (`spec.md` §4.8).
pub struct SampleAggregator {
    signals: HashMap<HandleId, SignalAccumulator>,
}

impl SampleAggregator {
    /// Constructs an aggregator with no pushed signals.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signals: HashMap::new(),
        }
    }

    /// Registers `handle` for accumulation with the given `behavior`. Idempotent.
    pub fn push_signal(&mut self, handle: HandleId, behavior: Behavior) {
        self.signals
            .entry(handle)
            .or_insert_with(|| SignalAccumulator::new(behavior));
    }

    fn accumulator(&self, handle: HandleId) -> Result<&SignalAccumulator> {
        self.signals
            .get(&handle)
            .ok_or_else(|| Error::logic(format!("signal {handle} not pushed to aggregator")))
    }

    /// Folds one new batched `value` into `handle`'s accumulator, attributing
    /// the delta to `region` per `spec.md` §4.8's monotone/variable rules.
    pub fn tick(
        &mut self,
        handle: HandleId,
        value: f64,
        region: u64,
        time: Time,
        epoch_boundary: bool,
    ) -> Result<()> {
        let acc = self
            .signals
            .get_mut(&handle)
            .ok_or_else(|| Error::logic(format!("signal {handle} not pushed to aggregator")))?;
        acc.tick(value, region, time, epoch_boundary);
        Ok(())
    }

    /// Total value attributable to all regions since process start.
    pub fn sample_region(&self, handle: HandleId) -> Result<f64> {
        Ok(self.accumulator(handle)?.sample_region())
    }

    /// Total value attributable to `region_hash` since process start.
    pub fn sample_region_hash(&self, handle: HandleId, region_hash: u64) -> Result<f64> {
        Ok(self.accumulator(handle)?.sample_region_hash(region_hash))
    }

    /// Value accrued during the most recent contiguous occurrence of
    /// whichever region is (or was last) active.
    pub fn sample_region_last(&self, handle: HandleId) -> Result<f64> {
        Ok(self.accumulator(handle)?.sample_region_last())
    }

    /// Value accrued since the previous tick.
    pub fn sample_period_last(&self, handle: HandleId) -> Result<f64> {
        Ok(self.accumulator(handle)?.sample_period_last())
    }

    /// Cumulative value since the first epoch boundary was observed.
    pub fn sample_epoch(&self, handle: HandleId) -> Result<f64> {
        Ok(self.accumulator(handle)?.sample_epoch())
    }

    /// Value accrued over the most recently completed epoch interval.
    pub fn sample_epoch_last(&self, handle: HandleId) -> Result<f64> {
        Ok(self.accumulator(handle)?.sample_epoch_last())
    }
}

impl Default for SampleAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotone_accumulates_nonnegative_deltas_per_region() {
        let mut agg = SampleAggregator::new();
        let h = HandleId::new(0);
        agg.push_signal(h, Behavior::Monotone);
        agg.tick(h, 100.0, 0xAA, Time::from_nanos(0), false).unwrap();
        agg.tick(h, 150.0, 0xAA, Time::from_nanos(1), false).unwrap();
        agg.tick(h, 220.0, 0xBB, Time::from_nanos(2), false).unwrap();
        // First tick: delta 0 attributed to UNMARKED (pre-epoch).
        // Second tick: delta 50 attributed to UNMARKED (region active at
        // the first tick was 0xAA, but pre-epoch attribution collapses to
        // UNMARKED until the first epoch boundary).
        assert_eq!(agg.sample_region(h).unwrap(), 120.0);
    }

    #[test]
    fn variable_integrates_value_times_elapsed_time() {
        let mut agg = SampleAggregator::new();
        let h = HandleId::new(0);
        agg.push_signal(h, Behavior::Variable);
        agg.tick(h, 10.0, 0xAA, Time::from_nanos(0), false).unwrap();
        agg.tick(h, 10.0, 0xAA, Time::ZERO.add_secs(2.0), false)
            .unwrap();
        assert_eq!(agg.sample_period_last(h).unwrap(), 20.0);
    }

    #[test]
    fn constant_behavior_is_not_accumulated() {
        let mut agg = SampleAggregator::new();
        let h = HandleId::new(0);
        agg.push_signal(h, Behavior::Constant);
        agg.tick(h, 42.0, 0xAA, Time::from_nanos(0), false).unwrap();
        agg.tick(h, 42.0, 0xAA, Time::from_nanos(1), false).unwrap();
        assert_eq!(agg.sample_region(h).unwrap(), 42.0);
        assert_eq!(agg.sample_period_last(h).unwrap(), 0.0);
    }

    #[test]
    fn epoch_accounting_tracks_completed_interval() {
        let mut agg = SampleAggregator::new();
        let h = HandleId::new(0);
        agg.push_signal(h, Behavior::Monotone);
        agg.tick(h, 0.0, 0xAA, Time::from_nanos(0), false).unwrap();
        agg.tick(h, 10.0, 0xAA, Time::from_nanos(1), true).unwrap();
        assert_eq!(agg.sample_epoch(h).unwrap(), 0.0);
        agg.tick(h, 30.0, 0xAA, Time::from_nanos(2), true).unwrap();
        assert_eq!(agg.sample_epoch(h).unwrap(), 20.0);
        assert_eq!(agg.sample_epoch_last(h).unwrap(), 20.0);
    }

    #[test]
    fn unpushed_signal_is_logic_error() {
        let agg = SampleAggregator::new();
        assert!(agg.sample_region(HandleId::new(0)).is_err());
    }
}
