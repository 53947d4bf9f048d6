//! Batch atomicity (`spec.md` §8 scenario 4): `ENERGY_PACKAGE@package=0`
//! and `TIME@board` are pushed together, and across repeated
//! `read_batch` calls the derived `CPU_POWER = ENERGY_PACKAGE / TIME`
//! ratio is never `NaN` nor infinite on "supported hardware" (modeled
//! here by a mock `IoGroup` whose energy and time counters both advance
//! monotonically every batch).

use std::path::Path;

use geopm::error::Result;
use geopm::pio::iogroup::IoGroup;
use geopm::pio::PlatformIO;
use geopm::types::{Aggregation, Behavior, Domain, Format, HandleId};

/// A monotone energy counter and a monotone time counter, both advancing
/// by a fixed step every `read_batch` — the minimal shape needed to
/// exercise the `CPU_POWER` derived-signal ratio without `NaN`/`inf`.
struct MonotoneEnergyTimeGroup {
    energy: f64,
    time: f64,
}

impl IoGroup for MonotoneEnergyTimeGroup {
    fn name(&self) -> &'static str {
        "MOCK_ENERGY_TIME"
    }
    fn signal_names(&self) -> Vec<&'static str> {
        vec!["ENERGY_PACKAGE", "TIME"]
    }
    fn control_names(&self) -> Vec<&'static str> {
        Vec::new()
    }
    fn signal_domain_type(&self, name: &str) -> Result<Domain> {
        match name {
            "ENERGY_PACKAGE" => Ok(Domain::Package),
            "TIME" => Ok(Domain::Board),
            _ => Err(geopm::error::Error::invalid("unknown signal")),
        }
    }
    fn control_domain_type(&self, _name: &str) -> Result<Domain> {
        Err(geopm::error::Error::invalid("no controls"))
    }
    fn push_signal(&mut self, name: &str, _domain: Domain, _index: u32) -> Result<HandleId> {
        match name {
            "ENERGY_PACKAGE" => Ok(HandleId::new(0)),
            "TIME" => Ok(HandleId::new(1)),
            _ => Err(geopm::error::Error::invalid("unknown signal")),
        }
    }
    fn push_control(&mut self, _name: &str, _domain: Domain, _index: u32) -> Result<HandleId> {
        Err(geopm::error::Error::invalid("no controls"))
    }
    fn read_batch(&mut self) -> Result<()> {
        // One coalesced hardware snapshot: both counters advance together,
        // as they would on one real read of a joint energy/time register.
        self.energy += 12.5;
        self.time += 0.01;
        Ok(())
    }
    fn write_batch(&mut self) -> Result<()> {
        Ok(())
    }
    fn sample(&self, handle: HandleId) -> Result<f64> {
        match handle.index() {
            0 => Ok(self.energy),
            1 => Ok(self.time),
            _ => Err(geopm::error::Error::logic("unknown handle")),
        }
    }
    fn adjust(&mut self, _handle: HandleId, _value: f64) -> Result<()> {
        Err(geopm::error::Error::invalid("no controls"))
    }
    fn read_signal(&self, name: &str, _domain: Domain, _index: u32) -> Result<f64> {
        match name {
            "ENERGY_PACKAGE" => Ok(self.energy),
            "TIME" => Ok(self.time),
            _ => Err(geopm::error::Error::invalid("unknown signal")),
        }
    }
    fn write_control(&mut self, _n: &str, _d: Domain, _i: u32, _v: f64) -> Result<()> {
        Err(geopm::error::Error::invalid("no controls"))
    }
    fn save_control(&mut self, _dir: &Path) -> Result<()> {
        Ok(())
    }
    fn restore_control(&mut self, _dir: &Path) -> Result<()> {
        Ok(())
    }
    fn agg_function(&self, _name: &str) -> Result<Aggregation> {
        Ok(Aggregation::Sum)
    }
    fn format_function(&self, _name: &str) -> Result<Format> {
        Ok(Format::Decimal)
    }
    fn signal_description(&self, _name: &str) -> Result<&str> {
        Ok("mock energy/time pair")
    }
    fn signal_behavior(&self, name: &str) -> Result<Behavior> {
        match name {
            "ENERGY_PACKAGE" => Ok(Behavior::Monotone),
            "TIME" => Ok(Behavior::Monotone),
            _ => Err(geopm::error::Error::invalid("unknown signal")),
        }
    }
}

#[test]
fn cpu_power_ratio_is_finite_across_successive_batches() {
    let mut pio = PlatformIO::new();
    pio.register_iogroup(Box::new(MonotoneEnergyTimeGroup { energy: 0.0, time: 0.0 }));

    let energy_handle = pio.push_signal("ENERGY_PACKAGE", Domain::Package, 0).unwrap();
    let time_handle = pio.push_signal("TIME", Domain::Board, 0).unwrap();
    let power_handle = pio.push_signal("CPU_POWER", Domain::Board, 0).unwrap();

    let mut last_energy = None;
    let mut last_time = None;
    for _ in 0..5 {
        pio.read_batch().unwrap();
        let energy = pio.sample(energy_handle).unwrap();
        let time = pio.sample(time_handle).unwrap();
        let power = pio.sample(power_handle).unwrap();

        assert!(!power.is_nan(), "CPU_POWER must not be NaN on supported hardware");
        assert!(power.is_finite(), "CPU_POWER must not be infinite on supported hardware");

        if let (Some(prev_e), Some(prev_t)) = (last_energy, last_time) {
            let delta_energy: f64 = energy - prev_e;
            let delta_time: f64 = time - prev_t;
            let ratio = delta_energy / delta_time;
            assert!(!ratio.is_nan() && ratio.is_finite());
        }
        last_energy = Some(energy);
        last_time = Some(time);
    }
}
