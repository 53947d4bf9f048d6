#![allow(unsafe_code)]
//! Endpoint: the bidirectional policy/sample shared-memory channel
//! between a Daemon and an Agent (`spec.md` §4.9, component C9).
//!
//! Two regions per endpoint `name`: `{name}-policy` (Daemon writes,
//! Agent reads) and `{name}-sample` (Agent writes, Daemon reads), each
//! exactly one page per [`layout::PolicyHeader`]/[`layout::SampleHeader`].
//! Casting the region's payload bytes to those `#[repr(C)]` structs is the
//! one unsafe operation this module performs beyond what [`crate::shmem`]
//! already does, so it is scoped `#[allow(unsafe_code)]` the same way.

pub mod daemon;
pub mod layout;
pub mod policy_store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use layout::{PolicyHeader, SampleHeader};

use crate::error::{Error, Result};
use crate::shmem::SharedRegion;
use crate::types::Time;

pub use daemon::Daemon;
pub use policy_store::PolicyStore;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn policy_region_name(base: &str) -> String {
    format!("{base}-policy")
}

fn sample_region_name(base: &str) -> String {
    format!("{base}-sample")
}

/// The owning (Daemon) side of an endpoint: opens (creates) and closes
/// (unlinks) both regions.
pub struct Endpoint {
    name: String,
    policy_shm: SharedRegion,
    sample_shm: SharedRegion,
    num_policy: usize,
    stop_wait: AtomicBool,
}

impl Endpoint {
    /// Creates both regions for endpoint `name`, sized for `num_policy`
    /// policy values (must not exceed [`layout::POLICY_MAX`]).
    pub fn open(name: &str, num_policy: usize) -> Result<Self> {
        if num_policy > layout::POLICY_MAX {
            return Err(Error::invalid(format!(
                "num_policy {num_policy} exceeds POLICY_MAX {}",
                layout::POLICY_MAX
            )));
        }
        PolicyHeader::assert_page_sized();
        SampleHeader::assert_page_sized();

        let policy_shm = SharedRegion::create(&policy_region_name(name), std::mem::size_of::<PolicyHeader>())?;
        let sample_shm = SharedRegion::create(&sample_region_name(name), std::mem::size_of::<SampleHeader>())?;

        policy_shm.with_lock_mut(|buf| {
            // SAFETY: `buf` is exactly `size_of::<PolicyHeader>()` bytes,
            // freshly mapped and exclusively held under the region's lock.
            let header = unsafe { &mut *buf.as_mut_ptr().cast::<PolicyHeader>() };
            *header = PolicyHeader::zeroed();
        })?;
        sample_shm.with_lock_mut(|buf| {
            // SAFETY: as above, for `SampleHeader`.
            let header = unsafe { &mut *buf.as_mut_ptr().cast::<SampleHeader>() };
            *header = SampleHeader::zeroed();
        })?;

        Ok(Self {
            name: name.to_string(),
            policy_shm,
            sample_shm,
            num_policy,
            stop_wait: AtomicBool::new(false),
        })
    }

    /// Unlinks both regions. After this call, [`EndpointUser::attach`]
    /// will fail for this endpoint's name.
    pub fn close(&self) -> Result<()> {
        self.policy_shm.unlink()?;
        self.sample_shm.unlink()
    }

    /// Writes a new policy. `values.len()` must equal `num_policy`.
    pub fn write_policy(&self, values: &[f64]) -> Result<()> {
        if values.len() != self.num_policy {
            return Err(Error::logic(format!(
                "write_policy expected {} values, got {}",
                self.num_policy,
                values.len()
            )));
        }
        tracing::trace!(endpoint = %self.name, count = values.len(), "write_policy");
        self.policy_shm.with_lock_mut(|buf| {
            // SAFETY: see `open`.
            let header = unsafe { &mut *buf.as_mut_ptr().cast::<PolicyHeader>() };
            header.values[..values.len()].copy_from_slice(values);
            header.count = values.len() as u64;
            header.timestamp_nanos = Time::now().as_nanos();
            header.is_updated = 1;
        })
    }

    /// Reads the most recent sample into `out`, returning its age in
    /// seconds, or `-1.0` if no sample has ever been written.
    pub fn read_sample(&self, out: &mut Vec<f64>) -> Result<f64> {
        let age = self.sample_shm.with_lock(|buf| {
            // SAFETY: see `open`.
            let header = unsafe { &*buf.as_ptr().cast::<SampleHeader>() };
            if header.is_updated == 0 {
                out.clear();
                return -1.0;
            }
            let count = header.count as usize;
            out.clear();
            out.extend_from_slice(&header.values[..count]);
            let now = Time::now();
            now.duration_since_secs(Time::from_nanos(header.timestamp_nanos))
        })?;
        tracing::trace!(endpoint = %self.name, age_secs = age, "read_sample");
        Ok(age)
    }

    /// The agent name published by the user side, empty if not yet attached.
    pub fn get_agent(&self) -> Result<String> {
        self.sample_shm.with_lock(|buf| {
            // SAFETY: see `open`.
            let header = unsafe { &*buf.as_ptr().cast::<SampleHeader>() };
            header.agent_name()
        })
    }

    /// The profile name published by the user side.
    pub fn get_profile_name(&self) -> Result<String> {
        self.sample_shm
            .with_lock(|buf| unsafe { &*buf.as_ptr().cast::<SampleHeader>() }.profile_name())
    }

    /// The hostnames published by the user side.
    pub fn get_hostnames(&self) -> Result<Vec<String>> {
        self.sample_shm
            .with_lock(|buf| unsafe { &*buf.as_ptr().cast::<SampleHeader>() }.hostnames())
    }

    /// Polls [`Endpoint::get_agent`] at a bounded cadence until an agent
    /// name is published, `timeout` elapses, or a concurrent
    /// [`Endpoint::stop_wait_loop`] call fires.
    pub fn wait_for_agent_attach(&self, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, |name| !name.is_empty())
    }

    /// Polls until the agent name is cleared (detached), times out, or is
    /// stopped.
    pub fn wait_for_agent_detach(&self, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, str::is_empty)
    }

    fn wait_for(&self, timeout: Duration, done: impl Fn(&str) -> bool) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.stop_wait.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            let agent = self.get_agent()?;
            if done(&agent) {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(Error::runtime("timed out"));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Causes the next (or currently in-flight) wait loop to return
    /// immediately without a timeout error.
    pub fn stop_wait_loop(&self) {
        self.stop_wait.store(true, Ordering::SeqCst);
    }

    /// Clears a prior [`Endpoint::stop_wait_loop`] request.
    pub fn reset_wait_loop(&self) {
        self.stop_wait.store(false, Ordering::SeqCst);
    }

    /// This endpoint's base name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The user (Agent) side of an endpoint: attaches to regions created by a
/// [`Endpoint`], publishes identity on first contact, reads policy, writes
/// samples.
pub struct EndpointUser {
    policy_shm: SharedRegion,
    sample_shm: SharedRegion,
}

impl EndpointUser {
    /// Attaches to an endpoint previously opened by a [`Endpoint`].
    pub fn attach(name: &str) -> Result<Self> {
        let policy_shm = SharedRegion::attach(&policy_region_name(name), std::mem::size_of::<PolicyHeader>())?;
        let sample_shm = SharedRegion::attach(&sample_region_name(name), std::mem::size_of::<SampleHeader>())?;
        Ok(Self {
            policy_shm,
            sample_shm,
        })
    }

    /// Publishes this agent's identity on first contact (idempotent).
    pub fn publish_identity(&self, agent: &str, profile: &str, hosts: &[String]) -> Result<()> {
        self.sample_shm.with_lock_mut(|buf| {
            // SAFETY: see `Endpoint::open`.
            let header = unsafe { &mut *buf.as_mut_ptr().cast::<SampleHeader>() };
            header.set_agent_name(agent)?;
            header.set_profile_name(profile)?;
            header.set_hostlist(hosts)?;
            Ok::<(), Error>(())
        })?
    }

    /// Reads the currently-published policy, returning its age in seconds,
    /// or `-1.0` if no policy has ever been written (`spec.md` §8: "∀
    /// endpoints: `write_policy(π); read_policy()` returns π with age
    /// `< 10 ms` under no load"), the same freshness contract
    /// [`Endpoint::read_sample`] already provides for samples.
    pub fn read_policy(&self) -> Result<(Vec<f64>, f64)> {
        self.policy_shm.with_lock(|buf| {
            // SAFETY: see `Endpoint::open`.
            let header = unsafe { &*buf.as_ptr().cast::<PolicyHeader>() };
            if header.is_updated == 0 {
                return (Vec::new(), -1.0);
            }
            let values = header.values[..header.count as usize].to_vec();
            let age = Time::now().duration_since_secs(Time::from_nanos(header.timestamp_nanos));
            (values, age)
        })
    }

    /// Writes a new sample. `values.len()` must fit [`layout::SAMPLE_MAX`].
    pub fn write_sample(&self, values: &[f64]) -> Result<()> {
        if values.len() > layout::SAMPLE_MAX {
            return Err(Error::invalid(format!(
                "sample of {} values exceeds SAMPLE_MAX {}",
                values.len(),
                layout::SAMPLE_MAX
            )));
        }
        tracing::trace!(count = values.len(), "write_sample");
        self.sample_shm.with_lock_mut(|buf| {
            // SAFETY: see `Endpoint::open`.
            let header = unsafe { &mut *buf.as_mut_ptr().cast::<SampleHeader>() };
            header.values[..values.len()].copy_from_slice(values);
            header.count = values.len() as u64;
            header.timestamp_nanos = Time::now().as_nanos();
            header.is_updated = 1;
        })
    }
}
