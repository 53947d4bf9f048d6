//! The exact byte layout of the two shared-memory regions backing one
//! [`crate::endpoint::Endpoint`] (`spec.md` §4.9, `SPEC_FULL.md` §4
//! detail note on §4.9).
//!
//! `original_source/src/EndpointImp.hpp` pins these structs (there named
//! `geopm_endpoint_policy_shmem_header`/`..._sample_shmem_header`) at one
//! page (4096 bytes) each, trailing `values[]` arrays sized to fill out
//! the remainder. Rust has no `static_assert` over an arbitrary const
//! expression without nightly, so the page-size invariant is checked with
//! `debug_assert_eq!` at construction instead — the idiomatic substitute.

use crate::error::{Error, Result};

const PAGE_SIZE: usize = 4096;

/// Maximum policy values a [`PolicyHeader`] can carry.
pub const POLICY_MAX: usize = 509;
/// Maximum sample values a [`SampleHeader`] can carry.
pub const SAMPLE_MAX: usize = 381;

/// `GEOPM_ENDPOINT_AGENT_NAME_MAX` (`original_source/src/EndpointImp.hpp`).
const AGENT_NAME_LEN: usize = 256;
/// `GEOPM_ENDPOINT_PROFILE_NAME_MAX`.
const PROFILE_NAME_LEN: usize = 256;
/// `GEOPM_ENDPOINT_HOSTLIST_PATH_MAX`.
const HOSTLIST_LEN: usize = 512;

/// The `-policy` shared-memory region's payload: written by the Daemon,
/// read by the Agent/`EndpointUser`.
#[repr(C)]
pub struct PolicyHeader {
    /// Nonzero once at least one policy has been written.
    pub is_updated: u64,
    /// Monotonic timestamp (nanoseconds) of the most recent policy write
    /// (`spec.md` §3 "Policy region: `(timestamp, count, values[])`").
    pub timestamp_nanos: u64,
    /// Number of valid entries in `values`.
    pub count: u64,
    /// Policy values, left-padded-unused beyond `count`.
    pub values: [f64; POLICY_MAX],
}

/// The `-sample` shared-memory region's payload: written by the
/// Agent/`EndpointUser` (including its identity, on first contact), read
/// by the Daemon.
#[repr(C)]
pub struct SampleHeader {
    /// Nonzero once at least one sample has been written.
    pub is_updated: u64,
    /// Monotonic timestamp (nanoseconds) of the most recent sample write.
    pub timestamp_nanos: u64,
    /// Number of valid entries in `values`.
    pub count: u64,
    agent_name: [u8; AGENT_NAME_LEN],
    profile_name: [u8; PROFILE_NAME_LEN],
    hostlist: [u8; HOSTLIST_LEN],
    /// Sample values, left-padded-unused beyond `count`.
    pub values: [f64; SAMPLE_MAX],
}

fn write_fixed(buf: &mut [u8], s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() >= buf.len() {
        return Err(Error::invalid(format!(
            "string of {} bytes does not fit in {}-byte field",
            bytes.len(),
            buf.len()
        )));
    }
    buf.fill(0);
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn read_fixed(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl PolicyHeader {
    /// Validates the header is exactly one page, per the original layout.
    pub fn assert_page_sized() {
        debug_assert_eq!(std::mem::size_of::<Self>(), PAGE_SIZE);
    }

    /// Zeroed header, as laid down fresh by `Endpoint::open`.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            is_updated: 0,
            timestamp_nanos: 0,
            count: 0,
            values: [0.0; POLICY_MAX],
        }
    }
}

impl SampleHeader {
    /// Validates the header is exactly one page.
    pub fn assert_page_sized() {
        debug_assert_eq!(std::mem::size_of::<Self>(), PAGE_SIZE);
    }

    /// Zeroed header, as laid down fresh by `Endpoint::open`.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            is_updated: 0,
            timestamp_nanos: 0,
            count: 0,
            agent_name: [0; AGENT_NAME_LEN],
            profile_name: [0; PROFILE_NAME_LEN],
            hostlist: [0; HOSTLIST_LEN],
            values: [0.0; SAMPLE_MAX],
        }
    }

    /// Sets the agent name, truncation-checked against the fixed field width.
    pub fn set_agent_name(&mut self, name: &str) -> Result<()> {
        write_fixed(&mut self.agent_name, name)
    }

    /// The agent name, empty until the agent side has published it.
    #[must_use]
    pub fn agent_name(&self) -> String {
        read_fixed(&self.agent_name)
    }

    /// Sets the profile name.
    pub fn set_profile_name(&mut self, name: &str) -> Result<()> {
        write_fixed(&mut self.profile_name, name)
    }

    /// The profile name, empty until published.
    #[must_use]
    pub fn profile_name(&self) -> String {
        read_fixed(&self.profile_name)
    }

    /// Sets the comma-joined hostlist.
    pub fn set_hostlist(&mut self, hosts: &[String]) -> Result<()> {
        write_fixed(&mut self.hostlist, &hosts.join(","))
    }

    /// The hostlist, split on `,`, empty until published.
    #[must_use]
    pub fn hostnames(&self) -> Vec<String> {
        let joined = read_fixed(&self.hostlist);
        if joined.is_empty() {
            Vec::new()
        } else {
            joined.split(',').map(str::to_string).collect()
        }
    }
}
