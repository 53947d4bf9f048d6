//! geopm: the core control plane for runtime monitoring and control of
//! platform power/performance telemetry across an HPC job.
//!
//! # Overview
//!
//! A node-level daemon exposes every hardware signal and control behind a
//! uniform, domain-aware abstraction ([`pio`]). A bidirectional
//! shared-memory channel ([`endpoint`]) carries policy down and telemetry
//! up between a job-wide resource manager and one [`controller::Controller`]
//! per compute node, which runs a fixed-cadence tree of [`agent::Agent`]
//! implementations that translate policy into platform adjustments and
//! telemetry back into samples. An application-linked sampler ([`app`])
//! feeds region-level progress into that telemetry without requiring the
//! application to know about agents at all.
//!
//! # Module Structure
//!
//! - [`types`]: Core identifiers and enums shared across every module
//!   (domains, handles, aggregation/format/behavior classifiers)
//! - [`error`](mod@error): The crate's error type and result alias
//! - [`hash`]: The region-name hashing scheme used to key samples
//! - [`config`]: Environment-driven runtime configuration
//! - [`observability`]: Structured logging setup and lightweight counters
//! - [`topology`]: The machine's domain hierarchy (boards, packages,
//!   cores, CPUs, memory, NICs, accelerators)
//! - [`shmem`]: POSIX shared memory plus a robust, process-shared mutex —
//!   the primitive underneath both [`endpoint`] and [`pio::batch_server`]
//! - [`pio`]: Platform I/O — drivers, IOGroups, the unified registry, and
//!   the batch server mediating unprivileged access
//! - [`app`]: Application-side instrumentation — status cells, the record
//!   log, the sampler, and sample aggregation
//! - [`endpoint`]: The policy/sample shared-memory channel, the
//!   SQLite-backed policy store, and the daemon mediating between them
//! - [`agent`]: The agent contract and the concrete agents shipped with
//!   this crate
//! - [`controller`]: The per-node control loop driving a tree of agents
//!   at a fixed cadence
//!
//! # API Stability
//!
//! This crate is currently in the 0.x series; public items should be
//! treated as unstable and subject to change ahead of a 1.0 release.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]

pub mod agent;
pub mod app;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod hash;
pub mod observability;
pub mod pio;
pub mod shmem;
pub mod topology;
pub mod types;

pub use config::Config;
pub use controller::{Controller, ControllerBuilder};
pub use error::{Error, Result};
pub use types::{Aggregation, Behavior, Domain, Format, HandleId, Time};
