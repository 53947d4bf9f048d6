//! Platform I/O: the signal/control abstraction over hardware telemetry
//! and actuation (`spec.md` §4, components C2–C5).
//!
//! [`driver`] parses/formats raw attributes, [`iogroup`] groups related
//! signals/controls behind the push/read_batch/write_batch protocol,
//! [`platform_io`] unifies every registered [`iogroup::IoGroup`] (plus
//! derived/aliased signals) into one registry, [`batch_server`] mediates
//! that registry for an unprivileged client process over shared memory,
//! and [`batch_session`] is the client-side handle on a running batch
//! server (`start_batch_client`/`read_batch_client`/`write_batch_client`).

pub mod batch_server;
pub mod batch_session;
pub mod driver;
pub mod iogroup;
pub mod platform_io;

pub use batch_server::BatchServer;
pub use batch_session::BatchSession;
pub use driver::{CpufreqDriver, Driver};
pub use iogroup::{CpufreqIoGroup, IoGroup};
pub use platform_io::PlatformIO;
