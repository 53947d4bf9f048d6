#![allow(unsafe_code)]
//! Client-side batch session lifecycle (`spec.md` §4.4 "Session
//! lifecycle"): `start_batch_client`/`read_batch_client`/
//! `write_batch_client`/`stop_batch_client`.
//!
//! A [`BatchSession`] is the client's handle on a running
//! [`crate::pio::batch_server::BatchServer`]: it owns the client-side
//! attachment to the two shared-memory regions the server created and
//! speaks the same `SIGCONT` + `sival_int ∈ {0,1}` protocol the server
//! loop answers (`spec.md` §4.5). Starting a session pushes the
//! requested signals/controls onto the shared [`PlatformIO`] up front —
//! the set served is fixed for the session's lifetime, matching "Out-of-
//! set access is rejected at start time, not at per-call time."

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nix::sys::signal::{SigSet, Signal};

use crate::error::{Error, Result};
use crate::pio::batch_server::{BatchServer, REQUEST_READ, REQUEST_WRITE};
use crate::pio::platform_io::PlatformIO;
use crate::shmem::SharedRegion;
use crate::types::{Domain, HandleId};

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// An active batch-server session as seen from the client side.
pub struct BatchSession {
    server: BatchServer,
    signal_shm: SharedRegion,
    control_shm: SharedRegion,
    num_signals: usize,
    num_controls: usize,
}

impl BatchSession {
    /// Requests a batch server over `platform_io` serving exactly
    /// `signals` and `controls`, forks it, and attaches this process as
    /// its client.
    ///
    /// # Errors
    ///
    /// Propagates any `push_signal`/`push_control` failure (an unknown or
    /// out-of-range request is rejected here, before the server forks, per
    /// `spec.md` §4.5) or a [`crate::error::Kind::Runtime`] if the fork or
    /// shared-memory setup fails.
    pub fn start(
        platform_io: &Arc<parking_lot::Mutex<PlatformIO>>,
        signals: &[(String, Domain, u32)],
        controls: &[(String, Domain, u32)],
    ) -> Result<Self> {
        let (handles, control_handles) = {
            let mut pio = platform_io.lock();
            let handles = signals
                .iter()
                .map(|(name, domain, index)| pio.push_signal(name, *domain, *index))
                .collect::<Result<Vec<HandleId>>>()?;
            let control_handles = controls
                .iter()
                .map(|(name, domain, index)| pio.push_control(name, *domain, *index))
                .collect::<Result<Vec<HandleId>>>()?;
            (handles, control_handles)
        };

        let key = format!(
            "{}-{}",
            std::process::id(),
            NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
        );
        let num_signals = handles.len();
        let num_controls = control_handles.len();
        let server = BatchServer::start(
            Arc::clone(platform_io),
            Arc::new(handles),
            Arc::new(control_handles),
            key,
        )?;

        // The server created the regions before forking; by the time
        // `start` returns to us the regions already exist under the
        // server's key, so attaching here cannot race the fork.
        let signal_shm = SharedRegion::attach(
            &format!("/geopm-service-{}-signals", server.key()),
            num_signals * 8,
        )?;
        let control_shm = SharedRegion::attach(
            &format!("/geopm-service-{}-controls", server.key()),
            num_controls * 8,
        )?;

        Ok(Self {
            server,
            signal_shm,
            control_shm,
            num_signals,
            num_controls,
        })
    }

    /// Requests one server-side `read_batch` and returns the sampled
    /// values in push order.
    pub fn read_batch_client(&self) -> Result<Vec<f64>> {
        self.request(REQUEST_READ)?;
        self.signal_shm.with_lock(|buf| {
            (0..self.num_signals)
                .map(|i| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(&buf[i * 8..i * 8 + 8]);
                    f64::from_le_bytes(b)
                })
                .collect()
        })
    }

    /// Stages `values` (in push order) into the control shared memory and
    /// requests one server-side `write_batch`.
    ///
    /// # Errors
    ///
    /// [`crate::error::Kind::Invalid`] if `values.len()` does not match
    /// the number of controls declared at [`BatchSession::start`].
    pub fn write_batch_client(&self, values: &[f64]) -> Result<()> {
        if values.len() != self.num_controls {
            return Err(Error::invalid(format!(
                "write_batch_client: expected {} values, got {}",
                self.num_controls,
                values.len()
            )));
        }
        self.control_shm.with_lock_mut(|buf| {
            for (i, v) in values.iter().enumerate() {
                buf[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
            }
        })?;
        self.request(REQUEST_WRITE)
    }

    /// Sends `sival_int = sival` via `SIGCONT` to the server and blocks
    /// for its `SIGCONT` reply.
    fn request(&self, sival: i32) -> Result<()> {
        let value = libc::sigval {
            sival_ptr: sival as isize as *mut libc::c_void,
        };
        // SAFETY: `self.server.pid()` is a live child process for the
        // lifetime of this session; `value` carries a plain integer, no
        // pointer.
        let rc = unsafe { libc::sigqueue(self.server.pid().as_raw(), libc::SIGCONT, value) };
        if rc != 0 {
            return Err(Error::runtime("sigqueue to batch server failed"));
        }

        let mut wait_set = SigSet::empty();
        wait_set.add(Signal::SIGCONT);
        // SAFETY: blocks this thread until the server's reply `SIGCONT`
        // arrives; no other signal is in `wait_set`.
        unsafe { wait_set.wait() }
            .map(|_| ())
            .map_err(|e| Error::runtime(format!("sigwaitinfo for batch reply failed: {e}")))
    }

    /// The session key naming this session's shared-memory regions.
    #[must_use]
    pub fn key(&self) -> &str {
        self.server.key()
    }

    /// Terminates the batch server and unlinks its shared memory (stop
    /// request).
    pub fn stop(self) -> Result<()> {
        self.server.stop()
    }
}
