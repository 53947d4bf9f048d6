#![allow(unsafe_code)]
//! BatchServer: a forked process mediating batched PIO access for an
//! unprivileged client (`spec.md` §4.5, component C5).
//!
//! The server inherits the daemon's access rights; the client may only
//! touch the signals/controls declared at session start (`spec.md` §4.5
//! "Out-of-set access is rejected at start time, not at per-call time").
//! Protocol: the client sends `SIGCONT` with `sival_int` either `0`
//! (request a read) or `1` (request a write); the server performs exactly
//! one `read_batch`/`write_batch` against the shared-memory payload and
//! replies with `SIGCONT`. Any other `sival_int`, or `SIGTERM`, ends the
//! server loop.
//!
//! This module crosses into raw `fork`/`sigwaitinfo` FFI and is scoped
//! `#[allow(unsafe_code)]` the way the teacher crate scopes unsafe to its
//! OS-primitive-touching modules (see `shmem`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::{Error, Result};
use crate::pio::platform_io::PlatformIO;
use crate::shmem::SharedRegion;
use crate::types::HandleId;

/// `sival_int` meaning a batched read is requested.
pub const REQUEST_READ: i32 = 0;
/// `sival_int` meaning a batched write is requested.
pub const REQUEST_WRITE: i32 = 1;

static SHOULD_EXIT: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigterm(_: i32) {
    SHOULD_EXIT.store(true, Ordering::SeqCst);
}

/// A running batch server, as seen from the parent (daemon) process.
pub struct BatchServer {
    child_pid: Pid,
    key: String,
    signal_shm_name: String,
    control_shm_name: String,
}

impl BatchServer {
    /// Forks a batch server serving exactly `num_signals` pushed signals
    /// and `num_control` pushed controls over `platform_io`, via two
    /// shared-memory regions named from a generated session `key`.
    ///
    /// The caller must have already pushed every signal/control the
    /// session will need onto `platform_io` — the set is fixed for the
    /// lifetime of the server and cannot be extended without starting a
    /// new session.
    pub fn start(
        platform_io: Arc<parking_lot::Mutex<PlatformIO>>,
        handles: Arc<Vec<HandleId>>,
        control_handles: Arc<Vec<HandleId>>,
        key: String,
    ) -> Result<Self> {
        let signal_shm_name = format!("/geopm-service-{key}-signals");
        let control_shm_name = format!("/geopm-service-{key}-controls");

        let signal_shm = SharedRegion::create(&signal_shm_name, handles.len() * 8)?;
        let control_shm = SharedRegion::create(&control_shm_name, control_handles.len() * 8 + 8)?;

        // SAFETY: `fork` is safe to call; the child only ever touches
        // async-signal-safe APIs (`sigwaitinfo`, the shared memory we just
        // mapped, and the `PlatformIO` handle set it inherited via
        // copy-on-write) before either looping or exiting.
        match unsafe { fork() }.map_err(|e| Error::runtime(format!("fork failed: {e}")))? {
            ForkResult::Parent { child } => {
                tracing::debug!(pid = child.as_raw(), %key, "batch server started");
                // Parent does not need its own copy of the shared memory
                // handles kept open beyond creation; the child holds its
                // own mapping. Dropping ours here would unlink the name
                // (we are the `owner`), so deliberately leak the parent's
                // handles for the life of the session instead.
                std::mem::forget(signal_shm);
                std::mem::forget(control_shm);
                Ok(Self {
                    child_pid: child,
                    key,
                    signal_shm_name,
                    control_shm_name,
                })
            }
            ForkResult::Child => {
                Self::install_sigterm_handler();
                Self::run_server_loop(&platform_io, &handles, &control_handles, signal_shm, control_shm);
                std::process::exit(0);
            }
        }
    }

    fn install_sigterm_handler() {
        let action = SigAction::new(
            SigHandler::Handler(handle_sigterm),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: installing a handler for SIGTERM in the freshly-forked
        // child, before any other signal-sensitive state is touched.
        unsafe {
            let _ = signal::sigaction(Signal::SIGTERM, &action);
        }
    }

    fn run_server_loop(
        platform_io: &Arc<parking_lot::Mutex<PlatformIO>>,
        handles: &[HandleId],
        control_handles: &[HandleId],
        signal_shm: SharedRegion,
        control_shm: SharedRegion,
    ) {
        let mut wait_set = SigSet::empty();
        wait_set.add(Signal::SIGCONT);

        loop {
            if SHOULD_EXIT.load(Ordering::SeqCst) {
                break;
            }
            // SAFETY: `wait_set` only contains SIGCONT; `sigwaitinfo`
            // blocks this thread until one arrives or `SIGTERM` interrupts
            // the call (handled via the installed handler + `EINTR` retry
            // loop implicit in `nix`'s wrapper).
            let info = match unsafe { wait_set.wait() } {
                Ok(info) => info,
                Err(_) => continue,
            };
            let sival = info.si_value().sival_ptr as i32;
            match sival {
                REQUEST_READ => {
                    tracing::trace!(client = info.si_pid(), count = handles.len(), "batch read request");
                    let mut pio = platform_io.lock();
                    if pio.read_batch().is_err() {
                        continue;
                    }
                    let mut bytes = vec![0u8; handles.len() * 8];
                    for (i, h) in handles.iter().enumerate() {
                        let v = pio.sample(*h).unwrap_or(f64::NAN);
                        bytes[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
                    }
                    let _ = signal_shm.with_lock_mut(|buf| {
                        buf[..bytes.len()].copy_from_slice(&bytes);
                    });
                    Self::reply(info.si_pid());
                }
                REQUEST_WRITE => {
                    tracing::trace!(client = info.si_pid(), count = control_handles.len(), "batch write request");
                    let values = control_shm
                        .with_lock(|buf| {
                            (0..control_handles.len())
                                .map(|i| {
                                    let mut b = [0u8; 8];
                                    b.copy_from_slice(&buf[i * 8..i * 8 + 8]);
                                    f64::from_le_bytes(b)
                                })
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    let mut pio = platform_io.lock();
                    for (h, v) in control_handles.iter().zip(values) {
                        let _ = pio.adjust(*h, v);
                    }
                    let _ = pio.write_batch();
                    Self::reply(info.si_pid());
                }
                _ => break,
            }
        }
    }

    fn reply(client_pid: libc::pid_t) {
        // SAFETY: sends a plain `SIGCONT` back to the requesting client,
        // carrying no payload; `client_pid` came from the kernel-populated
        // `siginfo_t` of the request we just handled.
        unsafe {
            libc::kill(client_pid, libc::SIGCONT);
        }
    }

    /// The server's process id, as seen by the parent.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.child_pid
    }

    /// The session key naming this server's shared-memory regions.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Terminates the server (stop request).
    pub fn stop(&self) -> Result<()> {
        signal::kill(self.child_pid, Signal::SIGTERM)
            .map_err(|e| Error::runtime(format!("failed to signal batch server: {e}")))?;
        nix::sys::wait::waitpid(self.child_pid, None)
            .map_err(|e| Error::runtime(format!("waitpid failed: {e}")))?;
        let _ = SharedRegion::attach(&self.signal_shm_name, 0).map(|r| r.unlink());
        let _ = SharedRegion::attach(&self.control_shm_name, 0).map(|r| r.unlink());
        tracing::debug!(pid = self.child_pid.as_raw(), key = %self.key, "batch server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_opcodes_are_zero_and_one() {
        assert_eq!(REQUEST_READ, 0);
        assert_eq!(REQUEST_WRITE, 1);
    }
}
