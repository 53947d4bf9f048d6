//! Daemon: owns one [`Endpoint`] and one [`PolicyStore`], bridging policy
//! lookups into the shared-memory channel (`spec.md` §4.11,
//! component C11).

use std::time::Duration;

use crate::endpoint::{Endpoint, PolicyStore};
use crate::error::Result;

/// Owns an [`Endpoint`] (opened at construction, closed at destruction)
/// and a [`PolicyStore`].
pub struct Daemon {
    endpoint: Endpoint,
    policy_store: PolicyStore,
}

impl Daemon {
    /// Opens `name`'s endpoint for `num_policy` policy values and takes
    /// ownership of `policy_store`.
    pub fn new(name: &str, num_policy: usize, policy_store: PolicyStore) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::open(name, num_policy)?,
            policy_store,
        })
    }

    /// Waits for an agent to attach, then looks up and publishes its best
    /// policy (`spec.md` §4.11):
    ///
    /// 1. `wait_for_agent_attach(timeout)` (cancellable via
    ///    [`Endpoint::stop_wait_loop`]).
    /// 2. Reads `agent` and `profile`.
    /// 3. `policy ← policystore.get_best(agent, profile)`.
    /// 4. `endpoint.write_policy(policy)`.
    ///
    /// Steps 2–4 are skipped if the wait returned via a stop signal rather
    /// than an actual attach.
    ///
    /// `original_source/libgeopm/src/Daemon.cpp` calls
    /// `policystore.get_best(agent, profile_name)` — this crate's
    /// [`PolicyStore::get_best`] takes `(profile, agent)` per `spec.md`
    /// §4.10's explicit parameter order, so the two arguments are
    /// swapped at this call site rather than in the store's signature.
    pub fn update_endpoint_from_policystore(&self, timeout: Duration) -> Result<()> {
        let span = tracing::info_span!("daemon_transaction", endpoint = self.endpoint.name());
        let _enter = span.enter();

        self.endpoint.wait_for_agent_attach(timeout)?;

        let agent = self.endpoint.get_agent()?;
        if agent.is_empty() {
            // A concurrent `stop_wait_loop()` resolved the wait with no
            // agent actually attached; nothing to publish this round.
            tracing::debug!("wait resolved via stop signal, nothing to publish");
            return Ok(());
        }
        let profile = self.endpoint.get_profile_name()?;

        let policy = self.policy_store.get_best(&agent, &profile)?;
        tracing::debug!(agent = %agent, profile = %profile, "publishing policy");
        self.endpoint.write_policy(&policy)
    }

    /// Delegates to [`Endpoint::stop_wait_loop`].
    pub fn stop_wait_loop(&self) {
        self.endpoint.stop_wait_loop();
    }

    /// Delegates to [`Endpoint::reset_wait_loop`].
    pub fn reset_wait_loop(&self) {
        self.endpoint.reset_wait_loop();
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.endpoint.close();
    }
}
