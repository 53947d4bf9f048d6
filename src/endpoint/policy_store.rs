//! PolicyStore: a persistent keyed store of best-known and default
//! policies (`spec.md` §4.10, component C10).
//!
//! `original_source/src/PolicyStore.hpp` backs this with a single SQLite
//! file; this crate does the same via `rusqlite` (bundled, already in the
//! teacher's dependency graph via its own embedded-store usage), behind
//! the `policy-store-sqlite` feature. Two tables: `defaults` keyed by
//! agent, `profiles` keyed by `(profile, agent)`; policy vectors are
//! stored as a length-prefixed little-endian `f64` BLOB so a variable
//! number of values round-trips without a schema migration per agent.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};

fn encode_policy(policy: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + policy.len() * 8);
    bytes.extend_from_slice(&(policy.len() as u64).to_le_bytes());
    for v in policy {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn decode_policy(bytes: &[u8]) -> Result<Vec<f64>> {
    if bytes.len() < 8 {
        return Err(Error::file_parse("policy BLOB shorter than length prefix"));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[..8]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    let body = &bytes[8..];
    if body.len() != len * 8 {
        return Err(Error::file_parse("policy BLOB length prefix mismatch"));
    }
    let mut values = Vec::with_capacity(len);
    for chunk in body.chunks_exact(8) {
        let mut b = [0u8; 8];
        b.copy_from_slice(chunk);
        values.push(f64::from_le_bytes(b));
    }
    Ok(values)
}

/// A persistent, SQLite-backed store of best-known and default policies.
pub struct PolicyStore {
    conn: Connection,
}

impl PolicyStore {
    /// Opens (creating if absent) the store at `path`, e.g.
    /// `/var/run/geopm/policystore.db`.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::runtime(format!("failed to open policy store: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Opens an in-memory store, for tests and short-lived daemons with no
    /// persistence requirement.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::runtime(format!("failed to open in-memory policy store: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS defaults (
                agent TEXT PRIMARY KEY,
                policy BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS profiles (
                profile TEXT NOT NULL,
                agent TEXT NOT NULL,
                policy BLOB NOT NULL,
                PRIMARY KEY (profile, agent)
            );",
        )
        .map_err(|e| Error::runtime(format!("failed to initialize policy store schema: {e}")))
    }

    /// Returns the best-known policy for `(profile, agent)`, falling back
    /// to the agent's default, padding any missing trailing values with
    /// `NaN` (`spec.md` §4.10 "use agent default for that slot").
    ///
    /// Fails with [`crate::error::Kind::Runtime`] if neither a
    /// profile-specific entry nor an agent default exists.
    pub fn get_best(&self, profile: &str, agent: &str) -> Result<Vec<f64>> {
        let profile_policy: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT policy FROM profiles WHERE profile = ?1 AND agent = ?2",
                params![profile, agent],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::runtime(format!("policy store query failed: {e}")))?;

        let default_policy: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT policy FROM defaults WHERE agent = ?1",
                params![agent],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::runtime(format!("policy store query failed: {e}")))?;

        match (profile_policy, default_policy) {
            (None, None) => Err(Error::runtime(format!(
                "no policy known for profile={profile} agent={agent}"
            ))),
            (Some(bytes), None) => decode_policy(&bytes),
            (None, Some(bytes)) => decode_policy(&bytes),
            (Some(profile_bytes), Some(default_bytes)) => {
                let profile_values = decode_policy(&profile_bytes)?;
                let default_values = decode_policy(&default_bytes)?;
                let mut merged = profile_values;
                while merged.len() < default_values.len() {
                    merged.push(f64::NAN);
                }
                Ok(merged)
            }
        }
    }

    /// Sets the best-known policy for `(profile, agent)`. An empty
    /// `policy` deletes the entry (`spec.md` §4.10).
    pub fn set_best(&self, profile: &str, agent: &str, policy: &[f64]) -> Result<()> {
        if policy.is_empty() {
            self.conn
                .execute(
                    "DELETE FROM profiles WHERE profile = ?1 AND agent = ?2",
                    params![profile, agent],
                )
                .map_err(|e| Error::runtime(format!("policy store delete failed: {e}")))?;
            return Ok(());
        }
        self.conn
            .execute(
                "INSERT INTO profiles (profile, agent, policy) VALUES (?1, ?2, ?3)
                 ON CONFLICT(profile, agent) DO UPDATE SET policy = excluded.policy",
                params![profile, agent, encode_policy(policy)],
            )
            .map_err(|e| Error::runtime(format!("policy store upsert failed: {e}")))?;
        Ok(())
    }

    /// Sets the default policy for `agent`.
    pub fn set_default(&self, agent: &str, policy: &[f64]) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO defaults (agent, policy) VALUES (?1, ?2)
                 ON CONFLICT(agent) DO UPDATE SET policy = excluded.policy",
                params![agent, encode_policy(policy)],
            )
            .map_err(|e| Error::runtime(format!("policy store default upsert failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_best_falls_back_to_default() {
        let store = PolicyStore::open_in_memory().unwrap();
        store.set_default("power_governor", &[150.0]).unwrap();
        assert_eq!(
            store.get_best("job-42", "power_governor").unwrap(),
            vec![150.0]
        );
    }

    #[test]
    fn get_best_prefers_profile_specific_entry() {
        let store = PolicyStore::open_in_memory().unwrap();
        store.set_default("power_governor", &[150.0]).unwrap();
        store
            .set_best("job-42", "power_governor", &[180.0])
            .unwrap();
        assert_eq!(
            store.get_best("job-42", "power_governor").unwrap(),
            vec![180.0]
        );
    }

    #[test]
    fn get_best_pads_short_profile_policy_with_nan() {
        let store = PolicyStore::open_in_memory().unwrap();
        store
            .set_default("frequency_map", &[1.0, 2.0, 3.0])
            .unwrap();
        store.set_best("job-1", "frequency_map", &[9.0]).unwrap();
        let best = store.get_best("job-1", "frequency_map").unwrap();
        assert_eq!(best[0], 9.0);
        assert!(best[1].is_nan());
        assert!(best[2].is_nan());
    }

    #[test]
    fn get_best_fails_when_nothing_known() {
        let store = PolicyStore::open_in_memory().unwrap();
        assert!(store.get_best("job-1", "nobody_agent").is_err());
    }

    #[test]
    fn empty_policy_deletes_profile_entry() {
        let store = PolicyStore::open_in_memory().unwrap();
        store.set_default("monitor", &[1.0]).unwrap();
        store.set_best("job-1", "monitor", &[2.0]).unwrap();
        store.set_best("job-1", "monitor", &[]).unwrap();
        assert_eq!(store.get_best("job-1", "monitor").unwrap(), vec![1.0]);
    }
}
