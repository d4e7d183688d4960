//! Server catalog: validation, a read-through cache over the Store, and
//! ping-based selection.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::latency::{to_ping_ms, LatencyProbe};
use crate::model::Server;
use crate::protocols::ProtocolRegistry;
use crate::store::Collection;

/// Outcome of a ping sweep. Individual failures are logged, not returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Owns the server collection.
///
/// Every mutation takes the cache's write lock, writes the Store, and only
/// then touches the cache, so a failed write is never visible through `get`.
pub struct ServerRegistry {
    store: Arc<dyn Collection<Server>>,
    cache: RwLock<HashMap<String, Server>>,
    protocols: Arc<ProtocolRegistry>,
}

impl ServerRegistry {
    pub fn new(store: Arc<dyn Collection<Server>>, protocols: Arc<ProtocolRegistry>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            protocols,
        }
    }

    pub fn protocols(&self) -> &Arc<ProtocolRegistry> {
        &self.protocols
    }

    fn validate(&self, server: &Server) -> Result<()> {
        if server.host.trim().is_empty() {
            return Err(RelayError::Validation("host must not be empty".into()));
        }
        if server.port == 0 {
            return Err(RelayError::Validation(
                "port must be between 1 and 65535".into(),
            ));
        }
        if server.protocol.as_str().is_empty() {
            return Err(RelayError::Validation("protocol must not be empty".into()));
        }
        if !self.protocols.is_registered(&server.protocol) {
            return Err(RelayError::Validation(format!(
                "protocol '{}' has no registered handler",
                server.protocol
            )));
        }
        Ok(())
    }

    // ── CRUD ────────────────────────────────────────────────────────

    /// Insert a new server. An empty id is replaced with a random one.
    pub fn add(&self, mut server: Server) -> Result<Server> {
        self.validate(&server)?;
        if server.id.trim().is_empty() {
            server.id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        server.created_at = now;
        server.updated_at = now;

        let mut cache = self.cache.write();
        self.store.add(&server)?;
        cache.insert(server.id.clone(), server.clone());
        tracing::debug!(server_id = %server.id, host = %server.host, "server added");
        Ok(server)
    }

    /// Cached lookup, falling back to the Store on a miss.
    pub fn get(&self, id: &str) -> Result<Server> {
        if let Some(server) = self.cache.read().get(id) {
            return Ok(server.clone());
        }

        let mut cache = self.cache.write();
        // Another caller may have filled the slot between the two locks.
        if let Some(server) = cache.get(id) {
            return Ok(server.clone());
        }
        let server = self
            .store
            .get(id)?
            .ok_or_else(|| RelayError::server_not_found(id))?;
        cache.insert(server.id.clone(), server.clone());
        Ok(server)
    }

    /// Replace the mutable fields of an existing server. `created_at` is kept.
    pub fn update(&self, mut server: Server) -> Result<Server> {
        self.validate(&server)?;

        let mut cache = self.cache.write();
        let existing = self.load_locked(&cache, &server.id)?;
        server.created_at = existing.created_at;
        server.updated_at = Utc::now();
        self.store.update(&server)?;
        cache.insert(server.id.clone(), server.clone());
        Ok(server)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut cache = self.cache.write();
        self.store.delete(id)?;
        cache.remove(id);
        tracing::debug!(server_id = %id, "server deleted");
        Ok(())
    }

    /// All servers in insertion order.
    pub fn list_all(&self) -> Result<Vec<Server>> {
        let _shared = self.cache.read();
        Ok(self.store.list()?)
    }

    pub fn list_enabled(&self) -> Result<Vec<Server>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|s| s.enabled)
            .collect())
    }

    pub fn set_ping(&self, id: &str, ping_ms: u32) -> Result<()> {
        self.modify(id, |server| server.ping = ping_ms)?;
        tracing::debug!(server_id = %id, ping_ms, "ping updated");
        Ok(())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.modify(id, |server| server.enabled = enabled)
    }

    /// Drop every cached entry; `get` repopulates lazily.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    fn load_locked(&self, cache: &HashMap<String, Server>, id: &str) -> Result<Server> {
        match cache.get(id) {
            Some(server) => Ok(server.clone()),
            None => self
                .store
                .get(id)?
                .ok_or_else(|| RelayError::server_not_found(id)),
        }
    }

    /// Read-modify-write under a single exclusive lock.
    fn modify(&self, id: &str, apply: impl FnOnce(&mut Server)) -> Result<()> {
        let mut cache = self.cache.write();
        let mut server = self.load_locked(&cache, id)?;
        apply(&mut server);
        server.updated_at = Utc::now();
        self.store.update(&server)?;
        cache.insert(server.id.clone(), server);
        Ok(())
    }

    // ── Selection ───────────────────────────────────────────────────

    /// Enabled server with the lowest ping; the first one wins a tie.
    ///
    /// A ping of 0 (unknown) compares as 0, so run a sweep first when the
    /// answer is used for routing.
    pub fn best_server(&self) -> Result<Server> {
        self.list_enabled()?
            .into_iter()
            .min_by_key(|s| s.ping)
            .ok_or(RelayError::NoEnabledServers)
    }

    // ── Ping sweeps ─────────────────────────────────────────────────

    /// Probe one server and record the result.
    pub async fn test_one(&self, id: &str, probe: &dyn LatencyProbe) -> Result<u32> {
        let server = self.get(id)?;
        let latency = probe.probe(&server).await.map_err(|source| {
            tracing::warn!(server_id = %id, "ping failed: {source}");
            RelayError::Probe {
                id: id.to_string(),
                source,
            }
        })?;
        let ping = to_ping_ms(latency);
        self.set_ping(id, ping)?;
        tracing::info!(server_id = %id, name = %server.name, ping_ms = ping, "ping test completed");
        Ok(ping)
    }

    /// Probe every server with at most `concurrency` probes in flight.
    ///
    /// A failed probe leaves that server's ping untouched.
    pub async fn test_all(&self, probe: &dyn LatencyProbe, concurrency: usize) -> Result<PingReport> {
        let servers = self.list_all()?;
        tracing::info!("starting ping sweep over {} servers", servers.len());

        let results: Vec<_> = stream::iter(servers)
            .map(|server| async move {
                let outcome = probe.probe(&server).await;
                (server, outcome)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut report = PingReport::default();
        for (server, outcome) in results {
            let recorded = match outcome {
                Ok(latency) => self.set_ping(&server.id, to_ping_ms(latency)),
                Err(e) => {
                    tracing::warn!(server_id = %server.id, "ping failed for {}: {e}", server.name);
                    report.failed += 1;
                    continue;
                }
            };
            match recorded {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    tracing::warn!(server_id = %server.id, "failed to record ping: {e}");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "ping sweep finished"
        );
        Ok(report)
    }
}
