//! `RelayClient`: one handle over the store, registry, importer and
//! orchestrator, wired from a [`Config`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::events::{NotificationCenter, StatsTracker, TracingAuditLog};
use crate::latency::TcpProbe;
use crate::model::{ConnectionState, ConnectionStats, Server};
use crate::orchestrator::ConnectionOrchestrator;
use crate::protocols::{HandlerOptions, ProtocolRegistry};
use crate::registry::{PingReport, ServerRegistry};
use crate::store::Store;
use crate::subscription::{FetchOptions, LinkParser, SubscriptionImporter};

pub struct RelayClient {
    config: Config,
    servers: Arc<ServerRegistry>,
    subscriptions: Arc<SubscriptionImporter>,
    orchestrator: Arc<ConnectionOrchestrator>,
    notifications: Arc<NotificationCenter>,
    stats: Arc<StatsTracker>,
    probe: TcpProbe,
    background: CancellationToken,
}

impl RelayClient {
    /// Open the JSON store under the configured data directory and register
    /// the built-in protocol handlers.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let data_dir = config.data_dir()?;
        let store = Store::open_json(&data_dir)
            .with_context(|| format!("Failed to open store at {}", data_dir.display()))?;
        let protocols = Arc::new(ProtocolRegistry::with_defaults(HandlerOptions {
            connect_timeout: Duration::from_secs(config.connection.connect_timeout_secs),
        }));
        Self::build(config, store, protocols)
    }

    /// Wire a client over an explicit store and protocol registry.
    pub fn build(
        config: Config,
        store: Store,
        protocols: Arc<ProtocolRegistry>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let notifications = Arc::new(NotificationCenter::new(config.notifications.max_entries));
        let stats = Arc::new(StatsTracker::new());

        let servers = Arc::new(ServerRegistry::new(store.servers, Arc::clone(&protocols)));

        let mut fetch = FetchOptions {
            timeout: Duration::from_secs(config.subscription.fetch_timeout_secs),
            connect_timeout: Duration::from_secs(config.subscription.connect_timeout_secs),
            ..FetchOptions::default()
        };
        if let Some(agent) = &config.subscription.user_agent {
            fetch.user_agent = agent.clone();
        }
        let parser = LinkParser::new(&fetch).context("Failed to build subscription HTTP client")?;
        let subscriptions = Arc::new(
            SubscriptionImporter::new(parser, store.subscriptions, Arc::clone(&servers))
                .with_notifier(notifications.clone()),
        );

        let orchestrator = Arc::new(
            ConnectionOrchestrator::new(protocols)
                .with_notifier(notifications.clone())
                .with_audit_log(Arc::new(TracingAuditLog))
                .with_usage_sink(stats.clone()),
        );

        Ok(Self {
            probe: TcpProbe::new(config.ping_timeout()),
            config,
            servers,
            subscriptions,
            orchestrator,
            notifications,
            stats,
            background: CancellationToken::new(),
        })
    }

    /// Spawn the usage poller and, when enabled, the subscription
    /// auto-refresh loop. Both stop on [`shutdown`](Self::shutdown).
    pub fn start_background(&self) {
        Arc::clone(&self.orchestrator)
            .spawn_usage_poller(self.config.usage_poll_interval(), self.background.child_token());
        if let Some(interval) = self.config.auto_update_interval() {
            Arc::clone(&self.subscriptions)
                .spawn_auto_refresh(interval, self.background.child_token());
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn servers(&self) -> &Arc<ServerRegistry> {
        &self.servers
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionImporter> {
        &self.subscriptions
    }

    pub fn orchestrator(&self) -> &Arc<ConnectionOrchestrator> {
        &self.orchestrator
    }

    pub fn notifications(&self) -> &Arc<NotificationCenter> {
        &self.notifications
    }

    pub fn usage(&self) -> &Arc<StatsTracker> {
        &self.stats
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Connect to the server with `id`. Disabled servers are refused.
    pub async fn connect(&self, id: &str) -> Result<Server> {
        let server = self.servers.get(id)?;
        if !server.enabled {
            return Err(RelayError::Validation(format!("server {id} is disabled")));
        }
        self.orchestrator.connect(&server).await?;
        Ok(server)
    }

    /// Connect to the enabled server with the lowest recorded ping.
    pub async fn connect_best(&self) -> Result<Server> {
        let server = self.servers.best_server()?;
        tracing::info!(server_id = %server.id, ping_ms = server.ping, "connecting to best server");
        self.orchestrator.connect(&server).await?;
        Ok(server)
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.orchestrator.disconnect().await
    }

    pub fn status(&self) -> ConnectionState {
        self.orchestrator.status()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.orchestrator.stats()
    }

    // ── Ping ────────────────────────────────────────────────────────

    pub async fn ping(&self, id: &str) -> Result<u32> {
        self.servers.test_one(id, &self.probe).await
    }

    pub async fn ping_all(&self) -> Result<PingReport> {
        self.servers
            .test_all(&self.probe, self.config.ping.concurrency)
            .await
    }

    /// Stop background loops and tear down a live tunnel.
    pub async fn shutdown(&self) -> Result<()> {
        self.background.cancel();
        match self.orchestrator.status() {
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Error => {
                match self.orchestrator.disconnect().await {
                    Ok(()) | Err(RelayError::NotConnected) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => Ok(()),
        }
    }
}
