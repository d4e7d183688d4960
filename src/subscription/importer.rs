//! Subscription import, soft-reconciling refresh and CRUD.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::parser::LinkParser;
use crate::error::{RelayError, Result};
use crate::events::{dispatch, NotificationLevel, Notifier};
use crate::model::{Server, Subscription};
use crate::registry::ServerRegistry;
use crate::store::Collection;

/// Per-server outcome of a refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub added: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Imports feeds into the server registry.
///
/// Servers never belong to a subscription: a refresh updates entries by id
/// or adds new ones, and never deletes entries missing from the feed.
pub struct SubscriptionImporter {
    parser: LinkParser,
    subscriptions: Arc<dyn Collection<Subscription>>,
    registry: Arc<ServerRegistry>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl SubscriptionImporter {
    pub fn new(
        parser: LinkParser,
        subscriptions: Arc<dyn Collection<Subscription>>,
        registry: Arc<ServerRegistry>,
    ) -> Self {
        Self {
            parser,
            subscriptions,
            registry,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn notify(&self, title: &str, message: &str, level: NotificationLevel) {
        if let Some(notifier) = &self.notifier {
            dispatch("notifier", || notifier.notify(title, message, level));
        }
    }

    /// Parse `url`, persist a subscription record, then add every parsed
    /// server. Per-server add failures are logged and counted only.
    pub async fn import(&self, url: &str) -> Result<Subscription> {
        tracing::info!("adding subscription from {url}");
        let servers = match self.parser.parse(url).await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::error!("failed to parse subscription {url}: {e}");
                self.notify(
                    "Subscription Error",
                    &format!("Failed to parse subscription: {e}"),
                    NotificationLevel::Error,
                );
                return Err(e);
            }
        };

        let mut sub = Subscription::new(url.trim());
        sub.name = display_name(url);
        sub.server_count = servers.len();
        sub.last_update = Some(Utc::now());
        if let Err(e) = self.subscriptions.add(&sub) {
            tracing::error!("failed to save subscription {url}: {e}");
            self.notify(
                "Subscription Error",
                &format!("Failed to save subscription: {e}"),
                NotificationLevel::Error,
            );
            return Err(e.into());
        }

        let (mut added, mut failed) = (0usize, 0usize);
        for server in servers {
            let name = server.name.clone();
            match self.registry.add(server) {
                Ok(_) => added += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(subscription_id = %sub.id, "failed to add server {name}: {e}");
                }
            }
        }

        tracing::info!(
            subscription_id = %sub.id,
            added,
            failed,
            "subscription added"
        );
        self.notify(
            "Subscription Added",
            &format!(
                "Successfully added subscription with {} servers",
                sub.server_count
            ),
            NotificationLevel::Success,
        );
        Ok(sub)
    }

    /// Re-parse the subscription's URL and merge the result into the
    /// registry. Fetch or decode failures leave every server untouched.
    pub async fn refresh(&self, id: &str) -> Result<RefreshReport> {
        let mut sub = self.get(id)?;
        tracing::info!(subscription_id = %id, "refreshing subscription {}", sub.url);

        let servers = match self.parser.parse(&sub.url).await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::error!(subscription_id = %id, "failed to refresh {}: {e}", sub.url);
                self.notify(
                    "Subscription Update Error",
                    &format!("Failed to parse subscription {}: {e}", sub.url),
                    NotificationLevel::Error,
                );
                return Err(e);
            }
        };

        let mut report = RefreshReport::default();
        let count = servers.len();
        for server in servers {
            self.reconcile(server, &mut report);
        }

        let now = Utc::now();
        sub.server_count = count;
        sub.last_update = Some(now);
        sub.updated_at = now;
        self.subscriptions.update(&sub)?;

        tracing::info!(
            subscription_id = %id,
            added = report.added,
            updated = report.updated,
            failed = report.failed,
            "subscription refreshed"
        );
        self.notify(
            "Subscription Updated",
            &format!(
                "Updated {} servers and added {} new servers",
                report.updated, report.added
            ),
            NotificationLevel::Success,
        );
        Ok(report)
    }

    fn reconcile(&self, fresh: Server, report: &mut RefreshReport) {
        let outcome = match self.registry.get(&fresh.id) {
            Ok(mut existing) => {
                existing.name = fresh.name;
                existing.host = fresh.host;
                existing.port = fresh.port;
                existing.protocol = fresh.protocol;
                existing.params = fresh.params;
                self.registry
                    .update(existing)
                    .map(|_| report.updated += 1)
            }
            Err(RelayError::NotFound { .. }) => {
                self.registry.add(fresh).map(|_| report.added += 1)
            }
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            report.failed += 1;
            tracing::warn!("failed to merge refreshed server: {e}");
        }
    }

    /// Refresh every subscription with `auto_update` set. Failures are
    /// logged per subscription.
    pub async fn refresh_due(&self) -> Result<usize> {
        let mut refreshed = 0;
        for sub in self.list()?.into_iter().filter(|s| s.auto_update) {
            match self.refresh(&sub.id).await {
                Ok(_) => refreshed += 1,
                Err(e) => tracing::warn!(subscription_id = %sub.id, "auto-refresh failed: {e}"),
            }
        }
        Ok(refreshed)
    }

    /// Spawn the periodic auto-refresh loop. Cancel `token` to stop it.
    pub fn spawn_auto_refresh(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; the initial import is fresh.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("subscription auto-refresh loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh_due().await {
                            tracing::warn!("subscription auto-refresh failed: {e}");
                        }
                    }
                }
            }
        })
    }

    // ── CRUD ────────────────────────────────────────────────────────

    pub fn list(&self) -> Result<Vec<Subscription>> {
        Ok(self.subscriptions.list()?)
    }

    pub fn get(&self, id: &str) -> Result<Subscription> {
        self.subscriptions
            .get(id)?
            .ok_or_else(|| RelayError::subscription_not_found(id))
    }

    /// Persist edits to `url`, `name` or `auto_update`. Counters and
    /// `created_at` stay as stored.
    pub fn update(&self, mut sub: Subscription) -> Result<Subscription> {
        if sub.url.trim().is_empty() {
            return Err(RelayError::Validation(
                "subscription url must not be empty".into(),
            ));
        }
        let existing = self.get(&sub.id)?;
        sub.created_at = existing.created_at;
        sub.server_count = existing.server_count;
        sub.last_update = existing.last_update;
        sub.updated_at = Utc::now();
        self.subscriptions.update(&sub)?;
        Ok(sub)
    }

    /// Remove the subscription record. Servers imported from it stay.
    pub fn delete(&self, id: &str) -> Result<()> {
        let sub = self.get(id)?;
        self.subscriptions.delete(id)?;
        tracing::info!(subscription_id = %id, "subscription deleted: {}", sub.url);
        self.notify(
            "Subscription Deleted",
            &format!("Successfully deleted subscription {}", sub.url),
            NotificationLevel::Success,
        );
        Ok(())
    }
}

/// Feed host for URLs, a generic label for pasted links.
fn display_name(input: &str) -> String {
    reqwest::Url::parse(input.trim())
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "Imported links".to_string())
}
