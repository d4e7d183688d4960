//! Side-channel collaborators: notifications, audit log and usage stats.
//!
//! All three are optional and fire-and-forget. They are invoked after the
//! authoritative state change has been committed, outside any lock, through
//! [`dispatch`] so a panicking collaborator cannot fail a transition.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ConnectionInfo, ConnectionState};

/// Run a collaborator call, logging and swallowing a panic.
pub(crate) fn dispatch(collaborator: &'static str, call: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(call)).is_err() {
        tracing::error!(collaborator, "collaborator panicked; ignoring");
    }
}

// ── Notifications ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    pub level: NotificationLevel,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

/// Receives user-facing notifications. Must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str, level: NotificationLevel);
}

/// Bounded in-memory notification feed, newest first.
pub struct NotificationCenter {
    max_entries: usize,
    entries: RwLock<VecDeque<Notification>>,
}

impl NotificationCenter {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Newest first.
    pub fn list(&self) -> Vec<Notification> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn unread_count(&self) -> usize {
        self.entries.read().iter().filter(|n| !n.read).count()
    }

    /// Returns `false` when no notification has that id.
    pub fn mark_read(&self, id: &str) -> bool {
        match self.entries.write().iter_mut().find(|n| n.id == id) {
            Some(n) => {
                n.read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&self) {
        for n in self.entries.write().iter_mut() {
            n.read = true;
        }
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Notifier for NotificationCenter {
    fn notify(&self, title: &str, message: &str, level: NotificationLevel) {
        let mut entries = self.entries.write();
        entries.push_front(Notification {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            message: message.to_string(),
            level,
            created_at: Utc::now(),
            read: false,
        });
        entries.truncate(self.max_entries);
    }
}

// ── Audit log ───────────────────────────────────────────────────────

/// One committed state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub server_id: Option<String>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

pub trait AuditLog: Send + Sync {
    fn record(&self, transition: &Transition);
}

/// Emits transitions as `tracing` events on the `relayctl::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record(&self, t: &Transition) {
        let server_id = t.server_id.as_deref().unwrap_or("-");
        match (t.to, t.detail.as_deref()) {
            (ConnectionState::Error, Some(detail)) => tracing::warn!(
                target: "relayctl::audit",
                from = %t.from,
                to = %t.to,
                server_id,
                "connection error: {detail}"
            ),
            (_, detail) => tracing::info!(
                target: "relayctl::audit",
                from = %t.from,
                to = %t.to,
                server_id,
                detail = detail.unwrap_or(""),
                "connection state changed"
            ),
        }
    }
}

// ── Usage statistics ────────────────────────────────────────────────

/// Receives usage accounting from the orchestrator.
pub trait UsageSink: Send + Sync {
    fn session_started(&self, info: &ConnectionInfo);
    /// Byte increments since the previous call.
    fn record_usage(&self, sent: u64, received: u64);
    fn session_ended(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub server_id: String,
    pub server_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct StatsInner {
    current: Option<Session>,
    history: Vec<Session>,
}

/// Per-session byte accounting with a closed-session history.
#[derive(Default)]
pub struct StatsTracker {
    inner: RwLock<StatsInner>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.inner.read().current.clone()
    }

    /// Closed sessions, oldest first.
    pub fn sessions(&self) -> Vec<Session> {
        self.inner.read().history.clone()
    }

    /// `(sent, received)` over history plus the live session.
    pub fn total_usage(&self) -> (u64, u64) {
        let inner = self.inner.read();
        inner
            .history
            .iter()
            .chain(inner.current.iter())
            .fold((0, 0), |(s, r), session| {
                (s + session.bytes_sent, r + session.bytes_received)
            })
    }
}

impl UsageSink for StatsTracker {
    fn session_started(&self, info: &ConnectionInfo) {
        let mut inner = self.inner.write();
        if let Some(mut stale) = inner.current.take() {
            stale.ended_at = Some(Utc::now());
            inner.history.push(stale);
        }
        inner.current = Some(Session {
            server_id: info.server_id.clone(),
            server_name: info.server_name.clone(),
            started_at: info.started_at,
            ended_at: None,
            bytes_sent: 0,
            bytes_received: 0,
        });
    }

    fn record_usage(&self, sent: u64, received: u64) {
        if let Some(session) = self.inner.write().current.as_mut() {
            session.bytes_sent += sent;
            session.bytes_received += received;
        }
    }

    fn session_ended(&self) {
        let mut inner = self.inner.write();
        if let Some(mut session) = inner.current.take() {
            session.ended_at = Some(Utc::now());
            inner.history.push(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_are_newest_first_and_capped() {
        let center = NotificationCenter::new(2);
        center.notify("a", "first", NotificationLevel::Info);
        center.notify("b", "second", NotificationLevel::Success);
        center.notify("c", "third", NotificationLevel::Error);

        let all = center.list();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].title, "c");
        assert_eq!(all[1].title, "b");
        assert_eq!(center.unread_count(), 2);
    }

    #[test]
    fn read_tracking() {
        let center = NotificationCenter::new(10);
        center.notify("a", "", NotificationLevel::Info);
        center.notify("b", "", NotificationLevel::Warning);
        let id = center.list()[1].id.clone();

        assert!(center.mark_read(&id));
        assert!(!center.mark_read("missing"));
        assert_eq!(center.unread_count(), 1);

        center.mark_all_read();
        assert_eq!(center.unread_count(), 0);
        center.clear();
        assert!(center.list().is_empty());
    }

    #[test]
    fn stats_accumulate_per_session() {
        let stats = StatsTracker::new();
        stats.record_usage(5, 5);
        assert_eq!(stats.total_usage(), (0, 0));

        let info = ConnectionInfo {
            server_id: "s1".into(),
            server_name: "one".into(),
            started_at: Utc::now(),
            bytes_sent: 0,
            bytes_received: 0,
        };
        stats.session_started(&info);
        stats.record_usage(100, 10);
        stats.record_usage(1, 1);
        assert_eq!(stats.current_session().unwrap().bytes_sent, 101);

        stats.session_ended();
        assert!(stats.current_session().is_none());
        stats.session_started(&info);
        stats.record_usage(9, 9);

        assert_eq!(stats.sessions().len(), 1);
        assert!(stats.sessions()[0].ended_at.is_some());
        assert_eq!(stats.total_usage(), (110, 20));
    }

    #[test]
    fn dispatch_swallows_panics() {
        let mut ran = false;
        dispatch("test", || ran = true);
        assert!(ran);
        dispatch("test", || panic!("boom"));
    }
}
