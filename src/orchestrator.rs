//! Connection state machine.
//!
//! Owns the single current connection: its state, the server it targets,
//! the live [`ProtocolHandler`] and the usage counters. State checks and
//! commits happen under one `parking_lot::RwLock`; handler I/O runs with the
//! lock released. A `disconnect` issued while a connect is in flight marks
//! the attempt cancelled, and the connecting task tears the tunnel down once
//! the handler returns.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::events::{dispatch, AuditLog, NotificationLevel, Notifier, Transition, UsageSink};
use crate::model::{ConnectionInfo, ConnectionState, ConnectionStats, Server};
use crate::protocols::{ConnectionDetails, ProtocolHandler, ProtocolRegistry};

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    info: Option<ConnectionInfo>,
    server: Option<Server>,
    handler: Option<Box<dyn ProtocolHandler>>,
    /// Set by `disconnect` while `Connecting`.
    cancel_requested: bool,
    /// Last `(sent, received)` read from the handler by `poll_usage`.
    last_sample: (u64, u64),
}

impl Inner {
    fn server_label(&self) -> String {
        self.server
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "previous connection".to_string())
    }
}

pub struct ConnectionOrchestrator {
    protocols: Arc<ProtocolRegistry>,
    inner: RwLock<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    notifier: Option<Arc<dyn Notifier>>,
    audit: Option<Arc<dyn AuditLog>>,
    usage: Option<Arc<dyn UsageSink>>,
}

impl ConnectionOrchestrator {
    pub fn new(protocols: Arc<ProtocolRegistry>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            protocols,
            inner: RwLock::new(Inner::default()),
            state_tx,
            notifier: None,
            audit: None,
            usage: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = Some(usage);
        self
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn status(&self) -> ConnectionState {
        self.inner.read().state
    }

    pub fn current_server(&self) -> Option<Server> {
        self.inner.read().server.clone()
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.inner.read().info.clone()
    }

    /// Receiver that observes every committed state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Snapshot for a stats query. Uptime only counts while connected.
    pub fn stats(&self) -> ConnectionStats {
        let inner = self.inner.read();
        match &inner.info {
            Some(info) => ConnectionStats {
                bytes_sent: info.bytes_sent,
                bytes_received: info.bytes_received,
                uptime_secs: if inner.state == ConnectionState::Connected {
                    u64::try_from((Utc::now() - info.started_at).num_seconds()).unwrap_or(0)
                } else {
                    0
                },
                server_id: Some(info.server_id.clone()),
            },
            None => ConnectionStats::default(),
        }
    }

    /// Metadata reported by the live handler.
    pub fn connection_details(&self) -> Result<ConnectionDetails> {
        let inner = self.inner.read();
        if inner.state != ConnectionState::Connected {
            return Err(RelayError::NotConnected);
        }
        let handler = inner.handler.as_ref().ok_or(RelayError::NotConnected)?;
        handler
            .connection_details()
            .map_err(|source| RelayError::Protocol {
                protocol: handler.protocol().to_string(),
                source,
            })
    }

    // ── Connect ─────────────────────────────────────────────────────

    /// Bring up a tunnel to `server`.
    ///
    /// Accepted from `Disconnected` and from `Error` (unless a failed
    /// disconnect still holds a tunnel). Returns `Cancelled` when a
    /// `disconnect` arrived while the handler was connecting.
    pub async fn connect(&self, server: &Server) -> Result<()> {
        let (handler, started) = {
            let mut inner = self.inner.write();
            let state = inner.state;
            match state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    return Err(RelayError::AlreadyConnected)
                }
                ConnectionState::Disconnecting => {
                    return Err(RelayError::InvalidTransition {
                        action: "connect",
                        state,
                    })
                }
                ConnectionState::Error if inner.handler.is_some() => {
                    return Err(RelayError::InvalidTransition {
                        action: "connect",
                        state,
                    })
                }
                ConnectionState::Disconnected | ConnectionState::Error => {}
            }

            inner.server = Some(server.clone());
            inner.info = Some(ConnectionInfo::for_server(server));
            inner.cancel_requested = false;
            inner.last_sample = (0, 0);
            let started = self.transition(&mut inner, ConnectionState::Connecting, None);
            (self.protocols.create(&server.protocol), started)
        };
        tracing::info!(server_id = %server.id, protocol = %server.protocol, "connecting to {}", server.name);
        self.emit(
            &started,
            "Connecting",
            &format!("Connecting to {}", server.name),
            NotificationLevel::Info,
        );

        let Some(mut handler) = handler else {
            let err = RelayError::UnsupportedProtocol(server.protocol.to_string());
            return self.finish_connect(server, None, Err(err)).await;
        };

        let outcome = handler
            .connect(server)
            .await
            .map_err(|source| RelayError::Protocol {
                protocol: server.protocol.to_string(),
                source,
            });
        self.finish_connect(server, Some(handler), outcome).await
    }

    async fn finish_connect(
        &self,
        server: &Server,
        mut handler: Option<Box<dyn ProtocolHandler>>,
        outcome: Result<()>,
    ) -> Result<()> {
        let committed = {
            let mut inner = self.inner.write();
            if inner.cancel_requested {
                None
            } else {
                Some(match &outcome {
                    Ok(()) => {
                        inner.handler = handler.take();
                        let t = self.transition(&mut inner, ConnectionState::Connected, None);
                        (t, inner.info.clone())
                    }
                    Err(e) => {
                        let t = self.transition(
                            &mut inner,
                            ConnectionState::Error,
                            Some(e.to_string()),
                        );
                        inner.info = None;
                        inner.server = None;
                        (t, None)
                    }
                })
            }
        };

        let Some((transition, info)) = committed else {
            return self.teardown_cancelled(server, handler_if_up(handler, &outcome)).await;
        };

        match outcome {
            Ok(()) => {
                tracing::info!(server_id = %server.id, "connected to {}", server.name);
                self.emit(
                    &transition,
                    "Connected",
                    &format!("Successfully connected to {}", server.name),
                    NotificationLevel::Success,
                );
                if let (Some(usage), Some(info)) = (&self.usage, info) {
                    dispatch("usage", || usage.session_started(&info));
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(server_id = %server.id, "failed to connect to {}: {e}", server.name);
                self.emit(
                    &transition,
                    "Connection Failed",
                    &format!("Failed to connect to {}: {e}", server.name),
                    NotificationLevel::Error,
                );
                Err(e)
            }
        }
    }

    /// Finish an attempt that a `disconnect` cancelled mid-flight.
    async fn teardown_cancelled(
        &self,
        server: &Server,
        handler: Option<Box<dyn ProtocolHandler>>,
    ) -> Result<()> {
        let teardown = match handler {
            Some(mut handler) => {
                let result = handler.disconnect().await;
                result.map_err(|e| (handler, e))
            }
            None => Ok(()),
        };

        let (transition, failure) = {
            let mut inner = self.inner.write();
            inner.cancel_requested = false;
            inner.info = None;
            match teardown {
                Ok(()) => {
                    let t = self.transition(&mut inner, ConnectionState::Disconnected, None);
                    inner.server = None;
                    (t, None)
                }
                Err((handler, e)) => {
                    let t = self.transition(
                        &mut inner,
                        ConnectionState::Error,
                        Some(e.to_string()),
                    );
                    inner.handler = Some(handler);
                    (t, Some(e))
                }
            }
        };

        match failure {
            None => {
                tracing::info!(server_id = %server.id, "connection to {} cancelled", server.name);
                self.emit(
                    &transition,
                    "Disconnected",
                    &format!("Connection to {} was cancelled", server.name),
                    NotificationLevel::Info,
                );
            }
            Some(e) => {
                tracing::error!(server_id = %server.id, "failed to tear down cancelled connection: {e}");
                self.emit(
                    &transition,
                    "Disconnection Failed",
                    &format!("Failed to disconnect from {}: {e}", server.name),
                    NotificationLevel::Error,
                );
            }
        }
        Err(RelayError::Cancelled)
    }

    // ── Disconnect ──────────────────────────────────────────────────

    /// Tear down the current connection.
    ///
    /// While `Connecting` this only requests cancellation and returns at
    /// once; the pending `connect` completes the teardown.
    pub async fn disconnect(&self) -> Result<()> {
        let (handler, label, was_connected, started) = {
            let mut inner = self.inner.write();
            let state = inner.state;
            match state {
                ConnectionState::Disconnected => return Err(RelayError::NotConnected),
                ConnectionState::Disconnecting => {
                    return Err(RelayError::InvalidTransition {
                        action: "disconnect",
                        state,
                    })
                }
                ConnectionState::Connecting => {
                    inner.cancel_requested = true;
                    let label = inner.server_label();
                    let t = self.transition(
                        &mut inner,
                        ConnectionState::Disconnecting,
                        Some("connect cancelled".to_string()),
                    );
                    drop(inner);
                    tracing::info!("cancelling in-flight connection to {label}");
                    self.emit(
                        &t,
                        "Disconnecting",
                        &format!("Disconnecting from {label}"),
                        NotificationLevel::Info,
                    );
                    return Ok(());
                }
                ConnectionState::Connected | ConnectionState::Error => {}
            }

            let was_connected = state == ConnectionState::Connected;
            let handler = inner.handler.take();
            let label = inner.server_label();
            let t = self.transition(&mut inner, ConnectionState::Disconnecting, None);
            (handler, label, was_connected, t)
        };
        tracing::info!("disconnecting from {label}");
        self.emit(
            &started,
            "Disconnecting",
            &format!("Disconnecting from {label}"),
            NotificationLevel::Info,
        );

        let result = match handler {
            Some(mut handler) => {
                let result = handler.disconnect().await;
                result.map_err(|e| (handler, e))
            }
            None => Ok(()),
        };

        let (transition, failure) = {
            let mut inner = self.inner.write();
            inner.info = None;
            match result {
                Ok(()) => {
                    let t = self.transition(&mut inner, ConnectionState::Disconnected, None);
                    inner.server = None;
                    (t, None)
                }
                Err((handler, e)) => {
                    let protocol = handler.protocol().to_string();
                    let t = self.transition(
                        &mut inner,
                        ConnectionState::Error,
                        Some(e.to_string()),
                    );
                    // Kept so a later disconnect can retry the teardown.
                    inner.handler = Some(handler);
                    (t, Some((protocol, e)))
                }
            }
        };

        if was_connected {
            if let Some(usage) = &self.usage {
                dispatch("usage", || usage.session_ended());
            }
        }

        match failure {
            None => {
                tracing::info!("disconnected from {label}");
                self.emit(
                    &transition,
                    "Disconnected",
                    &format!("Successfully disconnected from {label}"),
                    NotificationLevel::Success,
                );
                Ok(())
            }
            Some((protocol, source)) => {
                tracing::error!("failed to disconnect from {label}: {source}");
                self.emit(
                    &transition,
                    "Disconnection Failed",
                    &format!("Failed to disconnect from {label}: {source}"),
                    NotificationLevel::Error,
                );
                Err(RelayError::Protocol { protocol, source })
            }
        }
    }

    // ── Usage accounting ────────────────────────────────────────────

    /// Add byte increments to the current connection.
    ///
    /// A no-op unless `Connected`: pollers may race a disconnect.
    pub fn update_stats(&self, sent: u64, received: u64) {
        {
            let mut inner = self.inner.write();
            if inner.state != ConnectionState::Connected {
                return;
            }
            let Some(info) = inner.info.as_mut() else {
                return;
            };
            info.bytes_sent = info.bytes_sent.saturating_add(sent);
            info.bytes_received = info.bytes_received.saturating_add(received);
        }
        if let Some(usage) = &self.usage {
            dispatch("usage", || usage.record_usage(sent, received));
        }
    }

    /// Sample the handler's counters and feed the delta into
    /// [`update_stats`](Self::update_stats). `None` when not connected.
    pub fn poll_usage(&self) -> Option<(u64, u64)> {
        let delta = {
            let mut inner = self.inner.write();
            if inner.state != ConnectionState::Connected {
                return None;
            }
            let (sent, received) = inner.handler.as_ref()?.data_usage();
            let (last_sent, last_received) = inner.last_sample;
            inner.last_sample = (sent, received);
            (
                sent.saturating_sub(last_sent),
                received.saturating_sub(last_received),
            )
        };
        if delta != (0, 0) {
            self.update_stats(delta.0, delta.1);
        }
        Some(delta)
    }

    /// Spawn a loop calling [`poll_usage`](Self::poll_usage) every
    /// `interval`. Cancel `token` to stop it.
    pub fn spawn_usage_poller(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("usage poller cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.poll_usage();
                    }
                }
            }
        })
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Commit a new state. Must be called with the write lock held.
    fn transition(
        &self,
        inner: &mut Inner,
        to: ConnectionState,
        detail: Option<String>,
    ) -> Transition {
        let from = std::mem::replace(&mut inner.state, to);
        self.state_tx.send_replace(to);
        tracing::debug!(%from, %to, "connection state transition");
        Transition {
            from,
            to,
            server_id: inner.server.as_ref().map(|s| s.id.clone()),
            detail,
            at: Utc::now(),
        }
    }

    /// Audit + notify for a committed transition. Called without the lock.
    fn emit(&self, transition: &Transition, title: &str, message: &str, level: NotificationLevel) {
        if let Some(audit) = &self.audit {
            dispatch("audit", || audit.record(transition));
        }
        if let Some(notifier) = &self.notifier {
            dispatch("notifier", || notifier.notify(title, message, level));
        }
    }
}

/// The handler only needs tearing down when its connect succeeded.
fn handler_if_up(
    handler: Option<Box<dyn ProtocolHandler>>,
    outcome: &Result<()>,
) -> Option<Box<dyn ProtocolHandler>> {
    handler.filter(|_| outcome.is_ok())
}

impl std::fmt::Debug for ConnectionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ConnectionOrchestrator")
            .field("state", &inner.state)
            .field("server", &inner.server.as_ref().map(|s| &s.id))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NotificationCenter, StatsTracker};
    use crate::model::Protocol;
    use crate::protocols::{HandlerError, TrafficCounter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Handler whose behaviour is set up by the test.
    struct Scripted {
        fail_connect: bool,
        fail_disconnect: Arc<AtomicBool>,
        gate: Option<Arc<Notify>>,
        traffic: Arc<TrafficCounter>,
        up: bool,
    }

    #[async_trait]
    impl ProtocolHandler for Scripted {
        fn protocol(&self) -> Protocol {
            Protocol::Other("scripted".into())
        }

        async fn connect(&mut self, _server: &Server) -> std::result::Result<(), HandlerError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_connect {
                return Err(HandlerError::Other("handshake refused".into()));
            }
            self.up = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> std::result::Result<(), HandlerError> {
            if self.fail_disconnect.load(Ordering::SeqCst) {
                return Err(HandlerError::Other("socket stuck".into()));
            }
            self.up = false;
            Ok(())
        }

        fn data_usage(&self) -> (u64, u64) {
            self.traffic.snapshot()
        }

        fn connection_details(&self) -> std::result::Result<ConnectionDetails, HandlerError> {
            if !self.up {
                return Err(HandlerError::NotConnected);
            }
            Ok(ConnectionDetails::from([("kind".to_string(), "scripted".to_string())]))
        }
    }

    #[derive(Default, Clone)]
    struct Script {
        fail_connect: bool,
        fail_disconnect: Arc<AtomicBool>,
        gate: Option<Arc<Notify>>,
        traffic: Arc<TrafficCounter>,
    }

    fn orchestrator(script: &Script) -> ConnectionOrchestrator {
        let protocols = Arc::new(ProtocolRegistry::new());
        let script = script.clone();
        protocols.register(
            Protocol::Other("scripted".into()),
            Arc::new(move || {
                Box::new(Scripted {
                    fail_connect: script.fail_connect,
                    fail_disconnect: script.fail_disconnect.clone(),
                    gate: script.gate.clone(),
                    traffic: script.traffic.clone(),
                    up: false,
                }) as Box<dyn ProtocolHandler>
            }),
        );
        ConnectionOrchestrator::new(protocols)
    }

    fn server() -> Server {
        Server::new("scripted-1", "relay.example", 443, Protocol::Other("scripted".into()))
            .with_id("srv-1")
    }

    #[tokio::test]
    async fn successful_connect_and_disconnect() {
        let orch = orchestrator(&Script::default());
        orch.connect(&server()).await.unwrap();
        assert_eq!(orch.status(), ConnectionState::Connected);
        assert_eq!(orch.connection_info().unwrap().server_id, "srv-1");
        assert_eq!(orch.current_server().unwrap().id, "srv-1");
        assert_eq!(orch.connection_details().unwrap()["kind"], "scripted");

        orch.disconnect().await.unwrap();
        assert_eq!(orch.status(), ConnectionState::Disconnected);
        assert!(orch.connection_info().is_none());
        assert!(orch.current_server().is_none());
    }

    #[tokio::test]
    async fn failed_connect_ends_in_error_without_info() {
        let orch = orchestrator(&Script {
            fail_connect: true,
            ..Script::default()
        });
        let err = orch.connect(&server()).await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol { .. }));
        assert!(err.to_string().contains("handshake refused"));
        assert_eq!(orch.status(), ConnectionState::Error);
        assert!(orch.connection_info().is_none());
        assert!(orch.current_server().is_none());

        // Error with nothing held clears straight back to Disconnected.
        orch.disconnect().await.unwrap();
        assert_eq!(orch.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unsupported_protocol_passes_through_connecting() {
        let orch = orchestrator(&Script::default());
        let mut states = orch.subscribe();
        let mut target = server();
        target.protocol = Protocol::Other("hysteria2".into());

        let err = orch.connect(&target).await.unwrap_err();
        assert!(matches!(err, RelayError::UnsupportedProtocol(p) if p == "hysteria2"));
        assert_eq!(orch.status(), ConnectionState::Error);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn connect_while_connected_is_rejected() {
        let orch = orchestrator(&Script::default());
        orch.connect(&server()).await.unwrap();
        let before = orch.connection_info();
        assert!(matches!(
            orch.connect(&server()).await,
            Err(RelayError::AlreadyConnected)
        ));
        assert_eq!(orch.status(), ConnectionState::Connected);
        assert_eq!(orch.connection_info(), before);
    }

    #[tokio::test]
    async fn disconnect_while_disconnected_is_rejected() {
        let orch = orchestrator(&Script::default());
        assert!(matches!(
            orch.disconnect().await,
            Err(RelayError::NotConnected)
        ));
        assert_eq!(orch.status(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_disconnect_keeps_handler_for_retry() {
        let script = Script::default();
        let orch = orchestrator(&script);
        orch.connect(&server()).await.unwrap();

        script.fail_disconnect.store(true, Ordering::SeqCst);
        assert!(matches!(
            orch.disconnect().await,
            Err(RelayError::Protocol { .. })
        ));
        assert_eq!(orch.status(), ConnectionState::Error);
        assert!(orch.connection_info().is_none());
        assert!(matches!(
            orch.connect(&server()).await,
            Err(RelayError::InvalidTransition { action: "connect", .. })
        ));

        script.fail_disconnect.store(false, Ordering::SeqCst);
        orch.disconnect().await.unwrap();
        assert_eq!(orch.status(), ConnectionState::Disconnected);
        orch.connect(&server()).await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_cancels_in_flight_connect() {
        let gate = Arc::new(Notify::new());
        let orch = Arc::new(orchestrator(&Script {
            gate: Some(gate.clone()),
            ..Script::default()
        }));

        let pending = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.connect(&server()).await })
        };
        while orch.status() != ConnectionState::Connecting {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            orch.connect(&server()).await,
            Err(RelayError::AlreadyConnected)
        ));
        orch.disconnect().await.unwrap();
        assert_eq!(orch.status(), ConnectionState::Disconnecting);
        assert!(matches!(
            orch.disconnect().await,
            Err(RelayError::InvalidTransition { .. })
        ));

        gate.notify_one();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(RelayError::Cancelled)));
        assert_eq!(orch.status(), ConnectionState::Disconnected);
        assert!(orch.connection_info().is_none());
    }

    #[tokio::test]
    async fn update_stats_is_a_noop_unless_connected() {
        let orch = orchestrator(&Script::default());
        orch.update_stats(10, 10);
        assert!(orch.connection_info().is_none());
        assert_eq!(orch.stats(), ConnectionStats::default());
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(StatsTracker::new());
        let orch = Arc::new(orchestrator(&Script::default()).with_usage_sink(stats.clone()));
        orch.connect(&server()).await.unwrap();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let orch = orch.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        orch.update_stats(3, 1);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let info = orch.connection_info().unwrap();
        assert_eq!((info.bytes_sent, info.bytes_received), (24_000, 8_000));
        assert_eq!(stats.total_usage(), (24_000, 8_000));
        assert_eq!(orch.stats().server_id.as_deref(), Some("srv-1"));
    }

    #[tokio::test]
    async fn poll_usage_forwards_handler_deltas() {
        let script = Script::default();
        let orch = orchestrator(&script);
        assert_eq!(orch.poll_usage(), None);

        orch.connect(&server()).await.unwrap();
        script.traffic.add_sent(100);
        script.traffic.add_received(40);
        assert_eq!(orch.poll_usage(), Some((100, 40)));
        script.traffic.add_sent(5);
        assert_eq!(orch.poll_usage(), Some((5, 0)));
        assert_eq!(orch.poll_usage(), Some((0, 0)));

        let info = orch.connection_info().unwrap();
        assert_eq!((info.bytes_sent, info.bytes_received), (105, 40));
    }

    #[tokio::test]
    async fn notifications_follow_transitions() {
        let center = Arc::new(NotificationCenter::new(10));
        let orch = orchestrator(&Script::default()).with_notifier(center.clone());
        orch.connect(&server()).await.unwrap();
        orch.disconnect().await.unwrap();

        let titles: Vec<_> = center.list().into_iter().map(|n| n.title).collect();
        assert_eq!(
            titles,
            vec!["Disconnected", "Disconnecting", "Connected", "Connecting"]
        );
    }

    #[tokio::test]
    async fn panicking_collaborator_does_not_break_transitions() {
        struct Exploding;
        impl Notifier for Exploding {
            fn notify(&self, _: &str, _: &str, _: NotificationLevel) {
                panic!("notifier down");
            }
        }

        let orch = orchestrator(&Script::default()).with_notifier(Arc::new(Exploding));
        orch.connect(&server()).await.unwrap();
        assert_eq!(orch.status(), ConnectionState::Connected);
        orch.disconnect().await.unwrap();
        assert_eq!(orch.status(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn usage_poller_feeds_connection_info_until_cancelled() {
        let script = Script::default();
        let orch = Arc::new(orchestrator(&script));
        orch.connect(&server()).await.unwrap();

        let token = CancellationToken::new();
        let handle = orch
            .clone()
            .spawn_usage_poller(Duration::from_millis(100), token.clone());

        script.traffic.add_sent(10);
        script.traffic.add_received(20);
        tokio::time::sleep(Duration::from_millis(250)).await;
        let info = orch.connection_info().unwrap();
        assert_eq!((info.bytes_sent, info.bytes_received), (10, 20));

        script.traffic.add_sent(5);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let info = orch.connection_info().unwrap();
        assert_eq!((info.bytes_sent, info.bytes_received), (15, 20));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller should stop once cancelled")
            .unwrap();

        script.traffic.add_sent(100);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(orch.connection_info().unwrap().bytes_sent, 15);
    }
}
