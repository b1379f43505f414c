//! The single physical connection.
//!
//! `activate` and `deactivate` are synchronous check-and-set operations on
//! the control block. Everything that waits (the handshake, the session
//! loop, reconnect delays) runs on one driver task per generation.
//!
//! A driver writes shared state only through methods that first compare its
//! generation with the current one under the control lock. Once
//! `deactivate` bumps the generation, a driver that is still unwinding
//! cannot touch the state again.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{CourierError, CredentialSource, Result};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::directory::HandlerDirectory;
use crate::dispatcher::Dispatcher;
use crate::frame::{Command, Frame, HEARTBEAT};
use crate::heartbeat::{HeartbeatResult, Liveness, run_heartbeat};
use crate::link::{Connector, Link, LinkEvent};
use crate::protocol::{self, MISSED_BEATS_ALLOWED, NegotiatedHeartbeat};
use crate::registry::SubscriptionRegistry;
use crate::stats::TransportStats;

/// How often pending subscriptions are retried while connected.
const PENDING_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection and no driver.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// `CONNECTED` received; frames flow.
    Connected,
    /// Last attempt failed; a retry may be scheduled.
    Errored,
}

impl ConnectionState {
    /// Lowercase name for logs and the CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Errored => "errored",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct Control {
    generation: u64,
    cancel: Option<CancellationToken>,
    retry_now: Option<Arc<Notify>>,
    driver_alive: bool,
    outbound: Option<mpsc::Sender<String>>,
    token: Option<SecretString>,
    heartbeat: Option<NegotiatedHeartbeat>,
}

/// Owns the connection: activation, heartbeats, reconnection.
pub struct ConnectionSupervisor {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSource>,
    registry: Arc<SubscriptionRegistry>,
    directory: Arc<HandlerDirectory>,
    dispatcher: Dispatcher,
    stats: Arc<TransportStats>,
    control: Mutex<Control>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionSupervisor {
    /// Supervisor that is not connected yet.
    pub fn new(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
        registry: Arc<SubscriptionRegistry>,
        directory: Arc<HandlerDirectory>,
        stats: Arc<TransportStats>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&directory), Arc::clone(&stats)),
            config,
            connector,
            credentials,
            registry,
            directory,
            stats,
            control: Mutex::new(Control::default()),
            state,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that sees every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the state equals `target`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        matches!(
            time::timeout(timeout, rx.wait_for(|s| *s == target)).await,
            Ok(Ok(_))
        )
    }

    /// Current generation; bumped by every spawn and every `deactivate`.
    pub fn generation(&self) -> u64 {
        self.control.lock().generation
    }

    /// Heart-beat intervals negotiated for the current connection.
    pub fn negotiated_heartbeat(&self) -> Option<NegotiatedHeartbeat> {
        self.control.lock().heartbeat
    }

    /// Whether a token snapshot is held.
    pub fn has_token(&self) -> bool {
        self.control.lock().token.is_some()
    }

    /// The configuration in use.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Outbound queue of the live connection, only while `Connected`.
    pub fn connected_outbound(&self) -> Option<mpsc::Sender<String>> {
        let control = self.control.lock();
        (self.state() == ConnectionState::Connected)
            .then(|| control.outbound.clone())
            .flatten()
    }

    /// Ensure the connection is up or coming up.
    ///
    /// Returns at once: the handshake runs in the background. A no-op while
    /// `Connected` or `Connecting`. While `Errored` with a retry pending, the
    /// retry is moved forward instead of opening a second connection.
    ///
    /// Errors: `MissingCredentials` when the source has no token, `NoRuntime`
    /// outside a tokio runtime.
    pub fn activate(self: &Arc<Self>) -> Result<()> {
        let mut control = self.control.lock();
        match self.state() {
            ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
            ConnectionState::Errored if control.driver_alive => {
                if let Some(retry) = &control.retry_now {
                    retry.notify_one();
                }
                debug!(generation = control.generation, "activate: retry moved forward");
                return Ok(());
            }
            ConnectionState::Errored | ConnectionState::Disconnected => {}
        }

        let token = self
            .credentials
            .bearer_token()
            .ok_or(CourierError::MissingCredentials)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| CourierError::NoRuntime)?;

        control.generation += 1;
        let generation = control.generation;
        let cancel = CancellationToken::new();
        let retry_now = Arc::new(Notify::new());
        control.cancel = Some(cancel.clone());
        control.retry_now = Some(Arc::clone(&retry_now));
        control.driver_alive = true;
        control.token = Some(token.clone());
        let _ = self.state.send_replace(ConnectionState::Connecting);
        drop(control);

        info!(generation, url = %self.config.url, "activating connection");
        let driver = Driver {
            supervisor: Arc::clone(self),
            generation,
            cancel,
            retry_now,
        };
        let _ = runtime.spawn(driver.run(token));
        Ok(())
    }

    /// Tear the connection down and clear the registry and directory.
    ///
    /// Safe to call in any state. A best-effort `DISCONNECT` is queued if a
    /// connection is live.
    pub fn deactivate(&self) {
        let mut control = self.control.lock();
        control.generation += 1;
        let generation = control.generation;
        if let Some(cancel) = control.cancel.take() {
            cancel.cancel();
        }
        control.retry_now = None;
        control.driver_alive = false;
        control.token = None;
        control.heartbeat = None;
        if let Some(outbound) = control.outbound.take() {
            let _ = outbound.try_send(protocol::disconnect_frame().encode());
        }
        let previous = self.state.send_replace(ConnectionState::Disconnected);
        drop(control);

        self.registry.clear_all();
        self.directory.clear();
        info!(generation, from = %previous, "connection deactivated");
    }

    // ── driver callbacks, all generation-checked ────────────────────────

    fn is_current(&self, generation: u64) -> bool {
        self.control.lock().generation == generation
    }

    fn mark_connecting(&self, generation: u64, token: &SecretString) -> bool {
        let mut control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        control.token = Some(token.clone());
        let _ = self.state.send_replace(ConnectionState::Connecting);
        true
    }

    fn on_connected(
        &self,
        generation: u64,
        outbound: &mpsc::Sender<String>,
        heartbeat: NegotiatedHeartbeat,
    ) -> bool {
        {
            let mut control = self.control.lock();
            if control.generation != generation {
                return false;
            }
            control.outbound = Some(outbound.clone());
            control.heartbeat = Some(heartbeat);
            let _ = self.state.send_replace(ConnectionState::Connected);
        }
        self.stats.connection_opened();
        info!(
            generation,
            heartbeat_out = ?heartbeat.outgoing,
            heartbeat_in = ?heartbeat.incoming,
            "connected"
        );

        let _ = self.directory.notify_connected();

        // replay step: every recorded topic goes out once on the new link
        let control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        let _ = self.registry.resume(outbound.clone());
        true
    }

    fn on_failure(&self, generation: u64, error: &CourierError) -> bool {
        {
            let mut control = self.control.lock();
            if control.generation != generation {
                return false;
            }
            control.outbound = None;
            control.heartbeat = None;
            let _ = self.state.send_replace(ConnectionState::Errored);
            self.registry.suspend();
        }
        warn!(generation, error = %error, kind = error.error_kind(), "connection failed");
        let _ = self.directory.notify_error(error);
        true
    }

    fn retire(&self, generation: u64) {
        let mut control = self.control.lock();
        if control.generation == generation {
            control.driver_alive = false;
            control.cancel = None;
            control.retry_now = None;
        }
    }

    /// Fresh token from the source, or the previous snapshot.
    fn refresh_token(&self, previous: SecretString) -> SecretString {
        match self.credentials.bearer_token() {
            Some(token) => token,
            None => {
                debug!("credential source empty, reusing previous token");
                previous
            }
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let control = self.control.lock();
        f.debug_struct("ConnectionSupervisor")
            .field("state", &self.state())
            .field("generation", &control.generation)
            .field("driver_alive", &control.driver_alive)
            .field("url", &self.config.url)
            .finish_non_exhaustive()
    }
}

/// How one connection attempt ended.
enum SessionEnd {
    /// Failed; `connected` tells whether the handshake had completed.
    Failed { connected: bool, error: CourierError },
    /// A newer generation took over.
    Superseded,
}

/// One generation's connection loop.
struct Driver {
    supervisor: Arc<ConnectionSupervisor>,
    generation: u64,
    cancel: CancellationToken,
    retry_now: Arc<Notify>,
}

impl Driver {
    async fn run(self, mut token: SecretString) {
        let sup = Arc::clone(&self.supervisor);
        let mut failures: u32 = 0;

        loop {
            let end = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                end = self.session(&token) => end,
            };

            let error = match end {
                SessionEnd::Superseded => break,
                SessionEnd::Failed { connected, error } => {
                    if connected {
                        failures = 0;
                    }
                    error
                }
            };
            if !sup.on_failure(self.generation, &error) {
                break;
            }

            failures = failures.saturating_add(1);
            if let Some(max) = sup.config.max_reconnect_attempts {
                if failures > max {
                    warn!(
                        generation = self.generation,
                        attempts = max,
                        "reconnect attempts exhausted"
                    );
                    sup.retire(self.generation);
                    break;
                }
            }

            sup.stats.reconnect_attempt();
            debug!(
                generation = self.generation,
                attempt = failures,
                delay = ?sup.config.reconnect_delay,
                "reconnect scheduled"
            );
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = time::sleep(sup.config.reconnect_delay) => {}
                () = self.retry_now.notified() => debug!("reconnect requested early"),
            }

            token = sup.refresh_token(token);
            if !sup.mark_connecting(self.generation, &token) {
                break;
            }
        }
        debug!(generation = self.generation, "driver stopped");
    }

    async fn session(&self, token: &SecretString) -> SessionEnd {
        let sup = &self.supervisor;
        let config = &sup.config;
        let fail = |error| SessionEnd::Failed {
            connected: false,
            error,
        };

        let link = match time::timeout(config.connect_timeout, sup.connector.connect(&config.url))
            .await
        {
            Ok(Ok(link)) => link,
            Ok(Err(error)) => return fail(error),
            Err(_) => {
                return fail(CourierError::Handshake(format!(
                    "no connection within {:?}",
                    config.connect_timeout
                )));
            }
        };
        let Link {
            outbound,
            mut inbound,
        } = link;

        let connect = protocol::connect_frame(&config.virtual_host, token, &config.heartbeat);
        if outbound.send(connect.encode()).await.is_err() {
            return fail(CourierError::Transport(
                "link closed before CONNECT".into(),
            ));
        }

        let connected =
            match time::timeout(config.connect_timeout, await_connected(&mut inbound)).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(error)) => return fail(error),
                Err(_) => {
                    return fail(CourierError::Handshake(format!(
                        "no CONNECTED within {:?}",
                        config.connect_timeout
                    )));
                }
            };

        let heartbeat = config.heartbeat.negotiate(connected.get("heart-beat"));
        if !sup.on_connected(self.generation, &outbound, heartbeat) {
            return SessionEnd::Superseded;
        }

        let error = self.pump(&outbound, &mut inbound, heartbeat).await;
        if sup.is_current(self.generation) {
            SessionEnd::Failed {
                connected: true,
                error,
            }
        } else {
            SessionEnd::Superseded
        }
    }

    /// Run a connected session until it fails.
    async fn pump(
        &self,
        outbound: &mpsc::Sender<String>,
        inbound: &mut mpsc::Receiver<LinkEvent>,
        heartbeat: NegotiatedHeartbeat,
    ) -> CourierError {
        let sup = &self.supervisor;
        let liveness = Arc::new(Liveness::new());
        let watchdog_cancel = self.cancel.child_token();
        let _guard = watchdog_cancel.clone().drop_guard();
        let watchdog = async {
            match heartbeat.incoming {
                Some(interval) => {
                    run_heartbeat(
                        Arc::clone(&liveness),
                        interval,
                        MISSED_BEATS_ALLOWED,
                        watchdog_cancel,
                    )
                    .await
                }
                None => pending().await,
            }
        };
        tokio::pin!(watchdog);

        let mut beats = heartbeat.outgoing.map(|every| {
            let mut beats = time::interval_at(Instant::now() + every, every);
            beats.set_missed_tick_behavior(MissedTickBehavior::Delay);
            beats
        });
        let mut flush = time::interval_at(
            Instant::now() + PENDING_FLUSH_INTERVAL,
            PENDING_FLUSH_INTERVAL,
        );

        loop {
            tokio::select! {
                event = inbound.recv() => {
                    liveness.mark_alive();
                    match event {
                        Some(LinkEvent::Text(text)) => {
                            if let Err(error) = self.handle_text(&text) {
                                return error;
                            }
                        }
                        Some(LinkEvent::Pong) => {}
                        Some(LinkEvent::Closed(reason)) => {
                            return CourierError::Transport(format!(
                                "connection closed: {}",
                                reason.as_deref().unwrap_or("no reason given")
                            ));
                        }
                        Some(LinkEvent::Error(reason)) => return CourierError::Transport(reason),
                        None => return CourierError::Transport("link dropped".into()),
                    }
                }
                result = &mut watchdog => {
                    if result == HeartbeatResult::TimedOut {
                        let deadline = heartbeat.incoming_deadline().unwrap_or_default();
                        return CourierError::HeartbeatTimeout(deadline);
                    }
                    // cancelled: the outer select sees the token next
                    return CourierError::Transport("session cancelled".into());
                }
                () = tick(beats.as_mut()) => {
                    // a full queue already carries traffic, so a skipped beat is harmless
                    let _ = outbound.try_send(HEARTBEAT.to_string());
                }
                _ = flush.tick() => {
                    let _ = sup.registry.flush_pending();
                }
            }
        }
    }

    /// Handle one inbound text message. `Err` ends the session.
    fn handle_text(&self, text: &str) -> std::result::Result<(), CourierError> {
        let sup = &self.supervisor;
        if text.len() > sup.config.max_frame_size {
            sup.stats.frame_dropped();
            warn!(len = text.len(), "dropping oversized frame");
            return Ok(());
        }
        let frame = match Frame::parse(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(error) => {
                sup.stats.frame_dropped();
                warn!(error = %error, "dropping malformed frame");
                return Ok(());
            }
        };
        match frame.command {
            Command::Message => {
                // decode failures are logged and counted by the dispatcher
                let _ = sup.dispatcher.dispatch_frame(&frame);
            }
            Command::Error => {
                return Err(CourierError::Transport(format!(
                    "broker error: {}",
                    protocol::error_reason(&frame)
                )));
            }
            Command::Receipt => {
                debug!(receipt = frame.get("receipt-id").unwrap_or_default(), "receipt");
            }
            other => debug!(command = %other, "ignoring unexpected frame"),
        }
        Ok(())
    }
}

/// Read until `CONNECTED`. `ERROR` means the broker refused us.
async fn await_connected(
    inbound: &mut mpsc::Receiver<LinkEvent>,
) -> std::result::Result<Frame, CourierError> {
    loop {
        match inbound.recv().await {
            Some(LinkEvent::Text(text)) => match Frame::parse(&text)? {
                None => {}
                Some(frame) if frame.command == Command::Connected => return Ok(frame),
                Some(frame) if frame.command == Command::Error => {
                    return Err(CourierError::Rejected(protocol::error_reason(&frame)));
                }
                Some(frame) => {
                    return Err(CourierError::Handshake(format!(
                        "expected CONNECTED, got {}",
                        frame.command
                    )));
                }
            },
            Some(LinkEvent::Pong) => {}
            Some(LinkEvent::Closed(reason)) => {
                return Err(CourierError::Transport(format!(
                    "closed during handshake: {}",
                    reason.as_deref().unwrap_or("no reason given")
                )));
            }
            Some(LinkEvent::Error(reason)) => return Err(CourierError::Transport(reason)),
            None => return Err(CourierError::Transport("link dropped during handshake".into())),
        }
    }
}

/// Tick `interval` if there is one, otherwise never complete.
async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            let _ = interval.tick().await;
        }
        None => pending::<()>().await,
    }
}
