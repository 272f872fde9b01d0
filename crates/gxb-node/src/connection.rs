//! Witness connection state machine.
//!
//! Probe → rank → connect with fallback → connected. Any failure waits the
//! retry interval and starts over, without an attempt cap. Session status
//! reports drive the connected side: `reconnect` marks the mirror
//! provisional, `closed`/`error` reset the mirror and start over.
//!
//! The transition table is [`transition`], a pure function. The
//! [`ConnectionManager`] owns a driver task that feeds it events one at a
//! time and performs the resulting [`ConnectionAction`]s, so transitions are
//! serialized.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gxb_core::error::{ConnectionError, GxbError};
use gxb_core::types::{ConnectionState, Endpoint, SessionStatus};

use crate::config::ExplorerConfig;
use crate::mirror::ChainMirror;
use crate::probe::EndpointProbe;
use crate::session::{StatusSink, WitnessConnector, WitnessSession};

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection attempt was requested (by a caller or the retry timer).
    Start,
    /// Probing finished; reachable endpoints in ascending latency order.
    Probed(Vec<Endpoint>),
    /// A session was opened against this endpoint.
    Established(Endpoint),
    /// Every candidate refused or timed out.
    ConnectFailed,
    /// The current session reported a status change.
    Session(SessionStatus),
}

/// Effects the driver performs after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Probe every configured endpoint.
    ProbeEndpoints,
    /// Try these endpoints in order until one accepts.
    ConnectTo(Vec<Endpoint>),
    /// Wait the retry interval, then start over.
    ScheduleRetry,
    /// Publish the new session (the connected hook).
    NotifyConnected,
    /// Withdraw the session.
    NotifyDisconnected,
    /// Keep the mirror cache but flag it provisional.
    MarkProvisional,
    /// Drop the mirror cache, subscription, and flags.
    ResetMirror,
    /// Begin a fresh attempt immediately.
    Restart,
}

/// The connection state machine.
///
/// Events that do not apply to the current state leave it unchanged and
/// produce no actions. In particular `Start` outside `Disconnected` is a
/// no-op, which is what makes concurrent `connect()` calls idempotent.
pub fn transition(
    state: ConnectionState,
    event: &ConnectionEvent,
) -> (ConnectionState, Vec<ConnectionAction>) {
    use ConnectionAction as A;
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (state, event) {
        (S::Disconnected, E::Start) => (S::Probing, vec![A::ProbeEndpoints]),

        (S::Probing, E::Probed(ranked)) if ranked.is_empty() => {
            (S::Disconnected, vec![A::ScheduleRetry])
        }
        (S::Probing, E::Probed(ranked)) => (S::Connecting, vec![A::ConnectTo(ranked.clone())]),

        (S::Connecting, E::Established(_)) => (S::Connected, vec![A::NotifyConnected]),
        (S::Connecting, E::ConnectFailed) => (S::Disconnected, vec![A::ScheduleRetry]),

        (S::Connected | S::Reconnecting, E::Session(SessionStatus::Reconnect)) => {
            (S::Reconnecting, vec![A::MarkProvisional])
        }
        (S::Reconnecting, E::Session(SessionStatus::Open)) => (S::Connected, vec![]),
        (S::Connected | S::Reconnecting, E::Session(SessionStatus::Closed | SessionStatus::Error)) => (
            S::Disconnected,
            vec![A::ResetMirror, A::NotifyDisconnected, A::Restart],
        ),

        (state, _) => (state, vec![]),
    }
}

/// A state change, as published on [`ConnectionManager::transitions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Session lifecycle as seen by the service layer.
pub enum LinkEvent {
    /// A session was established; run the startup sequence against it.
    /// `generation` identifies the connection attempt that opened it.
    Up {
        generation: u64,
        session: Arc<dyn WitnessSession>,
    },
    /// The session was lost.
    Down,
}

/// Tunables for the connection loop.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoints: Vec<Endpoint>,
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry_interval: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &ExplorerConfig) -> Self {
        Self {
            endpoints: config.witnesses.clone(),
            probe_timeout: config.probe_timeout(),
            connect_timeout: config.request_timeout(),
            retry_interval: config.retry_interval(),
        }
    }
}

enum Command {
    Connect,
    Retry(u64),
    Shutdown,
}

/// State shared between the manager handle and its driver task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<StateChange>,
    session: RwLock<Option<Arc<dyn WitnessSession>>>,
    /// Generation of the live session; 0 when there is none.
    current: AtomicU64,
}

/// Owns the witness connection.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    status: mpsc::UnboundedSender<(u64, SessionStatus)>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Spawn the driver task. Nothing happens until [`connect`](Self::connect).
    ///
    /// Returns the manager and the stream of session lifecycle events.
    pub fn start(
        settings: ConnectionSettings,
        connector: Arc<dyn WitnessConnector>,
        mirror: Arc<ChainMirror>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            state,
            transitions,
            session: RwLock::new(None),
            current: AtomicU64::new(0),
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            probe: EndpointProbe::new(Arc::clone(&connector), settings.probe_timeout),
            settings,
            connector,
            mirror,
            shared: Arc::clone(&shared),
            retry_tx: cmd_tx.downgrade(),
            status_tx: status_tx.clone(),
            link_tx,
            pending: None,
            next_generation: 1,
            retry_epoch: 0,
        };
        let handle = tokio::spawn(driver.run(cmd_rx, status_rx));

        let manager = Arc::new(Self {
            shared,
            commands: cmd_tx,
            status: status_tx,
            driver: Mutex::new(Some(handle)),
        });
        (manager, link_rx)
    }

    /// Start connecting if idle. A no-op while an attempt is in flight or a
    /// session is up.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Report a status change of the current session.
    pub fn on_status_change(&self, status: SessionStatus) {
        let generation = self.shared.current.load(Ordering::SeqCst);
        let _ = self.status.send((generation, status));
    }

    /// Report that the session opened by `generation` is unusable. Ignored
    /// once that session has been superseded.
    pub fn report_failure(&self, generation: u64) {
        let _ = self.status.send((generation, SessionStatus::Error));
    }

    /// Whether `generation` is the live session.
    pub fn is_current(&self, generation: u64) -> bool {
        generation != 0 && self.shared.current.load(Ordering::SeqCst) == generation
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch the current state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Every state change, in order.
    pub fn transitions(&self) -> broadcast::Receiver<StateChange> {
        self.shared.transitions.subscribe()
    }

    /// The live session, if connected.
    pub fn session(&self) -> Option<Arc<dyn WitnessSession>> {
        self.shared.session.read().clone()
    }

    /// Endpoint of the live session.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.session().map(|s| s.endpoint().clone())
    }

    /// Wait until the state is `Connected`.
    pub async fn wait_connected(&self) -> Result<(), GxbError> {
        let mut rx = self.subscribe_state();
        rx.wait_for(|s| *s == ConnectionState::Connected)
            .await
            .map(|_| ())
            .map_err(|_| GxbError::ServiceUnavailable)
    }

    /// Stop the driver and drop the session.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        self.shared.session.write().take();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

struct Driver {
    settings: ConnectionSettings,
    connector: Arc<dyn WitnessConnector>,
    probe: EndpointProbe,
    mirror: Arc<ChainMirror>,
    shared: Arc<Shared>,
    retry_tx: mpsc::WeakUnboundedSender<Command>,
    status_tx: mpsc::UnboundedSender<(u64, SessionStatus)>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    /// Session opened by the last `ConnectTo`, awaiting `NotifyConnected`.
    pending: Option<Arc<dyn WitnessSession>>,
    next_generation: u64,
    retry_epoch: u64,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut status: mpsc::UnboundedReceiver<(u64, SessionStatus)>,
    ) {
        loop {
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(Command::Connect) => self.dispatch(ConnectionEvent::Start).await,
                    Some(Command::Retry(epoch)) if epoch == self.retry_epoch => {
                        self.dispatch(ConnectionEvent::Start).await
                    }
                    Some(Command::Retry(_)) => {}
                    Some(Command::Shutdown) | None => break,
                },
                Some((generation, report)) = status.recv() => {
                    let current = self.shared.current.load(Ordering::SeqCst);
                    if generation == 0 || generation != current {
                        debug!(generation, current, status = %report, "ignoring status from superseded session");
                        continue;
                    }
                    info!(status = %report, "session status");
                    self.dispatch(ConnectionEvent::Session(report)).await;
                }
            }
        }
        self.shared.current.store(0, Ordering::SeqCst);
        self.shared.session.write().take();
        debug!("connection driver stopped");
    }

    /// Feed one event through the state machine, then any follow-up events
    /// its actions produce.
    async fn dispatch(&mut self, event: ConnectionEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let from = *self.shared.state.borrow();
            let (to, actions) = transition(from, &event);
            if from != to {
                info!(from = %from, to = %to, "connection state");
                self.shared.state.send_replace(to);
                let _ = self.shared.transitions.send(StateChange { from, to });
            }
            for action in actions {
                if let Some(next) = self.perform(action).await {
                    queue.push_back(next);
                }
            }
        }
    }

    async fn perform(&mut self, action: ConnectionAction) -> Option<ConnectionEvent> {
        match action {
            ConnectionAction::ProbeEndpoints => {
                let ranked = self.probe.ranked(&self.settings.endpoints).await;
                if ranked.is_empty() {
                    warn!(error = %ConnectionError::NoReachableEndpoint, "probe round failed");
                }
                Some(ConnectionEvent::Probed(ranked))
            }
            ConnectionAction::ConnectTo(candidates) => Some(self.connect_with_fallback(candidates).await),
            ConnectionAction::ScheduleRetry => {
                self.retry_epoch += 1;
                let epoch = self.retry_epoch;
                let delay = self.settings.retry_interval;
                let retry_tx = self.retry_tx.clone();
                info!(retry_ms = delay.as_millis() as u64, "retrying connection");
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(tx) = retry_tx.upgrade() {
                        let _ = tx.send(Command::Retry(epoch));
                    }
                });
                None
            }
            ConnectionAction::NotifyConnected => {
                if let Some(session) = self.pending.take() {
                    let generation = self.shared.current.load(Ordering::SeqCst);
                    info!(endpoint = %session.endpoint(), generation, "connected to witness");
                    *self.shared.session.write() = Some(Arc::clone(&session));
                    let _ = self.link_tx.send(LinkEvent::Up { generation, session });
                }
                None
            }
            ConnectionAction::NotifyDisconnected => {
                self.shared.current.store(0, Ordering::SeqCst);
                if let Some(session) = self.shared.session.write().take() {
                    warn!(endpoint = %session.endpoint(), "witness session lost");
                }
                let _ = self.link_tx.send(LinkEvent::Down);
                None
            }
            ConnectionAction::MarkProvisional => {
                self.mirror.mark_provisional();
                None
            }
            ConnectionAction::ResetMirror => {
                self.mirror.reset_cache();
                None
            }
            ConnectionAction::Restart => Some(ConnectionEvent::Start),
        }
    }

    async fn connect_with_fallback(&mut self, candidates: Vec<Endpoint>) -> ConnectionEvent {
        let attempted = candidates.len();
        for endpoint in candidates {
            let generation = self.next_generation;
            self.next_generation += 1;
            let sink = StatusSink::new(generation, self.status_tx.clone());

            let attempt = tokio::time::timeout(
                self.settings.connect_timeout,
                self.connector.connect(&endpoint, sink),
            )
            .await;
            match attempt {
                Ok(Ok(session)) => {
                    self.shared.current.store(generation, Ordering::SeqCst);
                    self.pending = Some(session);
                    return ConnectionEvent::Established(endpoint);
                }
                Ok(Err(e)) => warn!(endpoint = %endpoint, error = %e, "connect failed"),
                Err(_) => warn!(endpoint = %endpoint, "connect timed out"),
            }
        }
        warn!(error = %ConnectionError::AllCandidatesFailed { attempted }, "connection round failed");
        ConnectionEvent::ConnectFailed
    }
}
