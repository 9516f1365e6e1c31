use std::{
    fmt,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::{BandError, Result};

/// Number of transitions kept in the state history
const HISTORY_LIMIT: usize = 20;

/// Connection lifecycle states for a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link to the device
    Disconnected,
    /// Transport connect in flight
    Connecting,
    /// Link established, services not yet usable
    Connected,
    /// Authentication handshake in flight
    Authenticating,
    /// Handshake accepted
    Authenticated,
    /// Session fully operational
    Ready,
    /// Terminal failure, reconnect allowed
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Authenticating => "AUTHENTICATING",
            Self::Authenticated => "AUTHENTICATED",
            Self::Ready => "READY",
            Self::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

impl ConnectionState {
    /// Whether the lifecycle may move from `self` to `target`
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        // Disconnected and Error are reachable from anywhere; everything
        // else must follow the connect/auth ladder.
        match target {
            Self::Disconnected | Self::Error => true,
            Self::Connecting => matches!(self, Self::Disconnected | Self::Error),
            Self::Connected => self == Self::Connecting,
            Self::Authenticating => self == Self::Connected,
            Self::Authenticated => self == Self::Authenticating,
            Self::Ready => matches!(self, Self::Connected | Self::Authenticated),
        }
    }

    /// Whether the session is usable for commands in this state
    #[must_use]
    pub const fn is_operational(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// One recorded transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the transition
    pub from: ConnectionState,
    /// State after the transition
    pub to: ConnectionState,
    /// When the transition happened
    pub at: SystemTime,
}

type Observer = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct Inner {
    state: ConnectionState,
    history: Vec<Transition>,
    observers: Vec<Observer>,
}

/// Lifecycle state machine for one device session
///
/// Transitions are validated against the lifecycle graph; observers are
/// notified after each accepted transition. A panicking observer is isolated
/// and never poisons the machine or the other observers.
pub struct StateMachine {
    inner: Mutex<Inner>,
    address: String,
}

impl StateMachine {
    /// Create a machine in DISCONNECTED for the given device
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                history: Vec::new(),
                observers: Vec::new(),
            }),
            address: address.into(),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Address of the device this machine tracks
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Snapshot of the bounded transition history, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<Transition> {
        self.lock().history.clone()
    }

    /// Register an observer called after every accepted transition
    pub fn observe(&self, observer: impl Fn(ConnectionState) + Send + Sync + 'static) {
        self.lock().observers.push(Arc::new(observer));
    }

    /// Attempt a transition to `target`
    ///
    /// # Errors
    ///
    /// Returns [`BandError::InvalidTransition`] when the lifecycle graph
    /// forbids the move. Self-transitions are accepted and ignored.
    pub fn transition(&self, target: ConnectionState) -> Result<()> {
        let (from, observers) = {
            let mut inner = self.lock();
            let from = inner.state;

            if from == target {
                trace!(address = %self.address, state = %target, "ignoring self-transition");
                return Ok(());
            }
            if !from.can_transition_to(target) {
                return Err(BandError::InvalidTransition { from, to: target });
            }

            inner.state = target;
            inner.history.push(Transition {
                from,
                to: target,
                at: SystemTime::now(),
            });
            if inner.history.len() > HISTORY_LIMIT {
                let excess = inner.history.len() - HISTORY_LIMIT;
                inner.history.drain(..excess);
            }

            (from, inner.observers.clone())
        };

        debug!(address = %self.address, %from, to = %target, "connection state changed");

        // Observers run outside the lock so they may query the machine.
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(target))).is_err() {
                warn!(address = %self.address, "state observer panicked");
            }
        }

        Ok(())
    }

    /// Force the machine to DISCONNECTED, always valid
    pub fn force_disconnected(&self) {
        // Disconnected is reachable from every state, so this cannot fail.
        let _ = self.transition(ConnectionState::Disconnected);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Background reconnect and liveness supervision for one session
///
/// Two independent timers run until [`ConnectionSupervisor::shutdown`], and
/// each polls the transport link on its own: a reconnect poll that spends one
/// attempt from a bounded budget whenever the link is down (the budget refills
/// on success or while the link is healthy), and a liveness probe that forces
/// the state machine to DISCONNECTED when the link is gone. Either timer can
/// be the first to notice a dead link.
pub struct ConnectionSupervisor {
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionSupervisor {
    /// Spawn supervision tasks for `machine`
    ///
    /// `is_connected` probes the transport link; `reconnect` performs one
    /// full reconnect attempt and reports its outcome.
    pub fn spawn<C, CF, R, RF>(
        machine: Arc<StateMachine>,
        reconnect_interval: Duration,
        liveness_interval: Duration,
        max_attempts: u32,
        is_connected: C,
        reconnect: R,
    ) -> Self
    where
        C: Fn() -> CF + Send + Sync + 'static,
        CF: Future<Output = bool> + Send + 'static,
        R: Fn() -> RF + Send + Sync + 'static,
        RF: Future<Output = Result<()>> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let is_connected = Arc::new(is_connected);

        {
            let machine = Arc::clone(&machine);
            let is_connected = Arc::clone(&is_connected);
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reconnect_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;

                let mut remaining = max_attempts;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = interval.tick() => {}
                    }

                    if is_connected().await {
                        remaining = max_attempts;
                        continue;
                    }
                    let state = machine.state();
                    if !matches!(state, ConnectionState::Disconnected | ConnectionState::Error) {
                        warn!(address = %machine.address(), "link lost, marking disconnected");
                        machine.force_disconnected();
                    }
                    if remaining == 0 {
                        continue;
                    }

                    remaining -= 1;
                    debug!(
                        address = %machine.address(),
                        attempts_left = remaining,
                        "attempting reconnect"
                    );
                    match reconnect().await {
                        Ok(()) => {
                            remaining = max_attempts;
                        }
                        Err(e) => {
                            warn!(address = %machine.address(), error = %e, "reconnect failed");
                        }
                    }
                }
            });
        }

        {
            let machine = Arc::clone(&machine);
            let mut shutdown = shutdown_rx;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(liveness_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = interval.tick() => {}
                    }

                    let state = machine.state();
                    if matches!(state, ConnectionState::Disconnected | ConnectionState::Error) {
                        continue;
                    }
                    if !is_connected().await {
                        warn!(address = %machine.address(), "liveness check failed, marking disconnected");
                        machine.force_disconnected();
                    }
                }
            });
        }

        Self { shutdown_tx }
    }

    /// Stop both supervision timers
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
