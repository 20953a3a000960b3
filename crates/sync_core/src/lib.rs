//! Lockstep tick-synchronization client for a remote, tick-driven simulation
//! server.
//!
//! The server publishes integer tick timestamps (microseconds) on the
//! `"sync"` channel. A [`WorldController`] reacts to each tick, runs one
//! bounded unit of domain work through its [`WorldHooks`], advertises the
//! next expected tick back on the channel, and collapses any burst of
//! notifications that arrives mid-work into a single catch-up step. The
//! [`Stepper`] is the caller-paced alternative for embedders that want a
//! synchronous advance-and-observe loop.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    sync::{broadcast, oneshot},
    task::AbortHandle,
};
use tracing::{debug, error, warn};

pub mod error;
mod stepper;
pub mod transport;

pub use error::SyncClientError;
pub use stepper::Stepper;
pub use transport::{
    MissingSyncTransport, PublicationHandler, RpcReply, SyncTransport, SYNC_CHANNEL,
};

/// Coarse default lockstep cadence for stepper-style embedders, in
/// milliseconds. Same unit scale as the controller's constructor parameter;
/// both are converted to microseconds at point of use.
pub const TIMESTEP_MS: i64 = 300;

/// Default tick increment for [`WorldController::new`], in milliseconds.
pub const DEFAULT_DT_MS: i64 = 3_000;

/// "No tick received yet". Compares as less than any real tick.
const TICK_NONE: i64 = -1;

/// Observable lifecycle of a controller, for embedders that want to
/// supervise the detached work the core spawns.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    Connected,
    ConnectFailed(String),
    Started,
    StartFailed(String),
    TickAccepted { tick: i64, next_tick: i64 },
    TickDropped { tick: i64 },
    TickCompleted { tick: i64 },
    TickFailed { tick: i64, error: String },
    PublishFailed { next_tick: i64, error: String },
}

/// Thin gateway issuing named remote calls and unwrapping the reply
/// envelope. Remote failures propagate to the caller untouched.
pub struct Session {
    transport: Arc<dyn SyncTransport>,
}

impl Session {
    pub fn new(transport: Arc<dyn SyncTransport>) -> Self {
        Self { transport }
    }

    /// Issues `method` and returns the reply payload.
    pub async fn rpc(&self, method: &str, args: Option<Value>) -> Result<Value> {
        let reply = self.transport.call(method, args).await?;
        Ok(reply.data)
    }

    /// Advances the server simulation by one step.
    pub async fn step(&self) -> Result<()> {
        self.rpc("session.step", None).await?;
        Ok(())
    }

    /// Resets the server simulation state.
    pub async fn restart(&self) -> Result<()> {
        self.rpc("session.restart", None).await?;
        Ok(())
    }

    /// Returns the server's current simulation time in microseconds.
    pub async fn time_us(&self) -> Result<i64> {
        let state = self.rpc("session.state", None).await?;
        state
            .get("time_us")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                SyncClientError::MissingField {
                    method: "session.state",
                    field: "time_us",
                }
                .into()
            })
    }
}

/// Domain logic the embedding application supplies.
#[async_trait]
pub trait WorldHooks: Send + Sync {
    /// Invoked exactly once, after the startup connection attempt completes.
    async fn on_start(&self, _session: Arc<Session>) -> Result<()> {
        Ok(())
    }

    /// Invoked once per accepted tick. The synchronizer stays busy until this
    /// returns; its completion is what permits the next transition.
    async fn on_tick(&self, session: Arc<Session>, _tick: i64) -> Result<()> {
        session.step().await
    }
}

/// Default hook set: no-op startup, one `session.step` per tick.
pub struct DefaultHooks;

#[async_trait]
impl WorldHooks for DefaultHooks {}

struct TickState {
    /// Most recently received tick, or [`TICK_NONE`] before the first one.
    last_tick: i64,
    /// At most one outstanding unit of per-tick work. Never aborted; the
    /// handle only marks presence.
    user_task: Option<AbortHandle>,
    /// Tick most recently advertised as "what we expect to process next".
    next_tick: i64,
}

struct ControllerInner {
    transport: Arc<dyn SyncTransport>,
    session: Arc<Session>,
    hooks: Arc<dyn WorldHooks>,
    dt_us: i64,
    state: Mutex<TickState>,
    events: broadcast::Sender<ControllerEvent>,
}

/// The tick-synchronization state machine plus its startup sequencer.
///
/// Must be constructed inside a Tokio runtime: construction binds the
/// publication handler, then runs the subscribe and connect attempts as
/// detached tasks without blocking the caller.
pub struct WorldController {
    inner: Arc<ControllerInner>,
}

impl WorldController {
    pub fn new(transport: Arc<dyn SyncTransport>, hooks: Arc<dyn WorldHooks>) -> Self {
        Self::with_timestep_ms(transport, hooks, DEFAULT_DT_MS)
    }

    /// Builds the controller with a tick increment of `dt_ms` milliseconds
    /// and begins the startup sequence. The handler is live before either
    /// the subscribe or the connect attempt starts, so no publication
    /// delivered between the two can be missed. `on_start` is scheduled
    /// exactly once when the connect attempt completes, successfully or not.
    pub fn with_timestep_ms(
        transport: Arc<dyn SyncTransport>,
        hooks: Arc<dyn WorldHooks>,
        dt_ms: i64,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let session = Arc::new(Session::new(Arc::clone(&transport)));
        let inner = Arc::new(ControllerInner {
            transport: Arc::clone(&transport),
            session,
            hooks,
            // ms -> µs, the unit scale of server ticks
            dt_us: dt_ms * 1_000,
            state: Mutex::new(TickState {
                last_tick: TICK_NONE,
                user_task: None,
                next_tick: TICK_NONE,
            }),
            events,
        });

        let weak = Arc::downgrade(&inner);
        let handler: PublicationHandler = Arc::new(move |tick| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_publication(tick);
            }
        });
        transport.bind_handler(SYNC_CHANNEL, handler);

        let subscriber = Arc::clone(&transport);
        tokio::spawn(async move {
            if let Err(err) = subscriber.subscribe(SYNC_CHANNEL).await {
                warn!("sync: subscribe failed: {err:#}");
            }
        });

        let startup = Arc::clone(&inner);
        tokio::spawn(async move {
            match startup.transport.connect().await {
                Ok(()) => {
                    let _ = startup.events.send(ControllerEvent::Connected);
                }
                Err(err) => {
                    error!("sync: connect failed: {err:#}");
                    let _ = startup
                        .events
                        .send(ControllerEvent::ConnectFailed(err.to_string()));
                }
            }
            // The startup hook runs once the attempt completes, regardless of
            // its outcome. It is independent of the tick pipeline.
            match startup.hooks.on_start(Arc::clone(&startup.session)).await {
                Ok(()) => {
                    let _ = startup.events.send(ControllerEvent::Started);
                }
                Err(err) => {
                    warn!("sync: on_start failed: {err:#}");
                    let _ = startup
                        .events
                        .send(ControllerEvent::StartFailed(err.to_string()));
                }
            }
        });

        Self { inner }
    }

    /// Blocking handshake variant: rebinds the sync handler to a single-use
    /// signal, performs the subscribe and connect attempts, and returns the
    /// first tick that arrives post-connection. Rebinding takes the channel
    /// away from the notification-driven pipeline; intended for caller-paced
    /// embedders.
    pub async fn connect(&self) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(Mutex::new(Some(tx)));
        let weak = Arc::downgrade(&self.inner);
        let handler: PublicationHandler = Arc::new(move |tick| {
            if let Some(tx) = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                let _ = tx.send(tick);
            }
            if let Some(inner) = weak.upgrade() {
                inner.lock_state().last_tick = tick;
            }
        });
        self.inner.transport.bind_handler(SYNC_CHANNEL, handler);
        self.inner
            .transport
            .subscribe(SYNC_CHANNEL)
            .await
            .map_err(|err| SyncClientError::Connection(err.to_string()))?;
        self.inner
            .transport
            .connect()
            .await
            .map_err(|err| SyncClientError::Connection(err.to_string()))?;
        rx.await
            .map_err(|_| SyncClientError::HandshakeInterrupted.into())
    }

    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.inner.session)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.events.subscribe()
    }

    /// Last tick observed on the sync channel, or -1 before the first one.
    pub fn last_tick(&self) -> i64 {
        self.inner.lock_state().last_tick
    }

    /// Tick most recently advertised as "what we expect to process next",
    /// or -1 before the first accepted transition.
    pub fn expected_next_tick(&self) -> i64 {
        self.inner.lock_state().next_tick
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock_state().user_task.is_some()
    }
}

impl ControllerInner {
    fn lock_state(&self) -> MutexGuard<'_, TickState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entry point for every sync-channel publication, self-published or not.
    /// Recording and guard evaluation happen in one critical section so two
    /// deliveries cannot interleave mid-transition.
    fn handle_publication(self: &Arc<Self>, tick: i64) {
        debug!("sync: tick {tick}");
        let mut state = self.lock_state();
        state.last_tick = tick;
        self.process_tick_locked(&mut state, tick);
    }

    fn process_tick_locked(self: &Arc<Self>, state: &mut TickState, tick: i64) {
        // Busy guard. Deliberately bypassed while last_tick is still
        // non-positive: stale state from before the first recorded tick must
        // not read as busy.
        if state.user_task.is_some() && state.last_tick > 0 {
            let _ = self.events.send(ControllerEvent::TickDropped { tick });
            return;
        }

        let next_tick = tick + self.dt_us;
        state.next_tick = next_tick;

        // Advertise the next expected tick without gating the hook on the
        // publish round-trip.
        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = publisher.transport.publish(SYNC_CHANNEL, next_tick).await {
                warn!("sync: publish of next tick {next_tick} failed: {err:#}");
                let _ = publisher.events.send(ControllerEvent::PublishFailed {
                    next_tick,
                    error: err.to_string(),
                });
            }
        });

        let hooks = Arc::clone(&self.hooks);
        let session = Arc::clone(&self.session);
        let task = tokio::spawn(async move { hooks.on_tick(session, tick).await });
        state.user_task = Some(task.abort_handle());
        let _ = self
            .events
            .send(ControllerEvent::TickAccepted { tick, next_tick });

        // Completion fires on success, hook error, and panic alike, so a
        // single failing tick cannot wedge the machine in the busy state.
        let completer = Arc::clone(self);
        tokio::spawn(async move {
            match task.await {
                Ok(Ok(())) => {
                    let _ = completer.events.send(ControllerEvent::TickCompleted { tick });
                }
                Ok(Err(err)) => {
                    warn!("sync: on_tick failed for tick {tick}: {err:#}");
                    let _ = completer.events.send(ControllerEvent::TickFailed {
                        tick,
                        error: err.to_string(),
                    });
                }
                Err(err) => {
                    error!("sync: on_tick task for tick {tick} did not complete: {err}");
                    let _ = completer.events.send(ControllerEvent::TickFailed {
                        tick,
                        error: err.to_string(),
                    });
                }
            }
            completer.finish_tick(next_tick);
        });
    }

    fn finish_tick(self: &Arc<Self>, next_tick: i64) {
        let mut state = self.lock_state();
        state.user_task = None;
        // A newer tick that arrived while busy was dropped by the guard;
        // re-derive progress from the latest observed value instead of the
        // lost notification.
        if state.last_tick >= next_tick {
            self.process_tick_locked(&mut state, next_tick);
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
