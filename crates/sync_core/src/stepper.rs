use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    error::SyncClientError,
    transport::{PublicationHandler, SyncTransport, SYNC_CHANNEL},
    Session,
};

/// Caller-paced alternative to the notification-driven controller: each
/// [`step`](Stepper::step) publishes the next tick and blocks until the
/// server's matching publication arrives. Suited to embedders that want a
/// synchronous advance-and-observe loop around the simulation.
pub struct Stepper {
    transport: Arc<dyn SyncTransport>,
    session: Session,
    shared: Arc<StepperShared>,
}

struct StepperShared {
    last_tick: Mutex<i64>,
    /// Single-use signal for the step currently waiting on a publication.
    pending: Mutex<Option<oneshot::Sender<i64>>>,
}

impl StepperShared {
    fn take_waiter(&self) -> Option<oneshot::Sender<i64>> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn install_waiter(&self, tx: oneshot::Sender<i64>) {
        // Replacing drops any stale sender; its awaiter observes an error.
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    fn record_tick(&self, tick: i64) {
        *self.last_tick.lock().unwrap_or_else(PoisonError::into_inner) = tick;
    }
}

impl Stepper {
    pub fn new(transport: Arc<dyn SyncTransport>) -> Self {
        Self {
            session: Session::new(Arc::clone(&transport)),
            shared: Arc::new(StepperShared {
                last_tick: Mutex::new(0),
                pending: Mutex::new(None),
            }),
            transport,
        }
    }

    /// Subscribes, connects, and returns the first tick published after the
    /// connection is up. Every inbound tick is recorded even when no step is
    /// waiting.
    pub async fn connect(&self) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.shared.install_waiter(tx);
        let shared = Arc::clone(&self.shared);
        let handler: PublicationHandler = Arc::new(move |tick| {
            if let Some(waiter) = shared.take_waiter() {
                let _ = waiter.send(tick);
            }
            shared.record_tick(tick);
        });
        self.transport.bind_handler(SYNC_CHANNEL, handler);
        self.transport
            .subscribe(SYNC_CHANNEL)
            .await
            .map_err(|err| SyncClientError::Connection(err.to_string()))?;
        self.transport
            .connect()
            .await
            .map_err(|err| SyncClientError::Connection(err.to_string()))?;
        rx.await
            .map_err(|_| SyncClientError::HandshakeInterrupted.into())
    }

    /// Publishes `last observed tick + 1` and waits for the next inbound
    /// publication, returning its tick. Only the newest waiter is ever
    /// resolved: a step still pending from an earlier call fails with
    /// [`SyncClientError::StepSuperseded`].
    pub async fn step(&self) -> Result<i64> {
        let (tx, rx) = oneshot::channel();
        self.shared.install_waiter(tx);
        let next = self.last_tick() + 1;
        debug!("sync: requesting step to tick {next}");
        self.transport.publish(SYNC_CHANNEL, next).await?;
        rx.await
            .map_err(|_| SyncClientError::StepSuperseded.into())
    }

    /// Passthrough to the session gateway.
    pub async fn rpc(&self, method: &str, args: Option<Value>) -> Result<Value> {
        self.session.rpc(method, args).await
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn last_tick(&self) -> i64 {
        *self
            .shared
            .last_tick
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/stepper_tests.rs"]
mod tests;
