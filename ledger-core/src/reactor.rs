//! Referral reward reactor
//!
//! A single tokio task consumes "purchase record created" events and runs
//! the referral-reward reaction for each one. Failures are logged and
//! swallowed; they never reach the buyer whose purchase triggered them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │        LedgerEngine::purchase (store transaction)     │
//! │   writes Purchase row + outbox event in one commit    │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ ReactorHandle::notify (try_send)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              RewardReactor (Single Task)              │
//! │  mailbox event  → process_purchase_event()            │
//! │  sweep timer    → replay every outbox event           │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//!     reward transaction deletes the outbox event it used
//! ```
//!
//! Because the event is consumed inside the reward transaction, an event
//! delivered both by the mailbox and by a sweep is applied once.

use crate::{
    engine::LedgerEngine,
    error::{Error, Result},
    types::PurchaseEvent,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Message sent to the reactor
#[derive(Debug)]
pub enum ReactorMessage {
    /// A purchase row was committed
    PurchaseRecorded(PurchaseEvent),

    /// Replay the whole outbox now; responds with the events processed
    Sweep {
        /// Completion channel
        response: oneshot::Sender<Result<usize>>,
    },

    /// Shutdown reactor
    Shutdown,
}

/// Actor that applies referral rewards
pub struct RewardReactor {
    engine: Arc<LedgerEngine>,
    mailbox: mpsc::Receiver<ReactorMessage>,
    sweep_interval: Duration,
}

impl std::fmt::Debug for RewardReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewardReactor")
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

impl RewardReactor {
    /// Create new reactor
    pub fn new(
        engine: Arc<LedgerEngine>,
        mailbox: mpsc::Receiver<ReactorMessage>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            engine,
            mailbox,
            sweep_interval,
        }
    }

    /// Run the reactor event loop
    pub async fn run(mut self) {
        // First tick fires immediately and replays what a previous process left
        let mut sweep_timer = interval(self.sweep_interval);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => {
                    match msg {
                        Some(ReactorMessage::PurchaseRecorded(event)) => {
                            self.handle_event(event).await;
                        }
                        Some(ReactorMessage::Sweep { response }) => {
                            let _ = response.send(self.sweep().await);
                        }
                        // Mailbox closed: every handle is gone
                        Some(ReactorMessage::Shutdown) | None => break,
                    }
                }

                _ = sweep_timer.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Outbox sweep failed");
                    }
                }
            }
        }

        tracing::info!("Reward reactor stopped");
    }

    async fn handle_event(&self, event: PurchaseEvent) {
        let engine = self.engine.clone();
        let buyer = event.buyer_id.clone();
        let result =
            tokio::task::spawn_blocking(move || engine.process_purchase_event(&event)).await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::error!(buyer = %buyer, error = %e, "Failed to credit referral reward");
            }
            Err(e) => {
                tracing::error!(buyer = %buyer, error = %e, "Referral reward task panicked");
            }
        }
    }

    async fn sweep(&self) -> Result<usize> {
        let engine = self.engine.clone();
        let pending = tokio::task::spawn_blocking(move || engine.storage().pending_events())
            .await
            .map_err(|e| Error::Concurrency(format!("Outbox scan task failed: {}", e)))??;

        let count = pending.len();
        self.engine.metrics().set_pending_events(count as i64);
        if count > 0 {
            tracing::debug!(count, "Replaying outbox events");
        }
        for event in pending {
            self.handle_event(event).await;
        }
        Ok(count)
    }
}

/// Handle for sending messages to the reactor
#[derive(Clone, Debug)]
pub struct ReactorHandle {
    sender: mpsc::Sender<ReactorMessage>,
}

impl ReactorHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<ReactorMessage>) -> Self {
        Self { sender }
    }

    /// Announce a committed purchase without waiting
    ///
    /// A full or closed mailbox is not an error: the event stays in the
    /// outbox and the next sweep picks it up.
    pub fn notify(&self, event: PurchaseEvent) {
        if let Err(e) = self.sender.try_send(ReactorMessage::PurchaseRecorded(event)) {
            tracing::warn!(error = %e, "Reward reactor mailbox unavailable, deferring to sweep");
        }
    }

    /// Process every outbox event, waiting for completion
    pub async fn sweep(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReactorMessage::Sweep { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Reactor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Shutdown reactor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ReactorMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Reactor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the reward reactor
pub fn spawn_reward_reactor(
    engine: Arc<LedgerEngine>,
    mailbox_capacity: usize,
    sweep_interval: Duration,
) -> (ReactorHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
    let reactor = RewardReactor::new(engine, rx, sweep_interval);

    let join = tokio::spawn(async move {
        reactor.run().await;
    });

    (ReactorHandle::new(tx), join)
}
