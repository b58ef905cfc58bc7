//! One-shot shutdown signal for timeloop.
//!
//! Replay runs forever in normal operation. The only way it ends is a shutdown
//! signal observed at one of its suspend points. That signal travels from a
//! single `Broadcaster` to any number of `Watcher` instances. The signal is a
//! one-time event: once fired every existing `Watcher`, and every `Watcher`
//! cloned afterward, observes it immediately.
//!
//! Dropping a `Broadcaster` without calling `signal` counts as firing it. A
//! watcher that can never be woken again has nothing left to wait for.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use tokio::sync::watch;
use tracing::{debug, info};

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    (Watcher { receiver }, Broadcaster { sender })
}

#[derive(Debug)]
/// Fires the shutdown signal for every `Watcher` derived from the same pair.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Fire the signal. Does not wait for watchers to observe it.
    pub fn signal(self) {
        self.sender.send_replace(true);
        debug!("shutdown signal sent");
    }

    /// Fire the signal and wait until every `Watcher` has been dropped.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);
        let peers = self.sender.receiver_count();
        if peers > 0 {
            info!("Waiting for {peers} peers");
        }
        self.sender.closed().await;
    }

    /// The number of live `Watcher` instances.
    #[must_use]
    pub fn watchers(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone)]
/// Waits for the shutdown signal.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait for the shutdown signal. Returns immediately if it already fired.
    pub async fn recv(mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                // Broadcaster dropped without firing.
                return;
            }
        }
    }

    /// Check for the shutdown signal without blocking.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }
}
