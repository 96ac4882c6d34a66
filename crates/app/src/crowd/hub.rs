//! Single-producer, many-consumer fan-out of encoded artifacts.
//!
//! The hub keeps only the newest artifact. Publishing replaces the slot and
//! never waits on consumers; a slow subscriber simply skips intermediate
//! artifacts. Each subscriber tracks the last sequence it returned so it can
//! never observe an older artifact than one it already delivered.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use tokio::sync::watch;
use tracing::debug;

use crate::crowd::data::Artifact;

#[derive(Clone, Debug)]
enum Slot {
    Empty,
    Ready(Arc<Artifact>),
    /// Keeps the final artifact so late wakers still receive it.
    Closed(Option<Arc<Artifact>>),
}

pub struct BroadcastHub {
    slot: watch::Sender<Slot>,
    next_sequence: AtomicU64,
    subscribers: Arc<AtomicUsize>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(Slot::Empty);
        Self {
            slot,
            next_sequence: AtomicU64::new(1),
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replace the latest artifact. Returns the assigned sequence, or `None`
    /// once the hub has been closed.
    pub(crate) fn publish(&self, mut artifact: Artifact) -> Option<u64> {
        let mut assigned = None;
        self.slot.send_if_modified(|slot| {
            if matches!(slot, Slot::Closed(_)) {
                return false;
            }
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            artifact.sequence = sequence;
            *slot = Slot::Ready(Arc::new(artifact));
            assigned = Some(sequence);
            true
        });
        assigned
    }

    /// Wake every subscriber with the closed signal. Subscribers that have
    /// not yet returned the final artifact get it before `None`. Later
    /// publishes are ignored.
    pub fn close(&self) {
        self.slot.send_if_modified(|slot| {
            let last = match slot {
                Slot::Ready(artifact) => Some(artifact.clone()),
                Slot::Empty => None,
                Slot::Closed(_) => return false,
            };
            *slot = Slot::Closed(last);
            true
        });
        debug!("broadcast hub closed");
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Closed(_))
    }

    /// Register a consumer. It receives the first artifact published after
    /// this call; the current slot content is not replayed.
    pub fn subscribe(&self) -> Subscriber {
        let mut rx = self.slot.subscribe();
        let last_sequence = match &*rx.borrow_and_update() {
            Slot::Ready(artifact) | Slot::Closed(Some(artifact)) => artifact.sequence,
            Slot::Empty | Slot::Closed(None) => 0,
        };
        let count = self.subscribers.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::gauge!("crowd_subscribers").set(count as f64);
        Subscriber {
            rx,
            last_sequence,
            subscribers: self.subscribers.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn latest(&self) -> Option<Arc<Artifact>> {
        match &*self.slot.borrow() {
            Slot::Ready(artifact) | Slot::Closed(Some(artifact)) => Some(artifact.clone()),
            Slot::Empty | Slot::Closed(None) => None,
        }
    }
}

/// Per-client cursor into the hub. Dropping it unregisters the client.
pub struct Subscriber {
    rx: watch::Receiver<Slot>,
    last_sequence: u64,
    subscribers: Arc<AtomicUsize>,
}

impl Subscriber {
    /// Wait for an artifact newer than the last one returned. `None` means
    /// the hub closed.
    pub(crate) async fn next(&mut self) -> Option<Arc<Artifact>> {
        loop {
            let slot = self.rx.borrow_and_update().clone();
            match slot {
                Slot::Ready(artifact) | Slot::Closed(Some(artifact))
                    if artifact.sequence > self.last_sequence =>
                {
                    self.last_sequence = artifact.sequence;
                    return Some(artifact);
                }
                Slot::Closed(_) => return None,
                Slot::Ready(_) | Slot::Empty => {}
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let remaining = self.subscribers.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        metrics::gauge!("crowd_subscribers").set(remaining as f64);
    }
}
