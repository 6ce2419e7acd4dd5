//! Connection registry and broadcast fanout.
//!
//! Tracks live sessions and, per spreadsheet, which sessions are joined.
//! Each session has one bounded outbound queue; committed mutations are
//! fanned into the queues of every joined session in the order the
//! coordinator produced them.
//!
//! Overflow policy: when a session's queue is full the session is evicted —
//! all its senders are dropped, so its connection thread observes a closed
//! channel, tears the connection down, and the client must rejoin and
//! re-fetch state through the read path. A slow consumer can never block the
//! coordinator or delay delivery to other sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::coordinator::CommittedMutation;

/// Thread-safe registry shared by the gateway and all coordinators.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    queue_depth: usize,
    next_id: Arc<AtomicU64>,
    /// Sessions evicted because their queue overflowed.
    overflow_disconnects: Arc<AtomicU64>,
}

struct RegistryInner {
    /// Master sender per connection, cloned into subscriptions.
    connections: HashMap<u64, SyncSender<CommittedMutation>>,
    /// Joined sessions per spreadsheet.
    subscribers: HashMap<Uuid, Vec<(u64, SyncSender<CommittedMutation>)>>,
}

impl ConnectionRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                connections: HashMap::new(),
                subscribers: HashMap::new(),
            })),
            queue_depth,
            next_id: Arc::new(AtomicU64::new(1)),
            overflow_disconnects: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a new connection. Returns its id and the receiving end of its
    /// bounded event queue.
    pub fn register(&self) -> (u64, Receiver<CommittedMutation>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::sync_channel(self.queue_depth);
        self.inner
            .lock()
            .unwrap()
            .connections
            .insert(id, tx);
        (id, rx)
    }

    /// Subscribe a connection to a spreadsheet's commit broadcasts.
    /// Returns false if the connection is unknown (already evicted).
    pub fn subscribe(&self, conn_id: u64, spreadsheet_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(tx) = inner.connections.get(&conn_id).cloned() else {
            return false;
        };
        let subs = inner.subscribers.entry(spreadsheet_id).or_default();
        if !subs.iter().any(|(id, _)| *id == conn_id) {
            subs.push((conn_id, tx));
        }
        true
    }

    /// Unsubscribe a connection from one spreadsheet.
    pub fn unsubscribe(&self, conn_id: u64, spreadsheet_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subs) = inner.subscribers.get_mut(&spreadsheet_id) {
            subs.retain(|(id, _)| *id != conn_id);
            if subs.is_empty() {
                inner.subscribers.remove(&spreadsheet_id);
            }
        }
    }

    /// Remove a connection entirely: its master sender and every
    /// subscription. Called on disconnect (graceful or abrupt).
    pub fn disconnect(&self, conn_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.remove(&conn_id);
        inner.subscribers.retain(|_, subs| {
            subs.retain(|(id, _)| *id != conn_id);
            !subs.is_empty()
        });
    }

    /// Deliver a committed mutation to every session joined to its
    /// spreadsheet.
    ///
    /// Called only from the owning spreadsheet's coordinator thread, so
    /// delivery order into each queue equals commit order. Sessions whose
    /// queue is full (or already closed) are evicted on the spot.
    pub fn broadcast(&self, event: &CommittedMutation) {
        let mut inner = self.inner.lock().unwrap();
        let mut evicted: Vec<u64> = Vec::new();

        if let Some(subs) = inner.subscribers.get(&event.spreadsheet_id) {
            for (conn_id, tx) in subs {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::warn!(
                            "Evicting connection {}: event queue overflow on spreadsheet {}",
                            conn_id,
                            event.spreadsheet_id
                        );
                        self.overflow_disconnects.fetch_add(1, Ordering::Relaxed);
                        evicted.push(*conn_id);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        evicted.push(*conn_id);
                    }
                }
            }
        }

        for conn_id in evicted {
            inner.connections.remove(&conn_id);
            inner.subscribers.retain(|_, subs| {
                subs.retain(|(id, _)| *id != conn_id);
                !subs.is_empty()
            });
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    pub fn subscriber_count(&self, spreadsheet_id: Uuid) -> usize {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .get(&spreadsheet_id)
            .map_or(0, |subs| subs.len())
    }

    pub fn overflow_disconnects(&self) -> u64 {
        self.overflow_disconnects.load(Ordering::Relaxed)
    }
}
