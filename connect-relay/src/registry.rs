use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::Message;

pub type ConnectionId = Uuid;

pub type Tx = mpsc::Sender<Message>;

struct Client {
    tx: Tx,
    /// Registration order; broadcasts walk clients in this order.
    seq: u64,
}

/// The set of sockets currently attached to one relay instance.
///
/// Each TCP connection gets its own entry, even if the same device
/// connects twice.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: DashMap<ConnectionId, Client>,
    next_seq: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tx: Tx) -> ConnectionId {
        let id = Uuid::new_v4();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(id, Client { tx, seq });
        debug!("registered connection {}", id);
        id
    }

    pub fn remove(&self, id: &ConnectionId) -> bool {
        debug!("unregistering connection {}", id);
        self.clients.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Queues `msg` for every connection except `except`, returning how
    /// many accepted it.
    pub fn broadcast(&self, msg: &Message, except: Option<ConnectionId>) -> usize {
        let mut targets: Vec<(u64, ConnectionId, Tx)> = self
            .clients
            .iter()
            .filter(|entry| Some(*entry.key()) != except)
            .map(|entry| (entry.value().seq, *entry.key(), entry.value().tx.clone()))
            .collect();
        targets.sort_by_key(|(seq, _, _)| *seq);

        let mut delivered = 0;
        for (_, id, tx) in targets {
            // Use try_send to avoid blocking; if channel is full, drop message (backpressure)
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("dropping broadcast for {}: channel full (backpressure)", id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("skipping broadcast for {}: connection closing", id);
                }
            }
        }
        delivered
    }
}
