use std::collections::HashMap;
use tokio::sync::broadcast;

use pkg_types::meta::{Kind, ResourceKey};
use pkg_types::object::Object;

/// A single change notification. Every variant carries full deep-copy
/// snapshots, so a consumer never has to re-read the store to learn what
/// the event described.
#[derive(Debug, Clone)]
pub enum Event {
    Created(Object),
    Updated { old: Object, new: Object },
    Deleted(Object),
}

impl Event {
    /// The snapshot the event is about (the new one for updates).
    pub fn object(&self) -> &Object {
        match self {
            Event::Created(obj) | Event::Deleted(obj) => obj,
            Event::Updated { new, .. } => new,
        }
    }

    pub fn key(&self) -> ResourceKey {
        self.object().key()
    }
}

/// Per-kind broadcast fan-out. One sender per kind is created up front so
/// every subscriber of a kind shares a channel and sees the same order.
pub struct EventHub {
    senders: HashMap<Kind, broadcast::Sender<Event>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let mut senders = HashMap::new();
        for kind in [Kind::Pod, Kind::ReplicaSet, Kind::Service] {
            let (tx, _) = broadcast::channel(capacity);
            senders.insert(kind, tx);
        }
        Self { senders }
    }

    /// Publish to the kind's subscribers. A send with no receivers is not
    /// an error.
    pub fn publish(&self, event: Event) {
        if let Some(tx) = self.senders.get(&event.object().kind()) {
            let _ = tx.send(event);
        }
    }

    pub fn subscribe(&self, kind: Kind) -> broadcast::Receiver<Event> {
        match self.senders.get(&kind) {
            Some(tx) => tx.subscribe(),
            // All kinds are registered in new(); an unknown kind would be
            // a construction bug, surfaced as a dead receiver.
            None => broadcast::channel(1).1,
        }
    }
}
