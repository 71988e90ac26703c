use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

/// Entity families a consumer may be displaying stale copies of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Entity {
    Authors,
    Books,
    Memberships,
    Notes,
    Follows,
    Profiles,
}

/// Broadcast channel for "this entity family changed" notifications.
///
/// Mutating operations publish after a successful write; subscribers drain
/// their receiver and refresh whatever views they keep. The bus carries no
/// row data, only the entity kind, so it stays decoupled from any cache.
pub struct InvalidationBus {
    subscribers: Mutex<Vec<Sender<Entity>>>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        InvalidationBus {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<Entity> {
        let (tx, rx) = channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Notify every live subscriber; subscribers whose receiver was dropped
    /// are pruned on the way through.
    pub fn publish(&self, entity: Entity) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(entity).is_ok());
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}
