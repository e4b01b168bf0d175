use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// In-process registry of submissions that have an attempt running.
///
/// The first caller for an id becomes the leader and holds an
/// [`InflightGuard`]; later callers get a receiver that fires when the
/// leader's guard is dropped.
#[derive(Clone, Default)]
pub(crate) struct InflightRegistry {
    entries: Arc<Mutex<HashMap<String, watch::Receiver<bool>>>>,
}

pub(crate) enum Entry {
    Leader(InflightGuard),
    Follower(watch::Receiver<bool>),
}

pub(crate) struct InflightGuard {
    id: String,
    entries: Arc<Mutex<HashMap<String, watch::Receiver<bool>>>>,
    done: watch::Sender<bool>,
}

impl InflightRegistry {
    pub(crate) fn enter(&self, id: &str) -> Entry {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(receiver) = entries.get(id) {
            return Entry::Follower(receiver.clone());
        }

        let (done, receiver) = watch::channel(false);
        entries.insert(id.to_string(), receiver);
        Entry::Leader(InflightGuard { id: id.to_string(), entries: self.entries.clone(), done })
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).contains_key(id)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
        let _ = self.done.send(true);
    }
}

/// Resolves once the leader behind `receiver` has finished.
pub(crate) async fn wait_for_leader(mut receiver: watch::Receiver<bool>) {
    let _ = receiver.wait_for(|done| *done).await;
}
