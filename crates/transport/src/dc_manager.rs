//! Data-channel readiness tracking (C5).
//!
//! `DataChannelManager` holds the current connection handle plus a
//! per-label ready flag. Senders must check readiness before writing;
//! an unready send is dropped by the caller, not by this type.

use std::collections::HashMap;
use std::sync::Mutex;

/// A cloneable handle to the Manager's current relay connection. Carries a
/// generation counter so callbacks from a connection that has since been
/// detached can recognise themselves as stale and no-op.
#[derive(Clone)]
pub struct ConnHandle<S> {
    pub generation: u64,
    pub sender: S,
}

pub struct DataChannelManager<S> {
    inner: Mutex<Inner<S>>,
}

struct Inner<S> {
    connection: Option<ConnHandle<S>>,
    ready: HashMap<String, bool>,
    next_generation: u64,
}

impl<S: Clone> DataChannelManager<S> {
    pub fn new(labels: &[&str]) -> Self {
        let mut ready = HashMap::new();
        for label in labels {
            ready.insert(label.to_string(), false);
        }
        Self {
            inner: Mutex::new(Inner {
                connection: None,
                ready,
                next_generation: 1,
            }),
        }
    }

    /// Bind a new connection, resetting all labels to not-ready. Returns
    /// the generation assigned to this connection, for stale-callback checks.
    pub fn attach(&self, sender: S) -> u64 {
        let mut guard = self.inner.lock().unwrap();
        let generation = guard.next_generation;
        guard.next_generation += 1;
        for ready in guard.ready.values_mut() {
            *ready = false;
        }
        guard.connection = Some(ConnHandle { generation, sender });
        generation
    }

    /// Clear the connection and all readiness flags.
    pub fn detach(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.connection = None;
        for ready in guard.ready.values_mut() {
            *ready = false;
        }
    }

    pub fn mark_ready(&self, label: &str) {
        let mut guard = self.inner.lock().unwrap();
        guard.ready.insert(label.to_string(), true);
    }

    pub fn is_ready(&self, label: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .ready
            .get(label)
            .copied()
            .unwrap_or(false)
    }

    pub fn get_connection(&self) -> Option<ConnHandle<S>> {
        self.inner.lock().unwrap().connection.clone()
    }

    /// True if `generation` matches the currently attached connection —
    /// used by transport callbacks to reject events from a torn-down session.
    pub fn is_current(&self, generation: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .connection
            .as_ref()
            .map(|c| c.generation == generation)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_resets_readiness() {
        let dcm: DataChannelManager<u32> = DataChannelManager::new(&["#ctrl", "#state"]);
        assert!(!dcm.is_ready("#ctrl"));
        dcm.attach(7);
        dcm.mark_ready("#ctrl");
        assert!(dcm.is_ready("#ctrl"));
        assert!(!dcm.is_ready("#state"));

        dcm.attach(8);
        assert!(!dcm.is_ready("#ctrl"), "readiness must reset on reattach");
    }

    #[test]
    fn test_detach_clears_connection() {
        let dcm: DataChannelManager<u32> = DataChannelManager::new(&["#ctrl"]);
        let gen = dcm.attach(1);
        assert!(dcm.is_current(gen));
        dcm.detach();
        assert!(dcm.get_connection().is_none());
        assert!(!dcm.is_current(gen));
    }

    #[test]
    fn test_generation_increments() {
        let dcm: DataChannelManager<u32> = DataChannelManager::new(&["#ctrl"]);
        let g1 = dcm.attach(1);
        let g2 = dcm.attach(2);
        assert_ne!(g1, g2);
    }
}
