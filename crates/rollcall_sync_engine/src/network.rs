//! Network reachability.

use std::sync::Arc;
use tokio::sync::watch;

/// Reports whether the remote is believed reachable.
pub trait NetworkMonitor: Send + Sync {
    /// Returns the current reachability.
    fn is_online(&self) -> bool;

    /// Returns a receiver that observes every reachability change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// A reachability flag set by the platform layer.
///
/// Cloning shares the same flag.
#[derive(Clone, Debug)]
pub struct NetworkState {
    sender: Arc<watch::Sender<bool>>,
}

impl NetworkState {
    /// Creates a flag with the given initial value.
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Records a reachability change. Setting the current value again
    /// does not notify subscribers.
    pub fn set_online(&self, online: bool) {
        self.sender.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor for NetworkState {
    fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}
