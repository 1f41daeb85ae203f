//! Notification fan-out

use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use vessel_core::{ContainerStatus, EventObserver, TracingObserver};

/// One supervisor notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Container name
    pub container: String,
    /// Human-readable message
    pub message: String,
    /// Status carried by the notification, if any
    pub status: Option<ContainerStatus>,
}

/// Observer that forwards notifications into a channel
///
/// Lets a presentation layer consume events as a stream. Notifications are
/// dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelObserver {
    /// Observer plus the receiving end of its channel
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventObserver for ChannelObserver {
    fn on_event(&self, container: &str, message: &str, status: Option<ContainerStatus>) {
        let _ = self.tx.send(Notification {
            container: container.to_string(),
            message: message.to_string(),
            status,
        });
    }
}

/// Shared, growable set of observers
///
/// Clones share the same list, so an observer registered on the runtime
/// reaches every container.
#[derive(Clone, Default)]
pub struct Observers {
    list: Arc<RwLock<Vec<Arc<dyn EventObserver>>>>,
}

impl Observers {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding a [`TracingObserver`]
    #[must_use]
    pub fn with_tracing() -> Self {
        let observers = Self::new();
        observers.register(Arc::new(TracingObserver));
        observers
    }

    /// Add an observer
    pub fn register(&self, observer: Arc<dyn EventObserver>) {
        self.list
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Deliver a notification to every observer
    pub fn emit(&self, container: &str, message: &str, status: Option<ContainerStatus>) {
        let list = self.list.read().unwrap_or_else(PoisonError::into_inner);
        for observer in list.iter() {
            observer.on_event(container, message, status);
        }
    }

    /// Number of registered observers
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no observer is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").field("count", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fans_out_to_shared_list() {
        let observers = Observers::with_tracing();
        let clone = observers.clone();
        let (channel, mut rx) = ChannelObserver::new();
        clone.register(Arc::new(channel));

        assert_eq!(observers.len(), 2);
        observers.emit("web", "Container paused.", Some(ContainerStatus::Paused));

        let note = rx.try_recv().unwrap();
        assert_eq!(note.container, "web");
        assert_eq!(note.message, "Container paused.");
        assert_eq!(note.status, Some(ContainerStatus::Paused));
    }
}
