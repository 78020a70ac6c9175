//! Publish/subscribe fan-out for console, stats and status events

use tokio::sync::broadcast;

use skyhost_core::DEFAULT_TRACKER_CAPACITY;

/// Broadcasts messages to any number of listeners. Slow listeners lose the
/// oldest messages instead of blocking the publisher.
#[derive(Debug, Clone)]
pub struct Tracker<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> Default for Tracker<T> {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKER_CAPACITY)
    }
}

impl<T: Clone> Tracker<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Publish to current listeners; nobody listening is not an error
    pub fn publish(&self, message: T) {
        let _ = self.sender.send(message);
    }

    pub fn listeners(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_listener_receives() {
        let tracker = Tracker::new(8);
        let mut a = tracker.subscribe();
        let mut b = tracker.subscribe();
        assert_eq!(tracker.listeners(), 2);

        tracker.publish(7u32);
        assert_eq!(a.recv().await.unwrap(), 7);
        assert_eq!(b.recv().await.unwrap(), 7);
    }

    #[test]
    fn test_publish_without_listeners() {
        let tracker: Tracker<String> = Tracker::default();
        tracker.publish("dropped".into());
        assert_eq!(tracker.listeners(), 0);
    }
}
