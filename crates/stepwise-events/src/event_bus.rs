//! Process-local notifications.
//!
//! Components that poll on a timer can subscribe to a channel to be woken
//! early. Notifications carry no payload and coalesce when a subscriber
//! falls behind.

use dashmap::DashMap;
use tokio::sync::broadcast;

/// Channel signalled after the scanner creates check builds
pub const NEW_CHECKS: &str = "new_checks";

const CHANNEL_CAPACITY: usize = 16;

/// Named wake-up channels
#[derive(Debug, Default)]
pub struct NotificationBus {
    channels: DashMap<String, broadcast::Sender<()>>,
}

impl NotificationBus {
    /// Creates a bus with no channels
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes every subscriber of `channel`, returning how many were listening
    pub fn notify(&self, channel: &str) -> usize {
        let delivered = self
            .channels
            .get(channel)
            .and_then(|sender| sender.send(()).ok())
            .unwrap_or(0);
        tracing::debug!(channel, delivered, "notification sent");
        delivered
    }

    /// Subscribes to `channel`
    pub fn subscribe(&self, channel: &str) -> Notifications {
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Notifications { receiver }
    }
}

/// A subscription to one channel
#[derive(Debug)]
pub struct Notifications {
    receiver: broadcast::Receiver<()>,
}

impl Notifications {
    /// Waits for the next notification; `false` once the bus is gone
    pub async fn recv(&mut self) -> bool {
        match self.receiver.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_to_subscribers_of_the_channel() {
        let bus = NotificationBus::new();
        let mut checks = bus.subscribe(NEW_CHECKS);
        let mut other = bus.subscribe("other");

        assert_eq!(bus.notify(NEW_CHECKS), 1);
        assert!(checks.recv().await);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), other.recv())
                .await
                .is_err()
        );
    }

    #[test]
    fn notify_without_subscribers_is_a_no_op() {
        let bus = NotificationBus::new();
        assert_eq!(bus.notify(NEW_CHECKS), 0);
    }
}
