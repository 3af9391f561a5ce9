use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{OccupancyChanged, ResourceKey};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for occupancy changes, one channel per resource key.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<ResourceKey, broadcast::Sender<OccupancyChanged>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to changes on `key`. Creates the channel if needed.
    pub fn subscribe(&self, key: ResourceKey) -> broadcast::Receiver<OccupancyChanged> {
        self.channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send to current subscribers. Drops the channel once nobody listens.
    pub fn publish(&self, change: OccupancyChanged) {
        let key = change.key;
        let delivered = match self.channels.get(&key) {
            Some(sender) => sender.send(change).is_ok(),
            None => return,
        };
        if !delivered {
            self.channels
                .remove_if(&key, |_, sender| sender.receiver_count() == 0);
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, key: &ResourceKey) -> usize {
        self.channels
            .get(key)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::Weekday;
    use ulid::Ulid;

    fn change(key: ResourceKey) -> OccupancyChanged {
        OccupancyChanged {
            key,
            cause: ChangeCause::Booked(Ulid::new()),
            occupied: Vec::new(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let key = ResourceKey::new(1, 2, Day::Weekday(Weekday::Thu));
        let mut rx = hub.subscribe(key);

        let sent = change(key);
        hub.publish(sent.clone());
        assert_eq!(rx.recv().await.unwrap(), sent);
    }

    #[tokio::test]
    async fn other_keys_are_not_delivered() {
        let hub = NotifyHub::new();
        let thu = ResourceKey::new(1, 2, Day::Weekday(Weekday::Thu));
        let fri = ResourceKey::new(1, 2, Day::Weekday(Weekday::Fri));
        let mut rx = hub.subscribe(thu);
        hub.publish(change(fri));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(change(ResourceKey::new(1, 1, Day::Weekday(Weekday::Mon))));
    }

    #[tokio::test]
    async fn channel_dropped_after_last_receiver() {
        let hub = NotifyHub::new();
        let key = ResourceKey::new(5, 5, Day::Weekday(Weekday::Sat));
        let rx = hub.subscribe(key);
        assert_eq!(hub.subscriber_count(&key), 1);
        drop(rx);
        hub.publish(change(key));
        assert_eq!(hub.subscriber_count(&key), 0);
        assert!(hub.channels.get(&key).is_none());
    }
}
