//! Subscriber hub — §2 shared utilities / §5 Concurrency.
//!
//! Each subscription owns a fixed-capacity outbound channel. A slow
//! subscriber never blocks the producer: `tokio::sync::broadcast` drops the
//! oldest unread messages for that lagging receiver and reports how many
//! were skipped, which `Subscription::recv` turns into a best-effort `Gap`
//! marker so callers can surface an `error` event. Cancellation closes the
//! outbound channel by dropping the `Subscription`.

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Hub<T: Clone + Send + 'static> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Default for Hub<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T: Clone + Send + 'static> Hub<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to all current subscribers. No-op (never blocks) if nobody
    /// is listening.
    pub fn publish(&self, event: T) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct Subscription<T: Clone + Send + 'static> {
    rx: broadcast::Receiver<T>,
}

#[derive(Debug)]
pub enum Delivered<T> {
    Event(T),
    /// The subscriber fell behind and `skipped` events were dropped.
    Gap { skipped: u64 },
    Closed,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    pub async fn recv(&mut self) -> Delivered<T> {
        match self.rx.recv().await {
            Ok(event) => Delivered::Event(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Delivered::Gap { skipped },
            Err(broadcast::error::RecvError::Closed) => Delivered::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_to_a_single_subscriber() {
        let hub: Hub<i32> = Hub::new(8);
        let mut sub = hub.subscribe();
        hub.publish(1);
        hub.publish(2);
        assert!(matches!(sub.recv().await, Delivered::Event(1)));
        assert!(matches!(sub.recv().await, Delivered::Event(2)));
    }

    #[tokio::test]
    async fn slow_subscriber_sees_a_gap_not_a_block() {
        let hub: Hub<i32> = Hub::new(2);
        let mut sub = hub.subscribe();
        for i in 0..10 {
            hub.publish(i);
        }
        match sub.recv().await {
            Delivered::Gap { skipped } => assert!(skipped > 0),
            other => panic!("expected a gap, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_subscription_is_cancellation() {
        let hub: Hub<i32> = Hub::new(4);
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
