use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Latest-wins distribution to any number of consumers.
///
/// Publishing never blocks. A consumer that falls behind by more than the
/// channel capacity skips the frames it missed.
pub struct Fanout<T> {
    tx: broadcast::Sender<T>,
}

pub type FanoutStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

impl<T: Clone + Send + 'static> Fanout<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of consumers the unit was handed to.
    pub fn publish(&self, unit: T) -> usize {
        self.tx.send(unit).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn stream(&self) -> FanoutStream<T> {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|r| async move {
            match r {
                Ok(unit) => Some(unit),
                Err(e) => {
                    log::debug!("fanout consumer {}", e);
                    None
                }
            }
        });
        Box::pin(stream)
    }

    pub fn consumer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T> Clone for Fanout<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_consumers() {
        let fanout = Fanout::<u32>::new(2);
        assert_eq!(fanout.consumer_count(), 0);
        assert_eq!(fanout.publish(1), 0);
    }

    #[tokio::test]
    async fn test_every_consumer_receives() -> anyhow::Result<()> {
        let fanout = Fanout::new(4);
        let mut a = fanout.subscribe();
        let mut b = fanout.stream();
        assert_eq!(fanout.consumer_count(), 2);

        assert_eq!(fanout.publish("frame"), 2);
        assert_eq!(a.recv().await?, "frame");
        assert_eq!(b.next().await, Some("frame"));

        drop(a);
        drop(b);
        assert_eq!(fanout.consumer_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_consumer_skips_without_blocking() -> anyhow::Result<()> {
        let fanout = Fanout::new(2);
        let mut slow = fanout.stream();
        let mut fast = fanout.subscribe();

        for i in 0..10u32 {
            fanout.publish(i);
            assert_eq!(fast.recv().await?, i);
        }

        // Only the newest units are still queued for the slow consumer
        assert_eq!(slow.next().await, Some(8));
        assert_eq!(slow.next().await, Some(9));
        Ok(())
    }
}
