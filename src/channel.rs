//! Bounded stage-to-stage channels
//!
//! Every link in the pipeline is a single-producer/single-consumer FIFO
//! with a fixed capacity. Sends block while the channel is full and
//! receives block while it is empty. A peer that exits early closes the
//! channel, which surfaces as [`GemmError::ChannelClosed`] instead of a hang.

use crate::error::{GemmError, GemmResult};

/// Sending half of a named bounded channel
pub struct Sink<T> {
    name: &'static str,
    inner: async_channel::Sender<T>,
}

/// Receiving half of a named bounded channel
pub struct Source<T> {
    name: &'static str,
    inner: async_channel::Receiver<T>,
}

/// Create a bounded channel holding at most `capacity` items
pub fn channel<T>(name: &'static str, capacity: usize) -> (Sink<T>, Source<T>) {
    let (sender, receiver) = async_channel::bounded(capacity.max(1));
    (
        Sink {
            name,
            inner: sender,
        },
        Source {
            name,
            inner: receiver,
        },
    )
}

impl<T> Sink<T> {
    pub fn send(&self, item: T) -> GemmResult<()> {
        self.inner
            .send_blocking(item)
            .map_err(|_| GemmError::closed(self.name))
    }
}

impl<T> Source<T> {
    pub fn recv(&self) -> GemmResult<T> {
        self.inner
            .recv_blocking()
            .map_err(|_| GemmError::closed(self.name))
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Items a stage will push into, or pull from, one channel during a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTraffic {
    pub stage: &'static str,
    pub items: usize,
}

impl StageTraffic {
    pub fn new(stage: &'static str, items: usize) -> Self {
        Self { stage, items }
    }
}

/// Check that a producer and a consumer agree on a channel's item count
pub fn link(channel: &'static str, producer: StageTraffic, consumer: StageTraffic) -> GemmResult<()> {
    if producer.items != consumer.items {
        return Err(GemmError::config(format!(
            "channel '{}': {} produces {} items but {} consumes {}",
            channel, producer.stage, producer.items, consumer.stage, consumer.items
        )));
    }
    log::debug!(
        "channel '{}': {} -> {} ({} items)",
        channel,
        producer.stage,
        consumer.stage,
        producer.items
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_order_across_threads() {
        let (tx, rx) = channel::<usize>("numbers", 2);
        let received = thread::scope(|s| {
            s.spawn(move || {
                for i in 0..100 {
                    tx.send(i).unwrap();
                }
            });
            (0..100).map(|_| rx.recv().unwrap()).collect::<Vec<_>>()
        });
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_capacity_is_bounded() {
        let (_tx, rx) = channel::<u8>("tile", 16);
        assert_eq!(rx.capacity(), Some(16));
        assert_eq!(rx.name(), "tile");
    }

    #[test]
    fn test_closed_producer_is_reported() {
        let (tx, rx) = channel::<u8>("words", 4);
        tx.send(1).unwrap();
        drop(tx);
        assert_eq!(rx.recv().unwrap(), 1);
        assert!(matches!(
            rx.recv(),
            Err(GemmError::ChannelClosed { channel: "words" })
        ));
    }

    #[test]
    fn test_link_rejects_mismatched_counts() {
        let reader = StageTraffic::new("reader", 32);
        assert!(link("a", reader, StageTraffic::new("array", 32)).is_ok());
        assert!(matches!(
            link("a", reader, StageTraffic::new("array", 24)),
            Err(GemmError::Config { .. })
        ));
    }
}
