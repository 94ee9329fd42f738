//! Bounded in-process ring with drop-on-full submission.
//!
//! Mirrors the kernel ring buffer contract in user space: a producer never
//! blocks, a full ring silently discards the new record and counts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use super::RecordSource;
use crate::domain::ChannelError;

/// Create a ring holding at most `capacity` records.
#[must_use]
pub fn lossy_ring(capacity: usize) -> (LossyProducer, LossyRing) {
    let (tx, rx) = bounded(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (LossyProducer { tx, dropped: Arc::clone(&dropped) }, LossyRing { rx, dropped })
}

#[derive(Clone)]
pub struct LossyProducer {
    tx: Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl LossyProducer {
    /// Submit one record. Returns `false` if it was dropped.
    pub fn submit(&self, record: Vec<u8>) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct LossyRing {
    rx: Receiver<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl LossyRing {
    /// Records currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl RecordSource for LossyRing {
    fn name(&self) -> &'static str {
        "lossy"
    }

    /// Returns [`ChannelError::Disconnected`] once every producer is gone and
    /// the ring is empty.
    fn poll(
        &mut self,
        timeout: Duration,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<usize, ChannelError> {
        let first = match self.rx.recv_timeout(timeout) {
            Ok(record) => record,
            Err(RecvTimeoutError::Timeout) => return Ok(0),
            Err(RecvTimeoutError::Disconnected) => return Err(ChannelError::Disconnected),
        };
        sink(&first);

        let mut delivered = 1;
        for record in self.rx.try_iter() {
            sink(&record);
            delivered += 1;
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn full_ring_drops_without_blocking() {
        let (producer, ring) = lossy_ring(1024);

        let start = Instant::now();
        let accepted = (0..9000u32).filter(|i| producer.submit(i.to_le_bytes().to_vec())).count();

        assert_eq!(accepted, 1024);
        assert_eq!(ring.len(), 1024);
        assert_eq!(producer.dropped(), 9000 - 1024);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn retained_records_are_the_oldest() {
        let (producer, mut ring) = lossy_ring(4);
        for i in 0..10u8 {
            producer.submit(vec![i]);
        }

        let mut seen = Vec::new();
        let n = ring.poll(Duration::from_millis(10), &mut |r| seen.push(r[0])).unwrap();
        assert_eq!(n, 4);
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn empty_ring_times_out() {
        let (_producer, mut ring) = lossy_ring(8);
        let n = ring.poll(Duration::from_millis(20), &mut |_| panic!("no records")).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn dropped_producer_disconnects_after_drain() {
        let (producer, mut ring) = lossy_ring(8);
        producer.submit(b"last".to_vec());
        drop(producer);

        assert_eq!(ring.poll(Duration::from_millis(10), &mut |_| {}).unwrap(), 1);
        assert!(matches!(
            ring.poll(Duration::from_millis(10), &mut |_| {}),
            Err(ChannelError::Disconnected)
        ));
    }
}
