//! Fixed-size broadcast ring for descrambled TS packets.
//!
//! One engine writes, any number of HTTP readers follow at their own
//! pace. The ring is a sliding window, not a queue: a reader that falls
//! more than the window size behind silently loses the overwritten
//! packets and resumes from the oldest retained one. There is no
//! backpressure on the writer.

use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Number of slots in the ring.
pub const RING_SLOTS: usize = 64;

struct RingState {
    slots: Vec<Option<Bytes>>,
    /// Sequence number of the next slot to be written. Slot `seq` lives
    /// at `slots[seq % RING_SLOTS]` while `head - RING_SLOTS <= seq < head`.
    head: u64,
    closed: bool,
}

/// Shared writer/reader state of one channel's fan-out buffer.
pub struct PacketRing {
    state: Mutex<RingState>,
    publish_notify: Notify,
}

impl PacketRing {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RingState {
                slots: vec![None; RING_SLOTS],
                head: 0,
                closed: false,
            }),
            publish_notify: Notify::new(),
        }
    }

    /// Store one packet in the next slot and wake every waiting reader.
    pub fn publish(&self, pkt: Bytes) {
        {
            let mut state = self.state.lock();
            let idx = (state.head % RING_SLOTS as u64) as usize;
            state.slots[idx] = Some(pkt);
            state.head += 1;
        }
        self.publish_notify.notify_waiters();
    }

    /// Close the ring: every current and future read observes
    /// end-of-stream.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.publish_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Create a reader positioned at the writer's cursor, so it sees only
    /// packets published from now on.
    pub fn subscribe(self: &Arc<Self>) -> RingReader {
        let next = self.state.lock().head;
        RingReader {
            ring: Arc::clone(self),
            next,
        }
    }
}

impl Default for PacketRing {
    fn default() -> Self {
        Self::new()
    }
}

/// One reader's cursor into a [`PacketRing`].
pub struct RingReader {
    ring: Arc<PacketRing>,
    next: u64,
}

impl RingReader {
    /// Wait for and return the next packet, or `None` once the ring is
    /// closed.
    pub async fn next(&mut self) -> Option<Bytes> {
        loop {
            // Register interest before checking state so a publish
            // between the check and the await cannot be missed.
            let notified = self.ring.publish_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.ring.state.lock();
                if state.closed {
                    return None;
                }
                if self.next < state.head {
                    if state.head - self.next > RING_SLOTS as u64 {
                        let oldest = state.head - RING_SLOTS as u64;
                        debug!(
                            "ring reader lagged, skipping {} packets",
                            oldest - self.next
                        );
                        self.next = oldest;
                    }
                    let idx = (self.next % RING_SLOTS as u64) as usize;
                    let pkt = state.slots[idx].clone();
                    self.next += 1;
                    if pkt.is_some() {
                        return pkt;
                    }
                    continue;
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn pkt(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 188])
    }

    #[tokio::test]
    async fn test_reader_sees_published_sequence() {
        let ring = Arc::new(PacketRing::new());
        let mut reader = ring.subscribe();
        for i in 0..10 {
            ring.publish(pkt(i));
        }
        for i in 0..10 {
            assert_eq!(reader.next().await.unwrap(), pkt(i));
        }
    }

    #[tokio::test]
    async fn test_reader_starts_at_writer_cursor() {
        let ring = Arc::new(PacketRing::new());
        ring.publish(pkt(1));
        ring.publish(pkt(2));

        // History published before subscribing is not replayed.
        let mut reader = ring.subscribe();
        ring.publish(pkt(3));
        assert_eq!(reader.next().await.unwrap(), pkt(3));
    }

    #[tokio::test]
    async fn test_blocked_reader_wakes_on_publish() {
        let ring = Arc::new(PacketRing::new());
        let mut reader = ring.subscribe();

        let writer = Arc::clone(&ring);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.publish(pkt(9));
        });

        assert_eq!(reader.next().await.unwrap(), pkt(9));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_lagged_reader_resyncs_to_oldest_retained() {
        let ring = Arc::new(PacketRing::new());
        let mut reader = ring.subscribe();

        let total = RING_SLOTS as u8 + 40;
        for i in 0..total {
            ring.publish(pkt(i));
        }

        // The reader lost the first 40 packets; what remains is the
        // contiguous suffix filling the window.
        for i in 40..total {
            assert_eq!(reader.next().await.unwrap(), pkt(i));
        }
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_readers() {
        let ring = Arc::new(PacketRing::new());
        let mut reader = ring.subscribe();

        let closer = Arc::clone(&ring);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        assert_eq!(reader.next().await, None);
        task.await.unwrap();
        assert!(ring.is_closed());
    }

    #[tokio::test]
    async fn test_close_ends_stream_even_with_unread_slots() {
        let ring = Arc::new(PacketRing::new());
        let mut reader = ring.subscribe();
        ring.publish(pkt(1));
        ring.close();
        assert_eq!(reader.next().await, None);
    }

    #[tokio::test]
    async fn test_independent_reader_cursors() {
        let ring = Arc::new(PacketRing::new());
        let mut fast = ring.subscribe();
        let mut slow = ring.subscribe();

        for i in 0..5 {
            ring.publish(pkt(i));
        }
        for i in 0..5 {
            assert_eq!(fast.next().await.unwrap(), pkt(i));
        }
        // The slow reader still sees everything, in order, exactly once.
        for i in 0..5 {
            assert_eq!(slow.next().await.unwrap(), pkt(i));
        }
    }
}
