//! Bounded packet queues between relay workers
//!
//! One queue sits between the reader and the writer of every relayed
//! endpoint (EP0 uses two, one per direction). Push and pop block for at
//! most one tick at a time so the calling worker can poll its stop flag
//! between attempts; a disconnected channel is the shutdown sentinel that
//! wakes waiters for good. FIFO is strict within a queue.
//!
//! Relay pipelines use exactly one sender and one receiver. Writer
//! auxiliary inputs are the one place sender clones are handed out, so
//! injector threads can post synthetic packets.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::time::Duration;
use usb::Packet;

/// Create a bounded packet queue, returning the producer and consumer halves
pub fn packet_queue(capacity: usize) -> (PacketSender, PacketReceiver) {
    let (tx, rx) = bounded(capacity);
    (PacketSender { tx }, PacketReceiver { rx })
}

/// Outcome of a bounded push attempt
#[derive(Debug)]
pub enum PushResult {
    Sent,
    /// Queue stayed full for the whole timeout; the packet comes back
    Full(Packet),
    /// Consumer is gone; shutdown requested
    Closed(Packet),
}

/// Outcome of a bounded pop attempt
#[derive(Debug)]
pub enum PopResult {
    Packet(Packet),
    /// Nothing arrived within the timeout
    Empty,
    /// Producer is gone; shutdown requested
    Closed,
}

/// Producer half of a packet queue
#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: Sender<Packet>,
}

impl PacketSender {
    /// Push, blocking up to `timeout` while the queue is full
    pub fn push_timeout(&self, packet: Packet, timeout: Duration) -> PushResult {
        match self.tx.send_timeout(packet, timeout) {
            Ok(()) => PushResult::Sent,
            Err(SendTimeoutError::Timeout(p)) => PushResult::Full(p),
            Err(SendTimeoutError::Disconnected(p)) => PushResult::Closed(p),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Consumer half of a packet queue
#[derive(Debug)]
pub struct PacketReceiver {
    rx: Receiver<Packet>,
}

impl PacketReceiver {
    /// Pop, blocking up to `timeout` while the queue is empty
    pub fn pop_timeout(&self, timeout: Duration) -> PopResult {
        match self.rx.recv_timeout(timeout) {
            Ok(packet) => PopResult::Packet(packet),
            Err(RecvTimeoutError::Timeout) => PopResult::Empty,
            Err(RecvTimeoutError::Disconnected) => PopResult::Closed,
        }
    }

    /// Pop only if a packet is immediately available
    pub fn try_pop(&self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usb::packet::TransferKind;

    const TICK: Duration = Duration::from_millis(10);

    fn packet(tag: u8) -> Packet {
        Packet::new(0x81, TransferKind::Bulk, vec![tag])
    }

    #[test]
    fn test_fifo_order() {
        let (tx, rx) = packet_queue(8);
        for tag in 0..4u8 {
            assert!(matches!(tx.push_timeout(packet(tag), TICK), PushResult::Sent));
        }
        for tag in 0..4u8 {
            match rx.pop_timeout(TICK) {
                PopResult::Packet(p) => assert_eq!(p.payload, vec![tag]),
                other => panic!("expected packet, got {:?}", other),
            }
        }
        assert!(matches!(rx.pop_timeout(TICK), PopResult::Empty));
    }

    #[test]
    fn test_push_blocks_when_full() {
        let (tx, _rx) = packet_queue(1);
        assert!(matches!(tx.push_timeout(packet(0), TICK), PushResult::Sent));
        match tx.push_timeout(packet(1), TICK) {
            PushResult::Full(p) => assert_eq!(p.payload, vec![1]),
            other => panic!("expected full, got {:?}", other),
        }
    }

    #[test]
    fn test_closed_wakes_producer() {
        let (tx, rx) = packet_queue(1);
        drop(rx);
        assert!(matches!(
            tx.push_timeout(packet(0), TICK),
            PushResult::Closed(_)
        ));
    }

    #[test]
    fn test_closed_wakes_consumer() {
        let (tx, rx) = packet_queue(4);
        tx.push_timeout(packet(7), TICK);
        drop(tx);
        // buffered packet still drains before the sentinel
        assert!(matches!(rx.pop_timeout(TICK), PopResult::Packet(_)));
        assert!(matches!(rx.pop_timeout(TICK), PopResult::Closed));
    }

    #[test]
    fn test_try_pop() {
        let (tx, rx) = packet_queue(4);
        assert!(rx.try_pop().is_none());
        tx.push_timeout(packet(1), TICK);
        assert_eq!(rx.try_pop().unwrap().payload, vec![1]);
    }
}
