//! Bounded single-producer single-consumer byte-message queue.
//!
//! Each parallel applier owns two of these: a data queue the leader fills
//! with streamed changes and an error queue the applier reports failures on.
//! The capacity is counted in bytes, like a fixed shared-memory ring, so a
//! stalled consumer eventually makes [`QueueSender::try_send`] return
//! [`SendResult::WouldBlock`]. A message larger than the whole queue is still
//! accepted once the queue is empty.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Per-message bookkeeping overhead charged against the capacity.
const MESSAGE_OVERHEAD: usize = 8;

/// Outcome of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The message is in the queue.
    Success,
    /// Not enough free space right now.
    WouldBlock,
    /// The receiver is gone.
    Detached,
}

/// Outcome of a receive attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvResult {
    /// The next message.
    Message(Bytes),
    /// Nothing queued right now.
    WouldBlock,
    /// The sender is gone and the queue is drained.
    Detached,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Bytes>,
    used_bytes: usize,
    sender_detached: bool,
    receiver_detached: bool,
}

#[derive(Debug)]
struct StatsInner {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    would_block: AtomicU64,
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages accepted by the queue.
    pub messages_sent: u64,
    /// Payload bytes accepted by the queue.
    pub bytes_sent: u64,
    /// Sends refused for lack of space.
    pub would_block: u64,
}

#[derive(Debug)]
struct Shared {
    capacity: usize,
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
    stats: StatsInner,
}

/// Creates a queue holding at most `capacity` bytes.
pub fn message_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let shared = Arc::new(Shared {
        capacity,
        state: Mutex::new(QueueState::default()),
        readable: Notify::new(),
        writable: Notify::new(),
        stats: StatsInner {
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            would_block: AtomicU64::new(0),
        },
    });
    (
        QueueSender {
            shared: shared.clone(),
        },
        QueueReceiver { shared },
    )
}

/// Sending half.
#[derive(Debug)]
pub struct QueueSender {
    shared: Arc<Shared>,
}

impl QueueSender {
    /// Enqueues without waiting.
    pub fn try_send(&self, msg: Bytes) -> SendResult {
        let mut state = self.shared.state.lock();
        if state.receiver_detached {
            return SendResult::Detached;
        }
        let cost = msg.len() + MESSAGE_OVERHEAD;
        if !state.messages.is_empty() && state.used_bytes + cost > self.shared.capacity {
            self.shared.stats.would_block.fetch_add(1, Ordering::Relaxed);
            return SendResult::WouldBlock;
        }
        state.used_bytes += cost;
        self.shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.shared
            .stats
            .bytes_sent
            .fetch_add(msg.len() as u64, Ordering::Relaxed);
        state.messages.push_back(msg);
        drop(state);
        self.shared.readable.notify_one();
        SendResult::Success
    }

    /// Enqueues, waiting for space as long as it takes.
    pub async fn send(&self, msg: Bytes) -> SendResult {
        loop {
            match self.try_send(msg.clone()) {
                SendResult::WouldBlock => self.shared.writable.notified().await,
                other => return other,
            }
        }
    }

    /// Waits until the receiver has consumed something, or `timeout` passes.
    pub async fn wait_writable(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.shared.writable.notified()).await;
    }

    /// True once the receiver has gone away.
    pub fn is_detached(&self) -> bool {
        self.shared.state.lock().receiver_detached
    }

    /// Current counters.
    pub fn stats(&self) -> QueueStats {
        let s = &self.shared.stats;
        QueueStats {
            messages_sent: s.messages_sent.load(Ordering::Relaxed),
            bytes_sent: s.bytes_sent.load(Ordering::Relaxed),
            would_block: s.would_block.load(Ordering::Relaxed),
        }
    }
}

impl Drop for QueueSender {
    fn drop(&mut self) {
        self.shared.state.lock().sender_detached = true;
        self.shared.readable.notify_one();
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct QueueReceiver {
    shared: Arc<Shared>,
}

impl QueueReceiver {
    /// Dequeues without waiting.
    pub fn try_recv(&self) -> RecvResult {
        let mut state = self.shared.state.lock();
        match state.messages.pop_front() {
            Some(msg) => {
                state.used_bytes -= msg.len() + MESSAGE_OVERHEAD;
                drop(state);
                self.shared.writable.notify_one();
                RecvResult::Message(msg)
            }
            None if state.sender_detached => RecvResult::Detached,
            None => RecvResult::WouldBlock,
        }
    }

    /// Waits up to `timeout` for a message.
    pub async fn recv_timeout(&self, timeout: Duration) -> RecvResult {
        match self.try_recv() {
            RecvResult::WouldBlock => {}
            other => return other,
        }
        let _ = tokio::time::timeout(timeout, self.shared.readable.notified()).await;
        self.try_recv()
    }

    /// Waits for the next message; `None` once the sender is gone.
    pub async fn recv(&self) -> Option<Bytes> {
        loop {
            match self.try_recv() {
                RecvResult::Message(msg) => return Some(msg),
                RecvResult::Detached => return None,
                RecvResult::WouldBlock => self.shared.readable.notified().await,
            }
        }
    }

    /// Bytes currently queued, overhead included.
    pub fn used_bytes(&self) -> usize {
        self.shared.state.lock().used_bytes
    }
}

impl Drop for QueueReceiver {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.receiver_detached = true;
        state.messages.clear();
        state.used_bytes = 0;
        drop(state);
        self.shared.writable.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, rx) = message_queue(1024);
        for i in 0..5u8 {
            assert_eq!(tx.try_send(Bytes::from(vec![i])), SendResult::Success);
        }
        for i in 0..5u8 {
            assert_eq!(rx.recv().await, Some(Bytes::from(vec![i])));
        }
        assert_eq!(rx.try_recv(), RecvResult::WouldBlock);
        assert_eq!(tx.stats().messages_sent, 5);
    }

    #[test]
    fn test_full_queue_would_block_until_drained() {
        let (tx, rx) = message_queue(64);
        assert_eq!(tx.try_send(Bytes::from(vec![0u8; 40])), SendResult::Success);
        assert_eq!(tx.try_send(Bytes::from(vec![0u8; 40])), SendResult::WouldBlock);
        assert_eq!(tx.stats().would_block, 1);
        assert!(matches!(rx.try_recv(), RecvResult::Message(_)));
        assert_eq!(tx.try_send(Bytes::from(vec![0u8; 40])), SendResult::Success);
    }

    #[test]
    fn test_oversized_message_fits_empty_queue() {
        let (tx, rx) = message_queue(16);
        assert_eq!(tx.try_send(Bytes::from(vec![1u8; 100])), SendResult::Success);
        assert_eq!(tx.try_send(Bytes::from_static(b"x")), SendResult::WouldBlock);
        assert!(matches!(rx.try_recv(), RecvResult::Message(m) if m.len() == 100));
        assert_eq!(rx.used_bytes(), 0);
    }

    #[test]
    fn test_detach_both_ways() {
        let (tx, rx) = message_queue(64);
        assert_eq!(tx.try_send(Bytes::from_static(b"last")), SendResult::Success);
        drop(tx);
        assert!(matches!(rx.try_recv(), RecvResult::Message(_)));
        assert_eq!(rx.try_recv(), RecvResult::Detached);

        let (tx, rx) = message_queue(64);
        drop(rx);
        assert!(tx.is_detached());
        assert_eq!(tx.try_send(Bytes::from_static(b"x")), SendResult::Detached);
    }

    #[tokio::test]
    async fn test_blocking_send_wakes_on_consume() {
        let (tx, rx) = message_queue(32);
        assert_eq!(tx.try_send(Bytes::from(vec![0u8; 20])), SendResult::Success);
        let sender = tokio::spawn(async move { tx.send(Bytes::from(vec![1u8; 20])).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(rx.try_recv(), RecvResult::Message(_)));
        assert_eq!(sender.await.unwrap(), SendResult::Success);
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).await,
            RecvResult::Message(m) if m[0] == 1
        ));
    }
}
