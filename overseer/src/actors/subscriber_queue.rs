//! Bounded per-subscriber queue with drop-oldest overflow.
//!
//! The bus pushes without ever waiting; the single consumer (one viewer
//! session) awaits `recv`. When the consumer falls behind, the oldest queued
//! event is discarded and counted, and the next `recv` reports the loss as a
//! `Delivery::Dropped` before resuming with the surviving events.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::actors::event_bus::BusEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(BusEvent),
    /// Number of events discarded since the previous delivery.
    Dropped(u64),
}

#[derive(Debug, Default)]
struct QueueInner {
    events: VecDeque<BusEvent>,
    pending_dropped: u64,
    total_dropped: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct SubscriberQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl SubscriberQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without blocking. Returns false once the queue is closed.
    pub fn push(&self, event: BusEvent) -> bool {
        {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            if inner.events.len() >= self.capacity {
                inner.events.pop_front();
                inner.pending_dropped += 1;
                inner.total_dropped += 1;
            }
            inner.events.push_back(event);
        }
        self.notify.notify_one();
        true
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<Delivery> {
        let mut inner = self.lock();
        if inner.pending_dropped > 0 {
            let count = std::mem::take(&mut inner.pending_dropped);
            return Some(Delivery::Dropped(count));
        }
        inner.events.pop_front().map(Delivery::Event)
    }

    /// Wait for the next delivery. `None` once closed and drained.
    ///
    /// Cancel safe: nothing is dequeued until the future resolves.
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.try_recv() {
                return Some(delivery);
            }
            if self.lock().closed {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_dropped(&self) -> u64 {
        self.lock().total_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared_types::{LogCategory, LogLevel, LogRecord};
    use std::sync::Arc;
    use std::time::Duration;

    fn log(sequence: u64) -> BusEvent {
        BusEvent::Log(LogRecord {
            sequence,
            timestamp: Utc::now(),
            level: LogLevel::Info,
            category: LogCategory::System,
            message: format!("line {sequence}"),
        })
    }

    fn sequence_of(delivery: Option<Delivery>) -> u64 {
        match delivery {
            Some(Delivery::Event(BusEvent::Log(record))) => record.sequence,
            other => panic!("expected a log delivery, got {other:?}"),
        }
    }

    #[test]
    fn test_overflow_drops_oldest_and_reports_first() {
        let queue = SubscriberQueue::new(2);
        for seq in 1..=5 {
            assert!(queue.push(log(seq)));
        }

        assert_eq!(queue.try_recv(), Some(Delivery::Dropped(3)));
        assert_eq!(sequence_of(queue.try_recv()), 4);
        assert_eq!(sequence_of(queue.try_recv()), 5);
        assert_eq!(queue.try_recv(), None);
        assert_eq!(queue.total_dropped(), 3);
    }

    #[test]
    fn test_closed_queue_rejects_pushes() {
        let queue = SubscriberQueue::new(4);
        queue.push(log(1));
        queue.close();

        assert!(!queue.push(log(2)));
        assert!(queue.is_closed());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push_and_ends_on_close() {
        let queue = Arc::new(SubscriberQueue::new(4));

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(delivery) = queue.recv().await {
                    seen.push(sequence_of(Some(delivery)));
                }
                seen
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(log(1));
        queue.push(log(2));
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let seen = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }
}
