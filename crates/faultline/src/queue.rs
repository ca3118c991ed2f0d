//! Bounded hand-off between capture call sites and the transport worker.
//!
//! Producers never wait: `enqueue` is a `try_send` that drops the new event
//! when the queue is full (drop-newest). The single consumer owns the
//! receiving half plus a one-event front slot used to requeue an event whose
//! send failed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::event::Event;

/// Counters shared by every producer and the consumer.
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    /// Accepted but not yet delivered or dropped (queued plus in flight).
    pending: AtomicUsize,
}

impl QueueStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Count everything still pending as dropped, returning how many that was.
    pub(crate) fn discard_pending(&self) -> u64 {
        let discarded = self.pending.swap(0, Ordering::AcqRel) as u64;
        self.dropped.fetch_add(discarded, Ordering::Relaxed);
        discarded
    }

    fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.release_pending();
    }

    fn record_dropped_pending(&self) {
        // Already counted as dropped if `discard_pending` took it.
        if self.release_pending() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Decrement `pending`, saturating at zero. Returns whether it was
    /// non-zero.
    fn release_pending(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1))
            .is_ok()
    }
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub pending: usize,
}

/// Create a bounded delivery queue.
pub fn delivery_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let stats = Arc::new(QueueStats::default());
    (
        QueueSender {
            tx,
            stats: Arc::clone(&stats),
        },
        QueueReceiver {
            rx,
            front: None,
            capacity,
            stats,
        },
    )
}

/// Producer half; cheap to clone, safe from any thread.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<Event>,
    stats: Arc<QueueStats>,
}

impl QueueSender {
    /// Hand an event to the worker without blocking.
    ///
    /// Returns `false` if the event was dropped because the queue is full or
    /// closed.
    pub fn enqueue(&self, event: Event) -> bool {
        // Counted before the send so the consumer can never observe an
        // underflowed pending count.
        self.stats.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.stats.record_dropped_pending();
                false
            }
        }
    }

    pub fn stats(&self) -> &Arc<QueueStats> {
        &self.stats
    }
}

/// Consumer half, owned by the transport worker.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<Event>,
    front: Option<Event>,
    capacity: usize,
    stats: Arc<QueueStats>,
}

impl QueueReceiver {
    /// Next event, requeued event first. `None` once closed and empty.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.front.take() {
            return Some(event);
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.front.take().or_else(|| self.rx.try_recv().ok())
    }

    /// Put a failed in-flight event back at the front of the queue.
    ///
    /// The event is kept only while the queue has room; otherwise it is
    /// counted as dropped. Returns whether it was kept.
    pub fn requeue_front(&mut self, event: Event) -> bool {
        if self.front.is_none() && self.rx.len() < self.capacity {
            self.front = Some(event);
            true
        } else {
            self.stats.record_dropped_pending();
            false
        }
    }

    pub fn mark_delivered(&self) {
        self.stats.record_delivered();
    }

    pub fn mark_dropped(&self) {
        self.stats.record_dropped_pending();
    }

    /// Stop accepting new events. Already queued events stay receivable.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Events waiting to be consumed, including a requeued one.
    pub fn len(&self) -> usize {
        self.rx.len() + usize::from(self.front.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &Arc<QueueStats> {
        &self.stats
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::builder::EventBuilder;
    use crate::config::Config;
    use crate::context::ContextSnapshot;

    pub(crate) fn test_event(message: &str) -> Event {
        let builder = EventBuilder::new(&Config::new("key"));
        let mut source = builder.message_source(message);
        source.stack = Some(Vec::new());
        builder.build(source, None, &ContextSnapshot::default())
    }

    #[test]
    fn test_overflow_drops_newest_and_counts_excess() {
        let (tx, mut rx) = delivery_queue(3);
        let accepted = (0..10)
            .filter(|i| tx.enqueue(test_event(&format!("e{i}"))))
            .count();

        assert_eq!(accepted, 3);
        let stats = tx.stats().snapshot();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.dropped, 7);
        assert_eq!(stats.pending, 3);

        // The oldest events survive.
        assert_eq!(rx.try_recv().unwrap().message, "e0");
        assert_eq!(rx.try_recv().unwrap().message, "e1");
        assert_eq!(rx.try_recv().unwrap().message, "e2");
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_enqueue_never_blocks_from_many_threads() {
        let (tx, _rx) = delivery_queue(8);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        tx.enqueue(test_event(&format!("t{t}-{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = tx.stats().snapshot();
        assert_eq!(stats.enqueued, 8);
        assert_eq!(stats.dropped, 92);
    }

    #[tokio::test]
    async fn test_requeue_goes_to_front() {
        let (tx, mut rx) = delivery_queue(4);
        tx.enqueue(test_event("first"));
        tx.enqueue(test_event("second"));

        let in_flight = rx.recv().await.unwrap();
        assert_eq!(in_flight.message, "first");
        assert!(rx.requeue_front(in_flight));
        assert_eq!(rx.len(), 2);

        assert_eq!(rx.recv().await.unwrap().message, "first");
        rx.mark_delivered();
        assert_eq!(rx.recv().await.unwrap().message, "second");
        rx.mark_delivered();

        let stats = rx.stats().snapshot();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_requeue_dropped_when_full() {
        let (tx, mut rx) = delivery_queue(2);
        tx.enqueue(test_event("a"));
        tx.enqueue(test_event("b"));

        let in_flight = rx.recv().await.unwrap();
        // A producer refills the freed slot before the send fails.
        assert!(tx.enqueue(test_event("c")));

        assert!(!rx.requeue_front(in_flight));
        let stats = rx.stats().snapshot();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.pending, 2);
    }

    #[tokio::test]
    async fn test_close_keeps_queued_events() {
        let (tx, mut rx) = delivery_queue(4);
        tx.enqueue(test_event("queued"));
        rx.close();

        assert!(!tx.enqueue(test_event("late")));
        assert_eq!(rx.recv().await.unwrap().message, "queued");
        assert!(rx.recv().await.is_none());
        assert_eq!(tx.stats().dropped(), 1);
    }

    #[test]
    fn test_discard_pending() {
        let (tx, _rx) = delivery_queue(4);
        tx.enqueue(test_event("a"));
        tx.enqueue(test_event("b"));

        let stats = tx.stats();
        assert_eq!(stats.discard_pending(), 2);
        assert_eq!(stats.pending(), 0);
        assert_eq!(stats.dropped(), 2);
    }

    #[test]
    fn test_settling_after_discard_never_underflows() {
        let (tx, mut rx) = delivery_queue(4);
        tx.enqueue(test_event("in flight"));
        tx.enqueue(test_event("queued"));
        let in_flight = rx.try_recv().unwrap();

        assert_eq!(tx.stats().discard_pending(), 2);

        // The worker settles its in-flight event after the discard.
        drop(in_flight);
        rx.mark_delivered();
        rx.mark_dropped();

        let stats = tx.stats().snapshot();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 2);
    }
}
