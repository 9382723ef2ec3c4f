//! FIFO admission queue for accepted-but-not-yet-dispatched connections.
//!
//! The queue pairs each item with its arrival timestamp so the dispatcher can
//! apply the wait-time eviction policy at dequeue. Dequeues use a bounded
//! wait so callers can poll their shutdown flag; `close()` stops further
//! enqueues but lets buffered items drain, which is what keeps
//! `served + lost` converging to `admitted` during shutdown.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Why an enqueue was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The configured depth bound was reached; the connection is rejected
    /// rather than admitted.
    Full,
    /// The queue has been closed for shutdown.
    Closed,
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::Full => write!(f, "admission queue is full"),
            EnqueueError::Closed => write!(f, "admission queue is closed"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Outcome of a bounded-wait dequeue.
#[derive(Debug)]
pub enum Dequeue<T> {
    /// Head of the queue with its arrival timestamp.
    Item(T, Instant),
    /// Nothing arrived within the wait; check shutdown and retry.
    TimedOut,
    /// Closed and fully drained.
    Closed,
}

struct State<T> {
    items: VecDeque<(T, Instant)>,
    closed: bool,
}

/// Single-consumer FIFO queue with an optional depth bound.
pub struct AdmissionQueue<T> {
    state: Mutex<State<T>>,
    available: Notify,
    capacity: Option<usize>,
}

impl<T> AdmissionQueue<T> {
    /// `capacity = None` reproduces the unbounded reference behavior;
    /// `Some(n)` rejects enqueues beyond `n` pending items.
    pub fn new(capacity: Option<usize>) -> Self {
        AdmissionQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Notify::new(),
            capacity,
        }
    }

    /// Append at the tail, stamped with `arrival`.
    pub fn enqueue(&self, item: T, arrival: Instant) -> Result<(), EnqueueError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(EnqueueError::Closed);
            }
            if let Some(cap) = self.capacity {
                if state.items.len() >= cap {
                    return Err(EnqueueError::Full);
                }
            }
            state.items.push_back((item, arrival));
        }
        self.available.notify_one();
        Ok(())
    }

    /// Remove and return the head, waiting up to `wait` for one to arrive.
    pub async fn dequeue(&self, wait: Duration) -> Dequeue<T> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some((item, arrival)) = state.items.pop_front() {
                    return Dequeue::Item(item, arrival);
                }
                if state.closed {
                    return Dequeue::Closed;
                }
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if d > Duration::ZERO => d,
                _ => return Dequeue::TimedOut,
            };
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Dequeue::TimedOut;
            }
        }
    }

    /// Stop accepting new items. Buffered items remain dequeueable; once the
    /// queue is empty, dequeues report `Closed`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
        }
        self.available.notify_waiters();
        self.available.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = AdmissionQueue::new(None);
        let t0 = Instant::now();
        queue.enqueue(1, t0).unwrap();
        queue.enqueue(2, t0 + Duration::from_millis(1)).unwrap();
        queue.enqueue(3, t0 + Duration::from_millis(2)).unwrap();

        let mut order = Vec::new();
        let mut arrivals = Vec::new();
        for _ in 0..3 {
            match queue.dequeue(WAIT).await {
                Dequeue::Item(n, at) => {
                    order.push(n);
                    arrivals.push(at);
                }
                other => panic!("expected item, got {other:?}"),
            }
        }
        assert_eq!(order, vec![1, 2, 3]);
        assert!(arrivals.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_reject_when_full() {
        let queue = AdmissionQueue::new(Some(2));
        let t0 = Instant::now();
        queue.enqueue(1, t0).unwrap();
        queue.enqueue(2, t0).unwrap();
        assert_eq!(queue.enqueue(3, t0), Err(EnqueueError::Full));

        // Draining one slot makes room again.
        assert!(matches!(queue.dequeue(WAIT).await, Dequeue::Item(1, _)));
        queue.enqueue(3, t0).unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_before_reporting_closed() {
        let queue = AdmissionQueue::new(None);
        let t0 = Instant::now();
        queue.enqueue(1, t0).unwrap();
        queue.enqueue(2, t0).unwrap();
        queue.close();

        assert_eq!(queue.enqueue(3, t0), Err(EnqueueError::Closed));
        assert!(matches!(queue.dequeue(WAIT).await, Dequeue::Item(1, _)));
        assert!(matches!(queue.dequeue(WAIT).await, Dequeue::Item(2, _)));
        assert!(matches!(queue.dequeue(WAIT).await, Dequeue::Closed));
    }

    #[tokio::test]
    async fn test_empty_dequeue_times_out() {
        let queue: AdmissionQueue<u32> = AdmissionQueue::new(None);
        let start = Instant::now();
        assert!(matches!(queue.dequeue(WAIT).await, Dequeue::TimedOut));
        assert!(start.elapsed() >= WAIT);
    }

    #[tokio::test]
    async fn test_blocked_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(AdmissionQueue::new(None));
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.enqueue(42, Instant::now()).unwrap();
        });

        match queue.dequeue(Duration::from_secs(2)).await {
            Dequeue::Item(n, _) => assert_eq!(n, 42),
            other => panic!("expected item, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_blocked_dequeue_wakes_on_close() {
        let queue: Arc<AdmissionQueue<u32>> = Arc::new(AdmissionQueue::new(None));
        let closer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });

        let start = Instant::now();
        assert!(matches!(
            queue.dequeue(Duration::from_secs(2)).await,
            Dequeue::Closed
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
