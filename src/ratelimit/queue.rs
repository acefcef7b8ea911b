//! In-process FIFO of requests waiting for a concurrency slot.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::lease::Lease;

/// A caller suspended until the dequeuer grants its reservation.
pub(crate) struct QueuedRequest {
    pub request_id: String,
    pub permit_count: u32,
    pub completion: oneshot::Sender<Lease>,
}

impl QueuedRequest {
    /// The caller stopped waiting: cancelled, or its future was dropped.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }
}

/// Snapshot of the request at the head of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Head {
    pub request_id: String,
    pub permit_count: u32,
    pub abandoned: bool,
}

#[derive(Default)]
struct QueueState {
    requests: VecDeque<QueuedRequest>,
    closed: bool,
}

/// Thread-safe FIFO that refuses new entries once closed.
#[derive(Default)]
pub(crate) struct RequestQueue {
    state: Mutex<QueueState>,
}

impl RequestQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a request, handing it back if the queue has been closed.
    pub(crate) fn push(&self, request: QueuedRequest) -> Result<(), QueuedRequest> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(request);
        }
        state.requests.push_back(request);
        Ok(())
    }

    pub(crate) fn head(&self) -> Option<Head> {
        let state = self.state.lock();
        state.requests.front().map(|request| Head {
            request_id: request.request_id.clone(),
            permit_count: request.permit_count,
            abandoned: request.is_abandoned(),
        })
    }

    /// Take a request out of the queue by reservation id.
    pub(crate) fn remove(&self, request_id: &str) -> Option<QueuedRequest> {
        let mut state = self.state.lock();
        let index = state
            .requests
            .iter()
            .position(|request| request.request_id == request_id)?;
        state.requests.remove(index)
    }

    /// Close the queue and return everything still waiting, in arrival order.
    pub(crate) fn close(&self) -> Vec<QueuedRequest> {
        let mut state = self.state.lock();
        state.closed = true;
        state.requests.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> (QueuedRequest, oneshot::Receiver<Lease>) {
        let (tx, rx) = oneshot::channel();
        let request = QueuedRequest {
            request_id: id.to_string(),
            permit_count: 1,
            completion: tx,
        };
        (request, rx)
    }

    #[test]
    fn test_fifo_order() {
        let queue = RequestQueue::new();
        let (a, _rx_a) = request("a");
        let (b, _rx_b) = request("b");
        assert!(queue.push(a).is_ok());
        assert!(queue.push(b).is_ok());

        assert_eq!(queue.head().unwrap().request_id, "a");
        assert!(queue.remove("a").is_some());
        assert_eq!(queue.head().unwrap().request_id, "b");
        assert!(queue.remove("a").is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_dropped_receiver_marks_abandoned() {
        let queue = RequestQueue::new();
        let (a, rx_a) = request("a");
        assert!(queue.push(a).is_ok());
        assert!(!queue.head().unwrap().abandoned);

        drop(rx_a);
        assert!(queue.head().unwrap().abandoned);
    }

    #[test]
    fn test_closed_queue_rejects_requests() {
        let queue = RequestQueue::new();
        let (a, _rx_a) = request("a");
        let (b, _rx_b) = request("b");
        assert!(queue.push(a).is_ok());

        let drained = queue.close();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty());
        assert!(queue.push(b).is_err());
    }
}
