//! Thread-safe FIFO of pending outbound master telegrams, each with its own
//! single-shot completion signal.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::ErrorKind;

/// Outcome of a completed outbound request: the slave's response bytes on
/// success, or the terminal error kind on failure.
pub type Outcome = Result<Vec<u8>, ErrorKind>;

/// Single-shot completion signal shared between the enqueuer and the
/// handler that eventually finishes the request.
#[derive(Debug, Default)]
pub struct Completion {
    result: Mutex<Option<Outcome>>,
    condvar: Condvar,
}

impl Completion {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            condvar: Condvar::new(),
        })
    }

    /// Sets the outcome and wakes any thread blocked in [`Completion::wait`].
    /// A request may only complete once; a second call is a no-op.
    pub fn complete(&self, outcome: Outcome) {
        let mut guard = self.result.lock().unwrap();
        if guard.is_none() {
            *guard = Some(outcome);
            self.condvar.notify_all();
        }
    }

    /// Blocks the calling thread until the request completes.
    pub fn wait(&self) -> Outcome {
        let guard = self.result.lock().unwrap();
        let mut guard = self
            .condvar
            .wait_while(guard, |r| r.is_none())
            .unwrap();
        guard.take().expect("condvar woke with no result")
    }

    /// Non-blocking poll: `Some(outcome)` once completed, `None` while the
    /// request is still pending. Used by the embedded/polled caller that
    /// cannot afford to block on a condition variable.
    pub fn poll(&self) -> Option<Outcome> {
        self.result.lock().unwrap().clone()
    }
}

/// One queued outbound master telegram, owned by the enqueuer until the
/// handler signals [`Completion`].
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Unstuffed master bytes (`QQ ZZ PB SB NN D1..DN`, no CRC).
    pub master_bytes: Vec<u8>,
    /// Shared completion signal; clone freely, the first `complete()` wins.
    pub completion: Arc<Completion>,
}

impl OutboundRequest {
    /// Creates a fresh, pending request for `master_bytes`.
    pub fn new(master_bytes: Vec<u8>) -> Self {
        Self {
            master_bytes,
            completion: Completion::new(),
        }
    }
}

/// A FIFO of pending [`OutboundRequest`]s, guarded by a mutex.
///
/// [`RequestQueue::dequeue`] is used only by the driver loop deciding
/// whether a new active cycle may start — the driver never blocks on it,
/// since it must keep servicing the bus. Blocking for a *result* happens
/// on the per-request [`Completion`], not on the queue.
#[derive(Debug, Default)]
pub struct RequestQueue {
    inner: Mutex<VecDeque<OutboundRequest>>,
}

impl RequestQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends `request` to the back of the queue.
    pub fn enqueue(&self, request: OutboundRequest) {
        self.inner.lock().unwrap().push_back(request);
    }

    /// Removes and returns the request at the front of the queue, if any.
    pub fn dequeue(&self) -> Option<OutboundRequest> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Number of requests currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether the queue has no pending requests.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails every currently queued request with `kind`, draining the
    /// queue. Used when the driver shuts down (see §5 Cancellation).
    pub fn fail_all(&self, kind_fn: impl Fn() -> ErrorKind) {
        let mut guard = self.inner.lock().unwrap();
        while let Some(req) = guard.pop_front() {
            req.completion.complete(Err(kind_fn()));
        }
    }
}

/// Blocks up to `timeout` waiting for `completion`, returning `None` on
/// timeout without consuming the eventual result (the caller may poll
/// again later).
pub fn wait_timeout(completion: &Completion, timeout: Duration) -> Option<Outcome> {
    let guard = completion.result.lock().unwrap();
    let (guard, result) = completion
        .condvar
        .wait_timeout_while(guard, timeout, |r| r.is_none())
        .unwrap();
    if result.timed_out() {
        None
    } else {
        guard.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_ordering() {
        let q = RequestQueue::new();
        q.enqueue(OutboundRequest::new(vec![1]));
        q.enqueue(OutboundRequest::new(vec![2]));
        assert_eq!(q.dequeue().unwrap().master_bytes, vec![1]);
        assert_eq!(q.dequeue().unwrap().master_bytes, vec![2]);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn completion_wakes_waiter() {
        let completion = Completion::new();
        let waiter = completion.clone();
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(10));
        completion.complete(Ok(vec![0x01]));
        assert_eq!(handle.join().unwrap(), Ok(vec![0x01]));
    }

    #[test]
    fn completion_is_single_shot() {
        let completion = Completion::new();
        completion.complete(Ok(vec![1]));
        completion.complete(Ok(vec![2]));
        assert_eq!(completion.poll(), Some(Ok(vec![1])));
    }

    #[test]
    fn fail_all_drains_queue() {
        let q = RequestQueue::new();
        let r1 = OutboundRequest::new(vec![1]);
        let c1 = r1.completion.clone();
        q.enqueue(r1);
        q.fail_all(|| ErrorKind::Offline);
        assert!(q.is_empty());
        assert!(matches!(c1.poll(), Some(Err(ErrorKind::Offline))));
    }
}
