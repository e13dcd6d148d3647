//! Retry of unhibernation attempts while the imap-master socket is busy.
//!
//! Sessions waiting for a retry sit in a deadline-ordered queue; a single
//! shared tick wakes the earliest-deadline session first and stops at the
//! first one that still cannot move back (everything behind it has a later
//! deadline, so there is no point trying).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{self, Duration, Instant};

use crate::registry::SessionId;
use crate::session::{RetryOutcome, SessionCmd};

/// How often queued sessions are retried.
pub const UNHIBERNATE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// If the client has produced input and no worker could be recreated
/// within this long, give up and disconnect: the client is waiting for an
/// answer.
pub const MOVE_BACK_WITH_INPUT_TIMEOUT: Duration = Duration::from_secs(10);

/// With only an external notification driving us the client is still
/// happy, so we can keep trying much longer.
pub const MOVE_BACK_WITHOUT_INPUT_TIMEOUT: Duration = Duration::from_secs(60 * 5);

pub fn move_back_timeout(input_pending: bool) -> Duration {
    if input_pending {
        MOVE_BACK_WITH_INPUT_TIMEOUT
    } else {
        MOVE_BACK_WITHOUT_INPUT_TIMEOUT
    }
}

pub fn move_back_deadline(start: Instant, input_pending: bool) -> Instant {
    start + move_back_timeout(input_pending)
}

struct Entry {
    deadline: Instant,
    seq: u64,
    id: SessionId,
    tx: mpsc::Sender<SessionCmd>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    /// Sequence number of the live entry per queued session; heap entries
    /// with a stale sequence are discarded when they surface.
    live: HashMap<SessionId, u64>,
    next_seq: u64,
}

/// The process-wide unhibernation retry queue. A session is queued iff it
/// has a live entry here; re-enqueueing replaces the previous entry (used
/// when client input shortens the deadline class).
#[derive(Default)]
pub struct RetryQueue {
    inner: Mutex<Inner>,
    bell: Notify,
}

impl RetryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueue(&self, id: SessionId, deadline: Instant, tx: mpsc::Sender<SessionCmd>) {
        {
            let mut inner = self.inner.lock().expect("retry queue poisoned");
            inner.next_seq += 1;
            let seq = inner.next_seq;
            inner.live.insert(id, seq);
            inner.heap.push(Reverse(Entry {
                deadline,
                seq,
                id,
                tx,
            }));
        }
        self.bell.notify_one();
    }

    pub fn remove(&self, id: SessionId) {
        self.inner
            .lock()
            .expect("retry queue poisoned")
            .live
            .remove(&id);
    }

    pub fn is_queued(&self, id: SessionId) -> bool {
        self.inner
            .lock()
            .expect("retry queue poisoned")
            .live
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("retry queue poisoned").live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The queued session with the earliest deadline, pruning entries
    /// whose session was dequeued or re-enqueued in the meantime.
    fn head(&self) -> Option<(SessionId, mpsc::Sender<SessionCmd>)> {
        let mut inner = self.inner.lock().expect("retry queue poisoned");
        loop {
            match inner.heap.peek() {
                None => return None,
                Some(Reverse(entry)) => {
                    if inner.live.get(&entry.id) == Some(&entry.seq) {
                        return Some((entry.id, entry.tx.clone()));
                    }
                }
            }
            inner.heap.pop();
        }
    }
}

/// The shared retry tick. Runs until shutdown; idles completely while the
/// queue is empty.
pub async fn run_scheduler(queue: Arc<RetryQueue>, mut must_exit: watch::Receiver<bool>) {
    loop {
        if queue.is_empty() {
            tokio::select! {
                _ = queue.bell.notified() => continue,
                changed = must_exit.changed() => {
                    if changed.is_err() || *must_exit.borrow() {
                        return;
                    }
                    continue;
                }
            }
        }
        tokio::select! {
            _ = time::sleep(UNHIBERNATE_RETRY_INTERVAL) => (),
            changed = must_exit.changed() => {
                if changed.is_err() || *must_exit.borrow() {
                    return;
                }
                continue;
            }
        }
        while let Some((id, tx)) = queue.head() {
            let (done_tx, done_rx) = oneshot::channel();
            if tx
                .send(SessionCmd::TryUnhibernate { done: done_tx })
                .await
                .is_err()
            {
                // session already destroyed
                queue.remove(id);
                continue;
            }
            match done_rx.await {
                Ok(RetryOutcome::Deferred) => break,
                Ok(RetryOutcome::Finished) | Err(_) => {
                    queue.remove(id);
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::Sender<SessionCmd> {
        mpsc::channel(1).0
    }

    #[test]
    fn head_is_the_earliest_deadline() {
        let queue = RetryQueue::new();
        let base = Instant::now();
        queue.enqueue(1, base + Duration::from_secs(10), sender());
        queue.enqueue(2, base + Duration::from_secs(2), sender());
        queue.enqueue(3, base + Duration::from_secs(300), sender());
        assert_eq!(queue.head().map(|(id, _)| id), Some(2));
        queue.remove(2);
        assert_eq!(queue.head().map(|(id, _)| id), Some(1));
        queue.remove(1);
        queue.remove(3);
        assert_eq!(queue.head().map(|(id, _)| id), None);
    }

    #[test]
    fn queued_flag_matches_queue_membership() {
        let queue = RetryQueue::new();
        assert!(!queue.is_queued(7));
        queue.enqueue(7, Instant::now() + Duration::from_secs(1), sender());
        assert!(queue.is_queued(7));
        assert_eq!(queue.len(), 1);
        queue.remove(7);
        assert!(!queue.is_queued(7));
        assert!(queue.is_empty());
    }

    #[test]
    fn reenqueue_replaces_the_deadline() {
        let queue = RetryQueue::new();
        let base = Instant::now();
        queue.enqueue(1, base + MOVE_BACK_WITHOUT_INPUT_TIMEOUT, sender());
        queue.enqueue(2, base + Duration::from_secs(60), sender());
        assert_eq!(queue.head().map(|(id, _)| id), Some(2));
        // client input arrived for session 1: its class shrinks to 10s
        queue.enqueue(1, base + MOVE_BACK_WITH_INPUT_TIMEOUT, sender());
        assert_eq!(queue.head().map(|(id, _)| id), Some(1));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn equal_deadlines_keep_insertion_order() {
        let queue = RetryQueue::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        for id in 10..20 {
            queue.enqueue(id, deadline, sender());
        }
        for want in 10..20 {
            let (id, _) = queue.head().unwrap();
            assert_eq!(id, want);
            queue.remove(id);
        }
    }

    #[test]
    fn timeout_class_selection() {
        assert_eq!(move_back_timeout(true), Duration::from_secs(10));
        assert_eq!(move_back_timeout(false), Duration::from_secs(300));
        let start = Instant::now();
        assert_eq!(
            move_back_deadline(start, true),
            start + Duration::from_secs(10)
        );
    }
}
