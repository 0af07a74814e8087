//! Priority admission for the global concurrency bound
//!
//! Free slots go to callers immediately. Once none are left, callers wait in
//! a bounded heap ordered by priority (higher first), then arrival order.
//! A released slot is handed straight to the best live waiter, so a later
//! low-priority arrival can never overtake a queued high-priority one.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// The wait queue already holds `max_waiting` callers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueueFull;

struct Waiter {
    priority: i32,
    sequence: u64,
    wake: oneshot::Sender<Slot>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority, then lower sequence, pops first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct State {
    available: usize,
    waiters: BinaryHeap<Waiter>,
    next_sequence: u64,
}

/// Counting admission with a priority-ordered, bounded wait queue
pub(crate) struct AdmissionQueue {
    state: Mutex<State>,
    max_waiting: usize,
}

impl std::fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AdmissionQueue")
            .field("available", &state.available)
            .field("waiting", &state.waiters.len())
            .field("max_waiting", &self.max_waiting)
            .finish()
    }
}

/// One unit of capacity, returned to the queue when dropped
pub(crate) struct Slot {
    queue: Option<Arc<AdmissionQueue>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            AdmissionQueue::release(queue);
        }
    }
}

/// Outcome of asking for a slot
pub(crate) enum Admit {
    /// Capacity was free
    Ready(Slot),
    /// Queued; the receiver resolves once a slot is handed over
    Queued(oneshot::Receiver<Slot>),
}

impl AdmissionQueue {
    pub(crate) fn new(capacity: usize, max_waiting: usize) -> Self {
        Self {
            state: Mutex::new(State {
                available: capacity,
                waiters: BinaryHeap::new(),
                next_sequence: 0,
            }),
            max_waiting,
        }
    }

    /// Take a free slot or join the queue at `priority`
    pub(crate) fn acquire(self: &Arc<Self>, priority: i32) -> Result<Admit, QueueFull> {
        let mut state = self.state.lock();
        // Callers that timed out or were cancelled no longer hold a place
        state.waiters.retain(|w| !w.wake.is_closed());

        if state.available > 0 && state.waiters.is_empty() {
            state.available -= 1;
            return Ok(Admit::Ready(Slot {
                queue: Some(Arc::clone(self)),
            }));
        }
        if state.waiters.len() >= self.max_waiting {
            return Err(QueueFull);
        }

        let (wake, receiver) = oneshot::channel();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.waiters.push(Waiter {
            priority,
            sequence,
            wake,
        });
        Ok(Admit::Queued(receiver))
    }

    /// Slots free right now
    pub(crate) fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Callers currently waiting
    pub(crate) fn waiting(&self) -> usize {
        let state = self.state.lock();
        state.waiters.iter().filter(|w| !w.wake.is_closed()).count()
    }

    fn release(queue: Arc<Self>) {
        let next = {
            let mut state = queue.state.lock();
            match state.waiters.pop() {
                Some(waiter) => waiter,
                None => {
                    state.available += 1;
                    return;
                }
            }
        };
        // Sent outside the lock: a waiter that already left drops the slot
        // again, which passes it on to the next one
        let _ = next.wake.send(Slot { queue: Some(queue) });
    }
}
