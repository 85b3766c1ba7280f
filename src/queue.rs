//! The asynchronous work queue (spec.md §4.3).
//!
//! A process-local priority queue with delayed visibility and a per-item
//! retry/cooldown/pause state machine. Admission is synchronous and must stay
//! fast; apply is slow and must not hold up webhook latency, so accepted
//! templates are handed off here and a worker pool drains it independently.
//!
//! spec.md §5 dictates the primitive explicitly ("mutex+condvar... locked
//! (mutex)"), so this queue uses `std::sync::{Mutex, Condvar}` around a
//! `BinaryHeap` rather than an async channel, even though the rest of the
//! crate is tokio-based. Blocking `dequeue` calls are bridged into async
//! worker loops via `tokio::task::spawn_blocking`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Identity of a work item: `(namespace, name)`.
pub type WorkItemId = (String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub retry_count: u32,
    pub retry_cycle: u32,
}

impl Default for RetryState {
    fn default() -> Self {
        RetryState {
            retry_count: 0,
            retry_cycle: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct HeapEntry {
    id: WorkItemId,
    priority: i64,
    scheduled_at: Instant,
    sequence: u64,
}

// BinaryHeap is a max-heap: higher priority first, then earlier scheduled_at
// first (so we invert the comparison on scheduled_at), then insertion order
// for strict FIFO among ties (spec.md §5's "Per-item within the queue: FIFO
// among items of equal priority with the same scheduledAt").
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.scheduled_at.cmp(&self.scheduled_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.sequence == other.sequence
    }
}
impl Eq for HeapEntry {}

struct Tracked {
    priority: i64,
    scheduled_at: Instant,
    retry: RetryState,
    paused: bool,
}

struct Inner {
    heap: BinaryHeap<HeapEntry>,
    tracked: HashMap<WorkItemId, Tracked>,
    in_flight: HashSet<WorkItemId>,
    next_sequence: u64,
    shutdown: bool,
}

/// Retry/cooldown/pause policy knobs (spec.md §4.3 defaults).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retry_cycles: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_retry_cycles: 3,
        }
    }
}

/// Outcome of handing a failure to `Requeue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Rescheduled with exponential backoff.
    Retry { retry_count: u32, delay: Duration },
    /// Retry budget for this cycle was exhausted; a cooldown was scheduled
    /// and `retry_cycle` incremented.
    Cooldown { retry_cycle: u32, delay: Duration },
    /// `retry_cycle` exceeded the configured maximum; the item is parked and
    /// will not be scheduled again until `resume` is called.
    Paused { retry_cycle: u32 },
}

pub struct WorkQueue {
    policy: RetryPolicy,
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

pub enum DequeueResult {
    Item(WorkItemId),
    ShuttingDown,
}

impl WorkQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        WorkQueue {
            policy,
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                tracked: HashMap::new(),
                in_flight: HashSet::new(),
                next_sequence: 0,
                shutdown: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// `Enqueue(id, priority)`: insert or merge. Merging takes the max
    /// priority and leaves retry state untouched (spec.md §4.3, P3).
    pub fn enqueue(&self, id: WorkItemId, priority: i64) {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        let now = Instant::now();

        if let Some(existing) = inner.tracked.get_mut(&id) {
            if existing.paused {
                // Paused items only leave pause state via `resume`.
                return;
            }
            let merged_priority = existing.priority.max(priority);
            existing.priority = merged_priority;
            existing.scheduled_at = now;
        } else {
            inner.tracked.insert(
                id.clone(),
                Tracked {
                    priority,
                    scheduled_at: now,
                    retry: RetryState::default(),
                    paused: false,
                },
            );
        }

        let tracked = &inner.tracked[&id];
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.heap.push(HeapEntry {
            id,
            priority: tracked.priority,
            scheduled_at: tracked.scheduled_at,
            sequence,
        });
        self.not_empty.notify_one();
    }

    /// `Dequeue()`: blocks until an item is due (`scheduledAt <= now`).
    /// Returns `ShuttingDown` once `shutdown` has been called, so workers can
    /// exit cleanly.
    pub fn dequeue_blocking(&self) -> DequeueResult {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        loop {
            if inner.shutdown {
                return DequeueResult::ShuttingDown;
            }

            let now = Instant::now();
            // Pop entries until we find one that's due and not stale
            // (stale: a merge superseded it, or it was already dequeued).
            while let Some(top) = inner.heap.peek() {
                if !inner.tracked.contains_key(&top.id) {
                    inner.heap.pop();
                    continue;
                }
                if top.scheduled_at > now {
                    break;
                }
                let top_id = top.id.clone();
                let top_scheduled_at = top.scheduled_at;
                inner.heap.pop();

                // Skip stale heap entries left behind by a merge (the
                // tracked map always holds the authoritative schedule).
                let current_scheduled_at = inner.tracked[&top_id].scheduled_at;
                if current_scheduled_at != top_scheduled_at {
                    continue;
                }
                if inner.in_flight.contains(&top_id) {
                    continue;
                }

                inner.tracked.remove(&top_id);
                inner.in_flight.insert(top_id.clone());
                return DequeueResult::Item(top_id);
            }

            let wait_for = inner
                .heap
                .peek()
                .map(|top| top.scheduled_at.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));

            let (guard, _timeout) = self
                .not_empty
                .wait_timeout(inner, wait_for.min(Duration::from_secs(1)))
                .expect("work queue lock poisoned");
            inner = guard;
        }
    }

    /// Non-blocking membership test (spec.md §4.5: used by the reconciler to
    /// skip periodic drift checks while a worker is already scheduled).
    pub fn contains(&self, id: &WorkItemId) -> bool {
        let inner = self.inner.lock().expect("work queue lock poisoned");
        inner.tracked.contains_key(id) || inner.in_flight.contains(id)
    }

    /// `Done(item)`: successful completion, clears retry state.
    pub fn done(&self, id: &WorkItemId) {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        inner.in_flight.remove(id);
    }

    /// `Requeue(item, err)`: failure path implementing the retry → cooldown →
    /// pause state machine of spec.md §4.3.
    pub fn requeue(&self, id: &WorkItemId, priority: i64) -> RequeueOutcome {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        inner.in_flight.remove(id);

        let mut retry = inner
            .tracked
            .get(id)
            .map(|t| t.retry.clone())
            .unwrap_or_default();

        retry.retry_count += 1;

        let outcome = if retry.retry_count > self.policy.max_retries {
            retry.retry_count = 0;
            retry.retry_cycle += 1;

            if self.policy.max_retry_cycles != 0 && retry.retry_cycle > self.policy.max_retry_cycles {
                inner.tracked.insert(
                    id.clone(),
                    Tracked {
                        priority,
                        scheduled_at: Instant::now(),
                        retry: retry.clone(),
                        paused: true,
                    },
                );
                return RequeueOutcome::Paused {
                    retry_cycle: retry.retry_cycle,
                };
            }

            RequeueOutcome::Cooldown {
                retry_cycle: retry.retry_cycle,
                delay: self.policy.max_delay,
            }
        } else {
            let exp = retry.retry_count.saturating_sub(1);
            let delay = self
                .policy
                .initial_delay
                .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
                .min(self.policy.max_delay);
            RequeueOutcome::Retry {
                retry_count: retry.retry_count,
                delay,
            }
        };

        let delay = match &outcome {
            RequeueOutcome::Retry { delay, .. } => *delay,
            RequeueOutcome::Cooldown { delay, .. } => *delay,
            RequeueOutcome::Paused { .. } => unreachable!("handled above"),
        };

        let scheduled_at = Instant::now() + delay;
        inner.tracked.insert(
            id.clone(),
            Tracked {
                priority,
                scheduled_at,
                retry,
                paused: false,
            },
        );
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.heap.push(HeapEntry {
            id: id.clone(),
            priority,
            scheduled_at,
            sequence,
        });
        self.not_empty.notify_one();
        outcome
    }

    /// Clears pause state and retry state (spec.md open question: current
    /// behavior resets both `retryCount` and `retryCycle` on resume) and
    /// re-enqueues.
    pub fn resume(&self, id: &WorkItemId, priority: i64) {
        {
            let mut inner = self.inner.lock().expect("work queue lock poisoned");
            inner.tracked.remove(id);
        }
        self.enqueue(id.clone(), priority);
    }

    pub fn retry_state(&self, id: &WorkItemId) -> Option<RetryState> {
        let inner = self.inner.lock().expect("work queue lock poisoned");
        inner.tracked.get(id).map(|t| t.retry.clone())
    }

    pub fn is_paused(&self, id: &WorkItemId) -> bool {
        let inner = self.inner.lock().expect("work queue lock poisoned");
        inner.tracked.get(id).map(|t| t.paused).unwrap_or(false)
    }

    /// Unblocks all waiters with `ShuttingDown` so workers exit cleanly.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        inner.shutdown = true;
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("work queue lock poisoned");
        inner.tracked.values().filter(|t| !t.paused).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
