//! Work queue retry/pause state machine end to end (P3, P4): a work item
//! identified by `(namespace, name)` is tracked at most once, and repeated
//! failures walk Retry -> Cooldown -> Paused exactly as spec.md §4.3 defines.

use kubetemplater::queue::{RequeueOutcome, RetryPolicy, WorkQueue};

fn item(ns: &str, name: &str) -> (String, String) {
    (ns.to_string(), name.to_string())
}

#[test]
fn duplicate_enqueues_of_the_same_item_do_not_create_duplicate_entries() {
    let queue = WorkQueue::new(RetryPolicy::default());
    let id = item("team-a", "tpl-1");

    queue.enqueue(id.clone(), 1);
    queue.enqueue(id.clone(), 1);
    queue.enqueue(id.clone(), 1);

    assert_eq!(queue.len(), 1);
}

#[test]
fn a_higher_priority_enqueue_is_never_dropped_by_a_lower_priority_merge() {
    let queue = WorkQueue::new(RetryPolicy::default());
    let id = item("team-a", "tpl-1");

    queue.enqueue(id.clone(), 1);
    queue.enqueue(id.clone(), 10);

    match queue.dequeue_blocking() {
        kubetemplater::queue::DequeueResult::Item(got) => assert_eq!(got, id),
        kubetemplater::queue::DequeueResult::ShuttingDown => panic!("queue should not be shutting down"),
    }
}

#[test]
fn repeated_failures_walk_retry_then_cooldown_then_paused() {
    let policy = RetryPolicy {
        max_retries: 2,
        initial_delay: std::time::Duration::from_millis(0),
        max_delay: std::time::Duration::from_secs(1),
        max_retry_cycles: 1,
    };
    let queue = WorkQueue::new(policy);
    let id = item("team-a", "tpl-1");

    // Attempt 1 and 2: plain Retry.
    assert!(matches!(queue.requeue(&id, 0), RequeueOutcome::Retry { retry_count: 1, .. }));
    assert!(matches!(queue.requeue(&id, 0), RequeueOutcome::Retry { retry_count: 2, .. }));

    // Attempt 3 exceeds max_retries=2: rolls into Cooldown, retry_count resets.
    let outcome = queue.requeue(&id, 0);
    assert!(matches!(outcome, RequeueOutcome::Cooldown { retry_cycle: 1, .. }));

    // Exhaust the single retry cycle allowed: next overflow is Paused.
    assert!(matches!(queue.requeue(&id, 0), RequeueOutcome::Retry { .. }));
    assert!(matches!(queue.requeue(&id, 0), RequeueOutcome::Retry { .. }));
    let final_outcome = queue.requeue(&id, 0);
    assert!(matches!(final_outcome, RequeueOutcome::Paused { .. }));
    assert!(queue.is_paused(&id));
}

#[test]
fn a_paused_item_does_not_re_enter_the_queue_until_resumed() {
    let policy = RetryPolicy {
        max_retries: 0,
        initial_delay: std::time::Duration::from_millis(0),
        max_delay: std::time::Duration::from_secs(1),
        max_retry_cycles: 1,
    };
    let queue = WorkQueue::new(policy);
    let id = item("team-a", "tpl-1");

    assert!(matches!(queue.requeue(&id, 0), RequeueOutcome::Cooldown { retry_cycle: 1, .. }));
    let outcome = queue.requeue(&id, 0);
    assert!(matches!(outcome, RequeueOutcome::Paused { retry_cycle: 2 }));
    assert!(queue.is_paused(&id));

    queue.enqueue(id.clone(), 5);
    assert!(queue.is_paused(&id), "enqueue must not override a paused item");

    queue.resume(&id, 5);
    assert!(!queue.is_paused(&id));
    assert_eq!(queue.retry_state(&id).map(|s| (s.retry_count, s.retry_cycle)), Some((0, 0)));
}
