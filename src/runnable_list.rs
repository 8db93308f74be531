//! Pure insert/remove operations over the runnable list: a doubly-linked
//! list of process queues ordered by ascending `runnable_at`, realized as
//! `Option<ProcessQueueKey>` links resolved through a central map instead of
//! raw pointers (spec.md §4.3, §9 REDESIGN note).

use std::collections::HashMap;
use std::time::Instant;

use crate::process_queue::{ProcessQueue, ProcessQueueKey};

/// Head/tail of the runnable list. Kept alongside the process-queue map
/// rather than inside any single `ProcessQueue`, since the list has no
/// single owning node.
#[derive(Debug, Default, Clone)]
pub struct RunnableListHead {
    pub head: Option<ProcessQueueKey>,
    pub tail: Option<ProcessQueueKey>,
}

/// Unlink `key` from wherever it currently sits. No-op if not linked.
pub fn remove(
    list: &mut RunnableListHead,
    queues: &mut HashMap<ProcessQueueKey, ProcessQueue>,
    key: &ProcessQueueKey,
) {
    let (prev, next) = match queues.get(key) {
        Some(q) if q.in_runnable_list => (q.runnable_at_prev.clone(), q.runnable_at_next.clone()),
        _ => return,
    };

    match &prev {
        Some(prev_key) => {
            if let Some(prev_queue) = queues.get_mut(prev_key) {
                prev_queue.runnable_at_next = next.clone();
            }
        }
        None => list.head = next.clone(),
    }
    match &next {
        Some(next_key) => {
            if let Some(next_queue) = queues.get_mut(next_key) {
                next_queue.runnable_at_prev = prev.clone();
            }
        }
        None => list.tail = prev.clone(),
    }

    if let Some(q) = queues.get_mut(key) {
        q.runnable_at_prev = None;
        q.runnable_at_next = None;
        q.in_runnable_list = false;
    }
}

/// Insert `key` in ascending-`runnable_at` order, scanning from the tail
/// (new entries usually sort near the end: freshly-enqueued work).
/// Callers must pass the queue's just-computed `runnable_at`; this module
/// never recomputes it.
pub fn insert_sorted(
    list: &mut RunnableListHead,
    queues: &mut HashMap<ProcessQueueKey, ProcessQueue>,
    key: &ProcessQueueKey,
    runnable_at: Instant,
) {
    remove(list, queues, key);

    let mut cursor = list.tail.clone();
    while let Some(cursor_key) = &cursor {
        let cursor_runnable_at = queues
            .get(cursor_key)
            .and_then(|q| q.runnable_at_cache)
            .map(|(at, _)| at)
            .unwrap_or(runnable_at);
        if cursor_runnable_at <= runnable_at {
            break;
        }
        cursor = queues.get(cursor_key).and_then(|q| q.runnable_at_prev.clone());
    }

    match cursor {
        None => {
            // Goes at the head.
            let old_head = list.head.clone();
            if let Some(old_head_key) = &old_head {
                if let Some(q) = queues.get_mut(old_head_key) {
                    q.runnable_at_prev = Some(key.clone());
                }
            } else {
                list.tail = Some(key.clone());
            }
            if let Some(q) = queues.get_mut(key) {
                q.runnable_at_prev = None;
                q.runnable_at_next = old_head;
                q.in_runnable_list = true;
            }
            list.head = Some(key.clone());
        }
        Some(after_key) => {
            let after_next = queues.get(&after_key).and_then(|q| q.runnable_at_next.clone());
            if let Some(after_next_key) = &after_next {
                if let Some(q) = queues.get_mut(after_next_key) {
                    q.runnable_at_prev = Some(key.clone());
                }
            } else {
                list.tail = Some(key.clone());
            }
            if let Some(q) = queues.get_mut(&after_key) {
                q.runnable_at_next = Some(key.clone());
            }
            if let Some(q) = queues.get_mut(key) {
                q.runnable_at_prev = Some(after_key);
                q.runnable_at_next = after_next;
                q.in_runnable_list = true;
            }
        }
    }
}

/// Walk the list head-to-tail, returning keys in ascending-`runnable_at`
/// order. Used by the dispatcher's update pass and the health check.
pub fn iter_ordered(
    list: &RunnableListHead,
    queues: &HashMap<ProcessQueueKey, ProcessQueue>,
) -> Vec<ProcessQueueKey> {
    let mut out = Vec::new();
    let mut cursor = list.head.clone();
    while let Some(key) = cursor {
        cursor = queues.get(&key).and_then(|q| q.runnable_at_next.clone());
        out.push(key);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_queue::RunnableAtReason;
    use crate::record::Uid;
    use std::time::Duration;

    fn key(name: &str) -> ProcessQueueKey {
        ProcessQueueKey {
            uid: Uid(1000),
            process_name: name.to_string(),
        }
    }

    fn insert_at(
        list: &mut RunnableListHead,
        queues: &mut HashMap<ProcessQueueKey, ProcessQueue>,
        name: &str,
        base: Instant,
        offset_secs: u64,
    ) {
        let k = key(name);
        queues.entry(k.clone()).or_insert_with(|| ProcessQueue::new(k.clone()));
        let at = base + Duration::from_secs(offset_secs);
        queues.get_mut(&k).unwrap().runnable_at_cache = Some((at, RunnableAtReason::Normal));
        insert_sorted(list, queues, &k, at);
    }

    #[test]
    fn inserts_maintain_ascending_order() {
        let mut list = RunnableListHead::default();
        let mut queues = HashMap::new();
        let base = Instant::now();

        insert_at(&mut list, &mut queues, "c", base, 30);
        insert_at(&mut list, &mut queues, "a", base, 10);
        insert_at(&mut list, &mut queues, "b", base, 20);

        let ordered = iter_ordered(&list, &queues);
        assert_eq!(
            ordered.iter().map(|k| k.process_name.clone()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn remove_unlinks_and_fixes_head_and_tail() {
        let mut list = RunnableListHead::default();
        let mut queues = HashMap::new();
        let base = Instant::now();

        insert_at(&mut list, &mut queues, "a", base, 10);
        insert_at(&mut list, &mut queues, "b", base, 20);
        insert_at(&mut list, &mut queues, "c", base, 30);

        remove(&mut list, &mut queues, &key("b"));

        let ordered = iter_ordered(&list, &queues);
        assert_eq!(
            ordered.iter().map(|k| k.process_name.clone()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        assert!(!queues[&key("b")].in_runnable_list);
        assert_eq!(list.head, Some(key("a")));
        assert_eq!(list.tail, Some(key("c")));
    }

    #[test]
    fn reposition_moves_entry_without_duplicating_it() {
        let mut list = RunnableListHead::default();
        let mut queues = HashMap::new();
        let base = Instant::now();

        insert_at(&mut list, &mut queues, "a", base, 10);
        insert_at(&mut list, &mut queues, "b", base, 20);
        // "a" becomes runnable later than "b".
        insert_at(&mut list, &mut queues, "a", base, 30);

        let ordered = iter_ordered(&list, &queues);
        assert_eq!(
            ordered.iter().map(|k| k.process_name.clone()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
    }

    #[test]
    fn remove_of_sole_entry_empties_the_list() {
        let mut list = RunnableListHead::default();
        let mut queues = HashMap::new();
        let base = Instant::now();
        insert_at(&mut list, &mut queues, "a", base, 0);

        remove(&mut list, &mut queues, &key("a"));

        assert!(list.head.is_none());
        assert!(list.tail.is_none());
    }
}
