//! Priority work queue feeding the worker pool.
//!
//! Dispatch prefers the highest non-empty tier, but every
//! [`FAIRNESS_INTERVAL`]th dispatch while lower tiers are waiting takes the
//! oldest lower-tier job instead, so a steady stream of high-priority work
//! cannot starve everything else.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use super::job::Priority;

pub const FAIRNESS_INTERVAL: u32 = 4;

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub job_type: String,
    pub payload: Value,
    seq: u64,
}

#[derive(Default)]
struct Tiers {
    // Indexed high, normal, low.
    queues: [VecDeque<QueuedJob>; 3],
    next_seq: u64,
    streak: u32,
    closed: bool,
}

fn tier(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

impl Tiers {
    fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn take(&mut self) -> Option<QueuedJob> {
        let top = self.queues.iter().position(|q| !q.is_empty())?;
        let lower_waiting = self.queues[top + 1..].iter().any(|q| !q.is_empty());

        if lower_waiting && self.streak + 1 >= FAIRNESS_INTERVAL {
            self.streak = 0;
            let oldest = (top + 1..self.queues.len())
                .filter_map(|i| self.queues[i].front().map(|j| (j.seq, i)))
                .min()
                .map(|(_, i)| i)?;
            return self.queues[oldest].pop_front();
        }

        self.streak = if lower_waiting { self.streak + 1 } else { 0 };
        self.queues[top].pop_front()
    }
}

/// Blocking multi-producer multi-consumer queue of pending jobs.
#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<Tiers>,
    ready: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job. Returns false if the queue has been closed.
    pub fn push(&self, job_id: String, job_type: String, payload: Value, priority: Priority) -> bool {
        let mut tiers = self.inner.lock();
        if tiers.closed {
            return false;
        }
        let seq = tiers.next_seq;
        tiers.next_seq += 1;
        tiers.queues[tier(priority)].push_back(QueuedJob {
            job_id,
            job_type,
            payload,
            seq,
        });
        drop(tiers);
        self.ready.notify_one();
        true
    }

    /// Block until a job is available. Returns `None` once the queue is closed.
    pub fn pop(&self) -> Option<QueuedJob> {
        let mut tiers = self.inner.lock();
        loop {
            if tiers.closed {
                return None;
            }
            if let Some(job) = tiers.take() {
                return Some(job);
            }
            self.ready.wait(&mut tiers);
        }
    }

    /// Drop a queued job. Returns true if it was still waiting.
    pub fn remove(&self, job_id: &str) -> bool {
        let mut tiers = self.inner.lock();
        for queue in tiers.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|j| j.job_id == job_id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Close the queue, wake every worker and return whatever was still
    /// waiting.
    pub fn close(&self) -> Vec<QueuedJob> {
        let mut tiers = self.inner.lock();
        tiers.closed = true;
        let drained: Vec<QueuedJob> = tiers.queues.iter_mut().flat_map(|q| q.drain(..)).collect();
        drop(tiers);
        self.ready.notify_all();
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn push(queue: &WorkQueue, id: &str, priority: Priority) {
        assert!(queue.push(id.to_string(), "t".to_string(), Value::Null, priority));
    }

    fn drain(queue: &WorkQueue, n: usize) -> Vec<String> {
        (0..n).map(|_| queue.pop().unwrap().job_id).collect()
    }

    #[test]
    fn test_fifo_within_tier() {
        let queue = WorkQueue::new();
        for id in ["a", "b", "c"] {
            push(&queue, id, Priority::Normal);
        }
        assert_eq!(drain(&queue, 3), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_high_priority_first() {
        let queue = WorkQueue::new();
        push(&queue, "n1", Priority::Normal);
        push(&queue, "l1", Priority::Low);
        push(&queue, "h1", Priority::High);
        assert_eq!(drain(&queue, 3), vec!["h1", "n1", "l1"]);
    }

    #[test]
    fn test_every_fourth_dispatch_serves_lower_tier() {
        let queue = WorkQueue::new();
        push(&queue, "n1", Priority::Normal);
        push(&queue, "l1", Priority::Low);
        for i in 0..6 {
            push(&queue, &format!("h{i}"), Priority::High);
        }
        // Three high, then the oldest lower-tier job (n1 predates l1).
        assert_eq!(drain(&queue, 4), vec!["h0", "h1", "h2", "n1"]);
        assert_eq!(drain(&queue, 4), vec!["h3", "h4", "h5", "l1"]);
    }

    #[test]
    fn test_remove_queued_job() {
        let queue = WorkQueue::new();
        push(&queue, "a", Priority::Normal);
        push(&queue, "b", Priority::Low);
        assert!(queue.remove("b"));
        assert!(!queue.remove("b"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_close_wakes_blocked_workers() {
        let queue = Arc::new(WorkQueue::new());
        let worker = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pop())
        };
        std::thread::sleep(Duration::from_millis(50));
        push(&queue, "x", Priority::Normal);
        std::thread::sleep(Duration::from_millis(50));
        let got = worker.join().unwrap();
        assert_eq!(got.map(|j| j.job_id), Some("x".to_string()));

        push(&queue, "left-behind", Priority::Normal);
        let drained = queue.close();
        assert_eq!(drained.len(), 1);
        assert!(queue.pop().is_none());
        assert!(!queue.push("y".into(), "t".into(), Value::Null, Priority::High));
    }
}
