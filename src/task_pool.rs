use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::log::LogDebug;

type Task = Box<dyn FnOnce() + Send>;

struct DelayedTask {
    run_at: Instant,
    seq: u64,
    task: Task,
}

// BinaryHeap is a max-heap; invert so the earliest deadline pops first.
// `seq` keeps same-instant tasks in submission order.
impl Ord for DelayedTask {
    fn cmp(&self, other: &DelayedTask) -> Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &DelayedTask) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &DelayedTask) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

struct PoolState {
    queue: BinaryHeap<DelayedTask>,
    next_seq: u64,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Small worker pool running delayed closures: the async-callback timeout
/// fallback and the periodic status/checkpoint task. Sized for tens of
/// outstanding tasks; tasks are expected to be short.
pub struct TaskPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    pub fn new(worker_count: usize) -> TaskPool {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                queue: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let inner = Arc::clone(&inner);
            workers.push(
                thread::Builder::new()
                    .name(format!("replog-timer-{}", i))
                    .spawn(move || worker_loop(inner))
                    .expect("spawn timer worker"),
            );
        }
        TaskPool {
            inner,
            workers: Mutex::new(workers),
        }
    }

    pub fn delay_task<F: FnOnce() + Send + 'static>(&self, delay: Duration, f: F) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            log!(LogDebug, "dropping task scheduled after shutdown");
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(DelayedTask {
            run_at: Instant::now() + delay,
            seq,
            task: Box::new(f),
        });
        drop(state);
        self.inner.available.notify_one();
    }

    /// Stops the workers. Tasks not yet due are dropped without running.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.queue.clear();
        }
        self.inner.available.notify_all();
        let workers = std::mem::replace(&mut *self.workers.lock().unwrap(), Vec::new());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum NextAction {
    Run,
    Wait(Duration),
    Idle,
}

fn worker_loop(inner: Arc<PoolInner>) {
    let mut state = inner.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        let action = match state.queue.peek() {
            Some(head) if head.run_at <= now => NextAction::Run,
            Some(head) => NextAction::Wait(head.run_at - now),
            None => NextAction::Idle,
        };
        match action {
            NextAction::Run => {
                let task = state.queue.pop().unwrap().task;
                drop(state);
                task();
                state = inner.state.lock().unwrap();
            }
            NextAction::Wait(wait) => {
                let (guard, _) = inner.available.wait_timeout(state, wait).unwrap();
                state = guard;
            }
            NextAction::Idle => {
                state = inner.available.wait(state).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc;

    #[test]
    fn tasks_run_after_their_delay() {
        let pool = TaskPool::new(2);
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        pool.delay_task(Duration::from_millis(50), move || {
            tx.send(start.elapsed()).unwrap();
        });
        let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(elapsed >= Duration::from_millis(50));
    }

    #[test]
    fn earlier_deadline_runs_first() {
        let pool = TaskPool::new(1);
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        pool.delay_task(Duration::from_millis(80), move || {
            tx.send("late").unwrap();
        });
        pool.delay_task(Duration::from_millis(20), move || {
            tx2.send("early").unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
    }

    #[test]
    fn shutdown_drops_pending_tasks() {
        let pool = TaskPool::new(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        pool.delay_task(Duration::from_secs(3600), move || {
            fired2.fetch_add(1, AtomicOrdering::SeqCst);
        });
        pool.shutdown();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }
}
