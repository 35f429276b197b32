// src/queue.rs
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// A unit of deferred work: a callback plus an optional cleanup.
///
/// The cleanup runs exactly once, after the callback finishes or panics,
/// or when an unexecuted task is dropped.
struct Task {
    callback: Option<TaskFn>,
    cleanup: Option<TaskFn>,
}

impl Task {
    fn run(mut self) {
        if let Some(callback) = self.callback.take() {
            let _ = panic::catch_unwind(AssertUnwindSafe(callback));
        }
        if let Some(cleanup) = self.cleanup.take() {
            let _ = panic::catch_unwind(AssertUnwindSafe(cleanup));
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            let _ = panic::catch_unwind(AssertUnwindSafe(cleanup));
        }
    }
}

struct QueueInner {
    tasks: VecDeque<Task>,
    suspended: bool,
    quit: bool,
}

struct QueueShared {
    inner: Mutex<QueueInner>,
    wake: Condvar,
}

/// Suspendable FIFO task pool executed by a fixed set of worker threads.
///
/// A fresh queue is suspended: workers are up but block until `resume`.
/// Tasks execute in submission order; the pop is serialized under the list
/// lock, so task N is dequeued no later than task N+1.
pub struct WorkQueue {
    shared: Arc<QueueShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new(worker_count: usize) -> Self {
        let shared = Arc::new(QueueShared {
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                suspended: true,
                quit: false,
            }),
            wake: Condvar::new(),
        });

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let shared = shared.clone();
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();
            let handle = thread::Builder::new()
                .name(format!("nocturne-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if !core_affinity::set_for_current(id) {
                            eprintln!("nocturne: worker {} failed to pin to CPU {}", i, id.id);
                        }
                    }
                    worker_loop(&shared);
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Self { shared, workers }
    }

    /// Wake all workers and let them pick up tasks.
    pub fn resume(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.suspended {
            inner.suspended = false;
            self.shared.wake.notify_all();
        }
    }

    /// Stop workers from starting new tasks. A task already running is not
    /// cancelled.
    pub fn suspend(&self) {
        self.shared.inner.lock().unwrap().suspended = true;
    }

    pub fn add_task<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Task {
            callback: Some(Box::new(callback)),
            cleanup: None,
        });
    }

    pub fn add_task_with_cleanup<F, C>(&self, callback: F, cleanup: C)
    where
        F: FnOnce() + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.push(Task {
            callback: Some(Box::new(callback)),
            cleanup: Some(Box::new(cleanup)),
        });
    }

    fn push(&self, task: Task) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.tasks.push_back(task);
        let running = !inner.suspended;
        drop(inner);
        if running {
            self.shared.wake.notify_one();
        }
    }

    /// Number of pending (not yet started) tasks. Blocks concurrent
    /// mutation of the list while counting.
    pub fn task_count(&self) -> usize {
        self.shared.inner.lock().unwrap().tasks.len()
    }

    /// Tear the queue down, joining every worker thread.
    ///
    /// With tasks still pending the queue is handed back untouched so the
    /// caller can drain or discard the work first.
    pub fn destroy(mut self) -> Result<(), WorkQueue> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.tasks.is_empty() {
                drop(inner);
                return Err(self);
            }
            inner.quit = true;
        }
        self.shared.wake.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shared.inner.lock().unwrap().quit = true;
        self.shared.wake.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &QueueShared) {
    let mut inner = shared.inner.lock().unwrap();
    loop {
        if inner.quit {
            return;
        }
        if inner.suspended || inner.tasks.is_empty() {
            inner = shared.wake.wait(inner).unwrap();
            continue;
        }
        let task = match inner.tasks.pop_front() {
            Some(task) => task,
            None => continue,
        };
        drop(inner);
        task.run();
        inner = shared.inner.lock().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn fresh_queue_is_suspended() {
        let queue = WorkQueue::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        queue.add_task(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(queue.task_count(), 1);

        queue.resume();
        assert!(wait_until(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(queue.task_count(), 0);
    }

    #[test]
    fn tasks_run_in_submission_order() {
        let queue = WorkQueue::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            queue.add_task(move || {
                order.lock().unwrap().push(i);
            });
        }
        queue.resume();
        assert!(wait_until(Duration::from_secs(2), || {
            order.lock().unwrap().len() == 10
        }));
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn suspend_halts_new_tasks() {
        let queue = WorkQueue::new(1);
        queue.resume();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        queue.add_task(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_until(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) == 1
        }));

        queue.suspend();
        let h = hits.clone();
        queue.add_task(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        queue.resume();
        assert!(wait_until(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) == 2
        }));
    }

    #[test]
    fn destroy_with_pending_tasks_fails() {
        let queue = WorkQueue::new(1);
        queue.add_task(|| {});

        // still suspended, the task cannot have started
        let queue = queue.destroy().expect_err("destroy must refuse pending work");
        assert_eq!(queue.task_count(), 1);

        queue.resume();
        assert!(wait_until(Duration::from_secs(2), || queue.task_count() == 0));
        // give the worker a moment to finish the in-flight task
        thread::sleep(Duration::from_millis(50));
        assert!(queue.destroy().is_ok());
    }

    #[test]
    fn cleanup_runs_after_panicking_callback() {
        let queue = WorkQueue::new(1);
        let cleaned = Arc::new(AtomicUsize::new(0));
        let c = cleaned.clone();
        queue.add_task_with_cleanup(
            || panic!("task blew up"),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        queue.resume();
        assert!(wait_until(Duration::from_secs(2), || {
            cleaned.load(Ordering::SeqCst) == 1
        }));
    }

    #[test]
    fn dropped_task_still_gets_cleanup() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let c = cleaned.clone();
        {
            let queue = WorkQueue::new(1);
            queue.add_task_with_cleanup(
                || {},
                move || {
                    c.fetch_add(1, Ordering::SeqCst);
                },
            );
            // never resumed, the pending task dies with the queue
        }
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }
}
