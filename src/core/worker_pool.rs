//! Bounded Worker Pool
//!
//! Fixed-size thread pool backing the event bus async dispatch path.
//! Shutdown drains the queue before joining the workers.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    condvar: Condvar,
    stop: AtomicBool,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(num_threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("hostshield-dispatch-{}", i))
                .spawn(move || worker_loop(&shared));
            match handle {
                Ok(h) => workers.push(h),
                Err(e) => log::error!("Failed to spawn dispatch worker: {}", e),
            }
        }

        Self { shared, workers }
    }

    pub fn submit<F: FnOnce() + Send + 'static>(&self, job: F) {
        self.shared.queue.lock().push_back(Box::new(job));
        self.shared.condvar.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Drain all pending jobs, then join the workers.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.condvar.notify_all();

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.join() {
                log::error!("Dispatch worker panicked during shutdown: {:?}", e);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if shared.stop.load(Ordering::SeqCst) {
                    return;
                }
                shared.condvar.wait(&mut queue);
            }
        };
        job();
    }
}
