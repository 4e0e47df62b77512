use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rustc_hash::FxHasher;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn, Instrument};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed number of workers, each with its own job queue. Jobs are plain closures that may
///  block: each one runs on tokio's blocking thread pool while its worker waits for it, so a
///  worker processes its jobs strictly one after the other.
///
/// Jobs submitted with the same key always go to the same worker, which keeps them in order.
pub struct WorkerPool {
    queues: Mutex<Vec<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
    next_worker: AtomicUsize,
}

impl WorkerPool {
    pub fn new(num_workers: usize, runtime: &Handle) -> WorkerPool {
        let num_workers = num_workers.max(1);

        let mut queues = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let (send, recv) = mpsc::unbounded_channel();
            queues.push(send);
            workers.push(runtime.spawn(
                worker_loop(recv)
                    .instrument(tracing::debug_span!("worker", worker_id))
            ));
        }
        debug!("started worker pool with {} workers", num_workers);

        WorkerPool {
            queues: Mutex::new(queues),
            workers: Mutex::new(workers),
            num_workers,
            next_worker: AtomicUsize::new(0),
        }
    }

    /// Run a job on the next worker in turn. Returns `false` if the pool is shut down and the job
    ///  was discarded.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.num_workers;
        self.submit(idx, Box::new(job))
    }

    /// Run a job on the worker assigned to `key`, after all jobs previously submitted for the
    ///  same key
    pub fn execute_keyed<K: Hash + ?Sized>(&self, key: &K, job: impl FnOnce() + Send + 'static) -> bool {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.num_workers as u64) as usize;
        self.submit(idx, Box::new(job))
    }

    fn submit(&self, idx: usize, job: Job) -> bool {
        let queues = self.queues.lock().unwrap();
        match queues.get(idx) {
            Some(queue) => queue.send(job).is_ok(),
            None => {
                trace!("worker pool is shut down - discarding job");
                false
            }
        }
    }

    /// Stop accepting jobs and wait for all queued jobs to finish
    pub async fn shutdown(&self) {
        self.queues.lock().unwrap().clear();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        if workers.is_empty() {
            return;
        }

        debug!("shutting down worker pool");
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("worker terminated abnormally: {}", e);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Ok(queues) = self.queues.get_mut() {
            queues.clear();
        }
    }
}

async fn worker_loop(mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        if let Err(e) = tokio::task::spawn_blocking(job).await {
            if e.is_panic() {
                error!("job panicked: {}", e);
            }
            else {
                warn!("job was cancelled: {}", e);
            }
        }
    }
    trace!("job queue closed, worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;
    use tokio::time::timeout;

    fn recorder() -> Arc<Mutex<Vec<u32>>> {
        Default::default()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_keyed_jobs_stay_in_order() {
        let pool = WorkerPool::new(4, &Handle::current());
        let recorded = recorder();

        for i in 0..200 {
            let recorded = recorded.clone();
            assert!(pool.execute_keyed("the key", move || {
                if i % 7 == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
                recorded.lock().unwrap().push(i);
            }));
        }
        pool.shutdown().await;

        assert_eq!(*recorded.lock().unwrap(), (0..200).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_workers_run_concurrently() {
        let pool = WorkerPool::new(2, &Handle::current());
        let barrier = Arc::new(Barrier::new(2));
        let (done_send, mut done_recv) = mpsc::unbounded_channel();

        for _ in 0..2 {
            let barrier = barrier.clone();
            let done_send = done_send.clone();
            pool.execute(move || {
                barrier.wait();
                done_send.send(()).unwrap();
            });
        }

        for _ in 0..2 {
            timeout(Duration::from_secs(5), done_recv.recv()).await.unwrap().unwrap();
        }
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1, &Handle::current());
        let recorded = recorder();

        pool.execute(|| panic!("job failure"));
        let r = recorded.clone();
        pool.execute(move || r.lock().unwrap().push(1));
        pool.shutdown().await;

        assert_eq!(*recorded.lock().unwrap(), vec![1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_drains_and_rejects() {
        let pool = WorkerPool::new(2, &Handle::current());
        let recorded = recorder();

        for i in 0..10 {
            let r = recorded.clone();
            pool.execute(move || {
                std::thread::sleep(Duration::from_millis(2));
                r.lock().unwrap().push(i);
            });
        }
        pool.shutdown().await;
        assert_eq!(recorded.lock().unwrap().len(), 10);

        assert!(!pool.execute(|| {}));
        assert!(!pool.execute_keyed(&1, || {}));
        pool.shutdown().await;
    }
}
