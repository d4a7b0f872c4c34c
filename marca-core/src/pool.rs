//! Fixed-capacity thread pool used by the sync finder and speed detector.
//!
//! Workers share one FIFO queue behind a mutex; there is no work stealing,
//! no priorities and no cancellation. Callers enqueue coarse jobs with
//! [`ThreadPool::add_job`] and synchronize with [`ThreadPool::wait_all`],
//! which blocks until every enqueued job has finished. Jobs publish results
//! by appending to a shared vector under a short mutex; ordering is
//! restored afterwards by sorting.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    active: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    job_ready: Condvar,
    jobs_done: Condvar,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Pool sized to the available hardware concurrency.
    pub fn new() -> Self {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_threads(n)
    }

    /// Pool with an explicit worker count (at least one).
    pub fn with_threads(n_threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                active: 0,
                shutdown: false,
            }),
            job_ready: Condvar::new(),
            jobs_done: Condvar::new(),
        });

        let workers = (0..n_threads.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(&shared))
            })
            .collect();

        Self { shared, workers }
    }

    pub fn n_threads(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue a job; it may run on any worker.
    pub fn add_job<F: FnOnce() + Send + 'static>(&self, f: F) {
        let mut state = self.shared.state.lock().expect("pool mutex poisoned");
        state.queue.push_back(Box::new(f));
        drop(state);
        self.shared.job_ready.notify_one();
    }

    /// Block until all currently enqueued jobs have completed.
    ///
    /// Jobs must not enqueue further jobs they expect this wait to cover.
    pub fn wait_all(&self) {
        let mut state = self.shared.state.lock().expect("pool mutex poisoned");
        while !state.queue.is_empty() || state.active > 0 {
            state = self
                .shared
                .jobs_done
                .wait(state)
                .expect("pool mutex poisoned");
        }
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            state.shutdown = true;
        }
        self.shared.job_ready.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut state = shared.state.lock().expect("pool mutex poisoned");
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.active += 1;
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = shared.job_ready.wait(state).expect("pool mutex poisoned");
            }
        };

        job();

        let mut state = shared.state.lock().expect("pool mutex poisoned");
        state.active -= 1;
        if state.queue.is_empty() && state.active == 0 {
            shared.jobs_done.notify_all();
        }
    }
}

/// Partition `jobs` into batch sizes that keep the pool saturated.
///
/// While many jobs remain, full batches of `threads` are emitted. Once the
/// remainder lands in `(threads, 2 * threads]`, it is split in half so the
/// final batch still uses most of the pool instead of leaving a short tail
/// where only a few threads work.
///
/// ```
/// use marca_core::pool::split_jobs;
/// assert_eq!(split_jobs(65, 32), vec![32, 17, 16]);
/// assert_eq!(split_jobs(36, 32), vec![18, 18]);
/// assert_eq!(split_jobs(5, 32), vec![5]);
/// ```
pub fn split_jobs(jobs: usize, threads: usize) -> Vec<usize> {
    let threads = threads.max(1);
    let mut remaining = jobs;
    let mut batches = Vec::new();
    let mut push = |batches: &mut Vec<usize>, n: usize| {
        if n > 0 {
            batches.push(n);
        }
    };

    while remaining > 2 * threads {
        push(&mut batches, threads);
        remaining -= threads;
    }
    if remaining > threads {
        let half = remaining.div_ceil(2);
        push(&mut batches, half);
        remaining -= half;
    }
    push(&mut batches, remaining);

    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_all_jobs() {
        let pool = ThreadPool::with_threads(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            pool.add_job(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_all();
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn wait_all_is_a_barrier() {
        let pool = ThreadPool::with_threads(2);
        let results = Arc::new(Mutex::new(Vec::new()));
        for round in 0..3 {
            for i in 0..8 {
                let results = Arc::clone(&results);
                pool.add_job(move || {
                    std::thread::sleep(std::time::Duration::from_millis(i % 3));
                    results.lock().unwrap().push(round);
                });
            }
            pool.wait_all();
        }
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 24);
        // every round must be fully flushed before the next one starts
        for (i, &round) in results.iter().enumerate() {
            assert_eq!(round, i / 8);
        }
    }

    #[test]
    fn wait_all_with_no_jobs_returns() {
        let pool = ThreadPool::with_threads(3);
        pool.wait_all();
        pool.wait_all();
    }

    #[test]
    fn single_thread_pool_works() {
        let pool = ThreadPool::with_threads(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.add_job(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_all();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn split_jobs_examples() {
        assert_eq!(split_jobs(65, 32), vec![32, 17, 16]);
        assert_eq!(split_jobs(36, 32), vec![18, 18]);
        assert_eq!(split_jobs(5, 32), vec![5]);
        assert_eq!(split_jobs(33, 32), vec![17, 16]);
        assert_eq!(split_jobs(64, 32), vec![32, 32]);
        assert_eq!(split_jobs(0, 32), Vec::<usize>::new());
    }

    #[test]
    fn split_jobs_invariants() {
        for jobs in 0..200 {
            for threads in 1..40 {
                let batches = split_jobs(jobs, threads);
                assert_eq!(batches.iter().sum::<usize>(), jobs, "sum for {jobs}/{threads}");
                assert!(
                    batches.iter().all(|&b| b <= threads),
                    "batch over thread count for {jobs}/{threads}"
                );
                if jobs > 2 * threads {
                    let full = batches.iter().take_while(|&&b| b == threads).count();
                    assert!(full >= (jobs - 2 * threads).div_ceil(threads));
                    assert!(batches.len() <= full + 2);
                }
            }
        }
    }
}
