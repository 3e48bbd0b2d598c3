use std::{
    any::Any,
    collections::VecDeque,
    mem,
    num::NonZeroUsize,
    panic,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{error, info};
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TrainErr};

/// The per thread state of a `WorkerPool`.
pub trait TaskHandler<T> {
    /// Processes a single task.
    fn run(&mut self, task: T) -> Result<()>;

    /// Called once the queue is drained, before the thread exits.
    fn terminate(self);
}

struct QueueState<T> {
    tasks: VecDeque<T>,
    closed: bool,
}

/// A bounded multi producer multi consumer queue.
struct TaskQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    poisoned: AtomicBool,
}

impl<T> TaskQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            poisoned: AtomicBool::new(false),
        }
    }

    fn push(&self, task: T) -> Result<()> {
        let mut state = self.state.lock();

        loop {
            if self.poisoned.load(Ordering::Acquire) || state.closed {
                return Err(TrainErr::PoolPoisoned);
            }

            if state.tasks.len() < self.capacity {
                break;
            }

            self.not_full.wait(&mut state);
        }

        state.tasks.push_back(task);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until there is a task, or returns `None` once the queue is closed and
    /// drained or poisoned.
    fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();

        loop {
            if self.poisoned.load(Ordering::Acquire) {
                return None;
            }

            if let Some(task) = state.tasks.pop_front() {
                self.not_full.notify_one();
                return Some(task);
            }

            if state.closed {
                return None;
            }

            self.not_empty.wait(&mut state);
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn poison(&self) {
        let _state = self.state.lock();
        self.poisoned.store(true, Ordering::Release);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// Poisons the queue if the thread holding it unwinds.
struct PanicGuard<'a, T>(&'a TaskQueue<T>);

impl<T> Drop for PanicGuard<'_, T> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("worker thread panicked, poisoning the pool");
            self.0.poison();
        }
    }
}

/// A fixed pool of OS threads processing a bounded queue of tasks.
///
/// Every thread owns a `TaskHandler` created when it starts. A failing handler (an error
/// or a panic) poisons the pool: pending tasks are discarded and `submit` fails from then
/// on.
pub struct WorkerPool<T: Send + 'static> {
    queue: Arc<TaskQueue<T>>,
    threads: Vec<JoinHandle<Result<()>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns the pool's threads.
    ///
    /// # Arguments
    /// * `threads` - The amount of threads.
    /// * `capacity` - The amount of pending tasks before `submit` blocks.
    /// * `factory` - Creates the handler of each thread, given the thread's index.
    ///
    /// # Returns
    /// An io error if a thread couldn't be spawned.
    pub fn new<H, F>(threads: NonZeroUsize, capacity: NonZeroUsize, factory: F) -> Result<Self>
    where
        H: TaskHandler<T>,
        F: Fn(usize) -> H + Send + Sync + 'static,
    {
        let queue = Arc::new(TaskQueue::new(capacity.get()));
        let factory = Arc::new(factory);

        let mut pool = Self {
            queue,
            threads: Vec::with_capacity(threads.get()),
        };

        for id in 0..threads.get() {
            let queue = Arc::clone(&pool.queue);
            let factory = Arc::clone(&factory);

            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || work(id, &queue, factory.as_ref()))?;

            pool.threads.push(handle);
        }

        info!(threads = threads.get(), capacity = capacity.get(); "worker pool started");
        Ok(pool)
    }

    /// Enqueues a task, blocking while the queue is full.
    ///
    /// # Returns
    /// `PoolPoisoned` if a worker failed.
    pub fn submit(&self, task: T) -> Result<()> {
        self.queue.push(task)
    }

    pub fn is_poisoned(&self) -> bool {
        self.queue.poisoned.load(Ordering::Acquire)
    }

    /// Drains the queue and joins every thread.
    ///
    /// # Returns
    /// The first error returned by a handler.
    ///
    /// # Panics
    /// Resumes the first panic raised by a handler.
    pub fn join(mut self) -> Result<()> {
        let mut panic = None;
        let mut failure = None;

        for outcome in self.shutdown() {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(payload) => {
                    panic.get_or_insert(payload);
                }
            }
        }

        if let Some(payload) = panic {
            error!("resuming worker panic: {}", panic_message(payload.as_ref()));
            panic::resume_unwind(payload);
        }

        failure.map_or(Ok(()), Err)
    }

    fn shutdown(&mut self) -> Vec<thread::Result<Result<()>>> {
        self.queue.close();
        mem::take(&mut self.threads)
            .into_iter()
            .map(JoinHandle::join)
            .collect()
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.shutdown();
        }
    }
}

fn work<T, H, F>(id: usize, queue: &TaskQueue<T>, factory: &F) -> Result<()>
where
    H: TaskHandler<T>,
    F: Fn(usize) -> H,
{
    let _guard = PanicGuard(queue);
    let mut handler = factory(id);

    while let Some(task) = queue.pop() {
        if let Err(e) = handler.run(task) {
            error!(worker = id; "worker failed: {e}");
            queue.poison();
            return Err(e);
        }
    }

    handler.terminate();
    Ok(())
}

/// Extracts the message of a panic payload for logging.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use std::{panic::AssertUnwindSafe, sync::atomic::AtomicUsize};

    use super::*;

    struct Counter {
        total: Arc<AtomicUsize>,
        local: usize,
        terminated: Arc<AtomicUsize>,
    }

    impl TaskHandler<usize> for Counter {
        fn run(&mut self, task: usize) -> Result<()> {
            match task {
                0 => Err(TrainErr::InvalidConfig("zero".into())),
                13 => panic!("unlucky task"),
                n => {
                    self.local += n;
                    self.total.fetch_add(n, Ordering::SeqCst);
                    Ok(())
                }
            }
        }

        fn terminate(self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(threads: usize) -> (WorkerPool<usize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let total = Arc::new(AtomicUsize::new(0));
        let terminated = Arc::new(AtomicUsize::new(0));

        let (t, d) = (Arc::clone(&total), Arc::clone(&terminated));
        let pool = WorkerPool::new(
            NonZeroUsize::new(threads).unwrap(),
            NonZeroUsize::new(2).unwrap(),
            move |_| Counter {
                total: Arc::clone(&t),
                local: 0,
                terminated: Arc::clone(&d),
            },
        )
        .unwrap();

        (pool, total, terminated)
    }

    #[test]
    fn test_join_drains_the_queue() {
        let (pool, total, terminated) = pool(3);

        for n in 1..=100 {
            pool.submit(n).unwrap();
        }
        pool.join().unwrap();

        assert_eq!(total.load(Ordering::SeqCst), 5050);
        assert_eq!(terminated.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_error_poisons_the_pool() {
        let (pool, _, _) = pool(2);
        pool.submit(0).unwrap();

        while !pool.is_poisoned() {
            thread::yield_now();
        }

        assert!(matches!(pool.submit(1), Err(TrainErr::PoolPoisoned)));
        assert!(matches!(pool.join(), Err(TrainErr::InvalidConfig(_))));
    }

    #[test]
    fn test_join_resumes_worker_panics() {
        let (pool, _, _) = pool(2);
        pool.submit(13).unwrap();

        let payload = panic::catch_unwind(AssertUnwindSafe(|| pool.join())).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "unlucky task");
    }
}
