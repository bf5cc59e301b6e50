use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake};
use std::thread::{self, Thread};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::{ExecutorError, Result};

/// A parker implementation that enables blocking a thread until a wake signal is received.
/// Worker threads use it to drive phase futures to completion.
pub struct Parker {
    thread: Thread,
    parked: AtomicBool,
}

impl Parker {
    /// Creates a new Parker instance wrapped in an Arc.
    ///
    /// The parker starts in a parked state to ensure any wakeups that occur
    /// between polling and parking are not missed.
    pub fn new() -> Arc<Self> {
        Arc::new(Parker {
            thread: thread::current(),
            // start off as parked to ensure wakeups are seen in between polling and parking
            parked: AtomicBool::new(true),
        })
    }

    pub fn block_on<F>(self: &Arc<Self>, fut: F) -> F::Output
    where
        F: Future,
    {
        self.parked.store(true, Ordering::Relaxed);

        let waker = self.clone().into();
        let mut cx = Context::from_waker(&waker);

        let mut fut = pin!(fut);
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(res) => break res,
                Poll::Pending => {
                    while self.parked.swap(true, Ordering::Acquire) {
                        thread::park();
                    }
                }
            }
        }
    }
}

impl Wake for Parker {
    fn wake(self: Arc<Self>) {
        if self.parked.swap(false, Ordering::Release) {
            self.thread.unpark();
        }
    }
}

/// The bounded worker pool that runs authenticator and transaction phases.
///
/// - Threads are spawned on demand up to `max_workers`
/// - Idle workers exit after the keep-alive period
/// - Queued tasks are handed to idle workers through a condition variable
///
/// Submitting never blocks the caller beyond the queue lock.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    /// Duration a worker thread will wait for new tasks before shutting down
    keep_alive: Duration,
    shared: Mutex<Shared>,
    max_workers: usize,
    condvar: Condvar,
}

struct Shared {
    queue: VecDeque<BoxFuture<'static, ()>>,
    /// Current number of worker threads
    workers: usize,
    /// Number of idle worker threads
    idle: usize,
    /// Number of workers that have been notified of new work
    notified: usize,
}

impl Executor {
    /// Creates a new executor with the specified configuration.
    ///
    /// # Arguments
    /// * `max_workers` - Optional maximum number of worker threads. Defaults to 15 * CPU cores
    /// * `keep_alive` - Optional duration workers will wait for new tasks. Defaults to 6 seconds
    pub fn new(max_workers: Option<usize>, keep_alive: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    notified: 0,
                }),
                condvar: Condvar::new(),
                keep_alive: keep_alive.unwrap_or_else(|| Duration::from_secs(6)),
                max_workers: max_workers.unwrap_or_else(|| num_cpus::get() * 15).max(1),
            }),
        }
    }

    /// Queues a task, waking an idle worker or spawning a new one if needed.
    ///
    /// # Errors
    /// Returns an error if the queue lock is poisoned. A failed thread spawn
    /// is only an error when no worker exists to pick the task up.
    pub fn execute<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shared = self
            .inner
            .shared
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;

        shared.queue.push_back(Box::pin(fut));

        if shared.idle == 0 && shared.workers < self.inner.max_workers {
            shared.workers += 1;
            if let Err(e) = self.spawn_worker() {
                shared.workers -= 1;
                if shared.workers == 0 {
                    shared.queue.pop_back();
                    return Err(e);
                }
                log::warn!("running without an extra worker: {}", e);
            }
        } else if shared.idle > 0 {
            shared.idle -= 1;
            shared.notified += 1;
            self.inner.condvar.notify_one();
        }
        Ok(())
    }

    /// Number of live worker threads.
    pub fn workers(&self) -> Result<usize> {
        let shared = self
            .inner
            .shared
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;
        Ok(shared.workers)
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    fn spawn_worker(&self) -> Result<()> {
        let inner = self.inner.clone();
        thread::Builder::new()
            .name("switchyard-worker".to_owned())
            .spawn(move || {
                if let Err(e) = inner.run() {
                    log::error!("Worker thread error: {}", e);
                }
            })
            .map_err(ExecutorError::ThreadSpawn)?;
        Ok(())
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl Inner {
    /// Main worker thread loop.
    ///
    /// The worker will:
    /// 1. Process all available tasks in the queue
    /// 2. Wait for new tasks using a condition variable
    /// 3. Exit if no tasks arrive within the keep-alive duration
    fn run(&self) -> Result<()> {
        let parker = Parker::new();
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;

        'alive: loop {
            while let Some(task) = shared.queue.pop_front() {
                drop(shared);
                run_task(&parker, task);
                shared = self
                    .shared
                    .lock()
                    .map_err(|_| ExecutorError::LockPoisoned)?;
            }

            shared.idle += 1;

            loop {
                let result = self
                    .condvar
                    .wait_timeout(shared, self.keep_alive)
                    .map_err(|_| ExecutorError::LockPoisoned)?;

                shared = result.0;
                let timeout = result.1;

                if shared.notified != 0 {
                    shared.notified -= 1;
                    continue 'alive;
                }

                if timeout.timed_out() {
                    break 'alive;
                }
            }
        }

        shared.workers -= 1;
        shared.idle -= 1;
        Ok(())
    }
}

fn run_task(parker: &Arc<Parker>, task: Pin<Box<dyn Future<Output = ()> + Send>>) {
    if panic::catch_unwind(AssertUnwindSafe(|| parker.block_on(task))).is_err() {
        log::error!("worker task panicked");
    }
}
