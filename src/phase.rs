//! The two-phase asynchronous pipeline.
//!
//! A phase suspends the logical request on the I/O task, runs blocking work
//! on the worker pool and resumes the request when the work signals
//! completion. Each run borrows a [`PhaseTask`] from its pool:
//!
//! ```text
//! Idle -> Initialized -> Running -> Completed | TimedOut | Failed
//! ```
//!
//! The request wrapper travels to the worker and back through a oneshot
//! channel. If the phase deadline passes first, the caller answers `503`
//! and the worker, which still owns the wrapper, recycles it when it
//! notices nobody is waiting. Either way the wrapper and the task are each
//! recycled exactly once, by whoever holds them last.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{ResourceError, RouterError, RouterResult};
use crate::executor::Executor;
use crate::pool::{Pooled, Recyclable, SyncPool};
use crate::request::RequestWrapper;

#[cfg(feature = "fault-injection")]
use crate::chaos::FaultInjector;

/// Which stage of request processing a phase performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Authenticate,
    Transact,
}

/// Lifecycle of a phase task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    Initialized,
    Running,
    Completed,
    TimedOut,
    Failed,
}

impl PhaseState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PhaseState::Completed | PhaseState::TimedOut | PhaseState::Failed
        )
    }
}

/// Shared flag telling running work that its caller gave up.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Fails with a timeout once cancelled; checked between units of work.
    pub fn check(&self, deadline: Duration) -> RouterResult<()> {
        if self.is_cancelled() {
            Err(RouterError::Timeout(deadline))
        } else {
            Ok(())
        }
    }
}

/// A pooled phase executor.
pub struct PhaseTask {
    kind: Option<PhaseKind>,
    state: PhaseState,
    cancel: CancelToken,
    deadline: Duration,
}

impl PhaseTask {
    pub fn new() -> Self {
        Self {
            kind: None,
            state: PhaseState::Idle,
            cancel: CancelToken::new(),
            deadline: Duration::ZERO,
        }
    }

    pub fn kind(&self) -> Option<PhaseKind> {
        self.kind
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn initialize(&mut self, kind: PhaseKind, deadline: Duration) -> RouterResult<()> {
        self.transition(PhaseState::Idle, PhaseState::Initialized)?;
        self.kind = Some(kind);
        self.deadline = deadline;
        Ok(())
    }

    pub fn start(&mut self) -> RouterResult<()> {
        self.transition(PhaseState::Initialized, PhaseState::Running)
    }

    /// Moves a running task into its terminal state.
    pub fn finish(&mut self, failed: bool) -> RouterResult<PhaseState> {
        let terminal = if self.cancel.is_cancelled() {
            PhaseState::TimedOut
        } else if failed {
            PhaseState::Failed
        } else {
            PhaseState::Completed
        };
        self.transition(PhaseState::Running, terminal)?;
        Ok(terminal)
    }

    fn transition(&mut self, from: PhaseState, to: PhaseState) -> RouterResult<()> {
        if self.state != from {
            return Err(RouterError::application(format!(
                "illegal phase transition {:?} -> {:?} (expected {:?})",
                self.state, to, from
            )));
        }
        log::trace!("phase {:?}: {:?} -> {:?}", self.kind, from, to);
        self.state = to;
        Ok(())
    }
}

impl Default for PhaseTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Recyclable for PhaseTask {
    fn reset(&mut self) {
        self.kind = None;
        self.state = PhaseState::Idle;
        // the old token may still be held by a caller that timed out
        self.cancel = CancelToken::new();
        self.deadline = Duration::ZERO;
    }
}

impl fmt::Debug for PhaseTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseTask")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Blocking work performed by a phase on a worker thread.
pub trait PhaseWork: Send + 'static {
    fn run(self, request: &mut RequestWrapper, cancel: &CancelToken) -> RouterResult<()>;
}

impl<F> PhaseWork for F
where
    F: FnOnce(&mut RequestWrapper, &CancelToken) -> RouterResult<()> + Send + 'static,
{
    fn run(self, request: &mut RequestWrapper, cancel: &CancelToken) -> RouterResult<()> {
        self(request, cancel)
    }
}

/// Submits phases to the worker pool and awaits their continuation.
#[derive(Clone)]
pub struct PhaseRunner {
    executor: Executor,
    tasks: Arc<SyncPool<PhaseTask>>,
    timeout: Duration,
    /// Timed-out requests whose worker has not returned yet.
    held: Arc<AtomicUsize>,
    #[cfg(feature = "fault-injection")]
    faults: Option<Arc<FaultInjector>>,
}

impl PhaseRunner {
    pub fn new(executor: Executor, tasks: Arc<SyncPool<PhaseTask>>, timeout: Duration) -> Self {
        Self {
            executor,
            tasks,
            timeout,
            held: Arc::new(AtomicUsize::new(0)),
            #[cfg(feature = "fault-injection")]
            faults: None,
        }
    }

    #[cfg(feature = "fault-injection")]
    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = Some(Arc::new(faults));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Requests that timed out while their work is still running. A value
    /// that never drops back points at hung work.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    /// Runs `work` against the request on the worker pool.
    ///
    /// Failures raised by `work` are staged on the returned wrapper rather
    /// than returned, so the caller re-raises them on its own path.
    ///
    /// # Errors
    /// Fails with `503 Service Unavailable` when the phase times out; the
    /// wrapper then stays with the worker, which recycles it.
    pub async fn run<W>(
        &self,
        kind: PhaseKind,
        wrapper: Pooled<RequestWrapper>,
        work: W,
    ) -> RouterResult<Pooled<RequestWrapper>>
    where
        W: PhaseWork,
    {
        let mut task = self.tasks.checkout()?;
        task.initialize(kind, self.timeout)?;
        let cancel = task.cancel_token().clone();
        let abandoned = cancel.clone();
        let held = Arc::clone(&self.held);
        let slot = wrapper.slot();
        let (tx, rx) = oneshot::channel();

        #[cfg(feature = "fault-injection")]
        let faults = self.faults.clone();

        self.executor.execute(async move {
            let mut task = task;
            let mut wrapper = wrapper;
            if let Err(err) = task.start() {
                wrapper.stage_failure(err);
            } else {
                #[cfg(feature = "fault-injection")]
                let result = match faults.as_deref().map(FaultInjector::inject) {
                    Some(Err(err)) => Err(err),
                    _ => work.run(&mut wrapper, task.cancel_token()),
                };
                #[cfg(not(feature = "fault-injection"))]
                let result = work.run(&mut wrapper, task.cancel_token());

                let failed = result.is_err();
                if let Err(err) = result {
                    wrapper.stage_failure(err);
                }
                match task.finish(failed) {
                    Ok(state) => log::debug!("{:?} phase finished: {:?}", kind, state),
                    Err(err) => log::error!("{}", err),
                }
            }
            drop(task);

            if let Err(wrapper) = tx.send(wrapper) {
                log::debug!(
                    "{:?} phase result discarded, recycling request in slot {:?}",
                    kind,
                    slot
                );
                drop(wrapper);
                if abandoned.is_cancelled() {
                    held.fetch_sub(1, Ordering::AcqRel);
                }
            }
        })?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(wrapper)) => Ok(wrapper),
            Ok(Err(_)) => Err(RouterError::application(format!(
                "{:?} phase ended without resuming the request",
                kind
            ))),
            Err(_) => {
                let held = self.held.fetch_add(1, Ordering::AcqRel) + 1;
                cancel.cancel();
                log::warn!(
                    "{:?} phase timed out after {:?}; slot {:?} held by its worker ({} held)",
                    kind,
                    self.timeout,
                    slot,
                    held
                );
                Err(ResourceError::service_unavailable().into())
            }
        }
    }
}

impl fmt::Debug for PhaseRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseRunner")
            .field("timeout", &self.timeout)
            .field("max_workers", &self.executor.max_workers())
            .finish()
    }
}
