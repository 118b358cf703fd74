//! Idle-time scheduling: "run this when convenient, no later than a deadline".
//! BackgroundScheduler runs jobs one at a time on a low-priority Tokio worker loop.
//! ImmediateScheduler dispatches at once. QueuedScheduler holds jobs until drained.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type IdleTask = BoxFuture<'static, ()>;

pub trait IdleScheduler: Send + Sync {
    /// Run `task` when the host is idle, and no later than `deadline` from now.
    fn schedule(&self, deadline: Duration, task: IdleTask);

    /// Suspension point between steps of a long-running loop.
    fn yield_now(&self) -> BoxFuture<'static, ()> {
        Box::pin(tokio::task::yield_now())
    }
}

struct IdleJob {
    deadline: Duration,
    task: IdleTask,
}

/// Low-priority background queue. Each job waits `settle`, capped by its deadline,
/// and jobs run strictly one at a time.
pub struct BackgroundScheduler {
    tx: mpsc::UnboundedSender<IdleJob>,
}

impl BackgroundScheduler {
    /// Start the worker loop. Must be called from within a Tokio runtime.
    pub fn spawn(settle: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_idle_loop(rx, settle));
        Self { tx }
    }
}

impl IdleScheduler for BackgroundScheduler {
    fn schedule(&self, deadline: Duration, task: IdleTask) {
        if self.tx.send(IdleJob { deadline, task }).is_err() {
            warn!("idle queue closed, dropping job");
        }
    }
}

async fn run_idle_loop(mut rx: mpsc::UnboundedReceiver<IdleJob>, settle: Duration) {
    info!("idle worker loop started");
    while let Some(job) = rx.recv().await {
        let wait = settle.min(job.deadline);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        tokio::task::yield_now().await;
        job.task.await;
    }
    info!("idle worker loop exiting");
}

/// Fallback that dispatches every job immediately on the current runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

impl IdleScheduler for ImmediateScheduler {
    fn schedule(&self, _deadline: Duration, task: IdleTask) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => warn!("no async runtime, dropping idle job"),
        }
    }
}

/// Holds jobs until [`QueuedScheduler::drain`] runs them, for hosts that drive idle
/// work from their own event loop.
#[derive(Default)]
pub struct QueuedScheduler {
    jobs: Mutex<VecDeque<IdleTask>>,
}

impl QueuedScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Run queued jobs in order, including any scheduled while draining.
    pub async fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.jobs.lock().pop_front();
            let Some(task) = next else { break };
            task.await;
            ran += 1;
        }
        debug!(ran, "idle queue drained");
        ran
    }
}

impl IdleScheduler for QueuedScheduler {
    fn schedule(&self, _deadline: Duration, task: IdleTask) {
        self.jobs.lock().push_back(task);
    }
}
