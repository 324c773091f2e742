//! Crash-isolated task supervision plus the stop signal and ticker every
//! background loop waits on.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use futures_util::FutureExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout_at, Instant};

/// Cloneable view of the process-wide stop flag.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop is requested (or the supervisor is gone).
    pub async fn stopped(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration`; `false` means stop was requested meanwhile.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        let slept = tokio::select! {
            _ = sleep(duration) => true,
            _ = self.stopped() => false,
        };
        slept && !self.is_stopped()
    }

    pub async fn sleep_until(&mut self, deadline: Instant) -> bool {
        self.sleep(deadline.saturating_duration_since(Instant::now()))
            .await
    }
}

/// Fixed-cadence wait that hands control back to the caller every period.
pub struct Ticker {
    period: Duration,
    stop: StopSignal,
}

impl Ticker {
    pub fn new(period: Duration, stop: StopSignal) -> Self {
        Self { period, stop }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// `true` when the period elapsed, `false` when the loop should exit.
    pub async fn tick(&mut self) -> bool {
        self.stop.sleep(self.period).await
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    Completed,
    Stopped,
    Failed,
    Panicked,
}

/// Owns every background unit. A failing or panicking task is logged under
/// its name and never reaches siblings or the process.
pub struct TaskSupervisor {
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    tasks: Mutex<JoinSet<TaskExit>>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            stop_tx,
            stop_rx,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        StopSignal {
            rx: self.stop_rx.clone(),
        }
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Run `task` as an independent unit. The returned receiver reports how it
    /// ended and is meant for logging/tests only.
    pub fn supervise<F>(&self, name: impl Into<String>, task: F) -> oneshot::Receiver<TaskExit>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let stop = self.stop_signal();
        let (done_tx, done_rx) = oneshot::channel();

        let wrapped = async move {
            tracing::debug!("Task '{}' started", name);
            let exit = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) if stop.is_stopped() => {
                    tracing::info!("Task '{}' stopped", name);
                    TaskExit::Stopped
                }
                Ok(Ok(())) => {
                    tracing::debug!("Task '{}' finished", name);
                    TaskExit::Completed
                }
                Ok(Err(e)) => {
                    tracing::error!("Task '{}' failed: {:#}", name, e);
                    TaskExit::Failed
                }
                Err(panic) => {
                    tracing::error!("Task '{}' panicked: {}", name, panic_message(&*panic));
                    TaskExit::Panicked
                }
            };
            let _ = done_tx.send(exit);
            exit
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished units so fire-and-forget tasks don't accumulate.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(wrapped);
        done_rx
    }

    /// Fire-and-forget: wait `delay` (interruptibly), then run `task`. Abandoned
    /// silently if stop is requested first.
    pub fn supervise_after<F>(
        &self,
        name: impl Into<String>,
        delay: Duration,
        task: F,
    ) -> oneshot::Receiver<TaskExit>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut stop = self.stop_signal();
        self.supervise(name, async move {
            if stop.sleep(delay).await {
                task.await
            } else {
                Ok(())
            }
        })
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Raise the stop flag, give tasks `grace` to wind down, abort the rest.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.stop_tx.send(true);
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        tracing::info!(
            "Shutting down {} supervised task(s) (grace {:?})",
            tasks.len(),
            grace
        );

        let deadline = Instant::now() + grace;
        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "{} task(s) still running after grace period; aborting",
                        tasks.len()
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
