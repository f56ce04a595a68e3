/// Deadline enforcement for one unit of work
///
/// Work runs on its own named, detached thread so that it can be abandoned
/// without keeping the process alive. On expiry the driver escalates through a
/// [`Terminate`] implementation: a first request, then repeated forced kills
/// with a backoff that starts at 100ms and halves every round until the
/// worker is confirmed dead or the backoff budget runs out.
use crate::config::types::Result;
use crate::exec::streams::StreamRegistry;
use crate::observability::audit::events;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Something that can stop a running worker.
///
/// `attempt` is 0 for the first request and increases with every escalation.
pub trait Terminate: Send + Sync {
    fn terminate(&self, attempt: u32);
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome<T> {
    Completed(T),
    Panicked(String),
    TimedOut { confirmed_dead: bool },
}

#[derive(Debug, Clone)]
pub struct TimeoutDriver {
    name: String,
    initial_backoff: Duration,
    min_backoff: Duration,
}

impl TimeoutDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial_backoff: Duration::from_millis(100),
            min_backoff: Duration::from_millis(1),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, min: Duration) -> Self {
        self.initial_backoff = initial;
        self.min_backoff = min;
        self
    }

    /// Run `work`, inline when `deadline` is `None`.
    pub fn run<T, F>(
        &self,
        deadline: Option<Duration>,
        terminator: Arc<dyn Terminate>,
        work: F,
    ) -> Result<WorkerOutcome<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let Some(deadline) = deadline else {
            return Ok(match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(value) => WorkerOutcome::Completed(value),
                Err(payload) => WorkerOutcome::Panicked(panic_message(payload)),
            });
        };

        let (tx, rx) = bounded(1);
        let parent = thread::current().id();
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _streams = StreamRegistry::global().inherit(parent);
                let result = panic::catch_unwind(AssertUnwindSafe(work));
                let _ = tx.send(result);
            })?;

        match rx.recv_timeout(deadline) {
            Ok(Ok(value)) => Ok(WorkerOutcome::Completed(value)),
            Ok(Err(payload)) => Ok(WorkerOutcome::Panicked(panic_message(payload))),
            Err(RecvTimeoutError::Disconnected) => Ok(WorkerOutcome::Panicked(
                "worker exited without a result".to_string(),
            )),
            Err(RecvTimeoutError::Timeout) => {
                log::debug!("Worker '{}' exceeded {:?}", self.name, deadline);
                let confirmed_dead = self.escalate(terminator.as_ref(), |wait| {
                    !matches!(rx.recv_timeout(wait), Err(RecvTimeoutError::Timeout))
                });
                Ok(WorkerOutcome::TimedOut { confirmed_dead })
            }
        }
    }

    /// Kill escalation. `wait_dead` blocks up to the given time and reports
    /// whether the worker has finished.
    fn escalate(&self, terminator: &dyn Terminate, mut wait_dead: impl FnMut(Duration) -> bool) -> bool {
        terminator.terminate(0);
        let mut attempt = 1;
        let mut backoff = self.initial_backoff;
        loop {
            if wait_dead(backoff) {
                if attempt > 1 {
                    events::forced_kill(&self.name, attempt);
                }
                return true;
            }
            terminator.terminate(attempt);
            attempt += 1;
            backoff /= 2;
            if backoff < self.min_backoff {
                log::warn!(
                    "Worker '{}' did not stop after {} termination attempts; abandoning it",
                    self.name,
                    attempt
                );
                events::termination_unconfirmed(&self.name, attempt);
                return false;
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "worker panicked".to_string()
    }
}
