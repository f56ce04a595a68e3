/// Bounded worker pool
///
/// Independent operations (typically the repetition protocol for different
/// tests) run concurrently; results come back in input order.
use crate::config::types::{ExecutionRequest, Result};
use crate::core::sandbox::Executor;
use crate::verdict::repetition::{repeat, RepetitionConfig, RepetitionOutcome};
use crossbeam_channel::unbounded;
use std::thread;

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    parallelism: usize,
}

impl WorkerPool {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Apply `job` to every input on at most `parallelism` threads.
    pub fn map<I, O, F>(&self, inputs: Vec<I>, job: F) -> Vec<O>
    where
        I: Send,
        O: Send,
        F: Fn(I) -> O + Sync,
    {
        let total = inputs.len();
        let (job_tx, job_rx) = unbounded();
        for item in inputs.into_iter().enumerate() {
            let _ = job_tx.send(item);
        }
        drop(job_tx);

        let (done_tx, done_rx) = unbounded();
        thread::scope(|scope| {
            for _ in 0..self.parallelism.min(total) {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let job = &job;
                scope.spawn(move || {
                    for (idx, input) in job_rx.iter() {
                        let _ = done_tx.send((idx, job(input)));
                    }
                });
            }
        });
        drop(done_tx);

        let mut slots: Vec<Option<O>> = (0..total).map(|_| None).collect();
        for (idx, output) in done_rx.iter() {
            slots[idx] = Some(output);
        }
        slots.into_iter().flatten().collect()
    }

    /// Run the repetition protocol for each request.
    pub fn repeat_all(
        &self,
        executor: &dyn Executor,
        requests: &[ExecutionRequest],
        config: &RepetitionConfig,
    ) -> Vec<Result<RepetitionOutcome>> {
        log::debug!(
            "Repeating {} operations on {} workers",
            requests.len(),
            self.parallelism
        );
        self.map(requests.iter().collect(), |request| {
            repeat(executor, request, config)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ExecutionResult, Outcome, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn results_keep_input_order() {
        let pool = WorkerPool::new(4);
        let out = pool.map((0..50).collect(), |n: u64| {
            thread::sleep(Duration::from_millis(50 - n));
            n * 2
        });
        assert_eq!(out, (0..50).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn parallelism_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        pool.map((0..8).collect(), |_: i32| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            running.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(WorkerPool::new(0).parallelism(), 1);
    }

    struct Echo;

    impl Executor for Echo {
        fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
            Ok(ExecutionResult::new(Outcome::Success(Value::Str(
                request.entry_member.clone(),
            ))))
        }
    }

    #[test]
    fn repeat_all_runs_each_request() {
        let requests = vec![
            ExecutionRequest::new("t.T", "a"),
            ExecutionRequest::new("t.T", "b"),
            ExecutionRequest::new("t.T", "c"),
        ];
        let config = RepetitionConfig {
            repetitions: 3,
            ..RepetitionConfig::default()
        };
        let outcomes = WorkerPool::new(2).repeat_all(&Echo, &requests, &config);
        assert_eq!(outcomes.len(), 3);
        for outcome in outcomes {
            let outcome = outcome.unwrap();
            assert!(outcome.passed);
            assert_eq!(outcome.repetitions_completed, 3);
        }
    }
}
