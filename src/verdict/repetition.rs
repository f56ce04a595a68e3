/// Repetition protocol
/// Invokes one operation several times and folds the results into a single
/// verdict that exposes non-determinism and runaway total execution time.
use crate::config::types::{ExecutionRequest, Outcome, Result};
use crate::core::sandbox::Executor;
use crate::observability::audit::events;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepetitionConfig {
    pub repetitions: u32,
    pub aggregate_timeout: Duration,
}

impl Default for RepetitionConfig {
    fn default() -> Self {
        Self {
            repetitions: 7,
            aggregate_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RepetitionOutcome {
    pub passed: bool,
    /// Deduplicated by (normalised message, exception type), first-seen order
    pub failure_messages: Vec<String>,
    pub non_deterministic: bool,
    pub repetitions_requested: u32,
    pub repetitions_completed: u32,
    pub incomplete_repetitions: bool,
    pub timed_out: bool,
    pub out_of_memory: bool,
    pub illegal_operations: Vec<String>,
}

/// Collapse whitespace runs and trim, so messages differing only in layout
/// deduplicate.
fn normalise(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Default)]
struct Fold {
    passes: u32,
    non_passes: u32,
    seen_failures: Vec<(String, String)>,
    outcome: RepetitionOutcome,
}

impl Fold {
    fn record_failure(&mut self, type_name: &str, message: &str) {
        let key = (normalise(message), type_name.to_string());
        if !self.seen_failures.contains(&key) {
            self.seen_failures.push(key);
            self.outcome.failure_messages.push(format!("{}: {}", type_name, message));
        }
    }

    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Success(_) => self.passes += 1,
            Outcome::Exception(cause) => {
                self.non_passes += 1;
                self.record_failure(&cause.type_name, &cause.message);
            }
            Outcome::Timeout => {
                self.non_passes += 1;
                self.outcome.timed_out = true;
            }
            Outcome::OutOfMemory(cause) => {
                self.non_passes += 1;
                self.outcome.out_of_memory = true;
                self.record_failure(&cause.type_name, &cause.message);
            }
            Outcome::IllegalOperation(violation) => {
                self.non_passes += 1;
                if !self.outcome.illegal_operations.contains(violation) {
                    self.outcome.illegal_operations.push(violation.clone());
                }
            }
        }
    }
}

/// Run `request` up to `config.repetitions` times, strictly sequentially.
///
/// A structural error aborts the protocol. The aggregate deadline is checked
/// between repetitions, so an in-flight repetition is always kept.
pub fn repeat(
    executor: &dyn Executor,
    request: &ExecutionRequest,
    config: &RepetitionConfig,
) -> Result<RepetitionOutcome> {
    let mut fold = Fold::default();
    fold.outcome.repetitions_requested = config.repetitions;
    let started = Instant::now();

    for rep in 1..=config.repetitions {
        let result = executor.execute(request)?;
        fold.record(&result.outcome);
        fold.outcome.repetitions_completed = rep;

        if rep < config.repetitions && started.elapsed() > config.aggregate_timeout {
            log::debug!(
                "{}: aggregate timeout after {} of {} repetitions",
                request.entry_name(),
                rep,
                config.repetitions
            );
            fold.outcome.incomplete_repetitions = true;
            break;
        }
    }

    let Fold {
        passes,
        non_passes,
        mut outcome,
        ..
    } = fold;
    outcome.non_deterministic = passes > 0 && non_passes > 0;
    outcome.passed = passes > 0 && non_passes == 0;
    if outcome.non_deterministic {
        events::non_determinism(&request.entry_name(), passes, non_passes);
    }
    Ok(outcome)
}
