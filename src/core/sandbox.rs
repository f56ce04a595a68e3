//! In-process sandbox
//!
//! Composes the isolated loader, the stream virtualizer and the timeout
//! driver into a single call that produces exactly one [`ExecutionResult`].

use crate::config::types::{
    ExceptionDescriptor, ExecutionRequest, ExecutionResult, Outcome, Result, SandboxConfig,
};
use crate::exec::streams::StreamRegistry;
use crate::exec::timeout::{TimeoutDriver, WorkerOutcome};
use crate::loader::hostlib::HostLibrary;
use crate::loader::isolated::{IsolatedLoader, LoaderContext};
use crate::loader::CodePath;
use crate::observability::audit::{events, CorrelationIds};
use crate::runtime::engine::KillSwitch;
use crate::verdict::verdict::VerdictClassifier;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Anything that can run one request and report one result.
pub trait Executor: Send + Sync {
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult>;
}

type SharedContext = Arc<Mutex<LoaderContext>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Reusable in-process sandbox over fixed restricted and support code.
pub struct Sandbox {
    loader: IsolatedLoader,
    config: SandboxConfig,
    /// Context reused across calls when static state isolation is off
    cached: Mutex<Option<SharedContext>>,
    driver: TimeoutDriver,
}

impl Sandbox {
    pub fn new(restricted: &CodePath, support: &CodePath, config: SandboxConfig) -> Result<Self> {
        Self::with_host_library(
            restricted,
            support,
            config,
            Arc::new(HostLibrary::standard()),
        )
    }

    pub fn with_host_library(
        restricted: &CodePath,
        support: &CodePath,
        config: SandboxConfig,
        host: Arc<HostLibrary>,
    ) -> Result<Self> {
        let loader = IsolatedLoader::new(restricted, support, config.whitelist.clone(), host)?;
        Ok(Self {
            loader,
            config,
            cached: Mutex::new(None),
            driver: TimeoutDriver::new("gradebox-invocation"),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one invocation. `Err` only for structural problems.
    pub fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let correlation = CorrelationIds::new(request.entry_name());
        events::execution_start(correlation.clone());
        let started = Instant::now();

        let kill = Arc::new(KillSwitch::new());
        let context = if self.config.static_state_isolation {
            Arc::new(Mutex::new(
                self.loader.fresh_context(kill.clone(), self.config.memory_limit),
            ))
        } else {
            self.cached_context(&kill)
        };

        let activation = StreamRegistry::global().activate(self.config.streams);
        let owned = request.clone();
        let switch = kill.clone();
        let worker = self.driver.run(self.config.timeout, kill, move || {
            let mut ctx = lock(context.as_ref());
            ctx.set_kill_switch(switch);
            let invocation = ctx.invoke(&owned);
            drop(ctx);
            // a fresh context dies with the worker, releasing guest memory
            drop(context);
            invocation
        })?;

        let outcome = match worker {
            WorkerOutcome::Completed(Err(structural)) => return Err(structural),
            WorkerOutcome::Completed(Ok(Ok(value))) => Outcome::Success(value),
            WorkerOutcome::Completed(Ok(Err(error))) => VerdictClassifier::classify(&error),
            WorkerOutcome::Panicked(message) => {
                self.discard_cached();
                Outcome::Exception(ExceptionDescriptor::new("HostPanic", message))
            }
            WorkerOutcome::TimedOut { .. } => Outcome::Timeout,
        };

        match &outcome {
            Outcome::Timeout => {
                self.discard_cached();
                let limit_ms = self
                    .config
                    .timeout
                    .map(|t| t.as_millis() as u64)
                    .unwrap_or_default();
                events::wall_time_limit_violation(correlation.clone(), limit_ms);
            }
            Outcome::OutOfMemory(cause) => {
                self.discard_cached();
                events::memory_limit_violation(
                    correlation.clone(),
                    &cause.message,
                    self.config.memory_limit,
                );
            }
            Outcome::IllegalOperation(violation) => {
                events::illegal_operation(correlation.clone(), violation.clone());
            }
            _ => {}
        }

        let wall_time_ms = started.elapsed().as_millis() as u64;
        let result = ExecutionResult {
            stdout: activation.stdout_text(),
            stderr: activation.stderr_text(),
            output_truncated: activation.truncated(),
            outcome,
            wall_time_ms,
        };
        drop(activation);

        events::execution_end(correlation, result.outcome.kind(), wall_time_ms);
        Ok(result)
    }

    fn cached_context(&self, kill: &Arc<KillSwitch>) -> SharedContext {
        let mut slot = lock(&self.cached);
        match slot.as_ref() {
            Some(ctx) => ctx.clone(),
            None => {
                let ctx = Arc::new(Mutex::new(
                    self.loader.fresh_context(kill.clone(), self.config.memory_limit),
                ));
                *slot = Some(ctx.clone());
                ctx
            }
        }
    }

    fn discard_cached(&self) {
        if lock(&self.cached).take().is_some() {
            log::debug!("Discarded shared guest state");
        }
    }
}

impl Executor for Sandbox {
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        self.run(request)
    }
}

/// One-shot convenience: build a sandbox and run a single request.
pub fn run(
    restricted: &CodePath,
    support: &CodePath,
    request: &ExecutionRequest,
    config: SandboxConfig,
) -> Result<ExecutionResult> {
    Sandbox::new(restricted, support, config)?.run(request)
}
