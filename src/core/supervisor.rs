//! Host side of the forked-process sandbox
//!
//! The child is the `gradebox` binary in its hidden fork-host role. It is
//! spawned lazily, killed with `SIGKILL` when it misbehaves and respawned on
//! the next call. Children carry `PR_SET_PDEATHSIG=SIGKILL` so they never
//! outlive the host. That signal follows the forking thread rather than the
//! process, so every child of one sandbox is forked by a single spawner
//! thread that lives as long as the sandbox.

use crate::config::types::{
    ExceptionDescriptor, ExecutionRequest, ExecutionResult, Outcome, Result, SandboxConfig,
    SandboxError,
};
use crate::core::sandbox::Executor;
use crate::core::types::{read_message, write_message, ForkHostLaunch, RpcRequest, RpcResponse};
use crate::loader::CodePath;
use crate::observability::audit::{events, CorrelationIds};
use crate::runtime::engine;
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Forked host tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkOptions {
    /// Bound on waiting for the child's port announcement
    pub handshake_timeout: Duration,
    /// Attempts per call before a boundary fault is reported
    pub retry_budget: u32,
    /// Added to the invocation timeout when waiting for a response
    pub response_grace: Duration,
    /// Binary to run in fork-host role; the current executable when unset
    pub host_binary: Option<PathBuf>,
}

impl Default for ForkOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            retry_budget: 3,
            response_grace: Duration::from_secs(2),
            host_binary: None,
        }
    }
}

struct ChildHandle {
    child: Child,
    port: u16,
    generation: u64,
}

impl ChildHandle {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    /// SIGKILL and reap. `Child::kill` never signals a reaped child.
    fn kill(mut self, reason: &str) {
        let pid = self.pid();
        match self.child.kill() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => log::warn!("SIGKILL of fork host {} failed: {}", pid, e),
        }
        if let Err(e) = self.child.wait() {
            log::warn!("Reaping fork host {} failed: {}", pid, e);
        }
        log::info!("Fork host {} killed ({})", pid, reason);
        events::child_killed(pid, reason);
    }
}

fn with_parent_death_signal(command: &mut Command) {
    unsafe {
        command.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).map_err(io::Error::from)
        });
    }
}

struct SpawnJob {
    command: Command,
    reply: Sender<io::Result<Child>>,
}

/// Forks every child of one sandbox from the same long-lived thread.
///
/// The thread exits once the owning sandbox drops its sender.
struct Spawner {
    jobs: Sender<SpawnJob>,
}

impl Spawner {
    fn start() -> io::Result<Self> {
        let (jobs, queue) = unbounded::<SpawnJob>();
        thread::Builder::new()
            .name("gradebox-fork-spawner".to_string())
            .spawn(move || {
                for SpawnJob { mut command, reply } in queue.iter() {
                    let _ = reply.send(command.spawn());
                }
            })?;
        Ok(Self { jobs })
    }

    fn spawn(&self, command: Command) -> io::Result<Child> {
        let stopped = || io::Error::new(io::ErrorKind::BrokenPipe, "fork spawner has stopped");
        let (reply, result) = bounded(1);
        self.jobs
            .send(SpawnJob { command, reply })
            .map_err(|_| stopped())?;
        result.recv().map_err(|_| stopped())?
    }
}

/// Resolve and compile a code path so unit and location errors surface
/// before any child exists.
fn precompile(path: &CodePath) -> Result<()> {
    for unit in path.resolve()? {
        engine::compile(unit.name(), unit.bytes())?;
    }
    Ok(())
}

enum AttemptError {
    /// Refused, reset, EOF or garbage; worth a respawn
    Broken(String),
    /// No response within timeout + grace
    TimedOut,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Sandbox that runs every invocation in a separate child process.
pub struct ForkedSandbox {
    launch: ForkHostLaunch,
    options: ForkOptions,
    child: Mutex<Option<ChildHandle>>,
    generation: AtomicU64,
    spawner: Spawner,
    // keeps materialised in-memory units alive for respawns
    _materialised: Option<TempDir>,
}

impl ForkedSandbox {
    pub fn new(
        restricted: &CodePath,
        support: &CodePath,
        config: SandboxConfig,
        options: ForkOptions,
    ) -> Result<Self> {
        precompile(restricted)?;
        precompile(support)?;

        let needs_dir = !restricted.units().is_empty() || !support.units().is_empty();
        let materialised = if needs_dir {
            Some(tempfile::Builder::new().prefix("gradebox-units-").tempdir()?)
        } else {
            None
        };

        let (restricted, support) = match &materialised {
            Some(dir) => (
                restricted.materialise(&dir.path().join("restricted"))?,
                support.materialise(&dir.path().join("support"))?,
            ),
            None => (restricted.clone(), support.clone()),
        };

        Ok(Self {
            launch: ForkHostLaunch {
                restricted: restricted.locations().to_vec(),
                support: support.locations().to_vec(),
                config,
            },
            options,
            child: Mutex::new(None),
            generation: AtomicU64::new(0),
            spawner: Spawner::start()?,
            _materialised: materialised,
        })
    }

    pub fn options(&self) -> &ForkOptions {
        &self.options
    }

    /// PID of the live child, if any
    pub fn child_pid(&self) -> Option<u32> {
        lock(&self.child).as_ref().map(ChildHandle::pid)
    }

    /// Kill the current child; the next call respawns.
    pub fn kill_child(&self) {
        if let Some(handle) = lock(&self.child).take() {
            handle.kill("requested");
        }
    }

    pub fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let started = Instant::now();
        let correlation = CorrelationIds::new(request.entry_name());
        let rpc = RpcRequest::from(request);
        let budget = self.options.retry_budget.max(1);
        let mut last_fault = String::new();
        let mut last_oom: Option<ExceptionDescriptor> = None;
        let mut last_pid: Option<u32> = None;

        for attempt in 1..=budget {
            let (port, generation, pid) = match self.ensure_child()? {
                Ok(live) => live,
                Err(fault) => {
                    last_fault = fault;
                    continue;
                }
            };
            last_pid = Some(pid);

            match self.attempt(port, &rpc) {
                Ok(response) => match response.into_outcome(&request.entry_name())? {
                    Outcome::OutOfMemory(cause) => {
                        log::warn!(
                            "Fork host reported memory exhaustion on attempt {}/{}",
                            attempt,
                            budget
                        );
                        self.kill_generation(generation, "out of memory");
                        last_oom = Some(cause);
                    }
                    outcome => return Ok(finish(outcome, started)),
                },
                Err(AttemptError::TimedOut) => {
                    self.kill_generation(generation, "response timeout");
                    events::wall_time_limit_violation(
                        correlation.with_child_pid(pid),
                        self.response_timeout()
                            .map(|t| t.as_millis() as u64)
                            .unwrap_or_default(),
                    );
                    return Ok(finish(Outcome::Timeout, started));
                }
                Err(AttemptError::Broken(reason)) => {
                    log::warn!(
                        "Fork host call failed on attempt {}/{}: {}",
                        attempt,
                        budget,
                        reason
                    );
                    self.kill_generation(generation, &reason);
                    last_oom = None;
                    last_fault = reason;
                }
            }
        }

        if let Some(cause) = last_oom {
            return Ok(finish(Outcome::OutOfMemory(cause), started));
        }
        let correlation = match last_pid {
            Some(pid) => correlation.with_child_pid(pid),
            None => correlation,
        };
        events::boundary_fault(correlation, budget, &last_fault);
        Ok(finish(
            Outcome::Exception(ExceptionDescriptor::new(
                "BoundaryFault",
                format!("forked host failed {} times: {}", budget, last_fault),
            )),
            started,
        ))
    }

    fn response_timeout(&self) -> Option<Duration> {
        self.launch
            .config
            .timeout
            .map(|t| t + self.options.response_grace)
    }

    fn attempt(&self, port: u16, rpc: &RpcRequest) -> std::result::Result<RpcResponse, AttemptError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let broken = |what: &str, e: io::Error| AttemptError::Broken(format!("{}: {}", what, e));

        let mut stream = TcpStream::connect(addr).map_err(|e| broken("connect", e))?;
        stream
            .set_read_timeout(self.response_timeout())
            .map_err(|e| broken("configure", e))?;
        write_message(&mut stream, rpc).map_err(|e| broken("send", e))?;

        let mut reader = BufReader::new(stream);
        match read_message::<_, RpcResponse>(&mut reader) {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(AttemptError::Broken("connection closed before response".into())),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(AttemptError::TimedOut)
            }
            Err(e) => Err(broken("receive", e)),
        }
    }

    /// Port, generation and PID of a live child. The inner `Err` is a failed
    /// handshake, which counts against the retry budget.
    fn ensure_child(&self) -> Result<std::result::Result<(u16, u64, u32), String>> {
        let mut slot = lock(&self.child);
        if let Some(handle) = slot.as_mut() {
            match handle.child.try_wait() {
                Ok(None) => return Ok(Ok((handle.port, handle.generation, handle.pid()))),
                Ok(Some(status)) => {
                    // already reaped: the pid may be reused, so no signal
                    let pid = handle.pid();
                    log::warn!("Fork host {} exited unexpectedly: {}", pid, status);
                    events::child_exited(pid, &status.to_string());
                    slot.take();
                }
                Err(e) => {
                    log::warn!("Fork host status unavailable: {}", e);
                    if let Some(unknown) = slot.take() {
                        unknown.kill("status unavailable");
                    }
                }
            }
        }

        match self.spawn()? {
            Ok(handle) => {
                let live = (handle.port, handle.generation, handle.pid());
                *slot = Some(handle);
                Ok(Ok(live))
            }
            Err(fault) => Ok(Err(fault)),
        }
    }

    fn spawn(&self) -> Result<std::result::Result<ChildHandle, String>> {
        let binary = match &self.options.host_binary {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        let config_json = serde_json::to_string(&self.launch.config)
            .map_err(|e| SandboxError::Config(format!("cannot encode sandbox config: {}", e)))?;

        let mut command = Command::new(&binary);
        command.arg("--internal-role").arg("fork-host");
        for location in &self.launch.restricted {
            command.arg("--restricted").arg(location);
        }
        for location in &self.launch.support {
            command.arg("--support").arg(location);
        }
        command
            .arg("--sandbox-config")
            .arg(config_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        with_parent_death_signal(&mut command);

        let mut child = self.spawner.spawn(command)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Runtime("fork host stdout not captured".into()))?;

        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name(format!("gradebox-fork-{}-stdout", pid))
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                let mut line = String::new();
                let port = match reader.read_line(&mut line) {
                    Ok(n) if n > 0 => line.trim().parse::<u16>().ok(),
                    _ => None,
                };
                let _ = tx.send(port);
                // anything the child prints later goes to our stdout
                let _ = io::copy(&mut reader, &mut io::stdout());
            })?;

        let handle = |port| ChildHandle {
            child,
            port,
            generation,
        };
        match rx.recv_timeout(self.options.handshake_timeout) {
            Ok(Some(port)) => {
                log::info!("Fork host {} ready on port {} (generation {})", pid, port, generation);
                events::child_spawned(pid, generation);
                Ok(Ok(handle(port)))
            }
            Ok(None) | Err(RecvTimeoutError::Disconnected) => {
                handle(0).kill("bad handshake");
                Ok(Err(format!("fork host {} exited before announcing a port", pid)))
            }
            Err(RecvTimeoutError::Timeout) => {
                handle(0).kill("handshake timeout");
                Ok(Err(format!(
                    "fork host {} did not announce a port within {:?}",
                    pid, self.options.handshake_timeout
                )))
            }
        }
    }

    /// Kill the child only if it is still the generation that failed.
    fn kill_generation(&self, generation: u64, reason: &str) {
        let mut slot = lock(&self.child);
        if slot.as_ref().map(|h| h.generation) == Some(generation) {
            if let Some(handle) = slot.take() {
                handle.kill(reason);
            }
        }
    }
}

fn finish(outcome: Outcome, started: Instant) -> ExecutionResult {
    ExecutionResult {
        wall_time_ms: started.elapsed().as_millis() as u64,
        ..ExecutionResult::new(outcome)
    }
}

impl Executor for ForkedSandbox {
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        self.run(request)
    }
}

impl Drop for ForkedSandbox {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.child).take() {
            handle.kill("sandbox dropped");
        }
    }
}
