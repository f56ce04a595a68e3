use crate::config::types::{Result, SandboxError};
use crate::exec::timeout::Terminate;
use crate::runtime::traps::{Interrupted, ResourceExhausted};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use wasmtime::{Config, Engine, Module, ResourceLimiter, Store, UpdateDeadline};

/// Guest call stack budget
const MAX_WASM_STACK: usize = 512 * 1024;

static ENGINE: OnceLock<Engine> = OnceLock::new();
static MODULE_CACHE: OnceLock<Mutex<HashMap<[u8; 32], Module>>> = OnceLock::new();

/// The process-wide engine. Epoch interruption is always on.
pub fn engine() -> &'static Engine {
    ENGINE.get_or_init(|| {
        let mut config = Config::new();
        config
            .epoch_interruption(true)
            .wasm_backtrace(true)
            .max_wasm_stack(MAX_WASM_STACK);
        match Engine::new(&config) {
            Ok(engine) => engine,
            Err(e) => {
                log::error!("Falling back to default engine configuration: {}", e);
                Engine::default()
            }
        }
    })
}

/// Compile a unit, reusing an earlier compilation of identical bytes.
pub fn compile(name: &str, bytes: &[u8]) -> Result<Module> {
    let digest: [u8; 32] = Sha256::digest(bytes).into();
    let cache = MODULE_CACHE.get_or_init(Default::default);
    if let Some(module) = lock(cache).get(&digest) {
        return Ok(module.clone());
    }

    let module = Module::new(engine(), bytes).map_err(|e| SandboxError::InvalidUnit {
        name: name.to_string(),
        reason: format!("{:#}", e),
    })?;
    log::debug!("Compiled unit '{}' ({} bytes)", name, bytes.len());
    lock(cache).insert(digest, module.clone());
    Ok(module)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Per-invocation termination handle.
///
/// Bumping the engine epoch makes every running store consult its own
/// switch; only the store whose switch is set traps.
pub struct KillSwitch {
    requested: AtomicBool,
    engine: Engine,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            engine: engine().clone(),
        }
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminate for KillSwitch {
    fn terminate(&self, attempt: u32) {
        if attempt == 0 {
            log::debug!("Requesting guest interruption");
        }
        self.requested.store(true, Ordering::SeqCst);
        self.engine.increment_epoch();
    }
}

/// Caps guest linear memory at a fixed number of bytes.
#[derive(Debug)]
pub struct MemoryLimiter {
    limit: u64,
}

impl MemoryLimiter {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired as u64 > self.limit {
            return Err(ResourceExhausted {
                requested: desired,
                limit: self.limit,
            }
            .into());
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: u32,
        desired: u32,
        _maximum: Option<u32>,
    ) -> anyhow::Result<bool> {
        // one pointer per element
        let bytes = (desired as usize).saturating_mul(std::mem::size_of::<usize>());
        if bytes as u64 > self.limit {
            return Err(ResourceExhausted {
                requested: bytes,
                limit: self.limit,
            }
            .into());
        }
        Ok(true)
    }
}

/// Data owned by one guest store
pub struct HostState {
    pub kill: Arc<KillSwitch>,
    pub limiter: MemoryLimiter,
    pub files: HashMap<i32, File>,
    pub next_handle: i32,
}

impl HostState {
    pub fn new(kill: Arc<KillSwitch>, memory_limit: u64) -> Self {
        Self {
            kill,
            limiter: MemoryLimiter::new(memory_limit),
            files: HashMap::new(),
            next_handle: 1,
        }
    }
}

/// A fresh store with memory limiting and kill switch polling installed.
pub fn new_store(kill: Arc<KillSwitch>, memory_limit: u64) -> Store<HostState> {
    let mut store = Store::new(engine(), HostState::new(kill, memory_limit));
    store.limiter(|state| &mut state.limiter);
    store.set_epoch_deadline(1);
    store.epoch_deadline_callback(|ctx| {
        if ctx.data().kill.requested() {
            Err(Interrupted.into())
        } else {
            Ok(UpdateDeadline::Continue(1))
        }
    });
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_compile_once() {
        let wat = r#"(module (func (export "f") (result i32) i32.const 1))"#;
        compile("a", wat.as_bytes()).unwrap();
        compile("b", wat.as_bytes()).unwrap();
        let digest: [u8; 32] = Sha256::digest(wat.as_bytes()).into();
        let cache = MODULE_CACHE.get().unwrap().lock().unwrap();
        assert!(cache.contains_key(&digest));
    }

    #[test]
    fn invalid_bytes_are_structural() {
        match compile("broken", b"(module (func") {
            Err(SandboxError::InvalidUnit { name, .. }) => assert_eq!(name, "broken"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn limiter_rejects_growth_past_limit() {
        let mut limiter = MemoryLimiter::new(2 * 65536);
        assert!(limiter.memory_growing(0, 65536, None).unwrap());
        let err = limiter.memory_growing(65536, 3 * 65536, None).unwrap_err();
        let cause = err.downcast_ref::<ResourceExhausted>().unwrap();
        assert_eq!(cause.requested, 3 * 65536);
        assert_eq!(cause.limit, 2 * 65536);
    }

    #[test]
    fn kill_switch_sets_flag() {
        let kill = KillSwitch::new();
        assert!(!kill.requested());
        kill.terminate(0);
        assert!(kill.requested());
    }
}
