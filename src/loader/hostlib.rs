//! Trusted native support library (`rt.*`)
//!
//! Functions are registered by `(type, member, params)` so a type can
//! overload a member by signature. Console I/O goes through the stream
//! virtualizer, never the real process streams.

use crate::exec::streams;
use crate::loader::isolated::val_type_name;
use crate::runtime::engine::HostState;
use crate::runtime::traps::{GuestException, Interrupted};
use anyhow::anyhow;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use wasmtime::{Caller, Engine, FuncType, Val, ValType};

/// Longest guest string a host function will read
const MAX_GUEST_STRING: usize = 1024 * 1024;
const SLEEP_SLICE: Duration = Duration::from_millis(10);

pub type HostFn =
    Arc<dyn Fn(&mut Caller<'_, HostState>, &[Val], &mut [Val]) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    I32,
    I64,
    F32,
    F64,
}

impl ValueKind {
    pub fn val_type(self) -> ValType {
        match self {
            ValueKind::I32 => ValType::I32,
            ValueKind::I64 => ValType::I64,
            ValueKind::F32 => ValType::F32,
            ValueKind::F64 => ValType::F64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueKind::I32 => "i32",
            ValueKind::I64 => "i64",
            ValueKind::F32 => "f32",
            ValueKind::F64 => "f64",
        }
    }
}

use ValueKind::{F64, I32, I64};

pub struct HostFunction {
    type_name: String,
    member: String,
    params: Vec<ValueKind>,
    results: Vec<ValueKind>,
    func: HostFn,
}

impl HostFunction {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn func_type(&self, engine: &Engine) -> FuncType {
        FuncType::new(
            engine,
            self.params.iter().map(|k| k.val_type()),
            self.results.iter().map(|k| k.val_type()),
        )
    }

    pub fn func(&self) -> HostFn {
        self.func.clone()
    }

    fn matches(&self, type_name: &str, member: &str, params: &[String], results: &[String]) -> bool {
        self.type_name == type_name
            && self.member == member
            && self.params.iter().map(|k| k.name()).eq(params.iter().map(String::as_str))
            && self.results.iter().map(|k| k.name()).eq(results.iter().map(String::as_str))
    }
}

#[derive(Default)]
pub struct HostLibrary {
    functions: Vec<HostFunction>,
}

impl HostLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `rt.*` library: Math, Console, Assert, System, Thread, Files.
    pub fn standard() -> Self {
        let mut lib = Self::new();
        register_math(&mut lib);
        register_console(&mut lib);
        register_assert(&mut lib);
        register_system(&mut lib);
        register_thread(&mut lib);
        register_files(&mut lib);
        lib
    }

    pub fn register<F>(
        &mut self,
        type_name: &str,
        member: &str,
        params: &[ValueKind],
        results: &[ValueKind],
        func: F,
    ) where
        F: Fn(&mut Caller<'_, HostState>, &[Val], &mut [Val]) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.functions.push(HostFunction {
            type_name: type_name.to_string(),
            member: member.to_string(),
            params: params.to_vec(),
            results: results.to_vec(),
            func: Arc::new(func),
        });
    }

    /// Overload with exactly this wasm signature
    pub fn lookup(&self, type_name: &str, member: &str, ty: &FuncType) -> Option<&HostFunction> {
        let params: Vec<String> = ty.params().map(|t| val_type_name(&t)).collect();
        let results: Vec<String> = ty.results().map(|t| val_type_name(&t)).collect();
        self.functions
            .iter()
            .find(|f| f.matches(type_name, member, &params, &results))
    }

    pub fn provides_type(&self, type_name: &str) -> bool {
        self.functions.iter().any(|f| f.type_name == type_name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

fn arg_i32(params: &[Val], idx: usize) -> anyhow::Result<i32> {
    params
        .get(idx)
        .and_then(Val::i32)
        .ok_or_else(|| anyhow!("expected i32 argument at {}", idx))
}

fn arg_i64(params: &[Val], idx: usize) -> anyhow::Result<i64> {
    params
        .get(idx)
        .and_then(Val::i64)
        .ok_or_else(|| anyhow!("expected i64 argument at {}", idx))
}

fn arg_f64(params: &[Val], idx: usize) -> anyhow::Result<f64> {
    params
        .get(idx)
        .and_then(Val::f64)
        .ok_or_else(|| anyhow!("expected f64 argument at {}", idx))
}

/// Read a `(ptr, len)` UTF-8 string out of the caller's exported memory.
pub fn read_guest_string(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<String> {
    let memory = caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| GuestException::new("LinkageError", "caller exports no memory"))?;
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_GUEST_STRING)
        .ok_or_else(|| GuestException::new("Trap", format!("bad string length {}", len)))?;
    let mut buf = vec![0u8; len];
    memory.read(&*caller, ptr as u32 as usize, &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn io_exception(e: std::io::Error) -> anyhow::Error {
    GuestException::new("IOError", e.to_string()).into()
}

fn write_out(text: &[u8], to_stderr: bool) -> anyhow::Result<()> {
    let written = if to_stderr {
        streams::stderr().write_all(text)
    } else {
        streams::stdout().write_all(text)
    };
    written.map_err(io_exception)
}

fn register_math(lib: &mut HostLibrary) {
    lib.register("rt.Math", "abs", &[I32], &[I32], |_, p, r| {
        r[0] = Val::I32(arg_i32(p, 0)?.wrapping_abs());
        Ok(())
    });
    lib.register("rt.Math", "abs", &[I64], &[I64], |_, p, r| {
        r[0] = Val::I64(arg_i64(p, 0)?.wrapping_abs());
        Ok(())
    });
    lib.register("rt.Math", "abs", &[F64], &[F64], |_, p, r| {
        r[0] = Val::F64(arg_f64(p, 0)?.abs().to_bits());
        Ok(())
    });
    lib.register("rt.Math", "max", &[I32, I32], &[I32], |_, p, r| {
        r[0] = Val::I32(arg_i32(p, 0)?.max(arg_i32(p, 1)?));
        Ok(())
    });
    lib.register("rt.Math", "min", &[I32, I32], &[I32], |_, p, r| {
        r[0] = Val::I32(arg_i32(p, 0)?.min(arg_i32(p, 1)?));
        Ok(())
    });
    lib.register("rt.Math", "sqrt", &[F64], &[F64], |_, p, r| {
        r[0] = Val::F64(arg_f64(p, 0)?.sqrt().to_bits());
        Ok(())
    });
    lib.register("rt.Math", "pow", &[F64, F64], &[F64], |_, p, r| {
        r[0] = Val::F64(arg_f64(p, 0)?.powf(arg_f64(p, 1)?).to_bits());
        Ok(())
    });
}

fn register_console(lib: &mut HostLibrary) {
    lib.register("rt.Console", "print", &[I32, I32], &[], |c, p, _| {
        let text = read_guest_string(c, arg_i32(p, 0)?, arg_i32(p, 1)?)?;
        write_out(text.as_bytes(), false)
    });
    lib.register("rt.Console", "println", &[I32, I32], &[], |c, p, _| {
        let mut text = read_guest_string(c, arg_i32(p, 0)?, arg_i32(p, 1)?)?;
        text.push('\n');
        write_out(text.as_bytes(), false)
    });
    lib.register("rt.Console", "eprintln", &[I32, I32], &[], |c, p, _| {
        let mut text = read_guest_string(c, arg_i32(p, 0)?, arg_i32(p, 1)?)?;
        text.push('\n');
        write_out(text.as_bytes(), true)
    });
    lib.register("rt.Console", "print_i32", &[I32], &[], |_, p, _| {
        write_out(arg_i32(p, 0)?.to_string().as_bytes(), false)
    });
    lib.register("rt.Console", "print_i64", &[I64], &[], |_, p, _| {
        write_out(arg_i64(p, 0)?.to_string().as_bytes(), false)
    });
    lib.register("rt.Console", "print_f64", &[F64], &[], |_, p, _| {
        write_out(arg_f64(p, 0)?.to_string().as_bytes(), false)
    });
    lib.register("rt.Console", "read_byte", &[], &[I32], |_, _, r| {
        let mut byte = [0u8; 1];
        let n = streams::stdin().read(&mut byte).map_err(io_exception)?;
        r[0] = Val::I32(if n == 0 { -1 } else { i32::from(byte[0]) });
        Ok(())
    });
}

fn register_assert(lib: &mut HostLibrary) {
    lib.register("rt.Assert", "fail", &[I32, I32], &[], |c, p, _| {
        let message = read_guest_string(c, arg_i32(p, 0)?, arg_i32(p, 1)?)?;
        Err(GuestException::new("AssertionError", message).into())
    });
    lib.register("rt.Assert", "equals", &[I32, I32], &[], |_, p, _| {
        let (expected, actual) = (arg_i32(p, 0)?, arg_i32(p, 1)?);
        if expected != actual {
            return Err(GuestException::new(
                "AssertionError",
                format!("expected {} but was {}", expected, actual),
            )
            .into());
        }
        Ok(())
    });
    lib.register("rt.Assert", "equals", &[I64, I64], &[], |_, p, _| {
        let (expected, actual) = (arg_i64(p, 0)?, arg_i64(p, 1)?);
        if expected != actual {
            return Err(GuestException::new(
                "AssertionError",
                format!("expected {} but was {}", expected, actual),
            )
            .into());
        }
        Ok(())
    });
    lib.register("rt.Assert", "is_true", &[I32], &[], |_, p, _| {
        if arg_i32(p, 0)? == 0 {
            return Err(GuestException::new("AssertionError", "expected true").into());
        }
        Ok(())
    });
}

fn register_system(lib: &mut HostLibrary) {
    lib.register("rt.System", "nano_time", &[], &[I64], |_, _, r| {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        r[0] = Val::I64(nanos as i64);
        Ok(())
    });
    lib.register("rt.System", "raise", &[I32, I32], &[], |c, p, _| {
        let message = read_guest_string(c, arg_i32(p, 0)?, arg_i32(p, 1)?)?;
        Err(GuestException::new("RuntimeError", message).into())
    });
    // never exits the host process
    lib.register("rt.System", "exit", &[I32], &[], |_, p, _| {
        let status = arg_i32(p, 0)?;
        Err(GuestException::new("SystemExit", format!("exit status {}", status)).into())
    });
}

fn register_thread(lib: &mut HostLibrary) {
    lib.register("rt.Thread", "sleep", &[I64], &[], |c, p, _| {
        let millis = u64::try_from(arg_i64(p, 0)?).unwrap_or(0);
        let until = Instant::now() + Duration::from_millis(millis);
        loop {
            if c.data().kill.requested() {
                return Err(Interrupted.into());
            }
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(until - now));
        }
    });
}

fn register_files(lib: &mut HostLibrary) {
    lib.register("rt.Files", "<init>", &[I32, I32], &[I32], |c, p, r| {
        let path = read_guest_string(c, arg_i32(p, 0)?, arg_i32(p, 1)?)?;
        let file = std::fs::File::open(&path).map_err(io_exception)?;
        let state = c.data_mut();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.files.insert(handle, file);
        r[0] = Val::I32(handle);
        Ok(())
    });
    lib.register("rt.Files", "read_byte", &[I32], &[I32], |c, p, r| {
        let handle = arg_i32(p, 0)?;
        let file = c
            .data_mut()
            .files
            .get_mut(&handle)
            .ok_or_else(|| GuestException::new("IOError", format!("bad handle {}", handle)))?;
        let mut byte = [0u8; 1];
        let n = file.read(&mut byte).map_err(io_exception)?;
        r[0] = Val::I32(if n == 0 { -1 } else { i32::from(byte[0]) });
        Ok(())
    });
    lib.register("rt.Files", "close", &[I32], &[], |c, p, _| {
        let handle = arg_i32(p, 0)?;
        c.data_mut().files.remove(&handle);
        Ok(())
    });
}
