/// Isolated loading of restricted code
///
/// Every import of a restricted unit that leaves the restricted set is
/// checked against the whitelist while the unit is instantiated. Denied
/// function imports are bound to a stub raising [`PermissionViolation`]; the
/// restricted code never gets a handle to the real target. Imports between
/// restricted units are not checked. Units are instantiated lazily, in
/// dependency order, into a store owned by one [`LoaderContext`].
use crate::config::policy::whitelist::{CallKind, Whitelist};
use crate::config::types::{ExecutionRequest, Result, SandboxError, Value};
use crate::loader::hostlib::HostLibrary;
use crate::loader::CodePath;
use crate::observability::audit::events;
use crate::runtime::engine::{self, HostState, KillSwitch};
use crate::runtime::traps::PermissionViolation;
use anyhow::anyhow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use wasmtime::{Extern, ExternType, Func, FuncType, Instance, Module, Store, Val, ValType};

/// Outcome of guest code: a value, or whatever the guest raised.
pub type Invocation = std::result::Result<Value, anyhow::Error>;

pub fn val_type_name(ty: &ValType) -> String {
    match ty {
        ValType::I32 => "i32".to_string(),
        ValType::I64 => "i64".to_string(),
        ValType::F32 => "f32".to_string(),
        ValType::F64 => "f64".to_string(),
        ValType::V128 => "v128".to_string(),
        _ => "ref".to_string(),
    }
}

fn func_signature(ty: &FuncType) -> (Vec<String>, Vec<String>) {
    (
        ty.params().map(|t| val_type_name(&t)).collect(),
        ty.results().map(|t| val_type_name(&t)).collect(),
    )
}

fn extern_kind(ty: &ExternType) -> &'static str {
    match ty {
        ExternType::Func(_) => "function",
        ExternType::Memory(_) => "memory",
        ExternType::Global(_) => "global",
        ExternType::Table(_) => "table",
        _ => "other",
    }
}

struct UnitSlot {
    module: Module,
    restricted: bool,
}

/// Compiled restricted and support units plus the policy that links them.
///
/// Holds no guest state; every [`LoaderContext`] it creates is independent.
pub struct IsolatedLoader {
    units: Arc<HashMap<String, UnitSlot>>,
    whitelist: Option<Arc<Whitelist>>,
    host: Arc<HostLibrary>,
}

impl IsolatedLoader {
    /// Resolve and compile both code paths. A name defined in both resolves
    /// to the restricted unit.
    pub fn new(
        restricted: &CodePath,
        support: &CodePath,
        whitelist: Option<Whitelist>,
        host: Arc<HostLibrary>,
    ) -> Result<Self> {
        let mut units = HashMap::new();
        for unit in restricted.resolve()? {
            let module = engine::compile(unit.name(), unit.bytes())?;
            units.insert(
                unit.name().to_string(),
                UnitSlot {
                    module,
                    restricted: true,
                },
            );
        }
        for unit in support.resolve()? {
            if units.contains_key(unit.name()) {
                log::debug!("Support unit '{}' shadowed by restricted unit", unit.name());
                continue;
            }
            let module = engine::compile(unit.name(), unit.bytes())?;
            units.insert(
                unit.name().to_string(),
                UnitSlot {
                    module,
                    restricted: false,
                },
            );
        }
        log::debug!(
            "Loader ready: {} units, whitelist {}",
            units.len(),
            whitelist
                .as_ref()
                .map(|w| format!("with {} entries", w.len()))
                .unwrap_or_else(|| "disabled".to_string())
        );
        Ok(Self {
            units: Arc::new(units),
            whitelist: whitelist.map(Arc::new),
            host,
        })
    }

    /// A new context with its own store: fresh guest state.
    pub fn fresh_context(&self, kill: Arc<KillSwitch>, memory_limit: u64) -> LoaderContext {
        LoaderContext {
            store: engine::new_store(kill, memory_limit),
            units: self.units.clone(),
            whitelist: self.whitelist.clone(),
            host: self.host.clone(),
            instances: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }
}

/// One independent execution context: a store and its instances.
pub struct LoaderContext {
    store: Store<HostState>,
    units: Arc<HashMap<String, UnitSlot>>,
    whitelist: Option<Arc<Whitelist>>,
    host: Arc<HostLibrary>,
    instances: HashMap<String, Instance>,
    in_progress: HashSet<String>,
}

/// Split a loader error into caller misconfiguration and guest behaviour.
fn split(error: anyhow::Error) -> Result<Invocation> {
    match error.downcast::<SandboxError>() {
        Ok(structural) => Err(structural),
        Err(guest) => Ok(Err(guest)),
    }
}

impl LoaderContext {
    /// Replace the kill switch polled by this context's store.
    pub fn set_kill_switch(&mut self, kill: Arc<KillSwitch>) {
        self.store.data_mut().kill = kill;
    }

    /// Invoke a static entry point.
    ///
    /// `Err` is a structural problem with the request or the code paths;
    /// `Ok(Err(_))` is anything the guest raised, including at load time.
    pub fn invoke(&mut self, request: &ExecutionRequest) -> Result<Invocation> {
        if !self.units.contains_key(&request.entry_type) {
            return Err(SandboxError::EntryTypeNotFound(request.entry_type.clone()));
        }
        let instance = match self.instantiate(&request.entry_type) {
            Ok(instance) => instance,
            Err(e) => return split(e),
        };

        let func = instance
            .get_func(&mut self.store, &request.entry_member)
            .ok_or_else(|| SandboxError::EntryMemberNotFound {
                type_name: request.entry_type.clone(),
                member: request.entry_member.clone(),
            })?;
        let ty = func.ty(&self.store);
        check_arguments(request, &ty)?;

        let args = match self.lower_arguments(instance, request) {
            Ok(args) => args,
            Err(e) => return split(e),
        };
        let mut results = vec![Val::I32(0); ty.results().len()];
        if let Err(e) = func.call(&mut self.store, &args, &mut results) {
            return Ok(Err(e));
        }
        Ok(Ok(lift_results(&results)))
    }

    fn lower_arguments(
        &mut self,
        instance: Instance,
        request: &ExecutionRequest,
    ) -> anyhow::Result<Vec<Val>> {
        let mut vals = Vec::new();
        for (param_type, arg) in request.param_types.iter().zip(&request.args) {
            match (param_type.as_str(), arg) {
                ("i32", Value::I32(v)) => vals.push(Val::I32(*v)),
                ("i64", Value::I64(v)) => vals.push(Val::I64(*v)),
                ("i64", Value::I32(v)) => vals.push(Val::I64(i64::from(*v))),
                ("f32", Value::F32(v)) => vals.push(Val::F32(v.to_bits())),
                ("f64", Value::F64(v)) => vals.push(Val::F64(v.to_bits())),
                ("f64", Value::F32(v)) => vals.push(Val::F64(f64::from(*v).to_bits())),
                ("bool", Value::Bool(v)) => vals.push(Val::I32(i32::from(*v))),
                ("string", Value::Str(s)) => {
                    let (ptr, len) = self.write_string(instance, request, s)?;
                    vals.push(Val::I32(ptr));
                    vals.push(Val::I32(len));
                }
                (param_type, arg) => {
                    return Err(SandboxError::SignatureMismatch {
                        entry: request.entry_name(),
                        details: format!("argument {} is not a {}", arg, param_type),
                    }
                    .into())
                }
            }
        }
        Ok(vals)
    }

    fn write_string(
        &mut self,
        instance: Instance,
        request: &ExecutionRequest,
        text: &str,
    ) -> anyhow::Result<(i32, i32)> {
        let missing = || SandboxError::SignatureMismatch {
            entry: request.entry_name(),
            details: "string arguments need exported alloc(i32) -> i32 and memory".to_string(),
        };
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut self.store, "alloc")
            .map_err(|_| missing())?;
        let memory = instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(missing)?;
        let len = i32::try_from(text.len()).map_err(|_| anyhow!("string argument too long"))?;
        let ptr = alloc.call(&mut self.store, len)?;
        memory.write(&mut self.store, ptr as u32 as usize, text.as_bytes())?;
        Ok((ptr, len))
    }

    /// Instantiate `name` and, first, everything it imports.
    fn instantiate(&mut self, name: &str) -> anyhow::Result<Instance> {
        if let Some(instance) = self.instances.get(name) {
            return Ok(*instance);
        }
        if !self.in_progress.insert(name.to_string()) {
            return Err(SandboxError::CyclicDependency(name.to_string()).into());
        }
        let result = self.link_and_instantiate(name);
        self.in_progress.remove(name);
        let instance = result?;
        self.instances.insert(name.to_string(), instance);
        Ok(instance)
    }

    fn link_and_instantiate(&mut self, name: &str) -> anyhow::Result<Instance> {
        let units = self.units.clone();
        let slot = units
            .get(name)
            .ok_or_else(|| SandboxError::EntryTypeNotFound(name.to_string()))?;

        let mut imports: Vec<Extern> = Vec::new();
        for import in slot.module.imports() {
            let type_name = import.module();
            let member = import.name();
            let ty = import.ty();

            let crosses_boundary = slot.restricted && !self.is_restricted_unit(type_name);
            if crosses_boundary {
                if let Some(whitelist) = &self.whitelist {
                    let params = match &ty {
                        ExternType::Func(f) => Some(func_signature(f).0),
                        _ => None,
                    };
                    let permitted = whitelist.permits(
                        CallKind::of_member(member),
                        type_name,
                        member,
                        params.as_deref(),
                    );
                    if !permitted {
                        let description = match &params {
                            Some(p) => format!("{}.{}({})", type_name, member, p.join(",")),
                            None => format!("{}.{}", type_name, member),
                        };
                        events::permission_denied(name, description.clone());
                        match ty {
                            ExternType::Func(func_ty) => {
                                imports.push(violation_stub(&mut self.store, func_ty, description));
                                continue;
                            }
                            other => {
                                return Err(PermissionViolation(format!(
                                    "{} ({})",
                                    description,
                                    extern_kind(&other)
                                ))
                                .into())
                            }
                        }
                    }
                }
            }

            imports.push(self.resolve_import(name, type_name, member, ty)?);
        }

        let instance = Instance::new(&mut self.store, &slot.module, &imports)?;
        log::debug!("Instantiated unit '{}'", name);
        Ok(instance)
    }

    fn is_restricted_unit(&self, name: &str) -> bool {
        self.units.get(name).map(|s| s.restricted).unwrap_or(false)
    }

    fn resolve_import(
        &mut self,
        unit: &str,
        type_name: &str,
        member: &str,
        ty: ExternType,
    ) -> anyhow::Result<Extern> {
        let unresolved = || SandboxError::UnresolvedImport {
            unit: unit.to_string(),
            type_name: type_name.to_string(),
            member: member.to_string(),
        };

        if self.units.contains_key(type_name) {
            let target = self.instantiate(type_name)?;
            let export = target
                .get_export(&mut self.store, member)
                .ok_or_else(unresolved)?;
            let found = export.ty(&self.store);
            let compatible = match (&ty, &found) {
                (ExternType::Func(want), ExternType::Func(have)) => {
                    func_signature(want) == func_signature(have)
                }
                (want, have) => extern_kind(want) == extern_kind(have),
            };
            if !compatible {
                return Err(SandboxError::SignatureMismatch {
                    entry: format!("{}.{}", type_name, member),
                    details: format!("import by '{}' does not match the export", unit),
                }
                .into());
            }
            return Ok(export);
        }

        if let ExternType::Func(func_ty) = ty {
            if let Some(host_fn) = self.host.lookup(type_name, member, &func_ty) {
                let f = host_fn.func();
                let func = Func::new(&mut self.store, func_ty, move |mut caller, params, results| {
                    f(&mut caller, params, results)
                });
                return Ok(func.into());
            }
        }
        Err(unresolved().into())
    }
}

fn violation_stub(store: &mut Store<HostState>, ty: FuncType, description: String) -> Extern {
    let violation = PermissionViolation(description);
    Func::new(store, ty, move |_, _, _| Err(violation.clone().into())).into()
}

fn expand_param_type(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "i32" | "bool" => Some(&["i32"]),
        "i64" => Some(&["i64"]),
        "f32" => Some(&["f32"]),
        "f64" => Some(&["f64"]),
        "string" => Some(&["i32", "i32"]),
        _ => None,
    }
}

/// Structural checks of a request against the entry's wasm signature.
fn check_arguments(request: &ExecutionRequest, ty: &FuncType) -> Result<()> {
    let mismatch = |details: String| SandboxError::SignatureMismatch {
        entry: request.entry_name(),
        details,
    };
    if request.param_types.len() != request.args.len() {
        return Err(mismatch(format!(
            "{} parameter types for {} arguments",
            request.param_types.len(),
            request.args.len()
        )));
    }
    let mut expanded: Vec<&str> = Vec::new();
    for param_type in &request.param_types {
        let lowered = expand_param_type(param_type)
            .ok_or_else(|| mismatch(format!("unknown parameter type '{}'", param_type)))?;
        expanded.extend_from_slice(lowered);
    }
    let (params, _) = func_signature(ty);
    if !expanded.iter().copied().eq(params.iter().map(String::as_str)) {
        return Err(mismatch(format!(
            "requested ({}) but entry takes ({})",
            request.param_types.join(","),
            params.join(",")
        )));
    }
    Ok(())
}

fn lift(val: &Val) -> Value {
    match val {
        Val::I32(v) => Value::I32(*v),
        Val::I64(v) => Value::I64(*v),
        Val::F32(bits) => Value::F32(f32::from_bits(*bits)),
        Val::F64(bits) => Value::F64(f64::from_bits(*bits)),
        _ => Value::Unit,
    }
}

fn lift_results(results: &[Val]) -> Value {
    match results {
        [] => Value::Unit,
        [single] => lift(single),
        many => Value::List(many.iter().map(lift).collect()),
    }
}
