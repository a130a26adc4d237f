//! WebAssembly sandbox.
//!
//! [`WasmSandbox`] owns the wasmtime [`Engine`] and runs compiled guest
//! modules in a fresh [`Store`] per call.  Each store carries:
//!
//! - a fuel budget, bounding CPU deterministically so a guest orphaned by a
//!   host-side timeout still stops on its own;
//! - a [`ResourceLimiter`] that refuses linear-memory growth past the
//!   configured ceiling and remembers that it did;
//! - host functions for logging and result passing.
//!
//! # Guest ABI
//!
//! Modules served through [`WasmSandbox::invoke`] export `memory` and
//! `execute(op_ptr: i32, op_len: i32, input_ptr: i32, input_len: i32) -> i32`
//! and may export `alloc(len: i32) -> i32` to choose where the host writes
//! the operation name and JSON input (offset 0 otherwise).  The guest hands
//! back its JSON output through the `env.host_set_result(ptr, len)` import.
//! A non-zero return from `execute` is a failure whose message is whatever
//! the guest passed to `host_set_result`.
//!
//! Everything here is synchronous and CPU-bound; async callers run it on
//! [`tokio::task::spawn_blocking`].

use wasmtime::{
    AsContextMut, Caller, Engine, Extern, Func, Instance, Linker, Module, ResourceLimiter, Store,
    Trap, Val, ValType,
};

use crate::error::SandboxError;

type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Upper bound on table elements a guest may allocate.
const MAX_TABLE_ELEMENTS: usize = 10_000;

/// Resource ceilings for a single guest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestLimits {
    /// Linear-memory ceiling in bytes.
    pub max_memory: usize,
    /// Fuel budget (abstract instruction count).
    pub max_fuel: u64,
}

/// What a guest call produced.
#[derive(Debug, Clone, Default)]
pub struct GuestOutput {
    /// Bytes passed to `host_set_result`.
    pub output: Vec<u8>,
    /// Values returned by the called export.
    pub returns: Vec<serde_json::Value>,
    /// Messages passed to `host_log`.
    pub logs: Vec<String>,
    /// Largest linear memory size reached, in bytes.
    pub memory_peak: usize,
    pub fuel_consumed: u64,
}

/// Per-call state stored in the wasmtime [`Store`].
struct HostState {
    output: Vec<u8>,
    logs: Vec<String>,
    memory_limit: usize,
    memory_peak: usize,
    /// Size of the first growth request that was refused.
    memory_denied: Option<usize>,
}

impl HostState {
    fn new(limits: &GuestLimits) -> Self {
        Self {
            output: Vec::new(),
            logs: Vec::new(),
            memory_limit: limits.max_memory,
            memory_peak: 0,
            memory_denied: None,
        }
    }
}

impl ResourceLimiter for HostState {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.memory_limit {
            self.memory_denied.get_or_insert(desired);
            return Ok(false);
        }
        self.memory_peak = self.memory_peak.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }
}

/// The WebAssembly execution sandbox.
#[derive(Clone)]
pub struct WasmSandbox {
    engine: Engine,
}

impl WasmSandbox {
    /// Create a sandbox with fuel metering enabled.
    pub fn new() -> SandboxResult<Self> {
        let mut wasm_config = wasmtime::Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.wasm_memory64(false);

        let engine = Engine::new(&wasm_config)
            .map_err(|e| SandboxError::Compilation(format!("failed to create wasm engine: {e}")))?;

        tracing::debug!("wasm sandbox engine initialized");
        Ok(Self { engine })
    }

    /// Return a reference to the wasmtime [`Engine`].
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Compile a module from binary `.wasm` bytes or WAT text.
    pub fn compile(&self, bytes: &[u8]) -> SandboxResult<Module> {
        Module::new(&self.engine, bytes).map_err(|e| SandboxError::Compilation(e.to_string()))
    }

    /// Run the guest's `execute` export with `operation` and `input`.
    pub fn invoke(
        &self,
        module: &Module,
        operation: &str,
        input: &[u8],
        limits: &GuestLimits,
    ) -> SandboxResult<GuestOutput> {
        let (mut store, instance) = self.instantiate(module, limits)?;

        let memory = instance
            .get_memory(store.as_context_mut(), "memory")
            .ok_or_else(|| SandboxError::Execution("module has no exported memory".into()))?;

        let op_bytes = operation.as_bytes();
        let total = op_bytes.len() + input.len();
        let op_ptr = Self::guest_alloc(&mut store, &instance, total)?;
        let input_ptr = op_ptr + op_bytes.len();

        if op_ptr + total > memory.data_size(&store) {
            return Err(SandboxError::MemoryLimit {
                requested: op_ptr + total,
                limit: memory.data_size(&store),
            });
        }
        memory
            .write(&mut store, op_ptr, op_bytes)
            .map_err(|e| SandboxError::Execution(e.to_string()))?;
        memory
            .write(&mut store, input_ptr, input)
            .map_err(|e| SandboxError::Execution(e.to_string()))?;

        let execute_fn = instance
            .get_typed_func::<(i32, i32, i32, i32), i32>(store.as_context_mut(), "execute")
            .map_err(|e| SandboxError::Execution(format!("missing execute export: {e}")))?;

        let call = execute_fn.call(
            &mut store,
            (
                op_ptr as i32,
                op_bytes.len() as i32,
                input_ptr as i32,
                input.len() as i32,
            ),
        );
        let code = Self::finish_call(&mut store, limits, call)?;

        let mut out = Self::collect(&mut store, limits);
        if code != 0 {
            let message = String::from_utf8_lossy(&out.output).into_owned();
            return Err(SandboxError::Execution(if message.is_empty() {
                format!("execute returned non-zero code: {code}")
            } else {
                message
            }));
        }
        out.returns = vec![serde_json::Value::from(code)];
        Ok(out)
    }

    /// Call an arbitrary export with numeric arguments.
    ///
    /// Arguments are converted to the export's declared parameter types;
    /// results come back as JSON numbers.
    pub fn call_export(
        &self,
        module: &Module,
        function: &str,
        args: &[serde_json::Value],
        limits: &GuestLimits,
    ) -> SandboxResult<GuestOutput> {
        let (mut store, instance) = self.instantiate(module, limits)?;

        let func: Func = instance
            .get_func(store.as_context_mut(), function)
            .ok_or_else(|| SandboxError::Execution(format!("module has no export '{function}'")))?;
        let ty = func.ty(&store);

        let params: Vec<ValType> = ty.params().collect();
        if params.len() != args.len() {
            return Err(SandboxError::Execution(format!(
                "'{function}' takes {} argument(s), got {}",
                params.len(),
                args.len()
            )));
        }
        let params = params
            .iter()
            .zip(args)
            .map(|(ty, arg)| json_to_val(ty, arg))
            .collect::<SandboxResult<Vec<Val>>>()?;
        let mut results = vec![Val::I32(0); ty.results().len()];

        let call = func.call(&mut store, &params, &mut results);
        Self::finish_call(&mut store, limits, call)?;

        let mut out = Self::collect(&mut store, limits);
        out.returns = results.iter().map(val_to_json).collect();
        Ok(out)
    }

    fn instantiate(
        &self,
        module: &Module,
        limits: &GuestLimits,
    ) -> SandboxResult<(Store<HostState>, Instance)> {
        let mut store = Store::new(&self.engine, HostState::new(limits));
        store.limiter(|state| state);
        store
            .set_fuel(limits.max_fuel)
            .map_err(|e| SandboxError::Execution(e.to_string()))?;

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        Self::define_host_functions(&mut linker)?;

        match linker.instantiate(&mut store, module) {
            Ok(instance) => Ok((store, instance)),
            Err(e) => match store.data().memory_denied {
                Some(requested) => Err(SandboxError::MemoryLimit {
                    requested,
                    limit: limits.max_memory,
                }),
                None => Err(SandboxError::Instantiation(e.to_string())),
            },
        }
    }

    /// Map the raw call outcome, giving memory and fuel violations priority
    /// over whatever the guest did after hitting them.
    fn finish_call<T>(
        store: &mut Store<HostState>,
        limits: &GuestLimits,
        call: wasmtime::Result<T>,
    ) -> SandboxResult<T> {
        if let Some(requested) = store.data().memory_denied {
            return Err(SandboxError::MemoryLimit {
                requested,
                limit: limits.max_memory,
            });
        }
        call.map_err(|e| match e.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) => SandboxError::FuelExhausted {
                budget: limits.max_fuel,
            },
            _ => SandboxError::Trap(e.to_string()),
        })
    }

    fn collect(store: &mut Store<HostState>, limits: &GuestLimits) -> GuestOutput {
        let remaining = store.get_fuel().unwrap_or(0);
        let state = store.data_mut();
        GuestOutput {
            output: std::mem::take(&mut state.output),
            returns: Vec::new(),
            logs: std::mem::take(&mut state.logs),
            memory_peak: state.memory_peak,
            fuel_consumed: limits.max_fuel.saturating_sub(remaining),
        }
    }

    fn guest_alloc(
        store: &mut Store<HostState>,
        instance: &Instance,
        len: usize,
    ) -> SandboxResult<usize> {
        let Ok(alloc) = instance.get_typed_func::<i32, i32>(store.as_context_mut(), "alloc") else {
            return Ok(0);
        };
        let ptr = alloc
            .call(store.as_context_mut(), len as i32)
            .map_err(|e| SandboxError::Trap(e.to_string()))?;
        if ptr < 0 {
            return Err(SandboxError::Execution(format!("alloc returned {ptr}")));
        }
        Ok(ptr as usize)
    }

    /// Define the host functions that guests can import from `env`.
    fn define_host_functions(linker: &mut Linker<HostState>) -> SandboxResult<()> {
        linker
            .func_wrap(
                "env",
                "host_log",
                |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
                    let Some(msg) = read_guest_bytes(&mut caller, ptr, len) else {
                        return;
                    };
                    let msg = String::from_utf8_lossy(&msg).into_owned();
                    match level {
                        0 => tracing::error!(guest_msg = %msg),
                        1 => tracing::warn!(guest_msg = %msg),
                        2 => tracing::info!(guest_msg = %msg),
                        3 => tracing::debug!(guest_msg = %msg),
                        _ => tracing::trace!(guest_msg = %msg),
                    }
                    caller.data_mut().logs.push(msg);
                },
            )
            .map_err(|e| SandboxError::Instantiation(e.to_string()))?;

        linker
            .func_wrap(
                "env",
                "host_set_result",
                |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                    if let Some(bytes) = read_guest_bytes(&mut caller, ptr, len) {
                        caller.data_mut().output = bytes;
                    }
                },
            )
            .map_err(|e| SandboxError::Instantiation(e.to_string()))?;

        Ok(())
    }
}

fn read_guest_bytes(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(m)) => m,
        _ => return None,
    };
    if ptr < 0 || len < 0 {
        return None;
    }
    let data = memory.data(&*caller);
    let start = ptr as usize;
    let end = start.checked_add(len as usize)?;
    data.get(start..end).map(<[u8]>::to_vec)
}

fn json_to_val(ty: &ValType, arg: &serde_json::Value) -> SandboxResult<Val> {
    let bad = || SandboxError::Execution(format!("argument {arg} does not fit {ty}"));
    Ok(match ty {
        ValType::I32 => Val::I32(
            arg.as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(bad)?,
        ),
        ValType::I64 => Val::I64(arg.as_i64().ok_or_else(bad)?),
        ValType::F32 => Val::F32((arg.as_f64().ok_or_else(bad)? as f32).to_bits()),
        ValType::F64 => Val::F64(arg.as_f64().ok_or_else(bad)?.to_bits()),
        _ => return Err(bad()),
    })
}

fn val_to_json(val: &Val) -> serde_json::Value {
    match val {
        Val::I32(v) => serde_json::Value::from(*v),
        Val::I64(v) => serde_json::Value::from(*v),
        Val::F32(bits) => serde_json::Value::from(f32::from_bits(*bits) as f64),
        Val::F64(bits) => serde_json::Value::from(f64::from_bits(*bits)),
        _ => serde_json::Value::Null,
    }
}
