//! Default Runtime: the Wasmtime-backed implementation of [`Runtime`].
//!
//! Uses Wasmtime's classic (non-Component-Model) API: a plain `Module` is
//! linked against exactly the host imports the caller was granted, fuel is
//! configured on the `Store`, and epoch interruption backs [`Runtime::interrupt_handle`].
//!
//! # Design pattern
//!
//! `WasmtimeRuntime` holds only a validated `Config` template, not a shared
//! `Engine`. Each [`compile`](Runtime::compile) call builds its own fresh
//! `Engine`, and the resulting [`WasmtimeModule`] carries that engine through
//! instantiation into the store. Wasmtime's epoch counter lives on the
//! `Engine`, so giving every invocation its own engine is what makes
//! [`WasmtimeInterruptHandle::interrupt`] affect only that one invocation —
//! a shared engine would let one timeout bump the epoch for every concurrent
//! call riding on it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;
use wasmtime::{Caller, Config, Engine, Extern, FuncType, Global, Instance, Linker, Memory, Store, Val, ValType};

use crate::dump::TrapKind;
use crate::host_functions::{HostContext, HostError, HostFn, HostFunctionBinding};
use crate::runtime::contract::{CallError, CallOutcome, Interrupt, Runtime, RuntimeError};
use crate::value::{Value, ValueType};

/// Failure constructing a Wasmtime engine. Distinct from [`RuntimeError`]
/// because [`WasmtimeRuntime::new`] surfaces it once, up front, by building
/// and discarding a throwaway engine to validate the config template.
#[derive(Debug, Error)]
#[error("failed to initialize wasmtime engine: {0}")]
pub struct EngineInitError(String);

/// Wasmtime-backed [`Runtime`].
///
/// Cheap to clone: the `Config` template is behind an `Arc`, but no `Engine`
/// is shared across invocations — see the module-level design note.
#[derive(Clone)]
pub struct WasmtimeRuntime {
    config: Arc<Config>,
}

impl WasmtimeRuntime {
    /// Build the config template with fuel metering and epoch interruption
    /// enabled, and validate it by constructing (and dropping) one engine.
    /// Both settings are required for Munition's timeout and fuel
    /// guarantees — without them the contract cannot be satisfied.
    pub fn new() -> Result<Self, EngineInitError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        Engine::new(&config).map_err(|e| EngineInitError(e.to_string()))?;
        Ok(Self { config: Arc::new(config) })
    }

    fn new_engine(&self) -> Result<Engine, EngineInitError> {
        Engine::new(&self.config).map_err(|e| EngineInitError(e.to_string()))
    }
}

impl std::fmt::Debug for WasmtimeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeRuntime").finish()
    }
}

/// A compiled module paired with the engine it was compiled against. Every
/// `compile` call gets its own engine, so this pairing is load-bearing: the
/// store and linker built in `instantiate` must come from the same engine.
pub struct WasmtimeModule {
    engine: Engine,
    module: wasmtime::Module,
}

/// Engine-owned handles a `WasmtimeRuntime` store retains across a call, so
/// that `read_memory`/`read_globals`/`fuel_consumed` stay valid after a trap.
pub struct WasmtimeStore {
    store: Store<()>,
    memory: Option<Memory>,
    globals: Vec<Global>,
    initial_fuel: u64,
    engine: Engine,
}

/// Interrupts exactly one invocation's `call`, by bumping the epoch of the
/// engine that invocation's store was built from. Since every invocation
/// gets its own engine, no other invocation observes this bump.
#[derive(Clone)]
pub struct WasmtimeInterruptHandle {
    engine: Engine,
}

impl Interrupt for WasmtimeInterruptHandle {
    fn interrupt(&self) {
        self.engine.increment_epoch();
    }
}

impl Runtime for WasmtimeRuntime {
    type Module = WasmtimeModule;
    type Instance = Instance;
    type Store = WasmtimeStore;
    type InterruptHandle = WasmtimeInterruptHandle;

    fn compile(&self, wasm: &[u8]) -> Result<WasmtimeModule, RuntimeError> {
        let engine = self
            .new_engine()
            .map_err(|e| RuntimeError::InstantiationTrap { message: e.to_string() })?;
        trace!("compiling module against a fresh engine");
        let module = wasmtime::Module::new(&engine, wasm).map_err(|e| RuntimeError::InvalidModule { reason: e.to_string() })?;
        Ok(WasmtimeModule { engine, module })
    }

    fn instantiate(
        &self,
        module: &WasmtimeModule,
        imports: &[&'static HostFunctionBinding],
        initial_fuel: u64,
    ) -> Result<(Instance, WasmtimeStore), RuntimeError> {
        let mut store = Store::new(&module.engine, ());
        store
            .set_fuel(initial_fuel)
            .map_err(|e| RuntimeError::InstantiationTrap { message: format!("failed to set fuel: {e}") })?;
        store.set_epoch_deadline(1);

        let mut linker = Linker::new(&module.engine);
        for binding in imports {
            let func_type = FuncType::new(
                &module.engine,
                binding.params.iter().map(|t| value_type_to_valtype(*t)),
                binding.results.iter().map(|t| value_type_to_valtype(*t)),
            );
            let native = binding.native;
            linker
                .func_new(binding.namespace, binding.name, func_type, move |caller, args, results| {
                    host_trampoline(native, caller, args, results)
                })
                .map_err(|e| RuntimeError::LinkError { missing_import: format!("{}::{}: {e}", binding.namespace, binding.name) })?;
        }

        let instance = linker.instantiate(&mut store, &module.module).map_err(|e| {
            let message = e.to_string();
            if message.contains("unknown import") {
                RuntimeError::LinkError { missing_import: message }
            } else {
                RuntimeError::InstantiationTrap { message }
            }
        })?;

        let memory = instance.get_export(&mut store, "memory").and_then(Extern::into_memory);
        let globals = instance.exports(&mut store).filter_map(|export| export.into_global()).collect();

        trace!("module instantiated");
        Ok((instance, WasmtimeStore { store, memory, globals, initial_fuel, engine: module.engine.clone() }))
    }

    fn call(
        &self,
        instance: &Instance,
        store: &mut WasmtimeStore,
        function: &str,
        args: &[Value],
    ) -> Result<CallOutcome, CallError> {
        let func = instance
            .get_func(&mut store.store, function)
            .ok_or_else(|| CallError::Link(format!("function not exported: {function}")))?;

        let wasm_args: Vec<Val> = args.iter().map(|v| value_to_val(*v)).collect();
        let result_count = func.ty(&store.store).results().len();
        let mut raw_results = vec![Val::I32(0); result_count];

        trace!(function, "entering wasmtime call");
        match func.call(&mut store.store, &wasm_args, &mut raw_results) {
            Ok(()) => {
                let values = raw_results.iter().filter_map(val_to_value).collect();
                let fuel_remaining = store.store.get_fuel().unwrap_or(0);
                trace!(function, fuel_remaining, "wasmtime call returned");
                Ok(CallOutcome { values, fuel_remaining })
            }
            Err(e) => {
                let classified = classify_call_error(&e);
                trace!(function, ?classified, "wasmtime call failed");
                Err(classified)
            }
        }
    }

    fn read_memory(&self, store: &WasmtimeStore, offset: u32, len: u32) -> Result<Vec<u8>, RuntimeError> {
        let memory = store
            .memory
            .as_ref()
            .ok_or(RuntimeError::OutOfBounds { offset, len })?;
        let data = memory.data(&store.store);
        let start = offset as usize;
        let end = start + len as usize;
        data.get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(RuntimeError::OutOfBounds { offset, len })
    }

    fn read_all_memory(&self, store: &WasmtimeStore) -> Vec<u8> {
        match &store.memory {
            Some(memory) => memory.data(&store.store).to_vec(),
            None => Vec::new(),
        }
    }

    fn read_globals(&self, store: &WasmtimeStore) -> Vec<Value> {
        store.globals.iter().filter_map(|g| val_to_value(&g.get(&store.store))).collect()
    }

    fn fuel_consumed(&self, store: &WasmtimeStore) -> u64 {
        store.initial_fuel.saturating_sub(store.store.get_fuel().unwrap_or(0))
    }

    fn fuel_remaining(&self, store: &WasmtimeStore) -> u64 {
        store.store.get_fuel().unwrap_or(0)
    }

    fn cleanup(&self, instance: Instance, store: WasmtimeStore) {
        drop(instance);
        drop(store);
    }

    fn interrupt_handle(&self, store: &WasmtimeStore) -> WasmtimeInterruptHandle {
        WasmtimeInterruptHandle { engine: store.engine.clone() }
    }
}

/// Sentinel wrapping a caught host-function panic, so it can be recognized
/// downstream instead of falling through to a generic link error — a
/// native host function panicking must surface as a host-panic trap, not
/// an opaque link failure.
#[derive(Debug, Error)]
#[error("host function panicked: {0}")]
struct HostPanic(String);

/// Maps a `Func::call` failure into the contract's closed error taxonomy.
pub(crate) fn classify_call_error(err: &wasmtime::Error) -> CallError {
    if let Some(panic) = err.downcast_ref::<HostPanic>() {
        return CallError::Trap { kind: TrapKind::HostPanic, message: panic.0.clone() };
    }
    if let Some(trap) = err.downcast_ref::<wasmtime::Trap>() {
        if *trap == wasmtime::Trap::OutOfFuel {
            return CallError::FuelExhausted;
        }
        return CallError::Trap { kind: classify_trap(*trap), message: trap.to_string() };
    }
    CallError::Link(err.to_string())
}

/// Maps a Wasmtime trap code onto the framework's [`TrapKind`].
pub(crate) fn classify_trap(trap: wasmtime::Trap) -> TrapKind {
    match trap {
        wasmtime::Trap::UnreachableCodeReached => TrapKind::Unreachable,
        wasmtime::Trap::IntegerDivisionByZero => TrapKind::IntegerDivideByZero,
        wasmtime::Trap::IntegerOverflow => TrapKind::IntegerOverflow,
        wasmtime::Trap::MemoryOutOfBounds => TrapKind::OutOfBoundsMemoryAccess,
        wasmtime::Trap::BadSignature => TrapKind::IndirectCallTypeMismatch,
        wasmtime::Trap::StackOverflow => TrapKind::StackOverflow,
        wasmtime::Trap::TableOutOfBounds | wasmtime::Trap::IndirectCallToNull => TrapKind::UndefinedElement,
        _ => TrapKind::Unknown,
    }
}

fn value_type_to_valtype(ty: ValueType) -> ValType {
    match ty {
        ValueType::I32 => ValType::I32,
        ValueType::I64 => ValType::I64,
        ValueType::F32 => ValType::F32,
        ValueType::F64 => ValType::F64,
    }
}

fn value_to_val(value: Value) -> Val {
    match value {
        Value::I32(v) => Val::I32(v),
        Value::I64(v) => Val::I64(v),
        Value::F32(v) => Val::F32(v.to_bits()),
        Value::F64(v) => Val::F64(v.to_bits()),
    }
}

fn val_to_value(val: &Val) -> Option<Value> {
    match val {
        Val::I32(v) => Some(Value::I32(*v)),
        Val::I64(v) => Some(Value::I64(*v)),
        Val::F32(bits) => Some(Value::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Some(Value::F64(f64::from_bits(*bits))),
        _ => None,
    }
}

/// Lends a running guest's exported memory to a native host function,
/// fulfilling [`HostContext`] without exposing Wasmtime types outside this
/// module.
struct CallerMemory<'a> {
    caller: Caller<'a, ()>,
    memory: Option<Memory>,
}

impl HostContext for CallerMemory<'_> {
    fn read_memory(&self, offset: u32, len: u32) -> Result<Vec<u8>, HostError> {
        let memory = self.memory.ok_or(HostError::OutOfBounds { offset, len })?;
        let data = memory.data(&self.caller);
        let start = offset as usize;
        let end = start + len as usize;
        data.get(start..end).map(<[u8]>::to_vec).ok_or(HostError::OutOfBounds { offset, len })
    }

    fn write_memory(&mut self, offset: u32, data: &[u8]) -> Result<(), HostError> {
        let memory = self.memory.ok_or(HostError::OutOfBounds { offset, len: data.len() as u32 })?;
        memory
            .write(&mut self.caller, offset as usize, data)
            .map_err(|_| HostError::OutOfBounds { offset, len: data.len() as u32 })
    }
}

/// Bridges a [`HostFn`] (engine-agnostic) to Wasmtime's `func_new` closure
/// shape, catching panics at the host-call boundary so a misbehaving
/// native host function degrades to a trap instead of unwinding into
/// the guest.
fn host_trampoline(native: HostFn, mut caller: Caller<'_, ()>, args: &[Val], results: &mut [Val]) -> wasmtime::Result<()> {
    let memory = caller.get_export("memory").and_then(Extern::into_memory);
    let values: Vec<Value> = match args.iter().map(val_to_value).collect::<Option<Vec<_>>>() {
        Some(values) => values,
        None => return Err(wasmtime::Error::msg("unsupported argument type in host call")),
    };

    let mut ctx = CallerMemory { caller, memory };
    match std::panic::catch_unwind(AssertUnwindSafe(|| native(&mut ctx, &values))) {
        Ok(Ok(returned)) => {
            for (slot, value) in results.iter_mut().zip(returned) {
                *slot = value_to_val(value);
            }
            Ok(())
        }
        Ok(Err(host_err)) => Err(wasmtime::Error::new(host_err)),
        Err(panic) => {
            let message = panic_message(&panic);
            tracing::warn!(message, "host function panicked");
            Err(wasmtime::Error::new(HostPanic(message)))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_initializes_with_fuel_and_epoch_support() {
        let runtime = WasmtimeRuntime::new();
        assert!(runtime.is_ok());
    }

    #[test]
    fn classify_trap_maps_known_codes() {
        assert_eq!(classify_trap(wasmtime::Trap::UnreachableCodeReached), TrapKind::Unreachable);
        assert_eq!(classify_trap(wasmtime::Trap::IntegerDivisionByZero), TrapKind::IntegerDivideByZero);
        assert_eq!(classify_trap(wasmtime::Trap::StackOverflow), TrapKind::StackOverflow);
    }

    #[test]
    fn compile_rejects_invalid_bytes() {
        let runtime = WasmtimeRuntime::new().unwrap();
        let err = runtime.compile(b"not wasm").unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidModule { .. }));
    }

    #[test]
    fn compile_accepts_minimal_module() {
        let runtime = WasmtimeRuntime::new().unwrap();
        let wasm = wat::parse_str("(module)").unwrap();
        assert!(runtime.compile(&wasm).is_ok());
    }

    #[test]
    fn instantiate_and_call_exported_add_function() {
        let runtime = WasmtimeRuntime::new().unwrap();
        let wasm = wat::parse_str(
            r#"(module (func (export "add") (param i32 i32) (result i32) local.get 0 local.get 1 i32.add))"#,
        )
        .unwrap();
        let module = runtime.compile(&wasm).unwrap();
        let (instance, mut store) = runtime.instantiate(&module, &[], 10_000).unwrap();
        let outcome = runtime.call(&instance, &mut store, "add", &[Value::I32(2), Value::I32(3)]).unwrap();
        assert_eq!(outcome.values, vec![Value::I32(5)]);
        assert!(outcome.fuel_remaining < 10_000);
        runtime.cleanup(instance, store);
    }

    #[test]
    fn call_reports_fuel_exhaustion() {
        let runtime = WasmtimeRuntime::new().unwrap();
        let wasm = wat::parse_str(
            r#"(module (func (export "spin") (loop br 0)))"#,
        )
        .unwrap();
        let module = runtime.compile(&wasm).unwrap();
        let (instance, mut store) = runtime.instantiate(&module, &[], 500).unwrap();
        let err = runtime.call(&instance, &mut store, "spin", &[]).unwrap_err();
        assert!(matches!(err, CallError::FuelExhausted));
    }

    #[test]
    fn call_classifies_unreachable_trap() {
        let runtime = WasmtimeRuntime::new().unwrap();
        let wasm = wat::parse_str(r#"(module (func (export "boom") unreachable))"#).unwrap();
        let module = runtime.compile(&wasm).unwrap();
        let (instance, mut store) = runtime.instantiate(&module, &[], 10_000).unwrap();
        let err = runtime.call(&instance, &mut store, "boom", &[]).unwrap_err();
        assert!(matches!(err, CallError::Trap { kind: TrapKind::Unreachable, .. }));
    }

    #[test]
    fn host_function_panic_is_classified_as_host_panic_trap() {
        let err = wasmtime::Error::new(HostPanic("boom".to_string()));
        let classified = classify_call_error(&err);
        assert!(matches!(classified, CallError::Trap { kind: TrapKind::HostPanic, .. }));
    }

    #[test]
    fn instantiate_fails_to_link_missing_import() {
        let runtime = WasmtimeRuntime::new().unwrap();
        let wasm = wat::parse_str(r#"(module (import "env" "fs_read" (func (param i32 i32 i32 i32) (result i32))))"#).unwrap();
        let module = runtime.compile(&wasm).unwrap();
        let err = runtime.instantiate(&module, &[], 10_000).unwrap_err();
        assert!(matches!(err, RuntimeError::LinkError { .. }));
    }

    #[test]
    fn interrupting_one_invocations_handle_does_not_affect_a_sibling() {
        let runtime = WasmtimeRuntime::new().unwrap();
        let wasm = wat::parse_str(r#"(module (func (export "spin") (loop br 0)))"#).unwrap();

        let module_a = runtime.compile(&wasm).unwrap();
        let (instance_a, store_a) = runtime.instantiate(&module_a, &[], 10_000).unwrap();
        let handle_a = runtime.interrupt_handle(&store_a);

        let module_b = runtime.compile(&wasm).unwrap();
        let (instance_b, mut store_b) = runtime.instantiate(&module_b, &[], 10_000).unwrap();

        // Interrupting invocation A's handle must not trip invocation B's
        // epoch deadline, since each has its own engine.
        handle_a.interrupt();
        let outcome = runtime.call(&instance_b, &mut store_b, "spin", &[]);
        assert!(matches!(outcome.unwrap_err(), CallError::FuelExhausted));

        runtime.cleanup(instance_a, store_a);
    }
}
