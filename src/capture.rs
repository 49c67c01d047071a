//! Forensic Capture: turn a trapped/timed-out store into a [`ForensicDump`].
//!
//! A single operation, run to completion with no suspension between steps
//! freeze observation, read fuel and globals, read and
//! compress memory, stamp a timestamp, return. Capture always runs before
//! [`crate::runtime::Runtime::cleanup`], never after.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::capability::CapabilitySet;
use crate::dump::{Cause, ForensicDump};
use crate::runtime::Runtime;
use crate::value::Value;

/// Everything about the invocation itself that a dump needs to record but
/// that the store does not carry: which function was called, with what
/// arguments, under which capability sets, and for how long.
pub struct InvocationContext<'a> {
    pub function: &'a str,
    pub args: &'a [Value],
    pub requested_capabilities: &'a CapabilitySet,
    pub granted_capabilities: &'a CapabilitySet,
    pub wall_time_ns: u64,
    /// Upper bound on captured memory, in bytes. `None` captures everything.
    pub max_memory_bytes: Option<usize>,
}

/// Produce an immutable dump from a live-or-trapped store and invocation context.
///
/// If reading memory or globals panics or otherwise fails to produce a
/// result through `runtime`, the dump still returns with empty/degraded
/// fields rather than propagating — a capture failure must never mask the
/// original `cause`.
pub fn capture<R: Runtime>(runtime: &R, store: &R::Store, cause: Cause, context: InvocationContext<'_>) -> ForensicDump {
    let fuel_consumed = runtime.fuel_consumed(store);
    let fuel_remaining = runtime.fuel_remaining(store);
    let globals = runtime.read_globals(store);

    let raw_memory = runtime.read_all_memory(store);
    let (memory_pages, memory_truncated) = match context.max_memory_bytes {
        Some(limit) if raw_memory.len() > limit => (raw_memory[..limit].to_vec(), true),
        _ => (raw_memory, false),
    };

    let captured_at_ns = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0);

    ForensicDump {
        cause,
        fuel_consumed,
        fuel_remaining,
        wall_time_ns: context.wall_time_ns,
        memory_pages,
        memory_truncated,
        globals,
        requested_capabilities: context.requested_capabilities.clone(),
        granted_capabilities: context.granted_capabilities.clone(),
        function: context.function.to_string(),
        args: context.args.to_vec(),
        captured_at_ns,
    }
}

/// A dump produced with no live store — instantiation never happened (e.g.
/// the module failed to compile, or an unknown capability was requested).
/// Memory and globals are necessarily empty; no instance ever existed.
pub fn capture_without_instance(cause: Cause, context: InvocationContext<'_>) -> ForensicDump {
    let captured_at_ns = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0);

    ForensicDump {
        cause,
        fuel_consumed: 0,
        fuel_remaining: 0,
        wall_time_ns: context.wall_time_ns,
        memory_pages: Vec::new(),
        memory_truncated: false,
        globals: Vec::new(),
        requested_capabilities: context.requested_capabilities.clone(),
        granted_capabilities: context.granted_capabilities.clone(),
        function: context.function.to_string(),
        args: context.args.to_vec(),
        captured_at_ns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::wasmtime_runtime::WasmtimeRuntime;

    #[test]
    fn capture_without_instance_has_empty_memory() {
        let context = InvocationContext {
            function: "boom",
            args: &[],
            requested_capabilities: &CapabilitySet::new(),
            granted_capabilities: &CapabilitySet::implicit(),
            wall_time_ns: 0,
            max_memory_bytes: None,
        };
        let dump = capture_without_instance(Cause::InvalidModule, context);
        assert!(dump.memory_pages.is_empty());
        assert!(!dump.memory_truncated);
        assert_eq!(dump.cause, Cause::InvalidModule);
    }

    #[test]
    fn capture_reads_live_store_state() {
        let runtime = WasmtimeRuntime::new().unwrap();
        let wasm = wat::parse_str(
            r#"(module
                (memory (export "memory") 1)
                (func (export "touch") (result i32) i32.const 42))"#,
        )
        .unwrap();
        let module = runtime.compile(&wasm).unwrap();
        let (instance, mut store) = runtime.instantiate(&module, &[], 10_000).unwrap();
        runtime.call(&instance, &mut store, "touch", &[]).unwrap();

        let context = InvocationContext {
            function: "touch",
            args: &[],
            requested_capabilities: &CapabilitySet::new(),
            granted_capabilities: &CapabilitySet::implicit(),
            wall_time_ns: 1_000,
            max_memory_bytes: None,
        };
        let dump = capture(&runtime, &store, Cause::Timeout, context);
        assert_eq!(dump.memory_pages.len(), 65_536);
        assert!(!dump.memory_truncated);
        assert_eq!(dump.fuel_consumed + dump.fuel_remaining, 10_000);
    }

    #[test]
    fn capture_truncates_memory_when_bounded() {
        let runtime = WasmtimeRuntime::new().unwrap();
        let wasm = wat::parse_str(r#"(module (memory (export "memory") 1))"#).unwrap();
        let module = runtime.compile(&wasm).unwrap();
        let (_instance, store) = runtime.instantiate(&module, &[], 10_000).unwrap();

        let context = InvocationContext {
            function: "n/a",
            args: &[],
            requested_capabilities: &CapabilitySet::new(),
            granted_capabilities: &CapabilitySet::implicit(),
            wall_time_ns: 0,
            max_memory_bytes: Some(100),
        };
        let dump = capture(&runtime, &store, Cause::FuelExhausted, context);
        assert_eq!(dump.memory_pages.len(), 100);
        assert!(dump.memory_truncated);
    }
}
