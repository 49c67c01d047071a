//! End-to-end scenarios for `fire` against the Wasmtime-backed runtime
//! boundary behaviors and end-to-end invocation scenarios.

#![expect(clippy::expect_used, reason = "expect is acceptable in test code for clear failure messages")]
#![expect(clippy::unwrap_used, reason = "unwrap is acceptable in test code for clear failure messages")]

use std::time::{Duration, Instant};

use munition::capability::Capability;
use munition::dump::{Cause, TrapKind};
use munition::manager::{FireOptions, InstanceManager, InvocationResult};
use munition::runtime::wasmtime_runtime::WasmtimeRuntime;
use munition::Value;

fn manager() -> InstanceManager<WasmtimeRuntime> {
    let _ = tracing_subscriber::fmt::try_init();
    InstanceManager::new(WasmtimeRuntime::new().expect("engine init"))
}

fn wat(src: &str) -> Vec<u8> {
    wat::parse_str(src).expect("valid wat fixture")
}

#[test]
fn boundary_fuel_zero_exhausts_before_any_instruction() {
    let wasm = wat(r#"(module (func (export "noop")))"#);
    let result = manager().fire(&wasm, "noop", &[], FireOptions { fuel: Some(0), ..Default::default() });
    match result {
        InvocationResult::Crash(dump) => assert_eq!(dump.cause, Cause::FuelExhausted),
        other => panic!("expected Crash(fuel_exhausted), got {other:?}"),
    }
}

#[test]
fn boundary_fuel_one_may_complete_a_trivial_function() {
    let wasm = wat(r#"(module (func (export "noop")))"#);
    let result = manager().fire(&wasm, "noop", &[], FireOptions { fuel: Some(1), ..Default::default() });
    // Either outcome is admissible: fuel=1 either completes a
    // no-op or exhausts on the first instruction.
    match result {
        InvocationResult::Ok { .. } => {}
        InvocationResult::Crash(dump) => assert_eq!(dump.cause, Cause::FuelExhausted),
    }
}

#[test]
fn module_importing_denied_capability_fails_at_instantiation_not_call_time() {
    let wasm = wat(
        r#"(module
            (import "env" "net_connect" (func (param i32 i32 i32) (result i32)))
            (func (export "connect")))"#,
    );
    let result = manager().fire(&wasm, "connect", &[], FireOptions::default());
    match result {
        InvocationResult::Crash(dump) => {
            assert_eq!(dump.cause, Cause::HostDenied { capability: Capability::Network });
            assert!(dump.memory_pages.is_empty(), "no instance ever existed, memory must be empty");
        }
        other => panic!("expected Crash(host_denied), got {other:?}"),
    }
}

#[test]
fn granting_the_capability_allows_the_host_import_to_link() {
    let wasm = wat(
        r#"(module
            (import "env" "time_now" (func (result i64)))
            (func (export "noop")))"#,
    );
    let result = manager().fire(&wasm, "noop", &[], FireOptions { capabilities: vec!["time".to_string()], ..Default::default() });
    assert!(matches!(result, InvocationResult::Ok { .. }));
}

#[test]
fn timeout_interrupts_a_spinning_module_within_the_budget() {
    let wasm = wat(r#"(module (func (export "sleep_forever") (loop br 0)))"#);
    let started = Instant::now();
    let result = manager().fire(
        &wasm,
        "sleep_forever",
        &[],
        FireOptions { fuel: Some(1_000_000_000), timeout_ms: Some(50), ..Default::default() },
    );
    assert!(started.elapsed() < Duration::from_millis(500));
    match result {
        InvocationResult::Crash(dump) => assert_eq!(dump.cause, Cause::Timeout),
        other => panic!("expected Crash(timeout), got {other:?}"),
    }
}

#[test]
fn stack_overflow_traps_and_is_captured() {
    let wasm = wat(
        r#"(module
            (func $recurse (export "recurse") (param i32) (result i32)
                local.get 0
                i32.const 1
                i32.add
                call $recurse)
            )"#,
    );
    let result = manager().fire(&wasm, "recurse", &[Value::I32(0)], FireOptions { fuel: Some(50_000_000), ..Default::default() });
    match result {
        InvocationResult::Crash(dump) => {
            assert!(matches!(dump.cause, Cause::Trap { kind: TrapKind::StackOverflow, .. }) || dump.cause == Cause::FuelExhausted);
        }
        other => panic!("expected Crash, got {other:?}"),
    }
}

#[test]
fn isolation_fresh_memory_every_invocation() {
    let wasm = wat(
        r#"(module
            (memory (export "memory") 1)
            (func (export "bump") (result i32)
                i32.const 0
                i32.const 0
                i32.load
                i32.const 1
                i32.add
                i32.store offset=0
                i32.const 0
                i32.load))"#,
    );
    let mgr = manager();
    let first = mgr.fire(&wasm, "bump", &[], FireOptions::default());
    let second = mgr.fire(&wasm, "bump", &[], FireOptions::default());

    let value = |r: InvocationResult| match r {
        InvocationResult::Ok { values, .. } => values[0],
        other => panic!("expected Ok, got {other:?}"),
    };
    // If state leaked between calls, the second call would observe `1`.
    assert_eq!(value(first), Value::I32(1));
    assert_eq!(value(second), Value::I32(1));
}

#[test]
fn encode_decode_round_trips_through_a_real_crash_dump() {
    let wasm = wat(r#"(module (memory (export "memory") 1) (func (export "boom") unreachable))"#);
    let result = manager().fire(&wasm, "boom", &[], FireOptions::default());
    let dump = match result {
        InvocationResult::Crash(dump) => dump,
        other => panic!("expected Crash, got {other:?}"),
    };
    let encoded = munition::dump::codec::encode(&dump);
    let decoded = munition::dump::codec::decode(&encoded).expect("well-formed dump decodes");
    assert_eq!(dump, decoded);
}
