//! Instance Manager: the orchestrator.
//!
//! Owns the single public lifecycle operation, [`InstanceManager::fire`],
//! which drives compile → instantiate → invoke → capture → cleanup exactly
//! once per call, wiring the Capability Registry and Host Function
//! Table into the import set and routing every failure path through
//! Forensic Capture before [`Runtime::cleanup`] runs.
//!
//! `fire` is deliberately synchronous: a caller blocks for the duration of
//! one invocation. Internally, the wall-clock timeout is enforced by
//! running `Runtime::call` on a worker thread and racing it against
//! `timeout_ms` with [`std::sync::mpsc::Receiver::recv_timeout`] — the
//! standard library's blocking rendezvous primitive, not an async runtime,
//! since nothing else in this crate's public surface is async.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug_span, trace, warn};

use crate::capability::CapabilitySet;
use crate::capture::{self, InvocationContext};
use crate::config::ManagerConfig;
use crate::dump::{Cause, ForensicDump};
use crate::host_functions::HOST_FUNCTION_TABLE;
use crate::runtime::{CallError, Interrupt, Runtime, RuntimeError};
use crate::value::Value;

/// Per-call overrides of the manager's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct FireOptions {
    /// Fuel budget for this call. Defaults to [`ManagerConfig::default_fuel`].
    pub fuel: Option<u64>,
    /// Wall-clock timeout for this call, in milliseconds. Defaults to
    /// [`ManagerConfig::default_timeout_ms`].
    pub timeout_ms: Option<u32>,
    /// Requested capability names (atoms or aliases, see
    /// [`crate::capability::Capability`]).
    pub capabilities: Vec<String>,
    /// Overrides [`ManagerConfig::max_memory_pages_in_dump`] for this call.
    pub max_memory_pages_in_dump: Option<u32>,
}

/// Metadata returned alongside a successful call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvocationMetadata {
    pub fuel_remaining: u64,
    pub wall_time_ns: u64,
}

/// The only two outcomes visible to a caller of [`InstanceManager::fire`].
/// Every engine-level distinction collapses into `Crash(dump).cause`.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    Ok { values: Vec<Value>, metadata: InvocationMetadata },
    Crash(ForensicDump),
}

const WASM_PAGE_BYTES: usize = 65_536;

/// Drives one invocation's lifecycle over a pluggable [`Runtime`].
///
/// Holds no mutable state beyond its configuration — the Capability
/// Registry and Host Function Table are process-wide statics, and every
/// module/instance/store is exclusively owned by a single `fire` call.
/// `fire` may be called concurrently from many threads.
pub struct InstanceManager<R: Runtime> {
    runtime: R,
    config: ManagerConfig,
}

impl<R: Runtime + Clone + Send + 'static> InstanceManager<R> {
    /// Build a manager with default configuration.
    pub fn new(runtime: R) -> Self {
        Self { runtime, config: ManagerConfig::default() }
    }

    /// Build a manager with explicit configuration.
    pub fn with_config(runtime: R, config: ManagerConfig) -> Self {
        Self { runtime, config }
    }

    /// Run one invocation to completion: compile, instantiate, call under
    /// fuel and timeout, and on any failure, capture a forensic dump before
    /// cleanup.
    pub fn fire(&self, wasm: &[u8], function: &str, args: &[Value], options: FireOptions) -> InvocationResult {
        let fuel = options.fuel.unwrap_or(self.config.default_fuel);
        let timeout_ms = options.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let span = debug_span!("fire", function, fuel, timeout_ms);
        let _entered = span.enter();
        let start = Instant::now();
        let max_memory_bytes = options
            .max_memory_pages_in_dump
            .or(self.config.max_memory_pages_in_dump)
            .map(|pages| pages as usize * WASM_PAGE_BYTES);

        // Step 1: validate capabilities.
        let requested_names: Vec<&str> = options.capabilities.iter().map(String::as_str).collect();
        let requested = match CapabilitySet::validate(&requested_names) {
            Ok(set) => set,
            Err(_) => {
                return self.crash_without_instance(
                    Cause::InstantiationFailed { reason: "unknown_capability".to_string() },
                    function,
                    args,
                    &CapabilitySet::new(),
                    &CapabilitySet::new(),
                    start,
                );
            }
        };
        let granted = requested.effective();

        // Step 2: compile.
        trace!("compile");
        let module = match self.runtime.compile(wasm) {
            Ok(module) => module,
            Err(RuntimeError::InvalidModule { .. }) => {
                return self.crash_without_instance(Cause::InvalidModule, function, args, &requested, &granted, start);
            }
            Err(other) => {
                return self.crash_without_instance(
                    Cause::InstantiationFailed { reason: other.to_string() },
                    function,
                    args,
                    &requested,
                    &granted,
                    start,
                );
            }
        };

        // Step 3: build imports — the sole capability enforcement point.
        let imports: Vec<&'static _> = HOST_FUNCTION_TABLE.iter().filter(|binding| granted.has(binding.capability)).collect();
        let denied: Vec<&'static _> = HOST_FUNCTION_TABLE.iter().filter(|binding| !granted.has(binding.capability)).collect();

        // Step 4: instantiate.
        trace!(granted_imports = imports.len(), "instantiate");
        let (instance, store) = match self.runtime.instantiate(&module, &imports, fuel) {
            Ok(pair) => pair,
            Err(RuntimeError::LinkError { missing_import }) => {
                let capability = denied
                    .iter()
                    .find(|binding| missing_import.contains(&format!("{}::{}", binding.namespace, binding.name)))
                    .map(|binding| binding.capability);
                let cause = match capability {
                    Some(capability) => Cause::HostDenied { capability },
                    None => Cause::InstantiationFailed { reason: missing_import },
                };
                return self.crash_without_instance(cause, function, args, &requested, &granted, start);
            }
            Err(RuntimeError::InstantiationTrap { message }) => {
                return self.crash_without_instance(
                    Cause::InstantiationFailed { reason: message },
                    function,
                    args,
                    &requested,
                    &granted,
                    start,
                );
            }
            Err(other) => {
                return self.crash_without_instance(
                    Cause::InstantiationFailed { reason: other.to_string() },
                    function,
                    args,
                    &requested,
                    &granted,
                    start,
                );
            }
        };

        // Step 5: execute under timeout, on a worker thread. The interrupt
        // handle is obtained here, before `store` moves into the closure,
        // since the main thread has no other way to reach a store owned by
        // the worker thread.
        let interrupt_handle = self.runtime.interrupt_handle(&store);
        let runtime = self.runtime.clone();
        let function_owned = function.to_string();
        let args_owned = args.to_vec();
        let call_span = tracing::Span::current();
        let (tx, rx) = mpsc::channel();
        trace!(function, "call");
        thread::spawn(move || {
            let _entered = call_span.enter();
            let mut store = store;
            let result = runtime.call(&instance, &mut store, &function_owned, &args_owned);
            // The receiver may already be gone if `fire` somehow returned
            // early; there is nothing useful to do with that send failure.
            let _ = tx.send((result, instance, store));
        });

        let (call_result, instance, store, timed_out) = match rx.recv_timeout(Duration::from_millis(timeout_ms.into())) {
            Ok((result, instance, store)) => (result, instance, store, false),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(timeout_ms, "fire timed out, interrupting");
                interrupt_handle.interrupt();
                // The epoch bump guarantees `call` returns promptly; block
                // for the (bounded) remainder so the store can be captured.
                match rx.recv() {
                    Ok((result, instance, store)) => (result, instance, store, true),
                    Err(_) => unreachable_worker_disconnect(),
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => unreachable_worker_disconnect(),
        };

        let wall_time_ns = start.elapsed().as_nanos() as u64;

        if timed_out {
            let dump = capture::capture(
                &self.runtime,
                &store,
                Cause::Timeout,
                InvocationContext {
                    function,
                    args,
                    requested_capabilities: &requested,
                    granted_capabilities: &granted,
                    wall_time_ns,
                    max_memory_bytes,
                },
            );
            warn!(cause = ?dump.cause, "fire crashed");
            self.runtime.cleanup(instance, store);
            return InvocationResult::Crash(dump);
        }

        match call_result {
            Ok(outcome) => {
                trace!(fuel_remaining = outcome.fuel_remaining, "cleanup");
                self.runtime.cleanup(instance, store);
                InvocationResult::Ok {
                    values: outcome.values,
                    metadata: InvocationMetadata { fuel_remaining: outcome.fuel_remaining, wall_time_ns },
                }
            }
            Err(call_error) => {
                let cause = match call_error {
                    CallError::FuelExhausted => Cause::FuelExhausted,
                    CallError::Trap { kind, message } => Cause::Trap { kind, message },
                    CallError::Link(reason) => Cause::InstantiationFailed { reason },
                };
                let dump = capture::capture(
                    &self.runtime,
                    &store,
                    cause,
                    InvocationContext {
                        function,
                        args,
                        requested_capabilities: &requested,
                        granted_capabilities: &granted,
                        wall_time_ns,
                        max_memory_bytes,
                    },
                );
                warn!(cause = ?dump.cause, "fire crashed");
                self.runtime.cleanup(instance, store);
                InvocationResult::Crash(dump)
            }
        }
    }

    fn crash_without_instance(
        &self,
        cause: Cause,
        function: &str,
        args: &[Value],
        requested: &CapabilitySet,
        granted: &CapabilitySet,
        start: Instant,
    ) -> InvocationResult {
        let dump = capture::capture_without_instance(
            cause,
            InvocationContext {
                function,
                args,
                requested_capabilities: requested,
                granted_capabilities: granted,
                wall_time_ns: start.elapsed().as_nanos() as u64,
                max_memory_bytes: None,
            },
        );
        warn!(cause = ?dump.cause, "fire crashed");
        InvocationResult::Crash(dump)
    }
}

/// The worker thread can only disconnect without sending if it panicked
/// somewhere other than inside a native host function — i.e. a bug in the
/// `Runtime` implementation itself. Such a contract violation is fatal
/// and propagated, not wrapped in a dump.
#[allow(clippy::panic)]
fn unreachable_worker_disconnect() -> ! {
    panic!("munition: runtime worker thread disconnected without a result — this indicates a Runtime contract violation")
}

/// Compile-only entry point: `validate(wasm) -> Result<(), InvalidModule>`.
///
/// A thin wrapper over [`Runtime::compile`] that discards the compiled
/// module — useful for callers who want to reject malformed WASM before
/// spending a `fire` call on it.
pub fn validate<R: Runtime>(runtime: &R, wasm: &[u8]) -> Result<(), RuntimeError> {
    runtime.compile(wasm).map(drop)
}
