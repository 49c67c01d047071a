//! Runtime Contract: the engine-agnostic operations a WASM engine must
//! provide to back an [`crate::manager::InstanceManager`].
//!
//! Every operation is synchronous from the Manager's point of view. An
//! engine that cannot keep `read_memory`/`read_globals` valid on a trapped
//! store, right up until `cleanup`, cannot implement this trait — that
//! guarantee is what makes forensic capture possible.

use thiserror::Error;

use crate::dump::TrapKind;
use crate::host_functions::HostFunctionBinding;
use crate::value::Value;

/// Failure from `compile`, `instantiate`, `read_memory`, or `read_globals`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("module failed to compile: {reason}")]
    InvalidModule { reason: String },
    #[error("link error: missing import {missing_import}")]
    LinkError { missing_import: String },
    #[error("trap during instantiation: {message}")]
    InstantiationTrap { message: String },
    #[error("memory access out of bounds: offset {offset}, len {len}")]
    OutOfBounds { offset: u32, len: u32 },
}

/// Failure from `call`. Distinct from [`RuntimeError`] because the Manager
/// routes every variant of this one through forensic capture, never through
/// plain error propagation.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("fuel exhausted")]
    FuelExhausted,
    #[error("trap: {message}")]
    Trap { kind: TrapKind, message: String },
    #[error("link error: {0}")]
    Link(String),
}

/// A successful `call` return: result values plus the fuel left afterward.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub values: Vec<Value>,
    pub fuel_remaining: u64,
}

/// A lightweight, cloneable handle that can force one specific in-progress
/// `call` to return early, independent of which thread currently owns its
/// `Store`.
///
/// A handle must be scoped to a single invocation: interrupting it must never
/// affect any other invocation's store, even one sharing the same `Runtime`.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// The set of operations an engine must provide.
///
/// `Module`, `Instance`, and `Store` are opaque, engine-owned handles. The
/// Manager never inspects them directly — it only threads them back through
/// this trait.
pub trait Runtime: Send + Sync {
    type Module: Send;
    type Instance: Send;
    type Store: Send;
    type InterruptHandle: Interrupt + 'static;

    /// Compile raw WASM bytes into a `Module`. Does not instantiate.
    fn compile(&self, wasm: &[u8]) -> Result<Self::Module, RuntimeError>;

    /// Instantiate a compiled module, linking only the given host imports
    /// and seeding the store with `initial_fuel`.
    fn instantiate(
        &self,
        module: &Self::Module,
        imports: &[&'static HostFunctionBinding],
        initial_fuel: u64,
    ) -> Result<(Self::Instance, Self::Store), RuntimeError>;

    /// Invoke an exported function by name. On `Err`, `store` remains valid
    /// for `read_memory`/`read_globals`/`fuel_consumed` — this is what makes
    /// forensic capture possible after a trap or fuel exhaustion.
    fn call(
        &self,
        instance: &Self::Instance,
        store: &mut Self::Store,
        function: &str,
        args: &[Value],
    ) -> Result<CallOutcome, CallError>;

    /// Copy `len` bytes of linear memory starting at `offset`.
    fn read_memory(&self, store: &Self::Store, offset: u32, len: u32) -> Result<Vec<u8>, RuntimeError>;

    /// Copy the full linear memory. Used by forensic capture, which does not
    /// know the memory size ahead of time.
    fn read_all_memory(&self, store: &Self::Store) -> Vec<u8>;

    /// Read every exported global, in declaration order.
    fn read_globals(&self, store: &Self::Store) -> Vec<Value>;

    /// Fuel consumed so far by this store.
    fn fuel_consumed(&self, store: &Self::Store) -> u64;

    /// Fuel left before exhaustion.
    fn fuel_remaining(&self, store: &Self::Store) -> u64;

    /// Release engine resources. Infallible; must run on every path,
    /// including after a panic from a native host function.
    fn cleanup(&self, instance: Self::Instance, store: Self::Store);

    /// Produce a handle that can interrupt this store's `call`, and only
    /// this store's — never a sibling invocation's.
    ///
    /// Not part of the minimal operation set an engine must provide — added
    /// here because the Manager's timeout worker owns the `Store` by move
    /// while `call` runs, so the main thread cannot reach in and mutate it
    /// directly. The handle is obtained before the store is moved onto the
    /// worker thread and used from the main thread if the timeout fires.
    fn interrupt_handle(&self, store: &Self::Store) -> Self::InterruptHandle;
}
