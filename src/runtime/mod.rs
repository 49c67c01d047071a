//! The engine contract and its Wasmtime-backed default implementation.
//!
//! [`contract`] defines `Runtime` as a capability set of operations — compile,
//! instantiate, call, read memory/globals, cleanup — with no reference to any
//! particular WASM engine. [`wasmtime_runtime`] is the only implementation
//! shipped in this crate; [`crate::manager::InstanceManager`] is generic over
//! the trait and holds no direct reference to Wasmtime.

pub mod contract;
pub mod wasmtime_runtime;

pub use contract::{CallError, CallOutcome, Interrupt, Runtime, RuntimeError};
