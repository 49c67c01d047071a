//! # Munition — capability-attenuated WASM sandbox
//!
//! Munition executes untrusted WebAssembly modules under three guarantees:
//!
//! - **Bounded execution** — every invocation runs under a fuel budget and a
//!   wall-clock timeout.
//! - **Per-invocation isolation** — a fresh instance and a fresh store are
//!   created for every call; nothing survives between invocations.
//! - **Forensic capture** — any abnormal termination (fuel exhaustion, trap,
//!   timeout, denied capability) produces an immutable post-mortem snapshot
//!   of the sandbox before cleanup runs.
//!
//! ## Architecture
//!
//! The crate is organized around the [`manager::InstanceManager`], which
//! drives the compile → instantiate → invoke → capture → cleanup lifecycle:
//!
//! - [`capability`] — the closed capability vocabulary and set algebra
//! - [`host_functions`] — the static host import table gated by capability
//! - [`fuel`] — default and size-scaled fuel allocation
//! - [`dump`] — the forensic dump type and its stable wire codec
//! - [`runtime`] — the engine-agnostic `Runtime` contract and the
//!   Wasmtime-backed default implementation
//! - [`capture`] — atomic post-mortem capture from a live/trapped store
//! - [`manager`] — the orchestrator
//!
//! ## Example
//!
//! ```no_run
//! use munition::{InstanceManager, FireOptions, InvocationResult};
//! use munition::runtime::wasmtime_runtime::WasmtimeRuntime;
//!
//! let manager = InstanceManager::new(WasmtimeRuntime::new().expect("engine init"));
//! let wasm = wat::parse_str("(module (func (export \"add\") (result i32) i32.const 5))")
//!     .expect("valid wat");
//!
//! match manager.fire(&wasm, "add", &[], FireOptions::default()) {
//!     InvocationResult::Ok { values, .. } => println!("{values:?}"),
//!     InvocationResult::Crash(dump) => eprintln!("crashed: {:?}", dump.cause),
//! }
//! ```

pub mod capability;
pub mod capture;
pub mod config;
pub mod dump;
pub mod fuel;
pub mod host_functions;
pub mod manager;
pub mod runtime;
pub mod value;

pub mod prelude {
    //! Common imports for consumers of the crate.
    pub use crate::capability::{Capability, CapabilityError, CapabilitySet};
    pub use crate::config::ManagerConfig;
    pub use crate::dump::{Cause, ForensicDump, TrapKind};
    pub use crate::manager::{FireOptions, InstanceManager, InvocationResult};
    pub use crate::value::Value;
}

pub use capability::{Capability, CapabilityError, CapabilitySet};
pub use config::ManagerConfig;
pub use dump::{Cause, ForensicDump, TrapKind};
pub use manager::{FireOptions, InstanceManager, InvocationResult};
pub use value::Value;
