//! Fuel Policy: default and size-scaled fuel allocation.
//!
//! A pure function of its inputs — no mutable global state, no I/O. The
//! Manager consults this module only when the caller's [`FireOptions`]
//! (`crate::manager`) does not specify a fuel budget explicitly.

/// Default fuel budget when none is requested and no scaling is configured.
pub const DEFAULT_FUEL: u64 = 100_000;

/// Fuel consumed per byte of module size when `for_module` scaling is used.
const FUEL_PER_WASM_BYTE: u64 = 4;

/// Declared complexity hint a caller may attach to a module, scaling its
/// allocation beyond the flat per-byte rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    fn multiplier(self) -> u64 {
        match self {
            Complexity::Low => 1,
            Complexity::Medium => 4,
            Complexity::High => 16,
        }
    }
}

/// The unscaled default fuel budget.
pub fn default_fuel() -> u64 {
    DEFAULT_FUEL
}

/// A fuel allocation scaled to module size and, optionally, a declared
/// complexity class. Falls back to [`default_fuel`] for tiny modules so a
/// trivial module is never starved below the baseline.
pub fn for_module(wasm_size_bytes: usize, declared_complexity: Option<Complexity>) -> u64 {
    let scaled = wasm_size_bytes as u64 * FUEL_PER_WASM_BYTE;
    let scaled = match declared_complexity {
        Some(complexity) => scaled.saturating_mul(complexity.multiplier()),
        None => scaled,
    };
    scaled.max(DEFAULT_FUEL)
}
