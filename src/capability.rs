//! Capability registry: the closed permission vocabulary.
//!
//! A [`Capability`] is a symbolic atom drawn from a fixed, closed set — there
//! is no custom/extensible variant, unlike pattern-based capability models.
//! Attenuation works by *omission*: a module only gets the host imports whose
//! gating capability is in its granted set (see [`crate::host_functions`]).
//!
//! # Examples
//!
//! ```
//! use munition::capability::{Capability, CapabilitySet};
//!
//! let granted = CapabilitySet::validate(&["time"]).unwrap();
//! let effective = granted.effective();
//!
//! assert!(effective.has(Capability::Time));
//! assert!(effective.has(Capability::Compute)); // implicit
//! assert!(!effective.has(Capability::Network));
//! ```

use std::collections::BTreeSet;

use thiserror::Error;

/// A symbolic permission atom.
///
/// `Compute`, `MemoryRead`, and `MemoryWrite` are always granted (see
/// [`CapabilitySet::implicit`]) — a module cannot run at all without them, so
/// gating them would be meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Permission to execute WASM instructions at all. Implicit.
    Compute,
    /// Permission to read linear memory. Implicit.
    MemoryRead,
    /// Permission to write linear memory. Implicit.
    MemoryWrite,
    /// Permission to invoke any host import not covered by a more specific atom.
    HostCall,
    /// Permission to read from the host filesystem.
    FilesystemRead,
    /// Permission to write to the host filesystem.
    FilesystemWrite,
    /// Permission to open outbound network connections.
    Network,
    /// Permission to read the wall-clock.
    Time,
    /// Permission to draw host-provided randomness.
    Random,
}

impl Capability {
    /// The atom's wire-stable tag, used by the forensic dump codec.
    ///
    /// Stable across versions: never renumber an existing variant.
    pub(crate) fn tag(self) -> u8 {
        match self {
            Capability::Compute => 0,
            Capability::MemoryRead => 1,
            Capability::MemoryWrite => 2,
            Capability::HostCall => 3,
            Capability::FilesystemRead => 4,
            Capability::FilesystemWrite => 5,
            Capability::Network => 6,
            Capability::Time => 7,
            Capability::Random => 8,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Capability::Compute),
            1 => Some(Capability::MemoryRead),
            2 => Some(Capability::MemoryWrite),
            3 => Some(Capability::HostCall),
            4 => Some(Capability::FilesystemRead),
            5 => Some(Capability::FilesystemWrite),
            6 => Some(Capability::Network),
            7 => Some(Capability::Time),
            8 => Some(Capability::Random),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "compute" => Some(Capability::Compute),
            "memory_read" => Some(Capability::MemoryRead),
            "memory_write" => Some(Capability::MemoryWrite),
            "host_call" => Some(Capability::HostCall),
            "filesystem_read" => Some(Capability::FilesystemRead),
            "filesystem_write" => Some(Capability::FilesystemWrite),
            "network" => Some(Capability::Network),
            "time" => Some(Capability::Time),
            "random" => Some(Capability::Random),
            _ => None,
        }
    }

    /// Expand an alias name into the atoms it stands for.
    ///
    /// Returns `None` if `name` is neither a known atom nor a known alias.
    fn expand(name: &str) -> Option<Vec<Capability>> {
        match name {
            "time_readonly" => Some(vec![Capability::Time]),
            "full_fs" => Some(vec![Capability::FilesystemRead, Capability::FilesystemWrite]),
            other => Self::from_name(other).map(|c| vec![c]),
        }
    }
}

/// Requesting or expanding an unknown capability name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown capability: {0}")]
pub struct CapabilityError(pub String);

/// An unordered set of [`Capability`] atoms.
///
/// Invariant: once constructed via [`CapabilitySet::validate`], contains only
/// known atoms — aliases have already been expanded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    atoms: BTreeSet<Capability>,
}

impl CapabilitySet {
    /// The empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The always-granted set: `{compute, memory_read, memory_write}`.
    pub fn implicit() -> Self {
        Self {
            atoms: BTreeSet::from([Capability::Compute, Capability::MemoryRead, Capability::MemoryWrite]),
        }
    }

    /// Validate a list of requested capability names, expanding aliases.
    ///
    /// Pure and deterministic: no I/O, no dependence on process state.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError`] naming the first unrecognized atom or alias.
    pub fn validate(requested: &[&str]) -> Result<Self, CapabilityError> {
        let mut atoms = BTreeSet::new();
        for name in requested {
            match Capability::expand(name) {
                Some(expanded) => atoms.extend(expanded),
                None => return Err(CapabilityError((*name).to_string())),
            }
        }
        Ok(Self { atoms })
    }

    /// Build directly from already-known atoms, bypassing name validation.
    pub fn from_atoms(atoms: impl IntoIterator<Item = Capability>) -> Self {
        Self { atoms: atoms.into_iter().collect() }
    }

    /// The union of `self` and the implicit set.
    pub fn effective(&self) -> Self {
        let mut atoms = self.atoms.clone();
        atoms.extend(Self::implicit().atoms);
        Self { atoms }
    }

    /// Whether `capability` is present in this set.
    pub fn has(&self, capability: Capability) -> bool {
        self.atoms.contains(&capability)
    }

    /// Whether this set grants every capability `other` requires.
    pub fn is_superset_of(&self, other: &CapabilitySet) -> bool {
        other.atoms.is_subset(&self.atoms)
    }

    /// Iterate the atoms in a deterministic (tag) order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.atoms.iter().copied()
    }

    /// Number of atoms in the set.
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    /// Whether the set has no atoms.
    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self::from_atoms(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_set_contains_exactly_three_atoms() {
        let implicit = CapabilitySet::implicit();
        assert_eq!(implicit.len(), 3);
        assert!(implicit.has(Capability::Compute));
        assert!(implicit.has(Capability::MemoryRead));
        assert!(implicit.has(Capability::MemoryWrite));
        assert!(!implicit.has(Capability::Network));
    }

    #[test]
    fn validate_accepts_known_atoms() {
        let set = CapabilitySet::validate(&["network", "time"]).unwrap();
        assert!(set.has(Capability::Network));
        assert!(set.has(Capability::Time));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn validate_rejects_unknown_atom() {
        let err = CapabilitySet::validate(&["teleport"]).unwrap_err();
        assert_eq!(err.0, "teleport");
    }

    #[test]
    fn validate_expands_time_readonly_alias() {
        let set = CapabilitySet::validate(&["time_readonly"]).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.has(Capability::Time));
    }

    #[test]
    fn validate_expands_full_fs_alias() {
        let set = CapabilitySet::validate(&["full_fs"]).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.has(Capability::FilesystemRead));
        assert!(set.has(Capability::FilesystemWrite));
    }

    #[test]
    fn effective_adds_implicit_to_requested() {
        let requested = CapabilitySet::validate(&["random"]).unwrap();
        let effective = requested.effective();

        assert!(effective.has(Capability::Random));
        assert!(effective.has(Capability::Compute));
        assert!(effective.has(Capability::MemoryRead));
        assert!(effective.has(Capability::MemoryWrite));
    }

    #[test]
    fn is_superset_of_checks_required_against_granted() {
        let granted = CapabilitySet::validate(&["network", "time"]).unwrap();
        let required_ok = CapabilitySet::from_atoms([Capability::Network]);
        let required_missing = CapabilitySet::from_atoms([Capability::Random]);

        assert!(granted.is_superset_of(&required_ok));
        assert!(!granted.is_superset_of(&required_missing));
    }

    #[test]
    fn tag_round_trips_through_from_tag() {
        for cap in [
            Capability::Compute,
            Capability::MemoryRead,
            Capability::MemoryWrite,
            Capability::HostCall,
            Capability::FilesystemRead,
            Capability::FilesystemWrite,
            Capability::Network,
            Capability::Time,
            Capability::Random,
        ] {
            assert_eq!(Capability::from_tag(cap.tag()), Some(cap));
        }
    }

    #[test]
    fn from_tag_rejects_unknown_byte() {
        assert_eq!(Capability::from_tag(255), None);
    }

    #[test]
    fn empty_request_yields_empty_set() {
        let set = CapabilitySet::validate(&[]).unwrap();
        assert!(set.is_empty());
    }
}
