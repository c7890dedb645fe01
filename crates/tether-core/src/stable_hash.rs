//! Deterministic hash-based entity identity.
//!
//! Registry handles must come from something that stably and uniquely
//! identifies an entity within its owning module, never from a transient
//! allocation address, so registering the same entity twice yields the
//! same handle. [`StableHash`] provides that identity: a 64-bit xxh64 hash
//! of the entity's qualified name, mixed with a domain constant so a type,
//! a method and a field sharing a name can never collide.

use std::fmt;

use xxhash_rust::xxh64::xxh64;

/// Domain-separation constants mixed into entity hashes.
mod domain {
    pub const TYPE: u64 = 0x2fac10b63a6cc57c;
    pub const METHOD: u64 = 0x7d3c8b4a92e15f6d;
    pub const FIELD: u64 = 0x5ea77ffbcdf5f302;
    pub const PROPERTY: u64 = 0x3e9f5d2a8c7b1403;
    pub const ATTRIBUTE: u64 = 0x9a7f3d5e2b8c4601;
    pub const CALLABLE: u64 = 0x1a095090689d4647;
    /// Per-position mixing multiplier for signature parameters.
    pub const PARAM: u64 = 0x9e3779b97f4a7c15;
}

/// A deterministic 64-bit identity hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StableHash(u64);

impl StableHash {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Identity of a type by qualified name.
    pub fn of_type(name: &str) -> Self {
        Self(xxh64(name.as_bytes(), domain::TYPE))
    }

    /// Identity of a method within its owning type.
    pub fn of_method(owner: StableHash, name: &str, arity: usize) -> Self {
        let base = xxh64(name.as_bytes(), domain::METHOD ^ owner.0);
        Self(base.wrapping_add((arity as u64).wrapping_mul(domain::PARAM)))
    }

    /// Identity of a field within its owning type.
    pub fn of_field(owner: StableHash, name: &str) -> Self {
        Self(xxh64(name.as_bytes(), domain::FIELD ^ owner.0))
    }

    /// Identity of a property within its owning type.
    pub fn of_property(owner: StableHash, name: &str) -> Self {
        Self(xxh64(name.as_bytes(), domain::PROPERTY ^ owner.0))
    }

    /// Identity of the n-th attribute instance on a member.
    pub fn of_attribute(owner: StableHash, name: &str, index: usize) -> Self {
        let base = xxh64(name.as_bytes(), domain::ATTRIBUTE ^ owner.0);
        Self(base.wrapping_add((index as u64).wrapping_mul(domain::PARAM)))
    }

    /// Identity of a module-level callable.
    pub fn of_callable(name: &str) -> Self {
        Self(xxh64(name.as_bytes(), domain::CALLABLE))
    }
}

impl fmt::Debug for StableHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StableHash({:#018x})", self.0)
    }
}

impl fmt::Display for StableHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(StableHash::of_type("Player"), StableHash::of_type("Player"));
        assert_ne!(StableHash::of_type("Player"), StableHash::of_type("Enemy"));
    }

    #[test]
    fn domains_do_not_collide() {
        let ty = StableHash::of_type("Player");
        assert_ne!(ty, StableHash::of_callable("Player"));
        assert_ne!(
            StableHash::of_field(ty, "health"),
            StableHash::of_property(ty, "health")
        );
    }

    #[test]
    fn owner_scoping() {
        let a = StableHash::of_type("A");
        let b = StableHash::of_type("B");
        assert_ne!(StableHash::of_field(a, "x"), StableHash::of_field(b, "x"));
    }

    #[test]
    fn method_arity_matters() {
        let owner = StableHash::of_type("A");
        assert_ne!(
            StableHash::of_method(owner, "f", 1),
            StableHash::of_method(owner, "f", 2)
        );
    }
}
