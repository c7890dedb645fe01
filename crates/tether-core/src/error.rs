//! Unified error types for the interop engine.
//!
//! Each phase has its own error enum; [`InteropError`] wraps them for
//! unified handling at the boundary edge, where every fault is converted
//! into a diagnostic and a neutral return value. Nothing in this hierarchy
//! ever crosses the boundary as a panic.
//!
//! ```text
//! InteropError
//! ├── LoadError     - module loading faults
//! ├── ResolveError  - handle/member/type lookup faults
//! ├── MarshalError  - value encode/decode faults
//! ├── UnloadError   - module teardown faults
//! └── InvokeError   - construction/invocation faults
//! ```

use std::path::PathBuf;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::handle::{Handle, ModuleId};
use crate::tag::Tag;

pub type Result<T> = std::result::Result<T, InteropError>;

/// Faults raised while loading a plugin unit.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("plugin unit not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid plugin path: {0:?}")]
    InvalidPath(String),

    #[error("unit '{unit}' has an invalid format: {reason}")]
    InvalidFormat { unit: String, reason: String },

    #[error("load failed: {0}")]
    Failed(String),
}

/// Pollable status of the most recent load attempt.
///
/// Crosses the boundary as a raw `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum LoadStatus {
    Ok = 0,
    FileNotFound = 1,
    InvalidFormat = 2,
    InvalidPath = 3,
    Failed = 4,
}

impl From<&LoadError> for LoadStatus {
    fn from(err: &LoadError) -> Self {
        match err {
            LoadError::NotFound(_) => LoadStatus::FileNotFound,
            LoadError::InvalidPath(_) => LoadStatus::InvalidPath,
            LoadError::InvalidFormat { .. } => LoadStatus::InvalidFormat,
            LoadError::Failed(_) => LoadStatus::Failed,
        }
    }
}

/// Faults raised while resolving handles or members.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("unknown handle {0:?}")]
    UnknownHandle(Handle),

    #[error("unknown type '{0}'")]
    UnknownType(String),

    #[error("member '{member}' not found on '{owner}'")]
    MemberNotFound { owner: String, member: String },

    #[error("module {0:?} is not loaded")]
    ModuleGone(ModuleId),

    #[error("object token is stale or invalid")]
    StaleToken,
}

/// Faults raised while marshaling values across the boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarshalError {
    #[error("unsupported type tag {0}")]
    UnsupportedTag(u32),

    #[error("required {expected} value is missing")]
    MissingValue { expected: Tag },

    #[error("cannot marshal {got} as {expected}")]
    TypeMismatch { expected: Tag, got: &'static str },

    #[error("host binding '{0}' is not registered")]
    HostBindingMissing(&'static str),

    #[error("null address for {0} value")]
    NullAddress(Tag),
}

/// Faults raised while unloading a module.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnloadError {
    #[error("module {0:?} was not loaded as collectible")]
    NotCollectible(ModuleId),

    #[error("unload of module {module:?} timed out with {live} object(s) still alive")]
    TimedOut { module: ModuleId, live: usize },

    #[error("unknown module {0:?}")]
    UnknownModule(ModuleId),
}

/// Faults raised while constructing objects or invoking targets.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvokeError {
    #[error("no suitable constructor on '{type_name}' for {argc} argument(s)")]
    NoSuitableConstructor { type_name: String, argc: usize },

    #[error("instance call on a null target")]
    NullTarget,

    #[error("expected {expected} argument(s), got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("argument index {index} out of bounds ({count} available)")]
    ArgumentOutOfBounds { index: usize, count: usize },

    #[error("call target faulted: {0}")]
    Faulted(String),
}

/// Top-level error wrapper.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InteropError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Unload(#[from] UnloadError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_status_mapping() {
        let err = LoadError::NotFound(PathBuf::from("missing.unit"));
        assert_eq!(LoadStatus::from(&err), LoadStatus::FileNotFound);
        let err = LoadError::InvalidPath("a\0b".into());
        assert_eq!(LoadStatus::from(&err), LoadStatus::InvalidPath);
    }

    #[test]
    fn load_status_raw_round_trip() {
        for status in [
            LoadStatus::Ok,
            LoadStatus::FileNotFound,
            LoadStatus::InvalidFormat,
            LoadStatus::InvalidPath,
            LoadStatus::Failed,
        ] {
            let raw: u32 = status.into();
            assert_eq!(LoadStatus::try_from(raw).unwrap(), status);
        }
    }

    #[test]
    fn wrapping_preserves_message() {
        let err: InteropError = MarshalError::UnsupportedTag(99).into();
        assert_eq!(err.to_string(), "unsupported type tag 99");
    }
}
