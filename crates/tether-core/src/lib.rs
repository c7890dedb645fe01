//! Core types for the tether interop engine.
//!
//! This crate holds everything below the trampoline and dispatch layers:
//! the boundary tag and value model, the marshaling codec, the handle
//! registry and type table, the object heap and the diagnostic channel.

pub mod codec;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod handle;
pub mod heap;
pub mod host;
pub mod reflect;
pub mod registry;
pub mod sig;
pub mod stable_hash;
pub mod tag;
pub mod value;

pub use codec::{CallableBridge, Codec, MarshalCtx, OwnedNative};
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
pub use error::{
    InteropError, InvokeError, LoadError, LoadStatus, MarshalError, ResolveError, Result,
    UnloadError,
};
pub use frame::{CallFrame, ManagedFn};
pub use handle::{Handle, ModuleId, Token};
pub use heap::{ObjectHeap, ObjectInstance, ObjectView};
pub use host::{HostBindings, MAX_CALL_ARITY, RawCallable};
pub use reflect::{
    AttributeDef, CtorDef, EnumDef, FieldDef, MethodDef, PropertyDef, TypeDef, TypeTable,
    TypeTraits,
};
pub use registry::{Entity, Entry, HandleTable, TypeIndex};
pub use sig::{Param, Signature};
pub use stable_hash::StableHash;
pub use tag::{TAG_COUNT, Tag};
pub use value::{ArrayValue, Callable, RawParts, Value};
