//! tether: the interop core of a polyglot plugin host.
//!
//! A native host calls into a hosted dynamic object runtime's functions
//! and objects, and hosted code calls back into native function pointers,
//! with no shared memory layout and no compile-time knowledge of either
//! side's signatures. Modules of plugin code load and unload at runtime,
//! with deterministic teardown.
//!
//! The exported `tether_*` entry points in [`boundary`] are the native
//! surface; [`Engine`] is the embedder-facing Rust API behind them.

pub mod boundary;
pub mod dispatch;
pub mod engine;
pub mod lifecycle;
pub mod trampoline;

pub use engine::{Engine, EngineConfig};
pub use lifecycle::{
    FunctionDef, InMemoryResolver, ModuleRecord, ModuleState, UnitDefinition, UnitResolver,
};

pub mod prelude {
    pub use crate::engine::{Engine, EngineConfig};
    pub use crate::lifecycle::{InMemoryResolver, UnitDefinition, UnitResolver};
    pub use tether_core::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
    pub use tether_core::error::{
        InteropError, InvokeError, LoadError, LoadStatus, MarshalError, ResolveError,
        UnloadError,
    };
    pub use tether_core::frame::{CallFrame, ManagedFn};
    pub use tether_core::handle::{Handle, ModuleId, Token};
    pub use tether_core::reflect::{
        AttributeDef, EnumDef, FieldDef, MethodDef, PropertyDef, TypeDef, TypeTraits,
    };
    pub use tether_core::sig::{Param, Signature};
    pub use tether_core::tag::Tag;
    pub use tether_core::value::{ArrayValue, Callable, Value};
}
