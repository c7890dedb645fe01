//! The interop engine: process-wide state behind the boundary.
//!
//! One [`Engine`] composes the handle registry, type table, object heap,
//! host bindings, codec and module manager. The exported entry points in
//! [`crate::boundary`] operate on the process-global instance; embedders
//! can also create private engines for isolation (tests do).

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;

use tether_core::codec::Codec;
use tether_core::error::InteropError;
use tether_core::handle::{Handle, Token};
use tether_core::heap::{ObjectHeap, ObjectInstance};
use tether_core::host::HostBindings;
use tether_core::reflect::TypeTable;
use tether_core::registry::HandleTable;
use tether_core::sig::Signature;
use tether_core::tag::Tag;
use tether_core::value::{RawParts, Value};

use crate::dispatch::Invoker;
use crate::lifecycle::{InMemoryResolver, ModuleManager, UnitDefinition, UnitResolver};
use crate::trampoline::{Caches, TrampolineBridge};

/// Engine-level knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unload emits a warning once this much time has passed with the
    /// module's objects still alive.
    pub unload_warn: Duration,
    /// Unload gives up (returning false) past this deadline.
    pub unload_deadline: Duration,
    /// Pause between unload sweep passes.
    pub unload_poll: Duration,
    /// Largest arity the direct-bind fast path covers.
    pub direct_bind_max_args: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unload_warn: Duration::from_millis(200),
            unload_deadline: Duration::from_millis(1000),
            unload_poll: Duration::from_millis(2),
            direct_bind_max_args: 8,
        }
    }
}

pub(crate) fn relock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    // Boundary calls must keep working after a panicked operation; the
    // panic itself was already reported through the fault channel.
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    codec: Codec,
    pub(crate) registry: RwLock<HandleTable>,
    pub(crate) types: RwLock<TypeTable>,
    pub(crate) heap: Mutex<ObjectHeap>,
    bindings: RwLock<HostBindings>,
    pub(crate) modules: Mutex<ModuleManager>,
    pub(crate) staged: InMemoryResolver,
    pub(crate) resolver: RwLock<Option<Arc<dyn UnitResolver>>>,
    pub(crate) invokers: Mutex<FxHashMap<Handle, Invoker>>,
    caches: Caches,
    pub(crate) weak: Weak<Engine>,
}

impl Engine {
    pub fn new() -> Arc<Engine> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Arc<Engine> {
        Arc::new_cyclic(|weak: &Weak<Engine>| Engine {
            config,
            codec: Codec::new(Arc::new(TrampolineBridge::new(weak.clone()))),
            registry: RwLock::new(HandleTable::new()),
            types: RwLock::new(TypeTable::new()),
            heap: Mutex::new(ObjectHeap::new()),
            bindings: RwLock::new(HostBindings::new()),
            modules: Mutex::new(ModuleManager::new()),
            staged: InMemoryResolver::new(),
            resolver: RwLock::new(None),
            invokers: Mutex::new(FxHashMap::default()),
            caches: Caches::new(),
            weak: weak.clone(),
        })
    }

    /// The process-global engine the exported entry points run against.
    pub fn global() -> &'static Arc<Engine> {
        static GLOBAL: OnceLock<Arc<Engine>> = OnceLock::new();
        GLOBAL.get_or_init(Engine::new)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub(crate) fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Snapshot of the host bindings for use outside the lock.
    pub fn bindings_snapshot(&self) -> HostBindings {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Bind a batch of named native function pointers to the managed
    /// accessor slots.
    pub fn bind_host_functions<'a>(
        &self,
        slots: impl IntoIterator<Item = (&'a str, *const std::ffi::c_void)>,
    ) {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.bind_batch(slots);
    }

    /// Wire the built-in reference host into the accessor slots.
    pub fn install_reference_host(&self) {
        self.bind_host_functions(tether_core::host::reference_host::bindings());
    }

    pub fn set_resolver(&self, resolver: Arc<dyn UnitResolver>) {
        *self.resolver.write().unwrap_or_else(|e| e.into_inner()) = Some(resolver);
    }

    /// Stage an in-memory plugin unit for loading.
    pub fn provide_unit(&self, unit: UnitDefinition) {
        self.staged.provide(unit);
    }

    /// Call a native target through its (cached) forward adapter.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call_native(
        &self,
        parts: RawParts,
        sig: &Signature,
        args: &mut [Value],
    ) -> Result<Value, InteropError> {
        let trampoline = self
            .caches
            .forward(parts, sig, self.config.direct_bind_max_args);
        let bindings = self.bindings_snapshot();
        trampoline.call(&self.codec, &bindings, args)
    }

    /// Force a sweep of unreferenced objects. Returns how many were freed.
    pub fn collect(&self) -> usize {
        let freed = relock(&self.heap).sweep(None);
        let count = freed.len();
        for instance in freed {
            self.release_instance(instance);
        }
        count
    }

    /// Destruction is deterministic here; there is never a pending
    /// finalizer queue to drain. The entry point exists for boundary
    /// compatibility.
    pub fn wait_for_pending_finalizers(&self) {}

    /// Pin an object, keeping it alive while native code holds raw views
    /// of it. Must be paired with [`Engine::unpin_object`].
    pub fn pin_object(&self, token: Token) -> bool {
        relock(&self.heap).pin(token).is_some()
    }

    pub fn unpin_object(&self, token: Token) {
        relock(&self.heap).unpin(token);
    }

    /// Release the host cells a freed instance's fields still point at.
    pub(crate) fn release_instance(&self, instance: ObjectInstance) {
        let bindings = self.bindings_snapshot();
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        let mut current = Some(instance.ty);
        while let Some(index) = current {
            let Some(def) = types.get(index) else { break };
            for field in &def.fields {
                if field.tag == Tag::Str || field.tag == Tag::Function || field.tag.is_array() {
                    let addr = unsafe { instance.data_ptr().add(field.offset as usize) };
                    self.codec.release_cell(&bindings, field.tag, addr);
                }
            }
            current = def.base_index();
        }
    }

}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}
