//! Module lifecycle: loading plugin units and collectible unload.
//!
//! A module is one loaded plugin unit plus the private dependencies it
//! pulled in. Units are produced by a [`UnitResolver`]; the engine stages
//! in-memory units for embedders and tests, and a host can install its own
//! resolver for real artifact formats. Dependencies already present in the
//! host's loaded set are shared, not duplicated.
//!
//! Unload is deterministic: there is no collector to poll. Outstanding
//! strong tokens tracked for the module are released (each one reported;
//! a leaked strong token would otherwise pin the module forever), then the
//! heap is swept in a bounded retry loop. Objects still pinned by the host
//! keep the module alive; past the deadline the unload fails, leaving the
//! module loaded, resolvable and safely retryable.

use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use rustc_hash::FxHashMap;

use tether_core::diagnostics::DiagnosticSink;
use tether_core::error::{InteropError, InvokeError, LoadError, LoadStatus, UnloadError};
use tether_core::frame::ManagedFn;
use tether_core::handle::{ModuleId, Token};
use tether_core::registry::Entity;
use tether_core::reflect::TypeDef;
use tether_core::sig::Signature;
use tether_core::stable_hash::StableHash;
use tether_core::value::Callable;

use crate::engine::{Engine, relock};

/// A module-level free function exposed by a unit.
#[derive(Clone)]
pub struct FunctionDef {
    pub name: String,
    pub sig: Signature,
    pub body: ManagedFn,
}

impl std::fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("sig", &self.sig)
            .finish()
    }
}

/// One resolvable plugin unit: the types and functions it contributes,
/// plus the units it depends on.
#[derive(Debug, Clone, Default)]
pub struct UnitDefinition {
    pub name: String,
    pub dependencies: Vec<String>,
    pub types: Vec<TypeDef>,
    pub functions: Vec<FunctionDef>,
}

impl UnitDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    pub fn with_type(mut self, def: TypeDef) -> Self {
        self.types.push(def);
        self
    }

    pub fn with_function(
        mut self,
        name: impl Into<String>,
        sig: Signature,
        body: ManagedFn,
    ) -> Self {
        self.functions.push(FunctionDef {
            name: name.into(),
            sig,
            body,
        });
        self
    }
}

/// Resolves a unit name to its definition.
///
/// The resolver owns existence and format checks: an unknown unit is
/// `NotFound`, a malformed one `InvalidFormat`. Path syntax is validated
/// by the lifecycle manager before the resolver is consulted.
pub trait UnitResolver: Send + Sync {
    fn resolve(&self, unit: &str, path: &Path) -> Result<UnitDefinition, LoadError>;
}

/// Staging resolver holding units registered in memory.
#[derive(Default)]
pub struct InMemoryResolver {
    units: Mutex<FxHashMap<String, UnitDefinition>>,
}

impl InMemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide(&self, unit: UnitDefinition) {
        let mut units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        units.insert(unit.name.clone(), unit);
    }
}

impl UnitResolver for InMemoryResolver {
    fn resolve(&self, unit: &str, path: &Path) -> Result<UnitDefinition, LoadError> {
        let units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        units
            .get(unit)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(path.to_path_buf()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Loading,
    Loaded,
    Unloading,
}

/// One loaded plugin module.
#[derive(Debug)]
pub struct ModuleRecord {
    pub id: ModuleId,
    pub name: String,
    pub collectible: bool,
    pub alive: bool,
    pub state: ModuleState,
    /// Names of the units loaded into this module's domain.
    pub units: Vec<String>,
    /// Strong tokens handed out for objects of this module's types.
    pub tokens: Vec<Token>,
}

/// The table of loaded modules and the host's shared unit set.
pub struct ModuleManager {
    records: FxHashMap<u64, ModuleRecord>,
    unit_owner: FxHashMap<String, ModuleId>,
    next_id: u64,
    last_status: LoadStatus,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self {
            records: FxHashMap::default(),
            unit_owner: FxHashMap::default(),
            next_id: 1,
            last_status: LoadStatus::Ok,
        }
    }

    pub fn last_status(&self) -> LoadStatus {
        self.last_status
    }

    pub(crate) fn set_status(&mut self, status: LoadStatus) {
        self.last_status = status;
    }

    pub fn record(&self, id: ModuleId) -> Option<&ModuleRecord> {
        self.records.get(&id.raw())
    }

    pub(crate) fn record_mut(&mut self, id: ModuleId) -> Option<&mut ModuleRecord> {
        self.records.get_mut(&id.raw())
    }

    pub fn is_unit_loaded(&self, unit: &str) -> bool {
        self.unit_owner.contains_key(unit)
    }

    fn fresh_id(&mut self) -> ModuleId {
        let id = ModuleId::from_raw(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, record: ModuleRecord) {
        for unit in &record.units {
            self.unit_owner.insert(unit.clone(), record.id);
        }
        self.records.insert(record.id.raw(), record);
    }

    fn remove(&mut self, id: ModuleId) {
        if let Some(record) = self.records.remove(&id.raw()) {
            for unit in &record.units {
                if self.unit_owner.get(unit) == Some(&id) {
                    self.unit_owner.remove(unit);
                }
            }
        }
    }

    /// Track a strong token against its owning module.
    pub(crate) fn track_token(&mut self, id: ModuleId, token: Token) {
        if let Some(record) = self.records.get_mut(&id.raw()) {
            record.tokens.push(token);
        }
    }

    pub(crate) fn untrack_token(&mut self, id: ModuleId, token: Token) {
        if let Some(record) = self.records.get_mut(&id.raw()) {
            record.tokens.retain(|t| *t != token);
        }
    }
}

fn unit_name_from(path: &Path, remove_extension: bool) -> Result<String, LoadError> {
    let name = if remove_extension {
        path.file_stem()
    } else {
        path.file_name()
    };
    name.and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| LoadError::InvalidPath(path.display().to_string()))
}

impl Engine {
    /// Load a plugin unit (and its private dependencies) as a new module.
    pub fn load_module(
        &self,
        path: &str,
        remove_extension: bool,
        collectible: bool,
    ) -> Result<ModuleId, LoadError> {
        let result = self.load_module_inner(path, remove_extension, collectible);
        let mut modules = relock(&self.modules);
        match &result {
            Ok(id) => {
                modules.set_status(LoadStatus::Ok);
                DiagnosticSink::info("load", format!("loaded {id} from '{path}'"));
            }
            Err(err) => {
                modules.set_status(LoadStatus::from(err));
                DiagnosticSink::error("load", format!("'{path}': {err}"));
            }
        }
        result
    }

    fn load_module_inner(
        &self,
        path: &str,
        remove_extension: bool,
        collectible: bool,
    ) -> Result<ModuleId, LoadError> {
        if path.is_empty() || path.contains('\0') {
            return Err(LoadError::InvalidPath(path.to_string()));
        }
        let path_ref = Path::new(path);
        let unit_name = unit_name_from(path_ref, remove_extension)?;

        let root = self.resolve_unit(&unit_name, path_ref)?;
        let units = self.collect_units(root)?;

        let id = {
            let mut modules = relock(&self.modules);
            let id = modules.fresh_id();
            modules.insert(ModuleRecord {
                id,
                name: unit_name.clone(),
                collectible,
                alive: true,
                state: ModuleState::Loading,
                units: units.iter().map(|u| u.name.clone()).collect(),
                tokens: Vec::new(),
            });
            id
        };

        // Dependencies first, so base types across units resolve.
        for unit in units.iter().rev() {
            if let Err(err) = self.register_unit(unit, id) {
                // A half-loaded module must not stay resolvable.
                self.discard_module(id);
                return Err(err);
            }
        }

        let mut modules = relock(&self.modules);
        if let Some(record) = modules.record_mut(id) {
            record.state = ModuleState::Loaded;
        }
        Ok(id)
    }

    /// Resolve through the staged set first, then the installed resolver.
    fn resolve_unit(&self, unit: &str, path: &Path) -> Result<UnitDefinition, LoadError> {
        match self.staged.resolve(unit, path) {
            Ok(found) => Ok(found),
            Err(_) => {
                let resolver = self
                    .resolver
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                match resolver {
                    Some(resolver) => resolver.resolve(unit, path),
                    None => Err(LoadError::NotFound(path.to_path_buf())),
                }
            }
        }
    }

    /// Gather the root unit and every private dependency, skipping units
    /// already in the host's loaded set (those are shared, not copied).
    /// Returned in load order with the root first.
    fn collect_units(&self, root: UnitDefinition) -> Result<Vec<UnitDefinition>, LoadError> {
        let mut pending: Vec<String> = root.dependencies.clone();
        let mut loaded: Vec<UnitDefinition> = vec![root];
        let mut seen: Vec<String> = loaded.iter().map(|u| u.name.clone()).collect();

        while let Some(dep) = pending.pop() {
            if seen.contains(&dep) {
                continue;
            }
            seen.push(dep.clone());
            let shared = relock(&self.modules).is_unit_loaded(&dep);
            if shared {
                continue;
            }
            let unit = self.resolve_unit(&dep, Path::new(&dep))?;
            pending.extend(unit.dependencies.iter().cloned());
            loaded.push(unit);
        }
        Ok(loaded)
    }

    /// Register a unit's types and functions against a module.
    fn register_unit(&self, unit: &UnitDefinition, module: ModuleId) -> Result<(), LoadError> {
        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());

        for def in &unit.types {
            let ty_hash = def.identity();
            let index = types.register(def.clone(), module)?;
            registry.register(module, ty_hash, Entity::Type(index));
            let def = types
                .get(index)
                .cloned()
                .ok_or_else(|| LoadError::Failed(format!("type '{}' vanished", unit.name)))?;
            for (i, method) in def.methods.iter().enumerate() {
                registry.register(
                    module,
                    StableHash::of_method(ty_hash, &method.name, method.sig.arity()),
                    Entity::Method {
                        ty: index,
                        index: i as u32,
                    },
                );
            }
            for (i, field) in def.fields.iter().enumerate() {
                registry.register(
                    module,
                    StableHash::of_field(ty_hash, &field.name),
                    Entity::Field {
                        ty: index,
                        index: i as u32,
                    },
                );
            }
            for (i, property) in def.properties.iter().enumerate() {
                registry.register(
                    module,
                    StableHash::of_property(ty_hash, &property.name),
                    Entity::Property {
                        ty: index,
                        index: i as u32,
                    },
                );
            }
            for (i, attribute) in def.attributes.iter().enumerate() {
                registry.register(
                    module,
                    StableHash::of_attribute(ty_hash, &attribute.name, i),
                    Entity::Attribute {
                        ty: index,
                        index: i as u32,
                    },
                );
            }
        }

        for function in &unit.functions {
            let weak = self.weak.clone();
            let body = function.body.clone();
            let id = StableHash::of_callable(&function.name);
            let callable = Callable::new(id.raw(), function.sig.clone(), move |args| {
                let engine = weak
                    .upgrade()
                    .ok_or_else(|| InteropError::from(InvokeError::Faulted("engine shut down".into())))?;
                engine.run_managed(None, &body, args)
            });
            registry.register(module, id, Entity::Callable(callable));
        }
        Ok(())
    }

    /// Drop a partially loaded module.
    fn discard_module(&self, id: ModuleId) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .invalidate_module(id);
        self.types
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove_module(id);
        relock(&self.modules).remove(id);
    }

    /// Unload a collectible module.
    ///
    /// Returns `Ok` once every object of the module is gone and its
    /// metadata is invalidated. A timeout leaves the module fully loaded.
    pub fn unload_module(&self, id: ModuleId) -> Result<(), UnloadError> {
        let (tokens, name) = {
            let mut modules = relock(&self.modules);
            let record = modules
                .record_mut(id)
                .ok_or(UnloadError::UnknownModule(id))?;
            if !record.collectible {
                return Err(UnloadError::NotCollectible(id));
            }
            record.state = ModuleState::Unloading;
            (std::mem::take(&mut record.tokens), record.name.clone())
        };

        // A leftover strong token would pin the module in memory forever;
        // release each one and say so.
        for token in tokens {
            DiagnosticSink::warning(
                "unload",
                format!("releasing leaked strong token {token:?} for '{name}'"),
            );
            let freed = relock(&self.heap).release(token);
            if let Some(instance) = freed {
                self.release_instance(instance);
            }
        }

        let started = Instant::now();
        let mut warned = false;
        loop {
            let freed = relock(&self.heap).sweep(Some(id));
            for instance in freed {
                self.release_instance(instance);
            }
            let live = relock(&self.heap).live_for_module(id);
            if live == 0 {
                break;
            }
            let elapsed = started.elapsed();
            if elapsed >= self.config.unload_deadline {
                DiagnosticSink::error(
                    "unload",
                    format!("'{name}' still has {live} live object(s); giving up"),
                );
                let mut modules = relock(&self.modules);
                if let Some(record) = modules.record_mut(id) {
                    record.state = ModuleState::Loaded;
                }
                return Err(UnloadError::TimedOut { module: id, live });
            }
            if !warned && elapsed >= self.config.unload_warn {
                DiagnosticSink::warning(
                    "unload",
                    format!("'{name}' unload is slow: {live} object(s) still alive"),
                );
                warned = true;
            }
            std::thread::sleep(self.config.unload_poll);
        }

        // Reclaim reverse-trampoline contexts owned by this module's
        // callables before their registry entries disappear.
        let callable_ids: Vec<u64> = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            registry
                .handles_for_module(id, |e| matches!(e, Entity::Callable(_)))
                .into_iter()
                .filter_map(|h| match &registry.resolve(h).ok()?.entity {
                    Entity::Callable(c) => Some(c.id()),
                    _ => None,
                })
                .collect()
        };
        self.caches().evict_reverse(&callable_ids);

        for instance in relock(&self.heap).purge_module(id) {
            self.release_instance(instance);
        }
        let invalidated = self
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .invalidate_module(id);
        self.types
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove_module(id);
        let cached: Vec<tether_core::handle::Handle> =
            relock(&self.invokers).keys().copied().collect();
        let stale: Vec<_> = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            cached
                .into_iter()
                .filter(|h| registry.resolve(*h).is_err())
                .collect()
        };
        {
            let mut invokers = relock(&self.invokers);
            for handle in stale {
                invokers.remove(&handle);
            }
        }
        {
            let mut modules = relock(&self.modules);
            if let Some(record) = modules.record_mut(id) {
                record.alive = false;
            }
            modules.remove(id);
        }
        DiagnosticSink::info(
            "unload",
            format!("'{name}' unloaded, {invalidated} registry entries invalidated"),
        );
        Ok(())
    }

    pub fn last_load_status(&self) -> LoadStatus {
        relock(&self.modules).last_status()
    }

    pub fn module_name(&self, id: ModuleId) -> Result<String, UnloadError> {
        relock(&self.modules)
            .record(id)
            .map(|r| r.name.clone())
            .ok_or(UnloadError::UnknownModule(id))
    }

    pub fn module_is_loaded(&self, id: ModuleId) -> bool {
        relock(&self.modules).record(id).is_some()
    }
}
