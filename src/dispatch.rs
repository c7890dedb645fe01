//! The dispatch layer: construct, invoke, member access and metadata
//! queries over registered handles.
//!
//! Managed bodies run with the receiver pinned and no engine locks held
//! beyond a type-table read, so a body reached through a reverse
//! trampoline can reentrantly call back into dispatch. A body must not
//! load or unload modules.

use std::sync::Arc;

use tether_core::error::{InteropError, InvokeError, ResolveError};
use tether_core::frame::{CallFrame, ManagedFn};
use tether_core::handle::{Handle, Token};
use tether_core::codec::MarshalCtx;
use tether_core::reflect::{EnumDef, TypeDef, TypeTable, TypeTraits};
use tether_core::registry::{Entity, Entry, TypeIndex};
use tether_core::sig::{Param, Signature};
use tether_core::stable_hash::StableHash;
use tether_core::tag::Tag;
use tether_core::value::Value;

use crate::engine::{Engine, relock};

/// Cached, signature-checked adapter for one method handle.
#[derive(Clone)]
pub struct Invoker {
    def: Arc<TypeDef>,
    method: u32,
}

impl Invoker {
    fn method(&self) -> Result<&tether_core::reflect::MethodDef, ResolveError> {
        self.def
            .methods
            .get(self.method as usize)
            .ok_or(ResolveError::StaleToken)
    }
}

/// Null value matches every parameter; otherwise tags must agree, with
/// object references standing in for pointers.
fn value_compatible(value: &Value, param: &Param) -> bool {
    match value.tag() {
        None => true,
        Some(tag) => tag == param.tag,
    }
}

fn find_constructor(
    types: &TypeTable,
    ty: TypeIndex,
    args: &[Value],
) -> Option<(ManagedFn, Signature)> {
    // Match the requested type's own constructors by argument tags, then
    // walk the base chain so a subtype without declared constructors can
    // be built through a matching base constructor.
    let mut declared_any = false;
    let mut current = Some(ty);
    while let Some(index) = current {
        let def = types.get(index)?;
        declared_any |= !def.constructors.is_empty();
        for ctor in &def.constructors {
            if ctor.sig.arity() == args.len()
                && ctor.sig.params.iter().zip(args).all(|(p, a)| value_compatible(a, p))
            {
                return Some((ctor.body.clone(), ctor.sig.clone()));
            }
        }
        current = def.base_index();
    }
    // A chain with no declared constructors still default-constructs to
    // its zero-filled layout.
    if !declared_any && args.is_empty() {
        return Some((ManagedFn::new(|_| Ok(())), Signature::of(&[], Tag::Void)));
    }
    None
}

/// Unpins on drop, so a panicking body cannot leave an object pinned.
struct PinGuard<'a> {
    engine: &'a Engine,
    token: Token,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        relock(&self.engine.heap).unpin(self.token);
    }
}

impl Engine {
    fn pin_guarded(&self, token: Token) -> Result<(tether_core::heap::ObjectView, PinGuard<'_>), ResolveError> {
        let view = relock(&self.heap)
            .pin(token)
            .ok_or(ResolveError::StaleToken)?;
        Ok((view, PinGuard {
            engine: self,
            token,
        }))
    }

    pub(crate) fn resolve_entry(&self, handle: Handle) -> Result<Entry, ResolveError> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(handle)
            .cloned()
    }

    fn resolve_type_entry(&self, handle: Handle) -> Result<(TypeIndex, Entry), ResolveError> {
        let entry = self.resolve_entry(handle)?;
        match entry.entity {
            Entity::Type(ty) => Ok((ty, entry)),
            _ => Err(ResolveError::UnknownHandle(handle)),
        }
    }

    fn type_def(&self, ty: TypeIndex) -> Result<Arc<TypeDef>, ResolveError> {
        self.types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(ty)
            .cloned()
            .ok_or(ResolveError::StaleToken)
    }

    /// Run a managed body with the receiver pinned for the duration.
    pub(crate) fn run_managed(
        &self,
        this: Option<Token>,
        body: &ManagedFn,
        args: &mut [Value],
    ) -> Result<Value, InteropError> {
        let (view, _pin) = match this {
            Some(token) => {
                let (view, guard) = self.pin_guarded(token)?;
                (Some(view), Some(guard))
            }
            None => (None, None),
        };
        let bindings = self.bindings_snapshot();
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        let marshal = MarshalCtx {
            codec: self.codec(),
            bindings: &bindings,
            types: &types,
        };
        let mut frame = CallFrame::new(marshal, view, args);
        let outcome = body.call(&mut frame);
        outcome.map(|()| frame.into_ret())
    }

    // --- construction -------------------------------------------------------

    /// Construct an instance of a registered type, returning a strong or
    /// weak token per `weak`.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn construct(
        &self,
        type_handle: Handle,
        weak: bool,
        args: &mut [Value],
    ) -> Result<Token, InteropError> {
        let (ty, entry) = self.resolve_type_entry(type_handle)?;
        let def = self.type_def(ty)?;
        let found = {
            let types = self.types.read().unwrap_or_else(|e| e.into_inner());
            find_constructor(&types, ty, args)
        };
        let Some((body, _sig)) = found else {
            return Err(InvokeError::NoSuitableConstructor {
                type_name: def.name.clone(),
                argc: args.len(),
            }
            .into());
        };

        let token = relock(&self.heap).allocate(
            ty,
            entry.module,
            def.instance_size() as usize,
            !weak,
        );
        if token.is_strong() {
            relock(&self.modules).track_token(entry.module, token);
        }
        match self.run_managed(Some(token), &body, args) {
            Ok(_) => Ok(token),
            Err(err) => {
                if token.is_strong() {
                    relock(&self.modules).untrack_token(entry.module, token);
                    if let Some(instance) = relock(&self.heap).release(token) {
                        self.release_instance(instance);
                    }
                }
                Err(err)
            }
        }
    }

    /// Drop the strong reference a token holds.
    pub fn destroy_object(&self, token: Token) -> Result<(), InteropError> {
        let module = relock(&self.heap)
            .view(token)
            .ok_or(ResolveError::StaleToken)?
            .module;
        relock(&self.modules).untrack_token(module, token);
        if let Some(instance) = relock(&self.heap).release(token) {
            self.release_instance(instance);
        }
        Ok(())
    }

    /// Take an additional strong reference on an object.
    pub fn retain_object(&self, token: Token) -> Result<Token, InteropError> {
        let retained = relock(&self.heap)
            .retain(token)
            .ok_or(ResolveError::StaleToken)?;
        let module = relock(&self.heap)
            .view(retained)
            .ok_or(ResolveError::StaleToken)?
            .module;
        relock(&self.modules).track_token(module, retained);
        Ok(retained)
    }

    // --- invocation ---------------------------------------------------------

    fn invoker_for(&self, method: Handle) -> Result<Invoker, InteropError> {
        if let Some(found) = relock(&self.invokers).get(&method).cloned() {
            return Ok(found);
        }
        let entry = self.resolve_entry(method)?;
        let Entity::Method { ty, index } = entry.entity else {
            return Err(ResolveError::UnknownHandle(method).into());
        };
        let built = Invoker {
            def: self.type_def(ty)?,
            method: index,
        };
        // First build wins if two calls race here.
        Ok(relock(&self.invokers)
            .entry(method)
            .or_insert(built)
            .clone())
    }

    /// Invoke a method. Instance methods require a target token; by-ref
    /// argument slots are updated in place.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn invoke_method(
        &self,
        target: Option<Token>,
        method: Handle,
        args: &mut [Value],
    ) -> Result<Value, InteropError> {
        let invoker = self.invoker_for(method)?;
        let def = invoker.method()?;
        if args.len() != def.sig.arity() {
            return Err(InvokeError::ArityMismatch {
                expected: def.sig.arity(),
                got: args.len(),
            }
            .into());
        }
        let body = def.body.clone();
        if def.is_static {
            self.run_managed(None, &body, args)
        } else {
            let token = target.ok_or(InvokeError::NullTarget)?;
            if token.is_null() {
                return Err(InvokeError::NullTarget.into());
            }
            self.run_managed(Some(token), &body, args)
        }
    }

    /// Invoke a module-level callable by handle.
    pub fn invoke_callable(
        &self,
        handle: Handle,
        args: &mut [Value],
    ) -> Result<Value, InteropError> {
        let entry = self.resolve_entry(handle)?;
        let Entity::Callable(callable) = entry.entity else {
            return Err(ResolveError::UnknownHandle(handle).into());
        };
        callable.invoke(args)
    }

    /// Find a module-level callable by name.
    pub fn find_callable(&self, name: &str) -> Result<Handle, ResolveError> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .lookup_any(StableHash::of_callable(name))
            .ok_or_else(|| ResolveError::UnknownType(name.to_string()))
    }

    // --- field and property access -----------------------------------------

    fn with_pinned<R>(
        &self,
        token: Token,
        f: impl FnOnce(tether_core::heap::ObjectView) -> Result<R, InteropError>,
    ) -> Result<R, InteropError> {
        let (view, _pin) = self.pin_guarded(token)?;
        f(view)
    }

    pub fn get_field(&self, target: Token, name: &str) -> Result<Value, InteropError> {
        self.with_pinned(target, |view| {
            let bindings = self.bindings_snapshot();
            let types = self.types.read().unwrap_or_else(|e| e.into_inner());
            let (declaring, index) = types
                .find_field(view.ty, name)
                .ok_or_else(|| self.member_missing(&types, view.ty, name))?;
            let field = types.field(declaring, index)?;
            let addr = unsafe { view.data.add(field.offset as usize) };
            Ok(self.codec().decode(&bindings, addr, field.tag)?)
        })
    }

    pub fn set_field(&self, target: Token, name: &str, value: &Value) -> Result<(), InteropError> {
        self.with_pinned(target, |view| {
            let bindings = self.bindings_snapshot();
            let types = self.types.read().unwrap_or_else(|e| e.into_inner());
            let (declaring, index) = types
                .find_field(view.ty, name)
                .ok_or_else(|| self.member_missing(&types, view.ty, name))?;
            let field = types.field(declaring, index)?;
            let addr = unsafe { view.data.add(field.offset as usize) };
            self.codec()
                .write_back(&bindings, value, field.tag, addr)?;
            Ok(())
        })
    }

    /// Raw offset-based address of a field.
    ///
    /// Ephemeral by contract: the address is invalid once the object is
    /// freed or its module unloads. Callers needing it to stay valid must
    /// pin the object.
    pub fn field_address(&self, target: Token, name: &str) -> Result<usize, InteropError> {
        let view = relock(&self.heap)
            .view(target)
            .ok_or(ResolveError::StaleToken)?;
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        let (declaring, index) = types
            .find_field(view.ty, name)
            .ok_or_else(|| self.member_missing(&types, view.ty, name))?;
        let field = types.field(declaring, index)?;
        Ok(view.data as usize + field.offset as usize)
    }

    pub fn get_property(&self, target: Token, name: &str) -> Result<Value, InteropError> {
        let getter = {
            let view = relock(&self.heap)
                .view(target)
                .ok_or(ResolveError::StaleToken)?;
            let types = self.types.read().unwrap_or_else(|e| e.into_inner());
            let (declaring, index) = types
                .find_property(view.ty, name)
                .ok_or_else(|| self.member_missing(&types, view.ty, name))?;
            types
                .get(declaring)
                .and_then(|def| def.properties.get(index as usize))
                .and_then(|p| p.getter.clone())
                .ok_or_else(|| self.member_missing(&types, view.ty, name))?
        };
        self.run_managed(Some(target), &getter, &mut [])
    }

    pub fn set_property(
        &self,
        target: Token,
        name: &str,
        value: Value,
    ) -> Result<(), InteropError> {
        let setter = {
            let view = relock(&self.heap)
                .view(target)
                .ok_or(ResolveError::StaleToken)?;
            let types = self.types.read().unwrap_or_else(|e| e.into_inner());
            let (declaring, index) = types
                .find_property(view.ty, name)
                .ok_or_else(|| self.member_missing(&types, view.ty, name))?;
            types
                .get(declaring)
                .and_then(|def| def.properties.get(index as usize))
                .and_then(|p| p.setter.clone())
                .ok_or_else(|| self.member_missing(&types, view.ty, name))?
        };
        let mut args = [value];
        self.run_managed(Some(target), &setter, &mut args)?;
        Ok(())
    }

    /// Handle of the field a named lookup on this object resolves to.
    pub fn find_field_handle(&self, target: Token, name: &str) -> Result<Handle, InteropError> {
        let view = relock(&self.heap)
            .view(target)
            .ok_or(ResolveError::StaleToken)?;
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        let (declaring, _) = types
            .find_field(view.ty, name)
            .ok_or_else(|| self.member_missing(&types, view.ty, name))?;
        let def = types.get(declaring).ok_or(ResolveError::StaleToken)?;
        let key = StableHash::of_field(def.identity(), name);
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .lookup_any(key)
            .ok_or_else(|| self.member_missing(&types, view.ty, name))
    }

    /// Value tag of a named property on this object.
    pub fn property_tag(&self, target: Token, name: &str) -> Result<Tag, InteropError> {
        let view = relock(&self.heap)
            .view(target)
            .ok_or(ResolveError::StaleToken)?;
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        let (declaring, index) = types
            .find_property(view.ty, name)
            .ok_or_else(|| self.member_missing(&types, view.ty, name))?;
        types
            .get(declaring)
            .and_then(|def| def.properties.get(index as usize))
            .map(|p| p.tag)
            .ok_or_else(|| self.member_missing(&types, view.ty, name))
    }

    fn member_missing(&self, types: &TypeTable, ty: TypeIndex, name: &str) -> InteropError {
        let owner = types
            .get(ty)
            .map(|def| def.name.clone())
            .unwrap_or_else(|| "<unloaded>".into());
        ResolveError::MemberNotFound {
            owner,
            member: name.to_string(),
        }
        .into()
    }

    // --- metadata queries ---------------------------------------------------

    /// Resolve a type by qualified name.
    pub fn find_type(&self, name: &str) -> Result<Handle, ResolveError> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .lookup_any(StableHash::of_type(name))
            .ok_or_else(|| ResolveError::UnknownType(name.to_string()))
    }

    /// Handles of every type a module registered.
    pub fn module_types(&self, id: tether_core::handle::ModuleId) -> Vec<Handle> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .handles_for_module(id, |e| matches!(e, Entity::Type(_)))
    }

    pub fn type_name(&self, handle: Handle) -> Result<String, InteropError> {
        let (ty, _) = self.resolve_type_entry(handle)?;
        Ok(self.type_def(ty)?.name.clone())
    }

    pub fn type_size(&self, handle: Handle) -> Result<u32, InteropError> {
        let (ty, _) = self.resolve_type_entry(handle)?;
        Ok(self.type_def(ty)?.instance_size())
    }

    pub fn type_traits(&self, handle: Handle) -> Result<TypeTraits, InteropError> {
        let (ty, _) = self.resolve_type_entry(handle)?;
        Ok(self.type_def(ty)?.traits)
    }

    /// Handle of a type's base type, or the null handle at a root.
    pub fn type_base(&self, handle: Handle) -> Result<Handle, InteropError> {
        let (ty, _) = self.resolve_type_entry(handle)?;
        let def = self.type_def(ty)?;
        match &def.base {
            Some(base) => Ok(self.find_type(base)?),
            None => Ok(Handle::NULL),
        }
    }

    pub fn is_assignable(&self, from: Handle, to: Handle) -> Result<bool, InteropError> {
        let (from_ty, _) = self.resolve_type_entry(from)?;
        let (to_ty, _) = self.resolve_type_entry(to)?;
        Ok(self
            .types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_assignable(from_ty, to_ty))
    }

    fn member_handles(
        &self,
        handle: Handle,
        keys: impl Fn(StableHash, &TypeDef) -> Vec<StableHash>,
    ) -> Result<Vec<Handle>, InteropError> {
        let (ty, entry) = self.resolve_type_entry(handle)?;
        let def = self.type_def(ty)?;
        let ty_hash = def.identity();
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        Ok(keys(ty_hash, &def)
            .into_iter()
            .filter_map(|key| registry.lookup(entry.module, key))
            .collect())
    }

    pub fn type_methods(&self, handle: Handle) -> Result<Vec<Handle>, InteropError> {
        self.member_handles(handle, |ty_hash, def| {
            def.methods
                .iter()
                .map(|m| StableHash::of_method(ty_hash, &m.name, m.sig.arity()))
                .collect()
        })
    }

    pub fn type_fields(&self, handle: Handle) -> Result<Vec<Handle>, InteropError> {
        self.member_handles(handle, |ty_hash, def| {
            def.fields
                .iter()
                .map(|f| StableHash::of_field(ty_hash, &f.name))
                .collect()
        })
    }

    pub fn type_properties(&self, handle: Handle) -> Result<Vec<Handle>, InteropError> {
        self.member_handles(handle, |ty_hash, def| {
            def.properties
                .iter()
                .map(|p| StableHash::of_property(ty_hash, &p.name))
                .collect()
        })
    }

    pub fn type_attributes(&self, handle: Handle) -> Result<Vec<Handle>, InteropError> {
        self.member_handles(handle, |ty_hash, def| {
            def.attributes
                .iter()
                .enumerate()
                .map(|(i, a)| StableHash::of_attribute(ty_hash, &a.name, i))
                .collect()
        })
    }

    /// Find an instance or static method by name, walking the base chain.
    pub fn find_method(&self, type_handle: Handle, name: &str) -> Result<Handle, InteropError> {
        let (ty, _) = self.resolve_type_entry(type_handle)?;
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        let (declaring, index) = types
            .find_method(ty, name)
            .ok_or_else(|| self.member_missing(&types, ty, name))?;
        let def = types.get(declaring).ok_or(ResolveError::StaleToken)?;
        let method = def
            .methods
            .get(index as usize)
            .ok_or(ResolveError::StaleToken)?;
        let key = StableHash::of_method(def.identity(), &method.name, method.sig.arity());
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .lookup_any(key)
            .ok_or_else(|| self.member_missing(&types, ty, name))
    }

    /// Name of a handle's member (method, field, property or attribute).
    pub fn member_name(&self, handle: Handle) -> Result<String, InteropError> {
        let entry = self.resolve_entry(handle)?;
        let name = match entry.entity {
            Entity::Type(ty) => self.type_def(ty)?.name.clone(),
            Entity::Method { ty, index } => self
                .type_def(ty)?
                .methods
                .get(index as usize)
                .ok_or(ResolveError::StaleToken)?
                .name
                .clone(),
            Entity::Field { ty, index } => self
                .type_def(ty)?
                .fields
                .get(index as usize)
                .ok_or(ResolveError::StaleToken)?
                .name
                .clone(),
            Entity::Property { ty, index } => self
                .type_def(ty)?
                .properties
                .get(index as usize)
                .ok_or(ResolveError::StaleToken)?
                .name
                .clone(),
            Entity::Attribute { ty, index } => self
                .type_def(ty)?
                .attributes
                .get(index as usize)
                .ok_or(ResolveError::StaleToken)?
                .name
                .clone(),
            Entity::Callable(_) => return Err(ResolveError::UnknownHandle(handle).into()),
        };
        Ok(name)
    }

    /// Signature of a method handle, or of a field/property's value shape.
    pub fn member_signature(&self, handle: Handle) -> Result<Signature, InteropError> {
        let entry = self.resolve_entry(handle)?;
        match entry.entity {
            Entity::Method { ty, index } => Ok(self
                .type_def(ty)?
                .methods
                .get(index as usize)
                .ok_or(ResolveError::StaleToken)?
                .sig
                .clone()),
            Entity::Field { ty, index } => {
                let tag = self
                    .type_def(ty)?
                    .fields
                    .get(index as usize)
                    .ok_or(ResolveError::StaleToken)?
                    .tag;
                Ok(Signature::of(&[], tag))
            }
            Entity::Property { ty, index } => {
                let tag = self
                    .type_def(ty)?
                    .properties
                    .get(index as usize)
                    .ok_or(ResolveError::StaleToken)?
                    .tag;
                Ok(Signature::of(&[], tag))
            }
            Entity::Callable(c) => Ok(c.signature().clone()),
            _ => Err(ResolveError::UnknownHandle(handle).into()),
        }
    }

    /// Values of an attribute instance.
    pub fn attribute_values(
        &self,
        handle: Handle,
    ) -> Result<Vec<(String, Value)>, InteropError> {
        let entry = self.resolve_entry(handle)?;
        let Entity::Attribute { ty, index } = entry.entity else {
            return Err(ResolveError::UnknownHandle(handle).into());
        };
        Ok(self
            .type_def(ty)?
            .attributes
            .get(index as usize)
            .ok_or(ResolveError::StaleToken)?
            .values
            .clone())
    }

    /// One named value of an attribute instance.
    pub fn attribute_value(&self, handle: Handle, field: &str) -> Result<Value, InteropError> {
        self.attribute_values(handle)?
            .into_iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
            .ok_or_else(|| {
                ResolveError::MemberNotFound {
                    owner: "attribute".into(),
                    member: field.to_string(),
                }
                .into()
            })
    }

    /// Names and underlying values of an enum type.
    pub fn enum_entries(&self, handle: Handle) -> Result<(Vec<String>, Vec<i64>), InteropError> {
        let (ty, _) = self.resolve_type_entry(handle)?;
        let def = self.type_def(ty)?;
        let info = def.enum_def.as_ref().ok_or_else(|| {
            InteropError::from(ResolveError::MemberNotFound {
                owner: def.name.clone(),
                member: "<enum entries>".into(),
            })
        })?;
        let (names, values): (Vec<String>, Vec<i64>) = info
            .entries
            .iter()
            .map(|(n, v)| (n.clone(), *v))
            .unzip();
        Ok((names, values))
    }

    /// Define or replace an enum type's entries.
    pub fn define_enum(
        &self,
        handle: Handle,
        underlying: Tag,
        entries: Vec<(String, i64)>,
    ) -> Result<(), InteropError> {
        let (ty, _) = self.resolve_type_entry(handle)?;
        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        let def = types.get_mut(ty).ok_or(ResolveError::StaleToken)?;
        def.traits |= TypeTraits::ENUM;
        def.enum_def = Some(EnumDef {
            underlying,
            entries,
        });
        Ok(())
    }
}
