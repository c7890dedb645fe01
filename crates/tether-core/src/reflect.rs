//! Reflected type metadata: definitions for types, members and attribute
//! instances, plus the process-wide type table.
//!
//! Instance storage is a flat byte buffer. Field offsets are computed at
//! registration time (base-type fields first, then own fields), so a
//! subtype's buffer embeds its base prefix and an offset stays valid
//! whichever type in the chain declared the field.

use std::sync::Arc;

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use crate::error::{LoadError, ResolveError};
use crate::frame::ManagedFn;
use crate::handle::ModuleId;
use crate::registry::TypeIndex;
use crate::sig::Signature;
use crate::stable_hash::StableHash;
use crate::tag::Tag;
use crate::value::Value;

bitflags! {
    /// Trait flags reported by type metadata queries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeTraits: u32 {
        const CLASS = 1 << 0;
        const VALUE_TYPE = 1 << 1;
        const ENUM = 1 << 2;
        const SEALED = 1 << 3;
        const ABSTRACT = 1 << 4;
    }
}

impl Default for TypeTraits {
    fn default() -> Self {
        TypeTraits::CLASS
    }
}

/// A field of a reflected type.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub tag: Tag,
    /// Byte offset from the instance base. Computed at registration.
    pub offset: u32,
    pub attributes: Vec<AttributeDef>,
}

/// A constructor of a reflected type. The body receives the freshly
/// allocated instance as `this`.
#[derive(Clone)]
pub struct CtorDef {
    pub sig: Signature,
    pub body: ManagedFn,
}

impl std::fmt::Debug for CtorDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtorDef").field("sig", &self.sig).finish()
    }
}

/// A method of a reflected type.
#[derive(Clone)]
pub struct MethodDef {
    pub name: String,
    pub sig: Signature,
    pub is_static: bool,
    pub body: ManagedFn,
    pub attributes: Vec<AttributeDef>,
}

impl std::fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDef")
            .field("name", &self.name)
            .field("sig", &self.sig)
            .field("is_static", &self.is_static)
            .finish()
    }
}

/// A property of a reflected type: get/set bodies over a value tag.
#[derive(Clone)]
pub struct PropertyDef {
    pub name: String,
    pub tag: Tag,
    pub getter: Option<ManagedFn>,
    pub setter: Option<ManagedFn>,
}

impl std::fmt::Debug for PropertyDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyDef")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("readable", &self.getter.is_some())
            .field("writable", &self.setter.is_some())
            .finish()
    }
}

/// An attribute instance attached to a type or member.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDef {
    pub name: String,
    pub values: Vec<(String, Value)>,
}

impl AttributeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
        }
    }

    pub fn with_value(mut self, field: impl Into<String>, value: Value) -> Self {
        self.values.push((field.into(), value));
        self
    }

    pub fn value(&self, field: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }
}

/// Enum metadata: entry names and their underlying integer values.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDef {
    pub underlying: Tag,
    pub entries: Vec<(String, i64)>,
}

/// A reflected type definition.
///
/// Units build these with the chained constructors below; offsets and
/// sizes are filled in when the definition is registered.
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: String,
    pub base: Option<String>,
    pub traits: TypeTraits,
    pub fields: Vec<FieldDef>,
    pub constructors: Vec<CtorDef>,
    pub methods: Vec<MethodDef>,
    pub properties: Vec<PropertyDef>,
    pub attributes: Vec<AttributeDef>,
    pub enum_def: Option<EnumDef>,
    pub(crate) base_index: Option<TypeIndex>,
    pub(crate) size: u32,
    pub(crate) owner: ModuleId,
}

impl TypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            traits: TypeTraits::default(),
            fields: Vec::new(),
            constructors: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
            attributes: Vec::new(),
            enum_def: None,
            base_index: None,
            size: 0,
            owner: ModuleId::HOST,
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn with_traits(mut self, traits: TypeTraits) -> Self {
        self.traits = traits;
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, tag: Tag) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            tag,
            offset: 0,
            attributes: Vec::new(),
        });
        self
    }

    pub fn with_attributed_field(
        mut self,
        name: impl Into<String>,
        tag: Tag,
        attributes: Vec<AttributeDef>,
    ) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            tag,
            offset: 0,
            attributes,
        });
        self
    }

    pub fn with_ctor(mut self, sig: Signature, body: ManagedFn) -> Self {
        self.constructors.push(CtorDef { sig, body });
        self
    }

    pub fn with_method(
        mut self,
        name: impl Into<String>,
        sig: Signature,
        is_static: bool,
        body: ManagedFn,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.into(),
            sig,
            is_static,
            body,
            attributes: Vec::new(),
        });
        self
    }

    pub fn with_property(
        mut self,
        name: impl Into<String>,
        tag: Tag,
        getter: Option<ManagedFn>,
        setter: Option<ManagedFn>,
    ) -> Self {
        self.properties.push(PropertyDef {
            name: name.into(),
            tag,
            getter,
            setter,
        });
        self
    }

    pub fn with_attribute(mut self, attribute: AttributeDef) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_enum(mut self, underlying: Tag, entries: Vec<(String, i64)>) -> Self {
        self.traits |= TypeTraits::ENUM;
        self.enum_def = Some(EnumDef {
            underlying,
            entries,
        });
        self
    }

    /// Instance footprint in bytes, including the base prefix.
    pub fn instance_size(&self) -> u32 {
        self.size
    }

    /// Resolved base type, once registered.
    pub fn base_index(&self) -> Option<TypeIndex> {
        self.base_index
    }

    pub fn owner(&self) -> ModuleId {
        self.owner
    }

    pub fn identity(&self) -> StableHash {
        StableHash::of_type(&self.name)
    }
}

fn field_align(tag: Tag) -> u32 {
    match tag.native_size() {
        0 | 1 => 1,
        2 => 2,
        s if s <= 4 => 4,
        // Vec3 is 12 bytes of packed f32s.
        12 => 4,
        _ => 8,
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// The process-wide table of registered types.
///
/// Slots are tombstoned on module unload, like the handle registry, so a
/// stale [`TypeIndex`] can never alias a re-registered type.
#[derive(Default)]
pub struct TypeTable {
    slots: Vec<Option<Arc<TypeDef>>>,
    by_hash: FxHashMap<StableHash, TypeIndex>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, computing its layout. Registering a name that
    /// is already live fails: type identity is per name, and replacement
    /// only happens through module unload.
    pub fn register(&mut self, mut def: TypeDef, owner: ModuleId) -> Result<TypeIndex, LoadError> {
        let hash = def.identity();
        if let Some(&existing) = self.by_hash.get(&hash) {
            if self.slots.get(existing as usize).is_some_and(Option::is_some) {
                return Ok(existing);
            }
        }

        let (base_index, mut cursor) = match &def.base {
            Some(base_name) => {
                let base_hash = StableHash::of_type(base_name);
                let index = self.by_hash.get(&base_hash).copied().ok_or_else(|| {
                    LoadError::InvalidFormat {
                        unit: def.name.clone(),
                        reason: format!("unknown base type '{base_name}'"),
                    }
                })?;
                let base = self.slots[index as usize].as_ref().ok_or_else(|| {
                    LoadError::InvalidFormat {
                        unit: def.name.clone(),
                        reason: format!("base type '{base_name}' has been unloaded"),
                    }
                })?;
                (Some(index), base.size)
            }
            None => (None, 0),
        };

        for field in &mut def.fields {
            let align = field_align(field.tag);
            cursor = align_up(cursor, align);
            field.offset = cursor;
            cursor += field.tag.native_size() as u32;
        }
        def.size = align_up(cursor.max(1), 8);
        def.base_index = base_index;
        def.owner = owner;

        let index = self.slots.len() as TypeIndex;
        self.slots.push(Some(Arc::new(def)));
        self.by_hash.insert(hash, index);
        Ok(index)
    }

    pub fn get(&self, index: TypeIndex) -> Option<&Arc<TypeDef>> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    /// Mutable access for metadata updates (enum entries). Clones on write
    /// if the definition is shared.
    pub fn get_mut(&mut self, index: TypeIndex) -> Option<&mut TypeDef> {
        self.slots
            .get_mut(index as usize)
            .and_then(Option::as_mut)
            .map(Arc::make_mut)
    }

    pub fn find(&self, name: &str) -> Option<TypeIndex> {
        let index = *self.by_hash.get(&StableHash::of_type(name))?;
        self.get(index).map(|_| index)
    }

    pub fn base_of(&self, index: TypeIndex) -> Option<TypeIndex> {
        self.get(index)?.base_index
    }

    /// True when a value of `from` can stand in for `to`: same type, or
    /// `to` appears on `from`'s base chain.
    pub fn is_assignable(&self, from: TypeIndex, to: TypeIndex) -> bool {
        let mut current = Some(from);
        while let Some(index) = current {
            if index == to {
                return true;
            }
            current = self.base_of(index);
        }
        false
    }

    /// Find a field by name, walking the base chain. Returns the declaring
    /// type and the field's index within it.
    pub fn find_field(&self, ty: TypeIndex, name: &str) -> Option<(TypeIndex, u32)> {
        let mut current = Some(ty);
        while let Some(index) = current {
            let def = self.get(index)?;
            if let Some(pos) = def.fields.iter().position(|f| f.name == name) {
                return Some((index, pos as u32));
            }
            current = def.base_index;
        }
        None
    }

    /// Find a method by name, walking the base chain.
    pub fn find_method(&self, ty: TypeIndex, name: &str) -> Option<(TypeIndex, u32)> {
        let mut current = Some(ty);
        while let Some(index) = current {
            let def = self.get(index)?;
            if let Some(pos) = def.methods.iter().position(|m| m.name == name) {
                return Some((index, pos as u32));
            }
            current = def.base_index;
        }
        None
    }

    /// Find a property by name, walking the base chain.
    pub fn find_property(&self, ty: TypeIndex, name: &str) -> Option<(TypeIndex, u32)> {
        let mut current = Some(ty);
        while let Some(index) = current {
            let def = self.get(index)?;
            if let Some(pos) = def.properties.iter().position(|p| p.name == name) {
                return Some((index, pos as u32));
            }
            current = def.base_index;
        }
        None
    }

    /// Resolve a field definition from a (declaring type, index) pair.
    pub fn field(&self, ty: TypeIndex, index: u32) -> Result<&FieldDef, ResolveError> {
        self.get(ty)
            .and_then(|def| def.fields.get(index as usize))
            .ok_or(ResolveError::StaleToken)
    }

    /// Tombstone every type owned by `module`.
    pub fn remove_module(&mut self, module: ModuleId) -> Vec<TypeIndex> {
        let mut removed = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.as_ref().is_some_and(|d| d.owner == module) {
                *slot = None;
                removed.push(i as TypeIndex);
            }
        }
        self.by_hash
            .retain(|_, &mut index| !removed.contains(&index));
        removed
    }

    pub fn indices_for_module(&self, module: ModuleId) -> Vec<TypeIndex> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .is_some_and(|d| d.owner == module)
                    .then_some(i as TypeIndex)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ManagedFn;

    fn noop() -> ManagedFn {
        ManagedFn::new(|_| Ok(()))
    }

    fn module(n: u64) -> ModuleId {
        ModuleId::from_raw(n)
    }

    #[test]
    fn layout_offsets_and_size() {
        let mut table = TypeTable::new();
        let def = TypeDef::new("Mixed")
            .with_field("flag", Tag::Bool)
            .with_field("count", Tag::I32)
            .with_field("total", Tag::F64)
            .with_field("tail", Tag::U8);
        let index = table.register(def, module(1)).unwrap();
        let def = table.get(index).unwrap();
        assert_eq!(def.fields[0].offset, 0);
        assert_eq!(def.fields[1].offset, 4);
        assert_eq!(def.fields[2].offset, 8);
        assert_eq!(def.fields[3].offset, 16);
        assert_eq!(def.instance_size(), 24);
    }

    #[test]
    fn base_fields_prefix_subtype_layout() {
        let mut table = TypeTable::new();
        table
            .register(
                TypeDef::new("Base").with_field("id", Tag::I64),
                module(1),
            )
            .unwrap();
        let sub = table
            .register(
                TypeDef::new("Sub")
                    .with_base("Base")
                    .with_field("extra", Tag::I32),
                module(1),
            )
            .unwrap();
        let def = table.get(sub).unwrap();
        assert_eq!(def.fields[0].offset, 8);
        // The inherited field resolves through the chain at its base offset.
        let (declaring, idx) = table.find_field(sub, "id").unwrap();
        assert_eq!(table.field(declaring, idx).unwrap().offset, 0);
    }

    #[test]
    fn unknown_base_is_invalid_format() {
        let mut table = TypeTable::new();
        let err = table
            .register(TypeDef::new("Orphan").with_base("Missing"), module(1))
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidFormat { .. }));
    }

    #[test]
    fn assignability_walks_chain() {
        let mut table = TypeTable::new();
        let base = table.register(TypeDef::new("Base"), module(1)).unwrap();
        let sub = table
            .register(TypeDef::new("Sub").with_base("Base"), module(1))
            .unwrap();
        assert!(table.is_assignable(sub, base));
        assert!(table.is_assignable(sub, sub));
        assert!(!table.is_assignable(base, sub));
    }

    #[test]
    fn method_lookup_walks_chain() {
        let mut table = TypeTable::new();
        table
            .register(
                TypeDef::new("Base").with_method(
                    "greet",
                    Signature::of(&[], Tag::Void),
                    false,
                    noop(),
                ),
                module(1),
            )
            .unwrap();
        let sub = table
            .register(TypeDef::new("Sub").with_base("Base"), module(1))
            .unwrap();
        assert!(table.find_method(sub, "greet").is_some());
        assert!(table.find_method(sub, "missing").is_none());
    }

    #[test]
    fn remove_module_tombstones_types() {
        let mut table = TypeTable::new();
        let a = table.register(TypeDef::new("A"), module(1)).unwrap();
        let b = table.register(TypeDef::new("B"), module(2)).unwrap();
        let removed = table.remove_module(module(1));
        assert_eq!(removed, vec![a]);
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
        assert!(table.find("A").is_none());
    }
}
