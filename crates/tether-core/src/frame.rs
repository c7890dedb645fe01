//! Call frames bridging dispatch and managed function bodies.
//!
//! A [`CallFrame`] gives a body access to its arguments, its return slot
//! and, for instance calls, the receiver's raw field storage, decoded
//! and encoded through the codec so field access works identically from
//! bodies and from the boundary.

use std::fmt;
use std::sync::Arc;

use crate::codec::MarshalCtx;
use crate::error::{InteropError, InvokeError, ResolveError};
use crate::heap::ObjectView;
use crate::value::Value;

/// Context for one managed call.
pub struct CallFrame<'a> {
    marshal: MarshalCtx<'a>,
    this: Option<ObjectView>,
    args: &'a mut [Value],
    ret: Value,
}

impl<'a> CallFrame<'a> {
    pub fn new(marshal: MarshalCtx<'a>, this: Option<ObjectView>, args: &'a mut [Value]) -> Self {
        Self {
            marshal,
            this,
            args,
            ret: Value::Void,
        }
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, index: usize) -> Result<&Value, InvokeError> {
        self.args
            .get(index)
            .ok_or(InvokeError::ArgumentOutOfBounds {
                index,
                count: self.args.len(),
            })
    }

    /// Mutable slot access, used to write by-reference outputs.
    pub fn arg_mut(&mut self, index: usize) -> Result<&mut Value, InvokeError> {
        let count = self.args.len();
        self.args
            .get_mut(index)
            .ok_or(InvokeError::ArgumentOutOfBounds { index, count })
    }

    pub fn set_ret(&mut self, value: Value) {
        self.ret = value;
    }

    pub fn into_ret(self) -> Value {
        self.ret
    }

    pub fn this(&self) -> Option<ObjectView> {
        self.this
    }

    /// Read a field of the receiver through the codec.
    pub fn get_field(&self, name: &str) -> Result<Value, InteropError> {
        let view = self.this.ok_or(InvokeError::NullTarget)?;
        let (declaring, index) = self
            .marshal
            .types
            .find_field(view.ty, name)
            .ok_or_else(|| ResolveError::MemberNotFound {
                owner: self.type_name(view),
                member: name.to_string(),
            })?;
        let field = self.marshal.types.field(declaring, index)?;
        let addr = unsafe { view.data.add(field.offset as usize) };
        Ok(self
            .marshal
            .codec
            .decode(self.marshal.bindings, addr, field.tag)?)
    }

    /// Write a field of the receiver through the codec. Container and
    /// string cells already present in the field are assigned in place.
    pub fn set_field(&mut self, name: &str, value: &Value) -> Result<(), InteropError> {
        let view = self.this.ok_or(InvokeError::NullTarget)?;
        let (declaring, index) = self
            .marshal
            .types
            .find_field(view.ty, name)
            .ok_or_else(|| ResolveError::MemberNotFound {
                owner: self.type_name(view),
                member: name.to_string(),
            })?;
        let field = self.marshal.types.field(declaring, index)?;
        let addr = unsafe { view.data.add(field.offset as usize) };
        self.marshal
            .codec
            .write_back(self.marshal.bindings, value, field.tag, addr)?;
        Ok(())
    }

    fn type_name(&self, view: ObjectView) -> String {
        self.marshal
            .types
            .get(view.ty)
            .map(|def| def.name.clone())
            .unwrap_or_else(|| "<unloaded>".to_string())
    }
}

impl fmt::Debug for CallFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFrame")
            .field("arg_count", &self.args.len())
            .field("has_this", &self.this.is_some())
            .finish()
    }
}

type BodyFn = dyn Fn(&mut CallFrame) -> Result<(), InteropError> + Send + Sync;

/// Type-erased managed function body.
///
/// Wraps any callable taking a [`CallFrame`], allowing bodies of different
/// signatures to be stored uniformly. `Arc`-shared so definitions clone
/// cheaply into cached invokers.
#[derive(Clone)]
pub struct ManagedFn {
    inner: Arc<BodyFn>,
}

impl ManagedFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut CallFrame) -> Result<(), InteropError> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    pub fn call(&self, frame: &mut CallFrame) -> Result<(), InteropError> {
        (self.inner)(frame)
    }
}

impl fmt::Debug for ManagedFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedFn").finish_non_exhaustive()
    }
}
