//! Runtime-built calling adapters.
//!
//! Forward adapters let managed code call a native function pointer whose
//! signature is only known at load time; reverse adapters expose a managed
//! callable as an entry native code can call. Both are cached by target
//! identity with an atomic get-or-build, so concurrent first calls on the
//! same target converge on one adapter.
//!
//! The boundary's slot convention: every call slot is one machine word.
//! Scalars are reinterpreted into the slot; by-reference parameters and
//! string/container/vector/matrix parameters put the address of their
//! scratch storage (for handles, the handle itself) in the slot. When the
//! return tag is large, a hidden return slot is prepended to the call.

mod forward;
mod reverse;

pub use forward::ForwardTrampoline;
pub use reverse::{ReverseCtx, reverse_entry_for};

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use rustc_hash::FxHashMap;

use tether_core::codec::CallableBridge;
use tether_core::error::{InteropError, MarshalError};
use tether_core::host::RawCallable;
use tether_core::sig::Signature;
use tether_core::tag::Tag;
use tether_core::value::{Callable, RawParts, Value};

use crate::engine::Engine;

fn relock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    // Adapter caches stay usable even if a builder panicked.
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

/// Reinterpret a scalar value into a call slot word.
pub(crate) fn word_from_scalar(value: &Value, tag: Tag) -> Result<u64, MarshalError> {
    Ok(match (value, tag) {
        (Value::Null, _) => 0,
        (Value::Bool(v), Tag::Bool) => u64::from(*v),
        (Value::Char8(v), Tag::Char8) => u64::from(*v),
        (Value::Char16(v), Tag::Char16) => u64::from(*v),
        (Value::I8(v), Tag::I8) => *v as u8 as u64,
        (Value::U8(v), Tag::U8) => u64::from(*v),
        (Value::I16(v), Tag::I16) => *v as u16 as u64,
        (Value::U16(v), Tag::U16) => u64::from(*v),
        (Value::I32(v), Tag::I32) => *v as u32 as u64,
        (Value::U32(v), Tag::U32) => u64::from(*v),
        (Value::I64(v), Tag::I64) => *v as u64,
        (Value::U64(v), Tag::U64) => *v,
        (Value::Pointer(v), Tag::Pointer) => *v as u64,
        (Value::Object(t), Tag::Pointer) => t.raw(),
        (Value::F32(v), Tag::F32) => u64::from(v.to_bits()),
        (Value::F64(v), Tag::F64) => v.to_bits(),
        (other, tag) => {
            return Err(MarshalError::TypeMismatch {
                expected: tag,
                got: other.type_name(),
            });
        }
    })
}

/// Recover a scalar value from a call slot word.
///
/// Narrow tags mask to their width first: a native callee only defines
/// the low bits of its return register.
pub(crate) fn scalar_from_word(tag: Tag, word: u64) -> Value {
    match tag {
        Tag::Void => Value::Void,
        Tag::Bool => Value::Bool(word as u8 != 0),
        Tag::Char8 => Value::Char8(word as u8),
        Tag::Char16 => Value::Char16(word as u16),
        Tag::I8 => Value::I8(word as u8 as i8),
        Tag::U8 => Value::U8(word as u8),
        Tag::I16 => Value::I16(word as u16 as i16),
        Tag::U16 => Value::U16(word as u16),
        Tag::I32 => Value::I32(word as u32 as i32),
        Tag::U32 => Value::U32(word as u32),
        Tag::I64 => Value::I64(word as i64),
        Tag::U64 => Value::U64(word),
        Tag::Pointer => Value::Pointer(word as usize),
        Tag::F32 => Value::F32(f32::from_bits(word as u32)),
        Tag::F64 => Value::F64(f64::from_bits(word)),
        _ => Value::Null,
    }
}

/// Tags whose native representation is an opaque handle word.
pub(crate) fn is_handle_tag(tag: Tag) -> bool {
    tag == Tag::Str || tag == Tag::Function || tag.is_array()
}

/// Decode one boundary call slot into a managed value.
///
/// Slot semantics: by-value scalars carry their bits; by-value handles
/// carry the handle; everything else (by-ref parameters, vectors, the
/// matrix) carries the address of its storage.
pub(crate) fn decode_slot(
    codec: &tether_core::codec::Codec,
    bindings: &tether_core::host::HostBindings,
    tag: Tag,
    by_ref: bool,
    word: u64,
) -> Result<Value, InteropError> {
    if !by_ref && tag.is_scalar() {
        return Ok(scalar_from_word(tag, word));
    }
    if !by_ref && is_handle_tag(tag) {
        return Ok(codec.decode(bindings, (&word as *const u64).cast(), tag)?);
    }
    Ok(codec.decode(bindings, word as *const u8, tag)?)
}

/// Decode a full slot array against a signature.
pub(crate) fn decode_slot_args(
    codec: &tether_core::codec::Codec,
    bindings: &tether_core::host::HostBindings,
    sig: &Signature,
    words: &[u64],
) -> Result<Vec<Value>, InteropError> {
    sig.params
        .iter()
        .zip(words)
        .map(|(param, &word)| decode_slot(codec, bindings, param.tag, param.by_ref, word))
        .collect()
}

/// Push by-reference values back through their slot addresses after a
/// call, assigning existing host cells in place.
pub(crate) fn push_back_slot_args(
    codec: &tether_core::codec::Codec,
    bindings: &tether_core::host::HostBindings,
    sig: &Signature,
    words: &[u64],
    args: &[Value],
) -> Result<(), InteropError> {
    for ((param, &word), value) in sig.params.iter().zip(words).zip(args) {
        if param.by_ref {
            codec.write_back(bindings, value, param.tag, word as *mut u8)?;
        }
    }
    Ok(())
}

/// Adapter caches, keyed by target identity.
#[derive(Default)]
pub struct Caches {
    forward: Mutex<FxHashMap<RawParts, Arc<ForwardTrampoline>>>,
    reverse: Mutex<FxHashMap<u64, reverse::ReverseEntry>>,
}

impl Caches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or build the forward adapter for a target. Atomic per key.
    pub fn forward(
        &self,
        parts: RawParts,
        sig: &Signature,
        direct_bind_max_args: usize,
    ) -> Arc<ForwardTrampoline> {
        let mut cache = relock(&self.forward);
        cache
            .entry(parts)
            .or_insert_with(|| {
                Arc::new(ForwardTrampoline::build(parts, sig.clone(), direct_bind_max_args))
            })
            .clone()
    }

    /// Get or build the reverse entry for a managed callable. Atomic per
    /// key; repeated exposure of the same callable reuses one context.
    pub fn reverse(
        &self,
        engine: &Weak<Engine>,
        callable: &Callable,
    ) -> Result<RawParts, MarshalError> {
        let mut cache = relock(&self.reverse);
        if let Some(entry) = cache.get(&callable.id()) {
            return Ok(entry.parts);
        }
        let entry = reverse::ReverseEntry::build(engine.clone(), callable)?;
        let parts = entry.parts;
        cache.insert(callable.id(), entry);
        Ok(parts)
    }

    /// Drop the reverse contexts for the given callable identities,
    /// reclaiming their leaked context allocations.
    pub fn evict_reverse(&self, ids: &[u64]) {
        let mut cache = relock(&self.reverse);
        for id in ids {
            cache.remove(id);
        }
    }
}

/// Codec-facing bridge installed into the engine's codec.
pub struct TrampolineBridge {
    engine: Weak<Engine>,
}

impl TrampolineBridge {
    pub fn new(engine: Weak<Engine>) -> Self {
        Self { engine }
    }
}

impl CallableBridge for TrampolineBridge {
    fn wrap(&self, raw: &RawCallable, sig: Signature) -> Result<Callable, MarshalError> {
        let parts = RawParts {
            entry: raw.entry as usize,
            ctx: raw.ctx as usize,
        };
        let engine = self.engine.clone();
        let call_sig = sig.clone();
        // Identity mixes entry and context so two contexts sharing a pool
        // shim stay distinct targets.
        let id = (parts.entry as u64).wrapping_mul(0x9e3779b97f4a7c15) ^ parts.ctx as u64;
        Ok(Callable::with_raw(id, sig, parts, move |args| {
            let engine = engine.upgrade().ok_or(InteropError::Invoke(
                tether_core::error::InvokeError::Faulted("engine shut down".into()),
            ))?;
            engine.call_native(parts, &call_sig, args)
        }))
    }

    fn expose(&self, callable: &Callable) -> Result<RawParts, MarshalError> {
        let engine = self.engine.upgrade().ok_or(MarshalError::HostBindingMissing(
            "engine",
        ))?;
        engine.caches().reverse(&self.engine, callable)
    }
}
