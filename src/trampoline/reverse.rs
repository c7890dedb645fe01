//! Reverse trampolines: managed callable → native-callable entry.
//!
//! There is no runtime code generation here. Instead a fixed pool of
//! precompiled `extern "C"` shim entries, one per slot count, takes an
//! opaque context pointer first and the boundary's word slots after it.
//! Exposing a managed callable allocates a context carrying the callable
//! and its signature; the (entry, context) pair is what native code
//! receives. Contexts are reclaimed when their cache entry is evicted,
//! which happens when the owning module unloads.

use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Weak;

use tether_core::diagnostics::DiagnosticSink;
use tether_core::error::MarshalError;
use tether_core::tag::Tag;
use tether_core::value::{Callable, RawParts};

use super::word_from_scalar;
use crate::engine::Engine;

/// Captured state behind a reverse entry's context pointer.
pub struct ReverseCtx {
    engine: Weak<Engine>,
    callable: Callable,
}

/// A cached reverse exposure. Owns the leaked context allocation.
pub(super) struct ReverseEntry {
    pub(super) parts: RawParts,
}

impl ReverseEntry {
    pub(super) fn build(
        engine: Weak<Engine>,
        callable: &Callable,
    ) -> Result<Self, MarshalError> {
        let sig = callable.signature();
        let words = sig.arity() + usize::from(sig.ret.needs_indirect_return());
        let entry =
            reverse_entry_for(words).ok_or(MarshalError::UnsupportedTag(words as u32))?;
        let ctx = Box::into_raw(Box::new(ReverseCtx {
            engine,
            callable: callable.clone(),
        }));
        Ok(Self {
            parts: RawParts {
                entry,
                ctx: ctx as usize,
            },
        })
    }
}

impl Drop for ReverseEntry {
    fn drop(&mut self) {
        if self.parts.ctx != 0 {
            drop(unsafe { Box::from_raw(self.parts.ctx as *mut ReverseCtx) });
        }
    }
}

// Contexts are only dereferenced inside the shim entries.
unsafe impl Send for ReverseEntry {}
unsafe impl Sync for ReverseEntry {}

/// The shared body of every shim entry. Faults are caught here: nothing
/// may unwind into the native caller.
fn reverse_dispatch(ctx: *mut c_void, words: &[u64]) -> u64 {
    let result = catch_unwind(AssertUnwindSafe(|| reverse_dispatch_inner(ctx, words)));
    match result {
        Ok(Ok(word)) => word,
        Ok(Err(err)) => {
            DiagnosticSink::error("reverse call", err.to_string());
            0
        }
        Err(_) => {
            DiagnosticSink::fault("panic in reverse trampoline");
            0
        }
    }
}

fn reverse_dispatch_inner(
    ctx: *mut c_void,
    words: &[u64],
) -> Result<u64, tether_core::error::InteropError> {
    let ctx = unsafe { &*(ctx as *const ReverseCtx) };
    let engine = ctx
        .engine
        .upgrade()
        .ok_or(MarshalError::HostBindingMissing("engine"))?;
    let sig = ctx.callable.signature().clone();
    let bindings = engine.bindings_snapshot();
    let codec = engine.codec();

    let indirect = sig.ret.needs_indirect_return();
    let offset = usize::from(indirect);
    if words.len() != sig.arity() + offset {
        return Err(tether_core::error::InvokeError::ArityMismatch {
            expected: sig.arity() + offset,
            got: words.len(),
        }
        .into());
    }

    let mut args = super::decode_slot_args(codec, &bindings, &sig, &words[offset..])?;

    let ret = ctx.callable.invoke(&mut args)?;

    // Push by-ref values back into the caller's scratch slots.
    super::push_back_slot_args(codec, &bindings, &sig, &words[offset..], &args)?;

    if indirect {
        let out = words[0] as *mut u8;
        // Ownership of anything encoded here passes to the native caller.
        codec.encode(&bindings, &ret, sig.ret, out)?;
        return Ok(0);
    }
    if sig.ret == Tag::Void {
        return Ok(0);
    }
    Ok(word_from_scalar(&ret, sig.ret)?)
}

macro_rules! reverse_shims {
    ($( $name:ident / $n:literal => [ $($arg:ident),* ] ),* $(,)?) => {
        $(
            unsafe extern "C" fn $name(ctx: *mut c_void $(, $arg: u64)*) -> u64 {
                reverse_dispatch(ctx, &[$($arg),*])
            }
        )*

        /// Shim entry for a given slot count, if the pool covers it.
        pub fn reverse_entry_for(words: usize) -> Option<usize> {
            match words {
                $( $n => Some($name as usize), )*
                _ => None,
            }
        }
    };
}

reverse_shims! {
    reverse_entry_0 / 0 => [],
    reverse_entry_1 / 1 => [a0],
    reverse_entry_2 / 2 => [a0, a1],
    reverse_entry_3 / 3 => [a0, a1, a2],
    reverse_entry_4 / 4 => [a0, a1, a2, a3],
    reverse_entry_5 / 5 => [a0, a1, a2, a3, a4],
    reverse_entry_6 / 6 => [a0, a1, a2, a3, a4, a5],
    reverse_entry_7 / 7 => [a0, a1, a2, a3, a4, a5, a6],
    reverse_entry_8 / 8 => [a0, a1, a2, a3, a4, a5, a6, a7],
    reverse_entry_9 / 9 => [a0, a1, a2, a3, a4, a5, a6, a7, a8],
    reverse_entry_10 / 10 => [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9],
    reverse_entry_11 / 11 => [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10],
    reverse_entry_12 / 12 => [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11],
    reverse_entry_13 / 13 => [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12],
    reverse_entry_14 / 14 => [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13],
    reverse_entry_15 / 15 => [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14],
    reverse_entry_16 / 16 => [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15],
    reverse_entry_17 / 17 => [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15, a16],
}
