//! Forward trampolines: native function pointer → managed-style call.
//!
//! Three mechanisms, chosen when the adapter is built:
//!
//! - **Direct bind**: every parameter and the return are word-class
//!   scalars, so the pointer is transmuted to a matching strongly-typed
//!   call shape and invoked with reinterpreted words. No scratch, no
//!   adapter state. This is the common case.
//! - **Word call**: targets carrying a context pointer (reverse-shim
//!   descriptors) use the boundary's uniform word-slot shape, context
//!   first.
//! - **CIF call**: plain native targets with non-trivial signatures go
//!   through a libffi CIF describing the real parameter types.
//!
//! Scratch storage for encoded parameters comes from a per-call bump
//! arena; host cells allocated while encoding are released exactly once
//! after the return value is decoded and by-ref parameters are pulled
//! back. Bit-copied scalars allocate nothing and release nothing.

use std::ffi::c_void;

use bumpalo::Bump;
use libffi::middle::{Arg, Cif, CodePtr, Type};

use tether_core::codec::{Codec, OwnedNative};
use tether_core::error::{InteropError, InvokeError, MarshalError};
use tether_core::host::HostBindings;
use tether_core::sig::Signature;
use tether_core::tag::Tag;
use tether_core::value::{RawParts, Value};

use super::{is_handle_tag, scalar_from_word, word_from_scalar};

enum Mechanism {
    Direct,
    Words,
    Ffi(Cif),
}

/// A built forward adapter for one target.
pub struct ForwardTrampoline {
    parts: RawParts,
    sig: Signature,
    mechanism: Mechanism,
}

// The CIF only holds immutable type descriptors after construction.
unsafe impl Send for ForwardTrampoline {}
unsafe impl Sync for ForwardTrampoline {}

impl ForwardTrampoline {
    pub fn build(parts: RawParts, sig: Signature, direct_bind_max_args: usize) -> Self {
        let mechanism = if parts.ctx != 0 {
            Mechanism::Words
        } else if sig.is_direct_bindable() && sig.arity() <= direct_bind_max_args {
            Mechanism::Direct
        } else {
            Mechanism::Ffi(build_cif(&sig))
        };
        Self {
            parts,
            sig,
            mechanism,
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.sig
    }

    /// Invoke the target with managed arguments. By-reference slots are
    /// pulled back before returning.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call(
        &self,
        codec: &Codec,
        bindings: &HostBindings,
        args: &mut [Value],
    ) -> Result<Value, InteropError> {
        if args.len() != self.sig.arity() {
            return Err(InvokeError::ArityMismatch {
                expected: self.sig.arity(),
                got: args.len(),
            }
            .into());
        }

        if let Mechanism::Direct = self.mechanism {
            let mut words = [0u64; 24];
            for (i, (param, value)) in self.sig.params.iter().zip(args.iter()).enumerate() {
                words[i] = word_from_scalar(value, param.tag)?;
            }
            let word =
                unsafe { call_words(self.parts.entry, 0, &words[..self.sig.arity()])? };
            return Ok(scalar_from_word(self.sig.ret, word));
        }

        let bump = Bump::new();
        let indirect = self.sig.ret.needs_indirect_return();
        let ret_buf: *mut u8 = if indirect {
            bump.alloc_slice_fill_copy(self.sig.ret.native_size().max(8), 0u8)
                .as_mut_ptr()
        } else {
            std::ptr::null_mut()
        };

        let mut owned: Vec<OwnedNative> = Vec::new();
        let mut slots: Vec<u64> = Vec::with_capacity(self.sig.arity() + 1);
        let mut scratch: Vec<*mut u8> = Vec::with_capacity(self.sig.arity());
        if indirect {
            slots.push(ret_buf as u64);
        }

        let prep: Result<(), InteropError> = (|| {
            for (param, value) in self.sig.params.iter().zip(args.iter()) {
                if param.tag.is_scalar() && !param.by_ref {
                    slots.push(word_from_scalar(value, param.tag)?);
                    scratch.push(std::ptr::null_mut());
                    continue;
                }
                let cell = bump
                    .alloc_slice_fill_copy(param.tag.native_size().max(8), 0u8)
                    .as_mut_ptr();
                if let Some(cell_owned) = codec.encode(bindings, value, param.tag, cell)? {
                    owned.push(cell_owned);
                }
                let word = if is_handle_tag(param.tag) && !param.by_ref {
                    // The encoded handle is itself the storage address.
                    unsafe { std::ptr::read_unaligned(cell as *const u64) }
                } else {
                    cell as u64
                };
                slots.push(word);
                scratch.push(cell);
            }
            Ok(())
        })();

        if let Err(err) = prep {
            for cell_owned in owned {
                codec.release(bindings, cell_owned);
            }
            return Err(err);
        }

        let call_result = match &self.mechanism {
            Mechanism::Words => unsafe { call_words(self.parts.entry, self.parts.ctx, &slots) },
            Mechanism::Ffi(cif) => unsafe {
                Ok(self.ffi_call(cif, &bump, &slots, indirect))
            },
            Mechanism::Direct => unreachable!("direct calls return above"),
        };

        let result = call_result.and_then(|word| {
            let ret = if indirect {
                let value = codec.decode(bindings, ret_buf, self.sig.ret)?;
                // The callee allocated the returned cell; it is ours now
                // and dies once decoded.
                if is_handle_tag(self.sig.ret) {
                    codec.release_cell(bindings, self.sig.ret, ret_buf);
                }
                value
            } else if self.sig.ret == Tag::Void {
                Value::Void
            } else if self.sig.ret.is_scalar() {
                scalar_from_word(self.sig.ret, word)
            } else {
                Value::Void
            };

            for ((param, value), cell) in
                self.sig.params.iter().zip(args.iter_mut()).zip(&scratch)
            {
                if param.by_ref && !cell.is_null() {
                    *value = codec.decode(bindings, *cell, param.tag)?;
                } else if param.by_ref {
                    return Err(MarshalError::NullAddress(param.tag).into());
                }
            }
            Ok(ret)
        });

        for cell_owned in owned {
            codec.release(bindings, cell_owned);
        }
        result
    }

    /// Issue the CIF call. `slots` already hold scalar words and scratch
    /// addresses; each argument cell is materialized at its real type.
    unsafe fn ffi_call(&self, cif: &Cif, bump: &Bump, slots: &[u64], indirect: bool) -> u64 {
        let code = CodePtr(self.parts.entry as *mut c_void);
        let mut ffi_args: Vec<Arg> = Vec::with_capacity(slots.len());
        let mut slot_iter = slots.iter();

        if indirect {
            let word = slot_iter.next().copied().unwrap_or(0);
            let cell = bump.alloc(word as usize);
            ffi_args.push(Arg::new(cell));
        }
        for (param, &word) in self.sig.params.iter().zip(slot_iter) {
            if param.tag.is_scalar() && !param.by_ref {
                ffi_args.push(scalar_arg(bump, param.tag, word));
            } else {
                let cell = bump.alloc(word as usize);
                ffi_args.push(Arg::new(cell));
            }
        }

        unsafe {
            if indirect || self.sig.ret == Tag::Void {
                cif.call::<()>(code, &ffi_args);
                0
            } else {
                match self.sig.ret {
                    Tag::Bool | Tag::Char8 | Tag::U8 => {
                        u64::from(cif.call::<u8>(code, &ffi_args))
                    }
                    Tag::I8 => cif.call::<i8>(code, &ffi_args) as u8 as u64,
                    Tag::Char16 | Tag::U16 => u64::from(cif.call::<u16>(code, &ffi_args)),
                    Tag::I16 => cif.call::<i16>(code, &ffi_args) as u16 as u64,
                    Tag::U32 => u64::from(cif.call::<u32>(code, &ffi_args)),
                    Tag::I32 => cif.call::<i32>(code, &ffi_args) as u32 as u64,
                    Tag::I64 | Tag::U64 => cif.call::<u64>(code, &ffi_args),
                    Tag::Pointer | Tag::Function => {
                        cif.call::<*const c_void>(code, &ffi_args) as u64
                    }
                    Tag::F32 => u64::from(cif.call::<f32>(code, &ffi_args).to_bits()),
                    Tag::F64 => cif.call::<f64>(code, &ffi_args).to_bits(),
                    _ => {
                        cif.call::<()>(code, &ffi_args);
                        0
                    }
                }
            }
        }
    }
}

fn ffi_type(tag: Tag, by_ref: bool) -> Type {
    if by_ref || !tag.is_scalar() {
        return Type::pointer();
    }
    match tag {
        Tag::Bool | Tag::Char8 | Tag::U8 => Type::u8(),
        Tag::I8 => Type::i8(),
        Tag::Char16 | Tag::U16 => Type::u16(),
        Tag::I16 => Type::i16(),
        Tag::U32 => Type::u32(),
        Tag::I32 => Type::i32(),
        Tag::U64 => Type::u64(),
        Tag::I64 => Type::i64(),
        Tag::Pointer => Type::pointer(),
        Tag::F32 => Type::f32(),
        Tag::F64 => Type::f64(),
        _ => Type::pointer(),
    }
}

fn build_cif(sig: &Signature) -> Cif {
    let mut params: Vec<Type> = Vec::with_capacity(sig.arity() + 1);
    if sig.ret.needs_indirect_return() {
        params.push(Type::pointer());
    }
    for param in &sig.params {
        params.push(ffi_type(param.tag, param.by_ref));
    }
    let ret = if sig.ret == Tag::Void || sig.ret.needs_indirect_return() {
        Type::void()
    } else {
        ffi_type(sig.ret, false)
    };
    Cif::new(params, ret)
}

/// Materialize a scalar call slot at its real type for the CIF.
fn scalar_arg(bump: &Bump, tag: Tag, word: u64) -> Arg {
    match tag {
        Tag::Bool | Tag::Char8 | Tag::U8 => Arg::new(bump.alloc(word as u8)),
        Tag::I8 => Arg::new(bump.alloc(word as u8 as i8)),
        Tag::Char16 | Tag::U16 => Arg::new(bump.alloc(word as u16)),
        Tag::I16 => Arg::new(bump.alloc(word as u16 as i16)),
        Tag::U32 => Arg::new(bump.alloc(word as u32)),
        Tag::I32 => Arg::new(bump.alloc(word as u32 as i32)),
        Tag::U64 => Arg::new(bump.alloc(word)),
        Tag::I64 => Arg::new(bump.alloc(word as i64)),
        Tag::Pointer => Arg::new(bump.alloc(word as usize)),
        Tag::F32 => Arg::new(bump.alloc(f32::from_bits(word as u32))),
        Tag::F64 => Arg::new(bump.alloc(f64::from_bits(word))),
        _ => Arg::new(bump.alloc(word as usize)),
    }
}

/// The fixed pool of word-shaped call forms, with and without a leading
/// context pointer. Slot counts above the pool bound cannot occur: arity
/// is capped at [`tether_core::host::MAX_CALL_ARITY`] plus the hidden
/// return slot.
pub(super) unsafe fn call_words(
    entry: usize,
    ctx: usize,
    words: &[u64],
) -> Result<u64, InteropError> {
    macro_rules! shapes {
        ($( $n:literal => [ $($idx:literal),* ] ),* $(,)?) => {
            match (ctx, words.len()) {
                $(
                    (0, $n) => {
                        type F = unsafe extern "C" fn($(shapes!(@word $idx),)*) -> u64;
                        let f: F = unsafe { std::mem::transmute(entry) };
                        unsafe { f($(words[$idx],)*) }
                    }
                    (_, $n) => {
                        type F =
                            unsafe extern "C" fn(*mut c_void, $(shapes!(@word $idx),)*) -> u64;
                        let f: F = unsafe { std::mem::transmute(entry) };
                        unsafe { f(ctx as *mut c_void, $(words[$idx],)*) }
                    }
                )*
                _ => {
                    return Err(InvokeError::ArityMismatch {
                        expected: 17,
                        got: words.len(),
                    }
                    .into());
                }
            }
        };
        (@word $idx:literal) => { u64 };
    }

    let word = shapes! {
        0 => [],
        1 => [0],
        2 => [0, 1],
        3 => [0, 1, 2],
        4 => [0, 1, 2, 3],
        5 => [0, 1, 2, 3, 4],
        6 => [0, 1, 2, 3, 4, 5],
        7 => [0, 1, 2, 3, 4, 5, 6],
        8 => [0, 1, 2, 3, 4, 5, 6, 7],
        9 => [0, 1, 2, 3, 4, 5, 6, 7, 8],
        10 => [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
        11 => [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
        12 => [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11],
        13 => [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
        14 => [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13],
        15 => [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14],
        16 => [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
        17 => [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16],
    };
    Ok(word)
}
