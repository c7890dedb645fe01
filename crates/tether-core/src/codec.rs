//! The value-marshaling codec.
//!
//! Converts every supported value category between its native fixed-ABI
//! representation and the managed [`Value`] form. The per-tag logic is a
//! dispatch table built as data: [`Codec::new`] constructs one bundle per
//! tag with an exhaustive match, so an unhandled tag is a gap the compiler
//! reports at that one site, never a runtime fallthrough.
//!
//! Ownership rule: encode allocates host cells (strings, containers,
//! callable descriptors) and hands them to the caller as [`OwnedNative`]
//! records; whoever holds the record must release it exactly once. The
//! codec never frees anything it did not itself just allocate.

use std::ffi::c_void;
use std::sync::Arc;

use crate::error::MarshalError;
use crate::host::{HostBindings, MAX_CALL_ARITY, RawCallable};
use crate::reflect::TypeTable;
use crate::sig::{Param, Signature};
use crate::tag::{TAG_COUNT, Tag};
use crate::value::{ArrayValue, Callable, RawParts, Value};

/// Shared marshaling context threaded through call frames.
#[derive(Clone, Copy)]
pub struct MarshalCtx<'a> {
    pub codec: &'a Codec,
    pub bindings: &'a HostBindings,
    pub types: &'a TypeTable,
}

/// Bridge between the codec and the trampoline layer.
///
/// Function values decode into managed callables whose invocation goes
/// through a forward adapter, and encode into shim entries native code can
/// call; both live above this crate, so the codec reaches them through
/// this seam (the engine installs the implementation at construction).
pub trait CallableBridge: Send + Sync {
    /// Wrap a native function descriptor in a managed callable.
    fn wrap(&self, raw: &RawCallable, sig: Signature) -> Result<Callable, MarshalError>;

    /// Expose a managed callable as an entry/context pair.
    fn expose(&self, callable: &Callable) -> Result<RawParts, MarshalError>;
}

/// A native allocation made by `encode`, to be released exactly once.
#[derive(Debug)]
pub enum OwnedNative {
    Str(*mut c_void),
    /// Container handle plus its element tag.
    Container(Tag, *mut c_void),
    Callable(*mut RawCallable),
}

type DecodeFn = fn(&Codec, &HostBindings, Tag, *const u8) -> Result<Value, MarshalError>;
type EncodeFn =
    fn(&Codec, &HostBindings, Tag, &Value, *mut u8) -> Result<Option<OwnedNative>, MarshalError>;

struct TagBundle {
    decode: DecodeFn,
    encode: EncodeFn,
}

/// The per-tag marshaling table.
pub struct Codec {
    bundles: [TagBundle; TAG_COUNT],
    bridge: Arc<dyn CallableBridge>,
}

impl Codec {
    pub fn new(bridge: Arc<dyn CallableBridge>) -> Self {
        let bundles = std::array::from_fn(|raw| {
            let tag = Tag::try_from(raw as u32).expect("bundle table covers every tag");
            bundle_for(tag)
        });
        Self { bundles, bridge }
    }

    /// A codec with no trampoline layer attached; function tags fail.
    pub fn detached() -> Self {
        struct Detached;
        impl CallableBridge for Detached {
            fn wrap(&self, _: &RawCallable, _: Signature) -> Result<Callable, MarshalError> {
                Err(MarshalError::HostBindingMissing("callable bridge"))
            }
            fn expose(&self, _: &Callable) -> Result<RawParts, MarshalError> {
                Err(MarshalError::HostBindingMissing("callable bridge"))
            }
        }
        Self::new(Arc::new(Detached))
    }

    /// Decode the value at `addr` as `tag`.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn decode(
        &self,
        bindings: &HostBindings,
        addr: *const u8,
        tag: Tag,
    ) -> Result<Value, MarshalError> {
        if tag == Tag::Void {
            return Ok(Value::Void);
        }
        if addr.is_null() {
            return Err(MarshalError::NullAddress(tag));
        }
        (self.bundles[u32::from(tag) as usize].decode)(self, bindings, tag, addr)
    }

    /// Encode `value` as `tag` at `out`. A Null value produces the tag's
    /// zero representation. Returns any allocation ownership passes with.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn encode(
        &self,
        bindings: &HostBindings,
        value: &Value,
        tag: Tag,
        out: *mut u8,
    ) -> Result<Option<OwnedNative>, MarshalError> {
        if tag == Tag::Void {
            return Ok(None);
        }
        if out.is_null() {
            return Err(MarshalError::NullAddress(tag));
        }
        (self.bundles[u32::from(tag) as usize].encode)(self, bindings, tag, value, out)
    }

    /// Write a value back through an address that may already hold a live
    /// cell, as the by-ref pull-back path does: existing string and
    /// container cells are assigned in place so the native side keeps its
    /// handle identity; scalars and packed structs are overwritten.
    pub fn write_back(
        &self,
        bindings: &HostBindings,
        value: &Value,
        tag: Tag,
        addr: *mut u8,
    ) -> Result<Option<OwnedNative>, MarshalError> {
        if tag == Tag::Void {
            return Ok(None);
        }
        if addr.is_null() {
            return Err(MarshalError::NullAddress(tag));
        }
        match tag {
            Tag::Str => {
                let existing = unsafe { read_word(addr) } as *mut c_void;
                if existing.is_null() {
                    return self.encode(bindings, value, tag, addr);
                }
                let text = match value {
                    Value::Str(s) => s.as_str(),
                    Value::Null => "",
                    other => return Err(mismatch(tag, other)),
                };
                let assign = bindings.string_assign()?;
                unsafe { assign(existing, text.as_ptr(), text.len()) };
                Ok(None)
            }
            t if t.is_array() => {
                let existing = unsafe { read_word(addr) } as *mut c_void;
                if existing.is_null() {
                    return self.encode(bindings, value, tag, addr);
                }
                let elem = t.element().unwrap_or(Tag::Void);
                let assign = bindings.container_assign()?;
                match value {
                    Value::Array(array) if array.tag() == tag => {
                        let packed = pack_elements(bindings, array)?;
                        unsafe { assign(elem.into(), existing, packed.as_ptr(), array.len()) };
                        Ok(None)
                    }
                    Value::Null => {
                        unsafe { assign(elem.into(), existing, std::ptr::null(), 0) };
                        Ok(None)
                    }
                    other => Err(mismatch(tag, other)),
                }
            }
            _ => self.encode(bindings, value, tag, addr),
        }
    }

    /// Release an allocation produced by `encode`. Each record must be
    /// released exactly once.
    pub fn release(&self, bindings: &HostBindings, owned: OwnedNative) {
        match owned {
            OwnedNative::Str(handle) => {
                if let Ok(destroy) = bindings.string_destroy() {
                    unsafe { destroy(handle) };
                }
            }
            OwnedNative::Container(elem, handle) => {
                if let Ok(destroy) = bindings.container_destroy() {
                    unsafe { destroy(elem.into(), handle) };
                }
            }
            OwnedNative::Callable(cell) => {
                if !cell.is_null() {
                    drop(unsafe { Box::from_raw(cell) });
                }
            }
        }
    }

    /// Release the handle-bearing cell a field or return slot points at,
    /// zeroing the slot. Used when an object is destroyed or a returned
    /// cell has been decoded and is no longer needed.
    pub fn release_cell(&self, bindings: &HostBindings, tag: Tag, addr: *mut u8) {
        if addr.is_null() {
            return;
        }
        let handle = unsafe { read_word(addr) };
        if handle == 0 {
            return;
        }
        match tag {
            Tag::Str => self.release(bindings, OwnedNative::Str(handle as *mut c_void)),
            Tag::Function => {
                self.release(bindings, OwnedNative::Callable(handle as *mut RawCallable))
            }
            t => {
                if let Some(elem) = t.element() {
                    self.release(bindings, OwnedNative::Container(elem, handle as *mut c_void));
                } else {
                    return;
                }
            }
        }
        unsafe { write_word(addr, 0) };
    }

    pub fn bridge(&self) -> &Arc<dyn CallableBridge> {
        &self.bridge
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec").finish_non_exhaustive()
    }
}

// --- raw memory helpers -----------------------------------------------------

unsafe fn read_word(addr: *const u8) -> usize {
    unsafe { std::ptr::read_unaligned(addr as *const usize) }
}

unsafe fn write_word(addr: *mut u8, word: usize) {
    unsafe { std::ptr::write_unaligned(addr as *mut usize, word) }
}

fn mismatch(expected: Tag, got: &Value) -> MarshalError {
    MarshalError::TypeMismatch {
        expected,
        got: got.type_name(),
    }
}

// --- bundle construction ----------------------------------------------------

macro_rules! scalar_bundle {
    ($variant:ident, $ty:ty) => {
        TagBundle {
            decode: |_, _, _, addr| {
                let raw = unsafe { std::ptr::read_unaligned(addr as *const $ty) };
                Ok(Value::$variant(raw))
            },
            encode: |_, _, tag, value, out| {
                let raw: $ty = match value {
                    Value::$variant(v) => *v,
                    Value::Null => <$ty>::default(),
                    other => return Err(mismatch(tag, other)),
                };
                unsafe { std::ptr::write_unaligned(out as *mut $ty, raw) };
                Ok(None)
            },
        }
    };
}

macro_rules! packed_bundle {
    ($variant:ident, $n:expr) => {
        TagBundle {
            decode: |_, _, _, addr| {
                let mut raw = [0f32; $n];
                unsafe {
                    std::ptr::copy_nonoverlapping(addr, raw.as_mut_ptr() as *mut u8, $n * 4)
                };
                Ok(Value::$variant(raw))
            },
            encode: |_, _, tag, value, out| {
                let raw: [f32; $n] = match value {
                    Value::$variant(v) => *v,
                    Value::Null => [0f32; $n],
                    other => return Err(mismatch(tag, other)),
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(raw.as_ptr() as *const u8, out, $n * 4)
                };
                Ok(None)
            },
        }
    };
}

fn array_bundle() -> TagBundle {
    TagBundle {
        decode: |_, bindings, tag, addr| {
            let elem = tag
                .element()
                .ok_or(MarshalError::UnsupportedTag(tag.into()))?;
            let handle = unsafe { read_word(addr) } as *const c_void;
            if handle.is_null() {
                return Ok(Value::Null);
            }
            let length = bindings.container_length()?;
            let read = bindings.container_read()?;
            let len = unsafe { length(elem.into(), handle) };
            let mut bytes = vec![0u8; len * elem.native_size()];
            let copied = unsafe { read(elem.into(), handle, bytes.as_mut_ptr(), bytes.len()) };
            bytes.truncate(copied);
            Ok(Value::Array(unpack_elements(bindings, elem, &bytes)?))
        },
        encode: |_, bindings, tag, value, out| {
            let elem = tag
                .element()
                .ok_or(MarshalError::UnsupportedTag(tag.into()))?;
            let array = match value {
                Value::Array(a) if a.tag() == tag => a,
                Value::Null => {
                    unsafe { write_word(out, 0) };
                    return Ok(None);
                }
                other => return Err(mismatch(tag, other)),
            };
            let construct = bindings.container_construct()?;
            let assign = bindings.container_assign()?;
            let packed = pack_elements(bindings, array)?;
            let handle = unsafe { construct(elem.into(), array.len()) };
            unsafe { assign(elem.into(), handle, packed.as_ptr(), array.len()) };
            unsafe { write_word(out, handle as usize) };
            Ok(Some(OwnedNative::Container(elem, handle)))
        },
    }
}

fn bundle_for(tag: Tag) -> TagBundle {
    match tag {
        Tag::Void => TagBundle {
            decode: |_, _, _, _| Ok(Value::Void),
            encode: |_, _, _, _, _| Ok(None),
        },
        Tag::Bool => TagBundle {
            decode: |_, _, _, addr| {
                let raw = unsafe { std::ptr::read_unaligned(addr) };
                Ok(Value::Bool(raw != 0))
            },
            encode: |_, _, tag, value, out| {
                let raw: u8 = match value {
                    Value::Bool(v) => u8::from(*v),
                    Value::Null => 0,
                    other => return Err(mismatch(tag, other)),
                };
                unsafe { std::ptr::write_unaligned(out, raw) };
                Ok(None)
            },
        },
        Tag::Char8 => scalar_bundle!(Char8, u8),
        Tag::Char16 => scalar_bundle!(Char16, u16),
        Tag::I8 => scalar_bundle!(I8, i8),
        Tag::U8 => scalar_bundle!(U8, u8),
        Tag::I16 => scalar_bundle!(I16, i16),
        Tag::U16 => scalar_bundle!(U16, u16),
        Tag::I32 => scalar_bundle!(I32, i32),
        Tag::U32 => scalar_bundle!(U32, u32),
        Tag::I64 => scalar_bundle!(I64, i64),
        Tag::U64 => scalar_bundle!(U64, u64),
        Tag::Pointer => TagBundle {
            decode: |_, _, _, addr| Ok(Value::Pointer(unsafe { read_word(addr) })),
            encode: |_, _, tag, value, out| {
                let raw: usize = match value {
                    Value::Pointer(v) => *v,
                    Value::Object(token) => token.raw() as usize,
                    Value::Null => 0,
                    other => return Err(mismatch(tag, other)),
                };
                unsafe { write_word(out, raw) };
                Ok(None)
            },
        },
        Tag::F32 => scalar_bundle!(F32, f32),
        Tag::F64 => scalar_bundle!(F64, f64),
        Tag::Function => TagBundle {
            decode: |codec, _, _, addr| {
                let cell = unsafe { read_word(addr) } as *const RawCallable;
                if cell.is_null() {
                    return Ok(Value::Null);
                }
                let raw = unsafe { std::ptr::read_unaligned(cell) };
                let sig = signature_from_raw(&raw)?;
                Ok(Value::Function(codec.bridge.wrap(&raw, sig)?))
            },
            encode: |codec, _, tag, value, out| {
                let callable = match value {
                    Value::Function(c) => c,
                    Value::Null => {
                        unsafe { write_word(out, 0) };
                        return Ok(None);
                    }
                    other => return Err(mismatch(tag, other)),
                };
                let parts = match callable.raw_parts() {
                    Some(parts) => parts,
                    None => codec.bridge.expose(callable)?,
                };
                let cell = Box::into_raw(Box::new(raw_from_signature(
                    callable.signature(),
                    parts,
                )?));
                unsafe { write_word(out, cell as usize) };
                Ok(Some(OwnedNative::Callable(cell)))
            },
        },
        Tag::Str => TagBundle {
            decode: |_, bindings, _, addr| {
                let handle = unsafe { read_word(addr) } as *const c_void;
                if handle.is_null() {
                    return Ok(Value::Null);
                }
                Ok(Value::Str(read_host_string(bindings, handle)?))
            },
            encode: |_, bindings, tag, value, out| {
                let text = match value {
                    Value::Str(s) => s.as_str(),
                    Value::Null => {
                        unsafe { write_word(out, 0) };
                        return Ok(None);
                    }
                    other => return Err(mismatch(tag, other)),
                };
                let construct = bindings.string_construct()?;
                let handle = unsafe { construct(text.as_ptr(), text.len()) };
                unsafe { write_word(out, handle as usize) };
                Ok(Some(OwnedNative::Str(handle)))
            },
        },
        Tag::Vec2 => packed_bundle!(Vec2, 2),
        Tag::Vec3 => packed_bundle!(Vec3, 3),
        Tag::Vec4 => packed_bundle!(Vec4, 4),
        Tag::Mat4 => packed_bundle!(Mat4, 16),
        Tag::BoolArray
        | Tag::Char8Array
        | Tag::Char16Array
        | Tag::I8Array
        | Tag::U8Array
        | Tag::I16Array
        | Tag::U16Array
        | Tag::I32Array
        | Tag::U32Array
        | Tag::I64Array
        | Tag::U64Array
        | Tag::PointerArray
        | Tag::F32Array
        | Tag::F64Array
        | Tag::StrArray => array_bundle(),
    }
}

// --- host string and container helpers -------------------------------------

fn read_host_string(
    bindings: &HostBindings,
    handle: *const c_void,
) -> Result<String, MarshalError> {
    let length = bindings.string_length()?;
    let read = bindings.string_read()?;
    let len = unsafe { length(handle) };
    let mut buf = vec![0u8; len];
    let copied = unsafe { read(handle, buf.as_mut_ptr(), buf.len()) };
    buf.truncate(copied);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Pack an array's elements at their native widths. String elements are
/// constructed as fresh host handles owned by the receiving container.
fn pack_elements(bindings: &HostBindings, array: &ArrayValue) -> Result<Vec<u8>, MarshalError> {
    macro_rules! pack {
        ($items:expr, $ty:ty) => {{
            let mut bytes = Vec::with_capacity($items.len() * size_of::<$ty>());
            for item in $items {
                bytes.extend_from_slice(&item.to_ne_bytes());
            }
            bytes
        }};
    }
    Ok(match array {
        ArrayValue::Bool(items) => items.iter().map(|&b| u8::from(b)).collect(),
        ArrayValue::Char8(items) | ArrayValue::U8(items) => items.clone(),
        ArrayValue::I8(items) => items.iter().map(|&v| v as u8).collect(),
        ArrayValue::Char16(items) | ArrayValue::U16(items) => pack!(items, u16),
        ArrayValue::I16(items) => pack!(items, i16),
        ArrayValue::I32(items) => pack!(items, i32),
        ArrayValue::U32(items) => pack!(items, u32),
        ArrayValue::I64(items) => pack!(items, i64),
        ArrayValue::U64(items) => pack!(items, u64),
        ArrayValue::Pointer(items) => pack!(items, usize),
        ArrayValue::F32(items) => {
            let mut bytes = Vec::with_capacity(items.len() * 4);
            for item in items {
                bytes.extend_from_slice(&item.to_bits().to_ne_bytes());
            }
            bytes
        }
        ArrayValue::F64(items) => {
            let mut bytes = Vec::with_capacity(items.len() * 8);
            for item in items {
                bytes.extend_from_slice(&item.to_bits().to_ne_bytes());
            }
            bytes
        }
        ArrayValue::Str(items) => {
            let construct = bindings.string_construct()?;
            let mut bytes = Vec::with_capacity(items.len() * size_of::<usize>());
            for item in items {
                let handle = unsafe { construct(item.as_ptr(), item.len()) };
                bytes.extend_from_slice(&(handle as usize).to_ne_bytes());
            }
            bytes
        }
    })
}

fn unpack_elements(
    bindings: &HostBindings,
    elem: Tag,
    bytes: &[u8],
) -> Result<ArrayValue, MarshalError> {
    macro_rules! unpack {
        ($variant:ident, $ty:ty) => {{
            let items = bytes
                .chunks_exact(size_of::<$ty>())
                .map(|chunk| <$ty>::from_ne_bytes(chunk.try_into().unwrap_or_default()))
                .collect();
            ArrayValue::$variant(items)
        }};
    }
    Ok(match elem {
        Tag::Bool => ArrayValue::Bool(bytes.iter().map(|&b| b != 0).collect()),
        Tag::Char8 => ArrayValue::Char8(bytes.to_vec()),
        Tag::U8 => ArrayValue::U8(bytes.to_vec()),
        Tag::I8 => ArrayValue::I8(bytes.iter().map(|&b| b as i8).collect()),
        Tag::Char16 => unpack!(Char16, u16),
        Tag::I16 => unpack!(I16, i16),
        Tag::U16 => unpack!(U16, u16),
        Tag::I32 => unpack!(I32, i32),
        Tag::U32 => unpack!(U32, u32),
        Tag::I64 => unpack!(I64, i64),
        Tag::U64 => unpack!(U64, u64),
        Tag::Pointer => unpack!(Pointer, usize),
        Tag::F32 => ArrayValue::F32(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_bits(u32::from_ne_bytes(c.try_into().unwrap_or_default())))
                .collect(),
        ),
        Tag::F64 => ArrayValue::F64(
            bytes
                .chunks_exact(8)
                .map(|c| f64::from_bits(u64::from_ne_bytes(c.try_into().unwrap_or_default())))
                .collect(),
        ),
        Tag::Str => {
            let mut items = Vec::new();
            for chunk in bytes.chunks_exact(size_of::<usize>()) {
                let raw = usize::from_ne_bytes(chunk.try_into().unwrap_or_default());
                if raw == 0 {
                    items.push(String::new());
                } else {
                    items.push(read_host_string(bindings, raw as *const c_void)?);
                }
            }
            ArrayValue::Str(items)
        }
        other => return Err(MarshalError::UnsupportedTag(other.into())),
    })
}

// --- callable descriptor helpers -------------------------------------------

/// Recover a signature from a wire descriptor.
pub fn signature_from_raw(raw: &RawCallable) -> Result<Signature, MarshalError> {
    let argc = raw.argc as usize;
    if argc > MAX_CALL_ARITY {
        return Err(MarshalError::UnsupportedTag(raw.argc));
    }
    let mut params = Vec::with_capacity(argc);
    for (i, &raw_tag) in raw.param_tags[..argc].iter().enumerate() {
        let tag = Tag::try_from(raw_tag).map_err(|_| MarshalError::UnsupportedTag(raw_tag))?;
        params.push(Param {
            tag,
            by_ref: raw.byref_mask & (1 << i) != 0,
        });
    }
    let ret = Tag::try_from(raw.ret).map_err(|_| MarshalError::UnsupportedTag(raw.ret))?;
    Ok(Signature::new(params, ret))
}

/// Build a wire descriptor from a signature and raw parts.
pub fn raw_from_signature(sig: &Signature, parts: RawParts) -> Result<RawCallable, MarshalError> {
    if sig.arity() > MAX_CALL_ARITY {
        return Err(MarshalError::UnsupportedTag(sig.arity() as u32));
    }
    let mut param_tags = [u32::from(Tag::Void); MAX_CALL_ARITY];
    let mut byref_mask = 0u32;
    for (i, param) in sig.params.iter().enumerate() {
        param_tags[i] = param.tag.into();
        if param.by_ref {
            byref_mask |= 1 << i;
        }
    }
    Ok(RawCallable {
        entry: parts.entry as *const c_void,
        ctx: parts.ctx as *mut c_void,
        ret: sig.ret.into(),
        argc: sig.arity() as u32,
        byref_mask,
        param_tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::reference_host;

    fn setup() -> (Codec, HostBindings) {
        (Codec::detached(), reference_host::install())
    }

    #[test]
    fn scalar_bits_survive_round_trip() {
        let (codec, bindings) = setup();
        let cases = [
            (Value::Bool(true), Tag::Bool),
            (Value::Char16(0xfffe), Tag::Char16),
            (Value::I8(-128), Tag::I8),
            (Value::U16(65535), Tag::U16),
            (Value::I32(i32::MIN), Tag::I32),
            (Value::U64(u64::MAX), Tag::U64),
            (Value::Pointer(0xdead_beef), Tag::Pointer),
        ];
        let mut slot = [0u8; 8];
        for (value, tag) in cases {
            codec
                .encode(&bindings, &value, tag, slot.as_mut_ptr())
                .unwrap();
            let back = codec.decode(&bindings, slot.as_ptr(), tag).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn float_bit_patterns_are_preserved() {
        let (codec, bindings) = setup();
        let mut slot = [0u8; 8];
        // A signalling NaN payload must survive untouched.
        let weird = f32::from_bits(0x7fa0_0001);
        codec
            .encode(&bindings, &Value::F32(weird), Tag::F32, slot.as_mut_ptr())
            .unwrap();
        let back = codec.decode(&bindings, slot.as_ptr(), Tag::F32).unwrap();
        match back {
            Value::F32(v) => assert_eq!(v.to_bits(), 0x7fa0_0001),
            other => panic!("expected F32, got {other:?}"),
        }

        let weird64 = f64::from_bits(0x7ff4_0000_0000_0001);
        codec
            .encode(&bindings, &Value::F64(weird64), Tag::F64, slot.as_mut_ptr())
            .unwrap();
        let back = codec.decode(&bindings, slot.as_ptr(), Tag::F64).unwrap();
        match back {
            Value::F64(v) => assert_eq!(v.to_bits(), 0x7ff4_0000_0000_0001),
            other => panic!("expected F64, got {other:?}"),
        }
    }

    #[test]
    fn string_round_trip_releases_cell() {
        let _guard = reference_host::cell_guard();
        let (codec, bindings) = setup();
        let before = reference_host::live_strings();
        let mut slot = [0u8; 8];
        let owned = codec
            .encode(
                &bindings,
                &Value::Str("boundary".into()),
                Tag::Str,
                slot.as_mut_ptr(),
            )
            .unwrap()
            .expect("string encode allocates");
        assert_eq!(reference_host::live_strings(), before + 1);
        let back = codec.decode(&bindings, slot.as_ptr(), Tag::Str).unwrap();
        assert_eq!(back, Value::Str("boundary".into()));
        codec.release(&bindings, owned);
        assert_eq!(reference_host::live_strings(), before);
    }

    #[test]
    fn array_round_trips_at_boundary_lengths() {
        let (codec, bindings) = setup();
        for len in [0usize, 1, 1024, 1500] {
            let items: Vec<i32> = (0..len as i32).map(|i| i * 3 - 7).collect();
            let value = Value::Array(ArrayValue::I32(items));
            let mut slot = [0u8; 8];
            let owned = codec
                .encode(&bindings, &value, Tag::I32Array, slot.as_mut_ptr())
                .unwrap()
                .expect("array encode allocates");
            let back = codec
                .decode(&bindings, slot.as_ptr(), Tag::I32Array)
                .unwrap();
            assert_eq!(back, value, "length {len}");
            codec.release(&bindings, owned);
        }
    }

    #[test]
    fn string_array_round_trip() {
        let _guard = reference_host::cell_guard();
        let (codec, bindings) = setup();
        let before = reference_host::live_strings();
        let value = Value::Array(ArrayValue::Str(vec![
            "".into(),
            "one".into(),
            "two".into(),
        ]));
        let mut slot = [0u8; 8];
        let owned = codec
            .encode(&bindings, &value, Tag::StrArray, slot.as_mut_ptr())
            .unwrap()
            .expect("array encode allocates");
        let back = codec
            .decode(&bindings, slot.as_ptr(), Tag::StrArray)
            .unwrap();
        assert_eq!(back, value);
        codec.release(&bindings, owned);
        // Element handles are owned by the container and die with it.
        assert_eq!(reference_host::live_strings(), before);
    }

    #[test]
    fn null_encodes_to_zero_representation() {
        let (codec, bindings) = setup();
        let mut slot = [0xffu8; 8];
        codec
            .encode(&bindings, &Value::Null, Tag::I64, slot.as_mut_ptr())
            .unwrap();
        assert_eq!(
            codec.decode(&bindings, slot.as_ptr(), Tag::I64).unwrap(),
            Value::I64(0)
        );

        let mut slot = [0xffu8; 8];
        codec
            .encode(&bindings, &Value::Null, Tag::Str, slot.as_mut_ptr())
            .unwrap();
        assert!(
            codec
                .decode(&bindings, slot.as_ptr(), Tag::Str)
                .unwrap()
                .is_null()
        );
    }

    #[test]
    fn mismatch_is_explicit() {
        let (codec, bindings) = setup();
        let mut slot = [0u8; 8];
        let err = codec
            .encode(
                &bindings,
                &Value::Str("nope".into()),
                Tag::I32,
                slot.as_mut_ptr(),
            )
            .unwrap_err();
        assert!(matches!(err, MarshalError::TypeMismatch { .. }));
    }

    #[test]
    fn vector_and_matrix_round_trip() {
        let (codec, bindings) = setup();
        let mut slot = [0u8; 64];
        let v = Value::Vec3([1.5, -2.25, 1e-20]);
        codec
            .encode(&bindings, &v, Tag::Vec3, slot.as_mut_ptr())
            .unwrap();
        assert_eq!(codec.decode(&bindings, slot.as_ptr(), Tag::Vec3).unwrap(), v);

        let mut m = [0f32; 16];
        for (i, cell) in m.iter_mut().enumerate() {
            *cell = i as f32 * 0.5;
        }
        let v = Value::Mat4(m);
        codec
            .encode(&bindings, &v, Tag::Mat4, slot.as_mut_ptr())
            .unwrap();
        assert_eq!(codec.decode(&bindings, slot.as_ptr(), Tag::Mat4).unwrap(), v);
    }

    #[test]
    fn write_back_assigns_existing_string_cell() {
        let _guard = reference_host::cell_guard();
        let (codec, bindings) = setup();
        let mut slot = [0u8; 8];
        let owned = codec
            .encode(
                &bindings,
                &Value::Str("before".into()),
                Tag::Str,
                slot.as_mut_ptr(),
            )
            .unwrap()
            .expect("string encode allocates");
        let cell = usize::from_ne_bytes(slot);

        codec
            .write_back(
                &bindings,
                &Value::Str("after".into()),
                Tag::Str,
                slot.as_mut_ptr(),
            )
            .unwrap();
        // Same cell, new contents.
        assert_eq!(usize::from_ne_bytes(slot), cell);
        assert_eq!(
            codec.decode(&bindings, slot.as_ptr(), Tag::Str).unwrap(),
            Value::Str("after".into())
        );
        codec.release(&bindings, owned);
    }

    #[test]
    fn signature_wire_round_trip() {
        let sig = Signature::new(
            vec![Param::new(Tag::I32), Param::by_ref(Tag::Str)],
            Tag::F64,
        );
        let raw = raw_from_signature(&sig, RawParts { entry: 1, ctx: 0 }).unwrap();
        let back = signature_from_raw(&raw).unwrap();
        assert_eq!(back, sig);
    }
}
