//! Managed value representation.
//!
//! One variant per boundary category, exact widths preserved. Integer and
//! float variants are never collapsed into wider storage: the codec's
//! round-trip guarantee (bit-exact scalars) depends on it.

use std::fmt;
use std::sync::Arc;

use crate::error::InteropError;
use crate::handle::Token;
use crate::sig::Signature;
use crate::tag::Tag;

/// A value on the managed side of the boundary.
#[derive(Clone, PartialEq)]
pub enum Value {
    /// Absent value. Encoding Null produces the target tag's zero
    /// representation.
    Null,
    Void,
    Bool(bool),
    Char8(u8),
    Char16(u16),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Pointer(usize),
    F32(f32),
    F64(f64),
    Str(String),
    Array(ArrayValue),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat4([f32; 16]),
    Function(Callable),
    /// Reference to an object in the heap.
    Object(Token),
}

impl Value {
    /// The tag this value encodes under, when it has exactly one.
    ///
    /// `Null` has none; `Object` travels as a pointer-sized token.
    pub fn tag(&self) -> Option<Tag> {
        Some(match self {
            Value::Null => return None,
            Value::Void => Tag::Void,
            Value::Bool(_) => Tag::Bool,
            Value::Char8(_) => Tag::Char8,
            Value::Char16(_) => Tag::Char16,
            Value::I8(_) => Tag::I8,
            Value::U8(_) => Tag::U8,
            Value::I16(_) => Tag::I16,
            Value::U16(_) => Tag::U16,
            Value::I32(_) => Tag::I32,
            Value::U32(_) => Tag::U32,
            Value::I64(_) => Tag::I64,
            Value::U64(_) => Tag::U64,
            Value::Pointer(_) => Tag::Pointer,
            Value::F32(_) => Tag::F32,
            Value::F64(_) => Tag::F64,
            Value::Str(_) => Tag::Str,
            Value::Array(a) => a.tag(),
            Value::Vec2(_) => Tag::Vec2,
            Value::Vec3(_) => Tag::Vec3,
            Value::Vec4(_) => Tag::Vec4,
            Value::Mat4(_) => Tag::Mat4,
            Value::Function(_) => Tag::Function,
            Value::Object(_) => Tag::Pointer,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self.tag() {
            Some(tag) => tag.name(),
            None => "null",
        }
    }

    /// The zero representation of a tag, used when a Null value is encoded.
    pub fn zero_of(tag: Tag) -> Value {
        match tag {
            Tag::Void => Value::Void,
            Tag::Bool => Value::Bool(false),
            Tag::Char8 => Value::Char8(0),
            Tag::Char16 => Value::Char16(0),
            Tag::I8 => Value::I8(0),
            Tag::U8 => Value::U8(0),
            Tag::I16 => Value::I16(0),
            Tag::U16 => Value::U16(0),
            Tag::I32 => Value::I32(0),
            Tag::U32 => Value::U32(0),
            Tag::I64 => Value::I64(0),
            Tag::U64 => Value::U64(0),
            Tag::Pointer => Value::Pointer(0),
            Tag::F32 => Value::F32(0.0),
            Tag::F64 => Value::F64(0.0),
            Tag::Vec2 => Value::Vec2([0.0; 2]),
            Tag::Vec3 => Value::Vec3([0.0; 3]),
            Tag::Vec4 => Value::Vec4([0.0; 4]),
            Tag::Mat4 => Value::Mat4([0.0; 16]),
            // Strings, arrays and functions zero to a null handle.
            _ => Value::Null,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Void => write!(f, "Void"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Char8(v) => write!(f, "Char8({v})"),
            Value::Char16(v) => write!(f, "Char16({v})"),
            Value::I8(v) => write!(f, "I8({v})"),
            Value::U8(v) => write!(f, "U8({v})"),
            Value::I16(v) => write!(f, "I16({v})"),
            Value::U16(v) => write!(f, "U16({v})"),
            Value::I32(v) => write!(f, "I32({v})"),
            Value::U32(v) => write!(f, "U32({v})"),
            Value::I64(v) => write!(f, "I64({v})"),
            Value::U64(v) => write!(f, "U64({v})"),
            Value::Pointer(v) => write!(f, "Pointer({v:#x})"),
            Value::F32(v) => write!(f, "F32({v})"),
            Value::F64(v) => write!(f, "F64({v})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Array(a) => write!(f, "Array({}, len {})", a.tag(), a.len()),
            Value::Vec2(v) => write!(f, "Vec2({v:?})"),
            Value::Vec3(v) => write!(f, "Vec3({v:?})"),
            Value::Vec4(v) => write!(f, "Vec4({v:?})"),
            Value::Mat4(_) => write!(f, "Mat4(..)"),
            Value::Function(c) => write!(f, "Function({:#x})", c.id()),
            Value::Object(t) => write!(f, "Object({t:?})"),
        }
    }
}

/// Typed storage for homogeneous array values.
///
/// Keeping the element representation exact (rather than `Vec<Value>`) is
/// what lets the codec copy container contents with a single buffer pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
    Bool(Vec<bool>),
    Char8(Vec<u8>),
    Char16(Vec<u16>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    Pointer(Vec<usize>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Str(Vec<String>),
}

impl ArrayValue {
    /// The array tag of this storage.
    pub fn tag(&self) -> Tag {
        match self {
            ArrayValue::Bool(_) => Tag::BoolArray,
            ArrayValue::Char8(_) => Tag::Char8Array,
            ArrayValue::Char16(_) => Tag::Char16Array,
            ArrayValue::I8(_) => Tag::I8Array,
            ArrayValue::U8(_) => Tag::U8Array,
            ArrayValue::I16(_) => Tag::I16Array,
            ArrayValue::U16(_) => Tag::U16Array,
            ArrayValue::I32(_) => Tag::I32Array,
            ArrayValue::U32(_) => Tag::U32Array,
            ArrayValue::I64(_) => Tag::I64Array,
            ArrayValue::U64(_) => Tag::U64Array,
            ArrayValue::Pointer(_) => Tag::PointerArray,
            ArrayValue::F32(_) => Tag::F32Array,
            ArrayValue::F64(_) => Tag::F64Array,
            ArrayValue::Str(_) => Tag::StrArray,
        }
    }

    pub fn element_tag(&self) -> Tag {
        self.tag().element().unwrap_or(Tag::Void)
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayValue::Bool(v) => v.len(),
            ArrayValue::Char8(v) => v.len(),
            ArrayValue::Char16(v) => v.len(),
            ArrayValue::I8(v) => v.len(),
            ArrayValue::U8(v) => v.len(),
            ArrayValue::I16(v) => v.len(),
            ArrayValue::U16(v) => v.len(),
            ArrayValue::I32(v) => v.len(),
            ArrayValue::U32(v) => v.len(),
            ArrayValue::I64(v) => v.len(),
            ArrayValue::U64(v) => v.len(),
            ArrayValue::Pointer(v) => v.len(),
            ArrayValue::F32(v) => v.len(),
            ArrayValue::F64(v) => v.len(),
            ArrayValue::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Raw parts of a function value's wire form: the entry pointer and the
/// opaque context passed alongside it. A null context marks a plain native
/// function; a non-null context marks a reverse-shim entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawParts {
    pub entry: usize,
    pub ctx: usize,
}

type CallFn = dyn Fn(&mut [Value]) -> Result<Value, InteropError> + Send + Sync;

/// A managed callable.
///
/// Wraps either a native function pointer (decoded from the boundary, with a
/// lazily built forward adapter behind `invoke`) or a managed function being
/// exposed to native code. The inner callable is `Arc`-shared so cached
/// adapters survive cloning.
#[derive(Clone)]
pub struct Callable {
    id: u64,
    sig: Signature,
    raw: Option<RawParts>,
    inner: Arc<CallFn>,
}

impl Callable {
    pub fn new<F>(id: u64, sig: Signature, f: F) -> Self
    where
        F: Fn(&mut [Value]) -> Result<Value, InteropError> + Send + Sync + 'static,
    {
        Self {
            id,
            sig,
            raw: None,
            inner: Arc::new(f),
        }
    }

    /// Callable wrapping an already-raw target, so re-encoding it does not
    /// build a second adapter.
    pub fn with_raw<F>(id: u64, sig: Signature, raw: RawParts, f: F) -> Self
    where
        F: Fn(&mut [Value]) -> Result<Value, InteropError> + Send + Sync + 'static,
    {
        Self {
            id,
            sig,
            raw: Some(raw),
            inner: Arc::new(f),
        }
    }

    /// Stable identity of the target. Adapter caches key on this.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signature(&self) -> &Signature {
        &self.sig
    }

    pub fn raw_parts(&self) -> Option<RawParts> {
        self.raw
    }

    /// Invoke the target. Slots are mutable so by-reference parameters can
    /// be pulled back into them.
    pub fn invoke(&self, args: &mut [Value]) -> Result<Value, InteropError> {
        (self.inner)(args)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("id", &self.id)
            .field("arity", &self.sig.arity())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_variants() {
        assert_eq!(Value::I32(0).tag(), Some(Tag::I32));
        assert_eq!(Value::F64(0.0).tag(), Some(Tag::F64));
        assert_eq!(Value::Str(String::new()).tag(), Some(Tag::Str));
        assert_eq!(
            Value::Array(ArrayValue::U16(vec![1, 2])).tag(),
            Some(Tag::U16Array)
        );
        assert_eq!(Value::Null.tag(), None);
    }

    #[test]
    fn zero_values() {
        assert_eq!(Value::zero_of(Tag::I64), Value::I64(0));
        assert_eq!(Value::zero_of(Tag::Bool), Value::Bool(false));
        assert_eq!(Value::zero_of(Tag::Vec3), Value::Vec3([0.0; 3]));
        assert!(Value::zero_of(Tag::Str).is_null());
    }

    #[test]
    fn callable_identity_equality() {
        let a = Callable::new(7, Signature::of(&[], Tag::Void), |_| Ok(Value::Void));
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(a.id(), 7);
    }

    #[test]
    fn array_len() {
        let a = ArrayValue::Str(vec!["x".into(), "y".into()]);
        assert_eq!(a.len(), 2);
        assert_eq!(a.element_tag(), Tag::Str);
        assert!(!a.is_empty());
    }
}
