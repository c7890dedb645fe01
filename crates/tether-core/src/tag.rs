//! The closed enumeration of boundary value categories.
//!
//! Every value that crosses the host boundary is identified by exactly one
//! [`Tag`]. Enum-typed values are tagged by their underlying integer width,
//! never by their declared identity. Raw integers arriving from the host are
//! converted with `Tag::try_from`, so an unknown category fails explicitly
//! instead of truncating.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Category of a boundary value.
///
/// The discriminants are part of the boundary ABI and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Tag {
    Void = 0,
    Bool = 1,
    Char8 = 2,
    Char16 = 3,
    I8 = 4,
    U8 = 5,
    I16 = 6,
    U16 = 7,
    I32 = 8,
    U32 = 9,
    I64 = 10,
    U64 = 11,
    Pointer = 12,
    F32 = 13,
    F64 = 14,
    Function = 15,
    Str = 16,
    BoolArray = 17,
    Char8Array = 18,
    Char16Array = 19,
    I8Array = 20,
    U8Array = 21,
    I16Array = 22,
    U16Array = 23,
    I32Array = 24,
    U32Array = 25,
    I64Array = 26,
    U64Array = 27,
    PointerArray = 28,
    F32Array = 29,
    F64Array = 30,
    StrArray = 31,
    Vec2 = 32,
    Vec3 = 33,
    Vec4 = 34,
    Mat4 = 35,
}

/// Number of tags. Codec bundle tables are sized by this.
pub const TAG_COUNT: usize = 36;

impl Tag {
    /// Every tag, in discriminant order.
    pub const ALL: [Tag; TAG_COUNT] = [
        Tag::Void,
        Tag::Bool,
        Tag::Char8,
        Tag::Char16,
        Tag::I8,
        Tag::U8,
        Tag::I16,
        Tag::U16,
        Tag::I32,
        Tag::U32,
        Tag::I64,
        Tag::U64,
        Tag::Pointer,
        Tag::F32,
        Tag::F64,
        Tag::Function,
        Tag::Str,
        Tag::BoolArray,
        Tag::Char8Array,
        Tag::Char16Array,
        Tag::I8Array,
        Tag::U8Array,
        Tag::I16Array,
        Tag::U16Array,
        Tag::I32Array,
        Tag::U32Array,
        Tag::I64Array,
        Tag::U64Array,
        Tag::PointerArray,
        Tag::F32Array,
        Tag::F64Array,
        Tag::StrArray,
        Tag::Vec2,
        Tag::Vec3,
        Tag::Vec4,
        Tag::Mat4,
    ];

    /// Scalar tags reinterpret directly between a raw address and a value.
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            Tag::Bool
                | Tag::Char8
                | Tag::Char16
                | Tag::I8
                | Tag::U8
                | Tag::I16
                | Tag::U16
                | Tag::I32
                | Tag::U32
                | Tag::I64
                | Tag::U64
                | Tag::Pointer
                | Tag::F32
                | Tag::F64
        )
    }

    pub fn is_array(self) -> bool {
        self.element().is_some()
    }

    /// Element tag of a homogeneous array tag.
    pub fn element(self) -> Option<Tag> {
        Some(match self {
            Tag::BoolArray => Tag::Bool,
            Tag::Char8Array => Tag::Char8,
            Tag::Char16Array => Tag::Char16,
            Tag::I8Array => Tag::I8,
            Tag::U8Array => Tag::U8,
            Tag::I16Array => Tag::I16,
            Tag::U16Array => Tag::U16,
            Tag::I32Array => Tag::I32,
            Tag::U32Array => Tag::U32,
            Tag::I64Array => Tag::I64,
            Tag::U64Array => Tag::U64,
            Tag::PointerArray => Tag::Pointer,
            Tag::F32Array => Tag::F32,
            Tag::F64Array => Tag::F64,
            Tag::StrArray => Tag::Str,
            _ => return None,
        })
    }

    /// The array tag whose elements carry `self`, if one exists.
    pub fn array_of(self) -> Option<Tag> {
        Some(match self {
            Tag::Bool => Tag::BoolArray,
            Tag::Char8 => Tag::Char8Array,
            Tag::Char16 => Tag::Char16Array,
            Tag::I8 => Tag::I8Array,
            Tag::U8 => Tag::U8Array,
            Tag::I16 => Tag::I16Array,
            Tag::U16 => Tag::U16Array,
            Tag::I32 => Tag::I32Array,
            Tag::U32 => Tag::U32Array,
            Tag::I64 => Tag::I64Array,
            Tag::U64 => Tag::U64Array,
            Tag::Pointer => Tag::PointerArray,
            Tag::F32 => Tag::F32Array,
            Tag::F64 => Tag::F64Array,
            Tag::Str => Tag::StrArray,
            _ => return None,
        })
    }

    /// Byte footprint of the tag's fixed-ABI representation.
    ///
    /// Strings, arrays and functions cross as pointer-sized opaque handles;
    /// vectors and the matrix are packed `f32` structs.
    pub fn native_size(self) -> usize {
        match self {
            Tag::Void => 0,
            Tag::Bool | Tag::Char8 | Tag::I8 | Tag::U8 => 1,
            Tag::Char16 | Tag::I16 | Tag::U16 => 2,
            Tag::I32 | Tag::U32 | Tag::F32 => 4,
            Tag::I64 | Tag::U64 | Tag::F64 => 8,
            Tag::Pointer | Tag::Function | Tag::Str => size_of::<usize>(),
            t if t.is_array() => size_of::<usize>(),
            Tag::Vec2 => 8,
            Tag::Vec3 => 12,
            Tag::Vec4 => 16,
            Tag::Mat4 => 64,
            _ => unreachable!("tag {self:?} has no native size"),
        }
    }

    /// Tags eligible for the trampoline direct-bind fast path.
    ///
    /// Word-class scalars only: float-bearing signatures travel in distinct
    /// registers on the supported ABIs and always take the CIF path.
    pub fn is_word_scalar(self) -> bool {
        self.is_scalar() && !matches!(self, Tag::F32 | Tag::F64)
    }

    /// Tags whose return value travels through a hidden out-parameter slot
    /// prepended to the call.
    pub fn needs_indirect_return(self) -> bool {
        matches!(self, Tag::Str | Tag::Vec2 | Tag::Vec3 | Tag::Vec4 | Tag::Mat4) || self.is_array()
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::Void => "void",
            Tag::Bool => "bool",
            Tag::Char8 => "char8",
            Tag::Char16 => "char16",
            Tag::I8 => "int8",
            Tag::U8 => "uint8",
            Tag::I16 => "int16",
            Tag::U16 => "uint16",
            Tag::I32 => "int32",
            Tag::U32 => "uint32",
            Tag::I64 => "int64",
            Tag::U64 => "uint64",
            Tag::Pointer => "pointer",
            Tag::F32 => "float",
            Tag::F64 => "double",
            Tag::Function => "function",
            Tag::Str => "string",
            Tag::BoolArray => "bool[]",
            Tag::Char8Array => "char8[]",
            Tag::Char16Array => "char16[]",
            Tag::I8Array => "int8[]",
            Tag::U8Array => "uint8[]",
            Tag::I16Array => "int16[]",
            Tag::U16Array => "uint16[]",
            Tag::I32Array => "int32[]",
            Tag::U32Array => "uint32[]",
            Tag::I64Array => "int64[]",
            Tag::U64Array => "uint64[]",
            Tag::PointerArray => "pointer[]",
            Tag::F32Array => "float[]",
            Tag::F64Array => "double[]",
            Tag::StrArray => "string[]",
            Tag::Vec2 => "vec2",
            Tag::Vec3 => "vec3",
            Tag::Vec4 => "vec4",
            Tag::Mat4 => "mat4",
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for tag in Tag::ALL {
            let raw: u32 = tag.into();
            assert_eq!(Tag::try_from(raw).unwrap(), tag);
        }
    }

    #[test]
    fn unknown_raw_is_rejected() {
        assert!(Tag::try_from(TAG_COUNT as u32).is_err());
        assert!(Tag::try_from(u32::MAX).is_err());
    }

    #[test]
    fn array_element_round_trip() {
        for tag in Tag::ALL {
            if let Some(arr) = tag.array_of() {
                assert_eq!(arr.element(), Some(tag));
            }
            if let Some(elem) = tag.element() {
                assert_eq!(elem.array_of(), Some(tag));
            }
        }
    }

    #[test]
    fn every_scalar_has_an_array_tag() {
        for tag in Tag::ALL.into_iter().filter(|t| t.is_scalar()) {
            assert!(tag.array_of().is_some(), "{tag} has no array form");
        }
        assert!(Tag::Str.array_of().is_some());
    }

    #[test]
    fn native_sizes() {
        assert_eq!(Tag::Void.native_size(), 0);
        assert_eq!(Tag::Bool.native_size(), 1);
        assert_eq!(Tag::Char16.native_size(), 2);
        assert_eq!(Tag::F32.native_size(), 4);
        assert_eq!(Tag::U64.native_size(), 8);
        assert_eq!(Tag::Str.native_size(), size_of::<usize>());
        assert_eq!(Tag::I32Array.native_size(), size_of::<usize>());
        assert_eq!(Tag::Mat4.native_size(), 64);
    }

    #[test]
    fn floats_are_not_word_scalars() {
        assert!(Tag::I32.is_word_scalar());
        assert!(Tag::Pointer.is_word_scalar());
        assert!(!Tag::F32.is_word_scalar());
        assert!(!Tag::F64.is_word_scalar());
        assert!(!Tag::Str.is_word_scalar());
    }
}
