//! Call signatures: ordered parameter tags plus a return tag.

use crate::tag::Tag;

/// One parameter of a boundary call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Param {
    pub tag: Tag,
    /// By-reference parameters are passed through scratch storage and
    /// pulled back into the caller's slot after the call.
    pub by_ref: bool,
}

impl Param {
    pub fn new(tag: Tag) -> Self {
        Self { tag, by_ref: false }
    }

    pub fn by_ref(tag: Tag) -> Self {
        Self { tag, by_ref: true }
    }
}

/// Ordered tag list of a callable target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<Param>,
    pub ret: Tag,
}

impl Signature {
    pub fn new(params: Vec<Param>, ret: Tag) -> Self {
        Self { params, ret }
    }

    /// Signature with by-value parameters only.
    pub fn of(params: &[Tag], ret: Tag) -> Self {
        Self {
            params: params.iter().copied().map(Param::new).collect(),
            ret,
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// True when every parameter and the return are word-class scalars
    /// passed by value. Such targets are bound directly without an adapter.
    pub fn is_direct_bindable(&self) -> bool {
        (self.ret == Tag::Void || self.ret.is_word_scalar())
            && self
                .params
                .iter()
                .all(|p| !p.by_ref && p.tag.is_word_scalar())
    }

    pub fn has_by_ref(&self) -> bool {
        self.params.iter().any(|p| p.by_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_bindable() {
        assert!(Signature::of(&[Tag::I32, Tag::U64, Tag::Pointer], Tag::I32).is_direct_bindable());
        assert!(Signature::of(&[], Tag::Void).is_direct_bindable());
        assert!(!Signature::of(&[Tag::F32], Tag::Void).is_direct_bindable());
        assert!(!Signature::of(&[Tag::I32], Tag::Str).is_direct_bindable());
        let by_ref = Signature::new(vec![Param::by_ref(Tag::I32)], Tag::Void);
        assert!(!by_ref.is_direct_bindable());
    }
}
