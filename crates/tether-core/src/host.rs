//! Host-opaque value accessors.
//!
//! Strings cross the boundary only through a host-owned opaque handle, and
//! homogeneous containers through a matching opaque-handle family keyed by
//! element tag, because the host's internal representations are not
//! uniform. The accessor slots are populated by the batch registration
//! entry point; [`reference_host`] provides a complete built-in
//! implementation so the engine is usable (and testable) stand-alone.

use std::ffi::c_void;

use crate::diagnostics::DiagnosticSink;
use crate::error::MarshalError;

/// Upper bound on boundary call arity. Reverse shim entries are
/// precompiled per arity up to this.
pub const MAX_CALL_ARITY: usize = 16;

/// Wire form of a function value.
///
/// `entry` is called with `ctx` passed alongside when `ctx` is non-null;
/// a null `ctx` marks a plain native function pointer. The signature
/// travels inline so a decoded callable knows its own shape.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawCallable {
    pub entry: *const c_void,
    pub ctx: *mut c_void,
    pub ret: u32,
    pub argc: u32,
    /// Bit i set: parameter i is by-reference.
    pub byref_mask: u32,
    pub param_tags: [u32; MAX_CALL_ARITY],
}

// --- accessor slot shapes ---------------------------------------------------

pub type StringConstructFn = unsafe extern "C" fn(data: *const u8, len: usize) -> *mut c_void;
pub type StringLengthFn = unsafe extern "C" fn(s: *const c_void) -> usize;
pub type StringReadFn = unsafe extern "C" fn(s: *const c_void, out: *mut u8, cap: usize) -> usize;
pub type StringAssignFn = unsafe extern "C" fn(s: *mut c_void, data: *const u8, len: usize);
pub type StringDestroyFn = unsafe extern "C" fn(s: *mut c_void);

/// Container accessors take the element tag first; `len` counts elements,
/// buffer sizes count bytes.
pub type ContainerConstructFn = unsafe extern "C" fn(tag: u32, len: usize) -> *mut c_void;
pub type ContainerLengthFn = unsafe extern "C" fn(tag: u32, c: *const c_void) -> usize;
pub type ContainerReadFn =
    unsafe extern "C" fn(tag: u32, c: *const c_void, out: *mut u8, cap: usize) -> usize;
pub type ContainerAssignFn =
    unsafe extern "C" fn(tag: u32, c: *mut c_void, data: *const u8, len: usize);
pub type ContainerDestroyFn = unsafe extern "C" fn(tag: u32, c: *mut c_void);

pub type BoxConstructFn = unsafe extern "C" fn(tag: u32, value: *const u8) -> *mut c_void;
/// Writes the boxed value to `out` and returns its tag.
pub type BoxReadFn = unsafe extern "C" fn(b: *const c_void, out: *mut u8, cap: usize) -> u32;
pub type BoxDestroyFn = unsafe extern "C" fn(b: *mut c_void);

/// The named accessor slots the managed side depends on.
///
/// Populated by `bind` from the batch registration entry point. Reads fail
/// with [`MarshalError::HostBindingMissing`] until the slot is bound.
#[derive(Default, Clone)]
pub struct HostBindings {
    string_construct: Option<StringConstructFn>,
    string_length: Option<StringLengthFn>,
    string_read: Option<StringReadFn>,
    string_assign: Option<StringAssignFn>,
    string_destroy: Option<StringDestroyFn>,
    container_construct: Option<ContainerConstructFn>,
    container_length: Option<ContainerLengthFn>,
    container_read: Option<ContainerReadFn>,
    container_assign: Option<ContainerAssignFn>,
    container_destroy: Option<ContainerDestroyFn>,
    box_construct: Option<BoxConstructFn>,
    box_read: Option<BoxReadFn>,
    box_destroy: Option<BoxDestroyFn>,
}

macro_rules! binding_accessor {
    ($name:ident, $ty:ty) => {
        pub fn $name(&self) -> Result<$ty, MarshalError> {
            self.$name
                .ok_or(MarshalError::HostBindingMissing(stringify!($name)))
        }
    };
}

impl HostBindings {
    pub fn new() -> Self {
        Self::default()
    }

    binding_accessor!(string_construct, StringConstructFn);
    binding_accessor!(string_length, StringLengthFn);
    binding_accessor!(string_read, StringReadFn);
    binding_accessor!(string_assign, StringAssignFn);
    binding_accessor!(string_destroy, StringDestroyFn);
    binding_accessor!(container_construct, ContainerConstructFn);
    binding_accessor!(container_length, ContainerLengthFn);
    binding_accessor!(container_read, ContainerReadFn);
    binding_accessor!(container_assign, ContainerAssignFn);
    binding_accessor!(container_destroy, ContainerDestroyFn);
    binding_accessor!(box_construct, BoxConstructFn);
    binding_accessor!(box_read, BoxReadFn);
    binding_accessor!(box_destroy, BoxDestroyFn);

    /// Bind one named slot to a raw function pointer. Unknown names are
    /// reported and ignored so a newer host can ship extra bindings.
    pub fn bind(&mut self, name: &str, ptr: *const c_void) -> bool {
        if ptr.is_null() {
            DiagnosticSink::warning("bind", format!("null pointer for slot '{name}'"));
            return false;
        }
        unsafe {
            match name {
                "string_construct" => self.string_construct = Some(std::mem::transmute(ptr)),
                "string_length" => self.string_length = Some(std::mem::transmute(ptr)),
                "string_read" => self.string_read = Some(std::mem::transmute(ptr)),
                "string_assign" => self.string_assign = Some(std::mem::transmute(ptr)),
                "string_destroy" => self.string_destroy = Some(std::mem::transmute(ptr)),
                "container_construct" => self.container_construct = Some(std::mem::transmute(ptr)),
                "container_length" => self.container_length = Some(std::mem::transmute(ptr)),
                "container_read" => self.container_read = Some(std::mem::transmute(ptr)),
                "container_assign" => self.container_assign = Some(std::mem::transmute(ptr)),
                "container_destroy" => self.container_destroy = Some(std::mem::transmute(ptr)),
                "box_construct" => self.box_construct = Some(std::mem::transmute(ptr)),
                "box_read" => self.box_read = Some(std::mem::transmute(ptr)),
                "box_destroy" => self.box_destroy = Some(std::mem::transmute(ptr)),
                other => {
                    DiagnosticSink::warning("bind", format!("unknown host slot '{other}'"));
                    return false;
                }
            }
        }
        true
    }

    /// Bind a batch of named slots.
    pub fn bind_batch<'a>(&mut self, slots: impl IntoIterator<Item = (&'a str, *const c_void)>) {
        for (name, ptr) in slots {
            self.bind(name, ptr);
        }
    }
}

impl std::fmt::Debug for HostBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBindings")
            .field("strings", &self.string_construct.is_some())
            .field("containers", &self.container_construct.is_some())
            .field("boxes", &self.box_construct.is_some())
            .finish()
    }
}

/// Built-in reference implementation of the host accessor family.
///
/// Cells are plain Rust allocations; live-cell counters let tests assert
/// that transient scratch is freed exactly once.
pub mod reference_host {
    use super::*;
    use crate::tag::Tag;
    use std::sync::atomic::{AtomicIsize, Ordering};

    struct HostStr {
        bytes: Vec<u8>,
    }

    struct HostBuf {
        tag: u32,
        /// Elements packed at their native width. For string elements each
        /// word is a string handle owned by the container.
        data: Vec<u8>,
    }

    struct HostBox {
        tag: u32,
        data: Vec<u8>,
    }

    static LIVE_STRINGS: AtomicIsize = AtomicIsize::new(0);
    static LIVE_CONTAINERS: AtomicIsize = AtomicIsize::new(0);
    static LIVE_BOXES: AtomicIsize = AtomicIsize::new(0);

    pub fn live_strings() -> isize {
        LIVE_STRINGS.load(Ordering::SeqCst)
    }

    pub fn live_containers() -> isize {
        LIVE_CONTAINERS.load(Ordering::SeqCst)
    }

    pub fn live_boxes() -> isize {
        LIVE_BOXES.load(Ordering::SeqCst)
    }

    pub unsafe extern "C" fn string_construct(data: *const u8, len: usize) -> *mut c_void {
        let bytes = if data.is_null() || len == 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(data, len) }.to_vec()
        };
        LIVE_STRINGS.fetch_add(1, Ordering::SeqCst);
        Box::into_raw(Box::new(HostStr { bytes })) as *mut c_void
    }

    pub unsafe extern "C" fn string_length(s: *const c_void) -> usize {
        if s.is_null() {
            return 0;
        }
        unsafe { &*(s as *const HostStr) }.bytes.len()
    }

    pub unsafe extern "C" fn string_read(s: *const c_void, out: *mut u8, cap: usize) -> usize {
        if s.is_null() || out.is_null() {
            return 0;
        }
        let cell = unsafe { &*(s as *const HostStr) };
        let n = cell.bytes.len().min(cap);
        unsafe { std::ptr::copy_nonoverlapping(cell.bytes.as_ptr(), out, n) };
        n
    }

    pub unsafe extern "C" fn string_assign(s: *mut c_void, data: *const u8, len: usize) {
        if s.is_null() {
            return;
        }
        let cell = unsafe { &mut *(s as *mut HostStr) };
        cell.bytes.clear();
        if !data.is_null() && len > 0 {
            cell.bytes
                .extend_from_slice(unsafe { std::slice::from_raw_parts(data, len) });
        }
    }

    pub unsafe extern "C" fn string_destroy(s: *mut c_void) {
        if s.is_null() {
            return;
        }
        LIVE_STRINGS.fetch_sub(1, Ordering::SeqCst);
        drop(unsafe { Box::from_raw(s as *mut HostStr) });
    }

    fn element_width(tag: u32) -> usize {
        Tag::try_from(tag).map_or(0, Tag::native_size)
    }

    pub unsafe extern "C" fn container_construct(tag: u32, len: usize) -> *mut c_void {
        let width = element_width(tag);
        LIVE_CONTAINERS.fetch_add(1, Ordering::SeqCst);
        Box::into_raw(Box::new(HostBuf {
            tag,
            data: vec![0u8; width * len],
        })) as *mut c_void
    }

    pub unsafe extern "C" fn container_length(tag: u32, c: *const c_void) -> usize {
        if c.is_null() {
            return 0;
        }
        let width = element_width(tag);
        if width == 0 {
            return 0;
        }
        unsafe { &*(c as *const HostBuf) }.data.len() / width
    }

    pub unsafe extern "C" fn container_read(
        tag: u32,
        c: *const c_void,
        out: *mut u8,
        cap: usize,
    ) -> usize {
        let _ = tag;
        if c.is_null() || out.is_null() {
            return 0;
        }
        let cell = unsafe { &*(c as *const HostBuf) };
        let n = cell.data.len().min(cap);
        unsafe { std::ptr::copy_nonoverlapping(cell.data.as_ptr(), out, n) };
        n
    }

    pub unsafe extern "C" fn container_assign(
        tag: u32,
        c: *mut c_void,
        data: *const u8,
        len: usize,
    ) {
        if c.is_null() {
            return;
        }
        let cell = unsafe { &mut *(c as *mut HostBuf) };
        drop_owned_elements(cell);
        let bytes = element_width(tag) * len;
        cell.data.clear();
        if !data.is_null() && bytes > 0 {
            cell.data
                .extend_from_slice(unsafe { std::slice::from_raw_parts(data, bytes) });
        }
    }

    pub unsafe extern "C" fn container_destroy(tag: u32, c: *mut c_void) {
        let _ = tag;
        if c.is_null() {
            return;
        }
        LIVE_CONTAINERS.fetch_sub(1, Ordering::SeqCst);
        let mut cell = unsafe { Box::from_raw(c as *mut HostBuf) };
        drop_owned_elements(&mut cell);
    }

    /// String containers own their element handles.
    fn drop_owned_elements(cell: &mut HostBuf) {
        if cell.tag != u32::from(Tag::Str) {
            return;
        }
        for chunk in cell.data.chunks_exact(size_of::<usize>()) {
            let raw = usize::from_ne_bytes(chunk.try_into().unwrap_or_default());
            if raw != 0 {
                unsafe { string_destroy(raw as *mut c_void) };
            }
        }
        cell.data.clear();
    }

    pub unsafe extern "C" fn box_construct(tag: u32, value: *const u8) -> *mut c_void {
        let width = element_width(tag);
        let data = if value.is_null() || width == 0 {
            vec![0u8; width]
        } else {
            unsafe { std::slice::from_raw_parts(value, width) }.to_vec()
        };
        LIVE_BOXES.fetch_add(1, Ordering::SeqCst);
        Box::into_raw(Box::new(HostBox { tag, data })) as *mut c_void
    }

    pub unsafe extern "C" fn box_read(b: *const c_void, out: *mut u8, cap: usize) -> u32 {
        if b.is_null() {
            return u32::from(Tag::Void);
        }
        let cell = unsafe { &*(b as *const HostBox) };
        if !out.is_null() {
            let n = cell.data.len().min(cap);
            unsafe { std::ptr::copy_nonoverlapping(cell.data.as_ptr(), out, n) };
        }
        cell.tag
    }

    pub unsafe extern "C" fn box_destroy(b: *mut c_void) {
        if b.is_null() {
            return;
        }
        LIVE_BOXES.fetch_sub(1, Ordering::SeqCst);
        let cell = unsafe { Box::from_raw(b as *mut HostBox) };
        // A boxed string or container handle is owned by the box.
        if let Ok(tag) = Tag::try_from(cell.tag) {
            if (tag == Tag::Str || tag.is_array()) && cell.data.len() == size_of::<usize>() {
                let raw = usize::from_ne_bytes(cell.data[..].try_into().unwrap_or_default());
                if raw != 0 {
                    if tag == Tag::Str {
                        unsafe { string_destroy(raw as *mut c_void) };
                    } else if let Some(elem) = tag.element() {
                        unsafe { container_destroy(elem.into(), raw as *mut c_void) };
                    }
                }
            }
        }
    }

    /// The full named-slot batch for the reference host.
    pub fn bindings() -> Vec<(&'static str, *const c_void)> {
        vec![
            ("string_construct", string_construct as *const c_void),
            ("string_length", string_length as *const c_void),
            ("string_read", string_read as *const c_void),
            ("string_assign", string_assign as *const c_void),
            ("string_destroy", string_destroy as *const c_void),
            ("container_construct", container_construct as *const c_void),
            ("container_length", container_length as *const c_void),
            ("container_read", container_read as *const c_void),
            ("container_assign", container_assign as *const c_void),
            ("container_destroy", container_destroy as *const c_void),
            ("box_construct", box_construct as *const c_void),
            ("box_read", box_read as *const c_void),
            ("box_destroy", box_destroy as *const c_void),
        ]
    }

    /// A `HostBindings` set fully wired to the reference host.
    pub fn install() -> HostBindings {
        let mut wired = HostBindings::new();
        wired.bind_batch(bindings());
        wired
    }

    /// Serializes tests that assert on the process-wide cell counters.
    #[cfg(test)]
    pub(crate) fn cell_guard() -> std::sync::MutexGuard<'static, ()> {
        use std::sync::{Mutex, OnceLock};
        static CELL_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        CELL_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_slot_errors() {
        let bindings = HostBindings::new();
        assert_eq!(
            bindings.string_construct().unwrap_err(),
            MarshalError::HostBindingMissing("string_construct")
        );
    }

    #[test]
    fn reference_host_string_round_trip() {
        let _guard = reference_host::cell_guard();
        let bindings = reference_host::install();
        let construct = bindings.string_construct().unwrap();
        let read = bindings.string_read().unwrap();
        let length = bindings.string_length().unwrap();
        let destroy = bindings.string_destroy().unwrap();

        unsafe {
            let s = construct(b"hello".as_ptr(), 5);
            assert_eq!(length(s), 5);
            let mut buf = [0u8; 8];
            let n = read(s, buf.as_mut_ptr(), buf.len());
            assert_eq!(&buf[..n], b"hello");
            destroy(s);
        }
    }

    #[test]
    fn reference_host_counts_cells() {
        let _guard = reference_host::cell_guard();
        let bindings = reference_host::install();
        let construct = bindings.string_construct().unwrap();
        let destroy = bindings.string_destroy().unwrap();
        let before = reference_host::live_strings();
        unsafe {
            let s = construct(b"x".as_ptr(), 1);
            assert_eq!(reference_host::live_strings(), before + 1);
            destroy(s);
        }
        assert_eq!(reference_host::live_strings(), before);
    }

    #[test]
    fn unknown_slot_name_is_ignored() {
        let mut bindings = HostBindings::new();
        assert!(!bindings.bind("frobnicate", reference_host::string_destroy as *const c_void));
    }
}
