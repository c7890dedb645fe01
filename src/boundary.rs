//! The fixed exported entry points the native host calls.
//!
//! Handle/buffer-only signatures: no managed type crosses raw. Every
//! entry catches faults at this edge, reports them through the diagnostic
//! channel and returns a neutral value; nothing throws across the
//! boundary.
//!
//! Buffer conventions:
//! - Method and callable arguments arrive as `argc` word-sized slots,
//!   interpreted against the target's declared signature (scalars by
//!   value, handles by value, by-ref and vector/matrix parameters by
//!   address). By-ref slots are written back after the call.
//! - Constructor arguments arrive as boxed any-tag handles, because the
//!   argument kinds select the constructor.
//! - Out-buffers receive the value's fixed-ABI representation; ownership
//!   of any cell encoded into an out-buffer passes to the caller.

use std::ffi::c_void;
use std::os::raw::c_char;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tether_core::diagnostics::{DiagnosticSink, FaultCallbackFn, MessageCallbackFn};
use tether_core::error::{InteropError, InvokeError, MarshalError, ResolveError};
use tether_core::handle::{Handle, ModuleId, Token};
use tether_core::sig::Signature;
use tether_core::tag::Tag;
use tether_core::value::Value;

use crate::engine::Engine;
use crate::trampoline::{decode_slot_args, push_back_slot_args};

fn guarded<T>(op: &'static str, neutral: T, f: impl FnOnce() -> Result<T, InteropError>) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            DiagnosticSink::error(op, err.to_string());
            neutral
        }
        Err(_) => {
            DiagnosticSink::fault(format!("panic in {op}"));
            neutral
        }
    }
}

unsafe fn read_cstr<'a>(ptr: *const c_char) -> Result<&'a str, InteropError> {
    if ptr.is_null() {
        return Err(MarshalError::NullAddress(Tag::Str).into());
    }
    unsafe { std::ffi::CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| MarshalError::TypeMismatch {
            expected: Tag::Str,
            got: "non-utf8 bytes",
        }
        .into())
}

/// Copy a string into a caller buffer, returning the full length or -1.
fn write_str_out(text: &str, out: *mut u8, cap: usize) -> isize {
    if !out.is_null() && cap > 0 {
        let n = text.len().min(cap);
        unsafe { std::ptr::copy_nonoverlapping(text.as_ptr(), out, n) };
    }
    text.len() as isize
}

fn write_handles_out(handles: &[Handle], out: *mut u64, cap: usize) -> usize {
    if !out.is_null() {
        for (i, handle) in handles.iter().take(cap).enumerate() {
            unsafe { out.add(i).write(handle.raw()) };
        }
    }
    handles.len()
}

unsafe fn slot_words(raw_args: *const u8, argc: usize) -> Vec<u64> {
    let mut words = Vec::with_capacity(argc);
    for i in 0..argc {
        words.push(unsafe { std::ptr::read_unaligned((raw_args as *const u64).add(i)) });
    }
    words
}

/// Decode a boxed any-tag argument.
unsafe fn decode_boxed(engine: &Engine, handle: *const c_void) -> Result<Value, InteropError> {
    if handle.is_null() {
        return Ok(Value::Null);
    }
    let bindings = engine.bindings_snapshot();
    let read = bindings.box_read()?;
    let mut buf = [0u8; 64];
    let raw_tag = unsafe { read(handle, buf.as_mut_ptr(), buf.len()) };
    let tag = Tag::try_from(raw_tag).map_err(|_| MarshalError::UnsupportedTag(raw_tag))?;
    if tag == Tag::Void {
        return Ok(Value::Null);
    }
    Ok(engine.codec().decode(&bindings, buf.as_ptr(), tag)?)
}

/// Run a slot-convention invocation: decode, call, pull back, encode.
fn invoke_slots(
    engine: &Engine,
    sig: &Signature,
    raw_args: *const u8,
    argc: usize,
    ret_out: *mut u8,
    call: impl FnOnce(&mut [Value]) -> Result<Value, InteropError>,
) -> Result<(), InteropError> {
    if argc != sig.arity() {
        return Err(InvokeError::ArityMismatch {
            expected: sig.arity(),
            got: argc,
        }
        .into());
    }
    if raw_args.is_null() && argc > 0 {
        return Err(MarshalError::NullAddress(Tag::Void).into());
    }
    let words = unsafe { slot_words(raw_args, argc) };
    let bindings = engine.bindings_snapshot();
    let mut args = decode_slot_args(engine.codec(), &bindings, sig, &words)?;
    let ret = call(&mut args)?;
    push_back_slot_args(engine.codec(), &bindings, sig, &words, &args)?;
    if !ret_out.is_null() && sig.ret != Tag::Void {
        engine.codec().encode(&bindings, &ret, sig.ret, ret_out)?;
    }
    Ok(())
}

// --- module lifecycle -------------------------------------------------------

/// Load a plugin unit as a new module. Returns the module id, or 0 on
/// failure (poll `tether_last_load_status`).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_load_module(
    path: *const c_char,
    remove_extension: u8,
    collectible: u8,
) -> u64 {
    guarded("load", 0, || {
        let path = unsafe { read_cstr(path) }?;
        let id = Engine::global().load_module(path, remove_extension != 0, collectible != 0)?;
        Ok(id.raw())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_unload_module(id: u64) -> u8 {
    guarded("unload", 0, || {
        Engine::global().unload_module(ModuleId::from_raw(id))?;
        Ok(1)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_last_load_status() -> u32 {
    guarded("load status", 0, || {
        Ok(Engine::global().last_load_status().into())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_module_name(id: u64, out: *mut u8, cap: usize) -> isize {
    guarded("module name", -1, || {
        let name = Engine::global().module_name(ModuleId::from_raw(id))?;
        Ok(write_str_out(&name, out, cap))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_module_types(id: u64, out: *mut u64, cap: usize) -> usize {
    guarded("module types", 0, || {
        let handles = Engine::global().module_types(ModuleId::from_raw(id));
        Ok(write_handles_out(&handles, out, cap))
    })
}

// --- type metadata ----------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_type_find(name: *const c_char) -> u64 {
    guarded("type find", 0, || {
        let name = unsafe { read_cstr(name) }?;
        Ok(Engine::global().find_type(name)?.raw())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_type_name(handle: u64, out: *mut u8, cap: usize) -> isize {
    guarded("type name", -1, || {
        let name = Engine::global().type_name(Handle::from_raw(handle))?;
        Ok(write_str_out(&name, out, cap))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_type_base(handle: u64) -> u64 {
    guarded("type base", 0, || {
        Ok(Engine::global().type_base(Handle::from_raw(handle))?.raw())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_type_size(handle: u64) -> u32 {
    guarded("type size", 0, || {
        Engine::global().type_size(Handle::from_raw(handle)).map_err(Into::into)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_type_traits(handle: u64) -> u32 {
    guarded("type traits", 0, || {
        Ok(Engine::global().type_traits(Handle::from_raw(handle))?.bits())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_type_is_assignable(from: u64, to: u64) -> u8 {
    guarded("assignability", 0, || {
        Ok(u8::from(
            Engine::global().is_assignable(Handle::from_raw(from), Handle::from_raw(to))?,
        ))
    })
}

/// Element tag of an array tag, or Void for non-array tags.
#[unsafe(no_mangle)]
pub extern "C" fn tether_tag_element(tag: u32) -> u32 {
    guarded("tag element", 0, || {
        let tag = Tag::try_from(tag).map_err(|_| MarshalError::UnsupportedTag(tag))?;
        Ok(tag.element().unwrap_or(Tag::Void).into())
    })
}

// --- member enumeration and queries ----------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn tether_type_methods(handle: u64, out: *mut u64, cap: usize) -> usize {
    guarded("methods", 0, || {
        let handles = Engine::global().type_methods(Handle::from_raw(handle))?;
        Ok(write_handles_out(&handles, out, cap))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_type_fields(handle: u64, out: *mut u64, cap: usize) -> usize {
    guarded("fields", 0, || {
        let handles = Engine::global().type_fields(Handle::from_raw(handle))?;
        Ok(write_handles_out(&handles, out, cap))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_type_properties(handle: u64, out: *mut u64, cap: usize) -> usize {
    guarded("properties", 0, || {
        let handles = Engine::global().type_properties(Handle::from_raw(handle))?;
        Ok(write_handles_out(&handles, out, cap))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_type_attributes(handle: u64, out: *mut u64, cap: usize) -> usize {
    guarded("attributes", 0, || {
        let handles = Engine::global().type_attributes(Handle::from_raw(handle))?;
        Ok(write_handles_out(&handles, out, cap))
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_method_find(type_handle: u64, name: *const c_char) -> u64 {
    guarded("method find", 0, || {
        let name = unsafe { read_cstr(name) }?;
        Ok(Engine::global()
            .find_method(Handle::from_raw(type_handle), name)?
            .raw())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_member_name(handle: u64, out: *mut u8, cap: usize) -> isize {
    guarded("member name", -1, || {
        let name = Engine::global().member_name(Handle::from_raw(handle))?;
        Ok(write_str_out(&name, out, cap))
    })
}

/// Write a member's parameter tags, by-ref mask and return tag. Returns
/// the parameter count.
#[unsafe(no_mangle)]
pub extern "C" fn tether_member_signature(
    handle: u64,
    out_tags: *mut u32,
    cap: usize,
    out_byref: *mut u32,
    out_ret: *mut u32,
) -> usize {
    guarded("member signature", 0, || {
        let sig = Engine::global().member_signature(Handle::from_raw(handle))?;
        let mut mask = 0u32;
        for (i, param) in sig.params.iter().enumerate() {
            if !out_tags.is_null() && i < cap {
                unsafe { out_tags.add(i).write(param.tag.into()) };
            }
            if param.by_ref {
                mask |= 1 << i;
            }
        }
        if !out_byref.is_null() {
            unsafe { out_byref.write(mask) };
        }
        if !out_ret.is_null() {
            unsafe { out_ret.write(sig.ret.into()) };
        }
        Ok(sig.arity())
    })
}

/// Read one named value of an attribute instance as a boxed any. The
/// caller owns the returned box.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_attribute_value(
    handle: u64,
    field: *const c_char,
    out_box: *mut *mut c_void,
) -> u8 {
    guarded("attribute value", 0, || {
        let field = unsafe { read_cstr(field) }?;
        let engine = Engine::global();
        let value = engine.attribute_value(Handle::from_raw(handle), field)?;
        let tag = value.tag().ok_or(MarshalError::MissingValue {
            expected: Tag::Void,
        })?;
        let bindings = engine.bindings_snapshot();
        let construct = bindings.box_construct()?;
        let mut buf = [0u8; 64];
        let owned = engine.codec().encode(&bindings, &value, tag, buf.as_mut_ptr())?;
        let boxed = unsafe { construct(tag.into(), buf.as_ptr()) };
        // The box copied (and for handles, now owns) the payload.
        drop(owned);
        if out_box.is_null() {
            return Err(MarshalError::NullAddress(tag).into());
        }
        unsafe { out_box.write(boxed) };
        Ok(1)
    })
}

// --- enums ------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn tether_enum_entry_count(handle: u64) -> usize {
    guarded("enum entries", 0, || {
        let (names, _) = Engine::global().enum_entries(Handle::from_raw(handle))?;
        Ok(names.len())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_enum_name(handle: u64, index: usize, out: *mut u8, cap: usize) -> isize {
    guarded("enum name", -1, || {
        let (names, _) = Engine::global().enum_entries(Handle::from_raw(handle))?;
        let name = names.get(index).ok_or(ResolveError::StaleToken)?;
        Ok(write_str_out(name, out, cap))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_enum_value(handle: u64, index: usize) -> i64 {
    guarded("enum value", 0, || {
        let (_, values) = Engine::global().enum_entries(Handle::from_raw(handle))?;
        values.get(index).copied().ok_or_else(|| {
            InteropError::from(ResolveError::StaleToken)
        })
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_enum_define(
    handle: u64,
    underlying: u32,
    names: *const *const c_char,
    values: *const i64,
    count: usize,
) -> u8 {
    guarded("enum define", 0, || {
        let underlying =
            Tag::try_from(underlying).map_err(|_| MarshalError::UnsupportedTag(underlying))?;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let name = unsafe { read_cstr(*names.add(i)) }?;
            let value = unsafe { *values.add(i) };
            entries.push((name.to_string(), value));
        }
        Engine::global().define_enum(Handle::from_raw(handle), underlying, entries)?;
        Ok(1)
    })
}

// --- objects ----------------------------------------------------------------

/// Construct an object. Arguments are boxed any-tag handles; the argument
/// kinds select the constructor. Returns the object token, 0 on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_object_construct(
    type_handle: u64,
    weak: u8,
    raw_args: *const *mut c_void,
    argc: usize,
) -> u64 {
    guarded("construct", 0, || {
        let engine = Engine::global();
        let mut args = Vec::with_capacity(argc);
        for i in 0..argc {
            let boxed = if raw_args.is_null() {
                std::ptr::null_mut()
            } else {
                unsafe { *raw_args.add(i) }
            };
            args.push(unsafe { decode_boxed(engine, boxed) }?);
        }
        let token = engine.construct(Handle::from_raw(type_handle), weak != 0, &mut args)?;
        Ok(token.raw())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_object_destroy(token: u64) -> u8 {
    guarded("destroy", 0, || {
        Engine::global().destroy_object(Token::from_raw(token))?;
        Ok(1)
    })
}

// --- invocation -------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn tether_invoke_method(
    target: u64,
    method: u64,
    raw_args: *const u8,
    argc: usize,
) -> u8 {
    guarded("invoke", 0, || {
        let engine = Engine::global();
        let sig = engine.member_signature(Handle::from_raw(method))?;
        let target = (target != 0).then(|| Token::from_raw(target));
        invoke_slots(engine, &sig, raw_args, argc, std::ptr::null_mut(), |args| {
            engine.invoke_method(target, Handle::from_raw(method), args)
        })?;
        Ok(1)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_invoke_method_ret(
    target: u64,
    method: u64,
    raw_args: *const u8,
    argc: usize,
    ret_out: *mut u8,
) -> u8 {
    guarded("invoke", 0, || {
        let engine = Engine::global();
        let sig = engine.member_signature(Handle::from_raw(method))?;
        let target = (target != 0).then(|| Token::from_raw(target));
        invoke_slots(engine, &sig, raw_args, argc, ret_out, |args| {
            engine.invoke_method(target, Handle::from_raw(method), args)
        })?;
        Ok(1)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_callable_find(name: *const c_char) -> u64 {
    guarded("callable find", 0, || {
        let name = unsafe { read_cstr(name) }?;
        Ok(Engine::global().find_callable(name)?.raw())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_callable_invoke(handle: u64, raw_args: *const u8, argc: usize) -> u8 {
    guarded("callable", 0, || {
        let engine = Engine::global();
        let sig = engine.member_signature(Handle::from_raw(handle))?;
        invoke_slots(engine, &sig, raw_args, argc, std::ptr::null_mut(), |args| {
            engine.invoke_callable(Handle::from_raw(handle), args)
        })?;
        Ok(1)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_callable_invoke_ret(
    handle: u64,
    raw_args: *const u8,
    argc: usize,
    ret_out: *mut u8,
) -> u8 {
    guarded("callable", 0, || {
        let engine = Engine::global();
        let sig = engine.member_signature(Handle::from_raw(handle))?;
        invoke_slots(engine, &sig, raw_args, argc, ret_out, |args| {
            engine.invoke_callable(Handle::from_raw(handle), args)
        })?;
        Ok(1)
    })
}

// --- field and property access ----------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_field_get(
    token: u64,
    name: *const c_char,
    out: *mut u8,
) -> u8 {
    guarded("field get", 0, || {
        let name = unsafe { read_cstr(name) }?;
        let engine = Engine::global();
        let value = engine.get_field(Token::from_raw(token), name)?;
        let tag = value.tag().unwrap_or(Tag::Void);
        if tag != Tag::Void {
            let bindings = engine.bindings_snapshot();
            engine.codec().encode(&bindings, &value, tag, out)?;
        }
        Ok(1)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_field_set(
    token: u64,
    name: *const c_char,
    value: *const u8,
) -> u8 {
    guarded("field set", 0, || {
        let name = unsafe { read_cstr(name) }?;
        let engine = Engine::global();
        // The buffer holds the field tag's fixed-ABI representation.
        let sig_handle = engine.find_field_handle(Token::from_raw(token), name)?;
        let sig = engine.member_signature(sig_handle)?;
        let bindings = engine.bindings_snapshot();
        let decoded = engine.codec().decode(&bindings, value, sig.ret)?;
        engine.set_field(Token::from_raw(token), name, &decoded)?;
        Ok(1)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_field_address(token: u64, name: *const c_char) -> u64 {
    guarded("field address", 0, || {
        let name = unsafe { read_cstr(name) }?;
        Ok(Engine::global().field_address(Token::from_raw(token), name)? as u64)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_property_get(
    token: u64,
    name: *const c_char,
    out: *mut u8,
) -> u8 {
    guarded("property get", 0, || {
        let name = unsafe { read_cstr(name) }?;
        let engine = Engine::global();
        let value = engine.get_property(Token::from_raw(token), name)?;
        let tag = value.tag().unwrap_or(Tag::Void);
        if tag != Tag::Void {
            let bindings = engine.bindings_snapshot();
            engine.codec().encode(&bindings, &value, tag, out)?;
        }
        Ok(1)
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_property_set(
    token: u64,
    name: *const c_char,
    value: *const u8,
) -> u8 {
    guarded("property set", 0, || {
        let name = unsafe { read_cstr(name) }?;
        let engine = Engine::global();
        let tag = engine.property_tag(Token::from_raw(token), name)?;
        let bindings = engine.bindings_snapshot();
        let decoded = engine.codec().decode(&bindings, value, tag)?;
        engine.set_property(Token::from_raw(token), name, decoded)?;
        Ok(1)
    })
}

// --- host wiring ------------------------------------------------------------

/// Register a batch of named native function pointers against the managed
/// accessor slots. Returns how many were bound.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_bind_host_functions(
    names: *const *const c_char,
    fns: *const *const c_void,
    count: usize,
) -> usize {
    guarded("bind", 0, || {
        let mut batch = Vec::with_capacity(count);
        for i in 0..count {
            let name = unsafe { read_cstr(*names.add(i)) }?;
            batch.push((name, unsafe { *fns.add(i) as *const c_void }));
        }
        Engine::global().bind_host_functions(batch);
        Ok(count)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_set_message_callback(callback: Option<MessageCallbackFn>) {
    DiagnosticSink::set_message_callback(callback);
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_set_fault_callback(callback: Option<FaultCallbackFn>) {
    DiagnosticSink::set_fault_callback(callback);
}

// --- collection -------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn tether_collect() -> u64 {
    guarded("collect", 0, || Ok(Engine::global().collect() as u64))
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_wait_for_pending_finalizers() {
    Engine::global().wait_for_pending_finalizers();
}
