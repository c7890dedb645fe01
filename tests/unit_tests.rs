//! Integration tests for the tether engine using `Engine` as the entry
//! point: marshaling round trips, registration idempotence, module
//! lifecycle, trampolines in both directions and member access.

use std::ffi::c_void;
use std::sync::Arc;
use std::time::Instant;

use tether::prelude::*;
use tether_core::host::reference_host;
use tether_core::value::RawParts;

/// Fresh engine wired to the built-in reference host.
fn engine() -> Arc<Engine> {
    let engine = Engine::new();
    engine.install_reference_host();
    engine
}

/// A unit with one reflective type and one free function.
fn player_unit() -> UnitDefinition {
    let ty = TypeDef::new("Player")
        .with_field("x", Tag::I32)
        .with_field("name", Tag::Str)
        .with_ctor(
            Signature::of(&[Tag::I32], Tag::Void),
            ManagedFn::new(|frame| {
                let x = frame.arg(0)?.clone();
                frame.set_field("x", &x)?;
                Ok(())
            }),
        )
        .with_method(
            "shift",
            Signature::of(&[Tag::I32], Tag::I32),
            false,
            ManagedFn::new(|frame| {
                let delta = match frame.arg(0)? {
                    Value::I32(v) => *v,
                    _ => 0,
                };
                let x = match frame.get_field("x")? {
                    Value::I32(v) => v,
                    _ => 0,
                };
                frame.set_field("x", &Value::I32(x + delta))?;
                frame.set_ret(Value::I32(x + delta));
                Ok(())
            }),
        )
        .with_method(
            "add",
            Signature::of(&[Tag::I32, Tag::I32], Tag::I32),
            true,
            ManagedFn::new(|frame| {
                let (a, b) = match (frame.arg(0)?, frame.arg(1)?) {
                    (Value::I32(a), Value::I32(b)) => (*a, *b),
                    _ => (0, 0),
                };
                frame.set_ret(Value::I32(a + b));
                Ok(())
            }),
        );
    UnitDefinition::new("player").with_type(ty).with_function(
        "magnitude",
        Signature::of(&[Tag::F64], Tag::F64),
        ManagedFn::new(|frame| {
            let v = match frame.arg(0)? {
                Value::F64(v) => *v,
                _ => 0.0,
            };
            frame.set_ret(Value::F64(v.abs()));
            Ok(())
        }),
    )
}

fn load_player(engine: &Engine) -> (ModuleId, Handle) {
    engine.provide_unit(player_unit());
    let id = engine.load_module("player", false, true).expect("load");
    let ty = engine.find_type("Player").expect("type");
    (id, ty)
}

// ============================================================================
// Registration and resolution
// ============================================================================

#[test]
fn repeated_type_lookup_yields_same_handle() {
    let engine = engine();
    let (_, ty) = load_player(&engine);
    assert_eq!(engine.find_type("Player").unwrap(), ty);
    assert_eq!(engine.type_name(ty).unwrap(), "Player");
}

#[test]
fn resolve_after_unload_is_not_found() {
    let engine = engine();
    let (id, ty) = load_player(&engine);
    let method = engine.find_method(ty, "shift").unwrap();

    engine.unload_module(id).expect("unload");

    assert!(engine.find_type("Player").is_err());
    assert!(engine.type_name(ty).is_err());
    assert!(engine.member_name(method).is_err());
}

#[test]
fn member_enumeration_round_trips() {
    let engine = engine();
    let (id, ty) = load_player(&engine);

    let types = engine.module_types(id);
    assert_eq!(types, vec![ty]);

    let methods = engine.type_methods(ty).unwrap();
    assert_eq!(methods.len(), 2);
    let names: Vec<String> = methods
        .iter()
        .map(|m| engine.member_name(*m).unwrap())
        .collect();
    assert!(names.contains(&"shift".to_string()));
    assert!(names.contains(&"add".to_string()));

    let fields = engine.type_fields(ty).unwrap();
    assert_eq!(fields.len(), 2);

    let sig = engine
        .member_signature(engine.find_method(ty, "add").unwrap())
        .unwrap();
    assert_eq!(sig.ret, Tag::I32);
    assert_eq!(sig.arity(), 2);
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn construct_set_get_and_field_address() {
    let engine = engine();
    let (_, ty) = load_player(&engine);

    let token = engine
        .construct(ty, false, &mut [Value::I32(0)])
        .expect("construct");
    engine.set_field(token, "x", &Value::I32(42)).unwrap();
    assert_eq!(engine.get_field(token, "x").unwrap(), Value::I32(42));

    let a = engine.field_address(token, "x").unwrap();
    let b = engine.field_address(token, "x").unwrap();
    assert_eq!(a, b, "field address must be stable for a live object");
    let base = engine.field_address(token, "x").unwrap();
    let name_addr = engine.field_address(token, "name").unwrap();
    assert!(name_addr > base);

    engine.destroy_object(token).unwrap();
    assert!(engine.get_field(token, "x").is_err());
}

#[test]
fn constructor_runs_with_arguments() {
    let engine = engine();
    let (_, ty) = load_player(&engine);
    let token = engine
        .construct(ty, false, &mut [Value::I32(9)])
        .expect("construct");
    assert_eq!(engine.get_field(token, "x").unwrap(), Value::I32(9));
    engine.destroy_object(token).unwrap();
}

#[test]
fn subtype_constructs_through_base_constructor() {
    let engine = engine();
    let base = TypeDef::new("Shape").with_field("sides", Tag::I32).with_ctor(
        Signature::of(&[Tag::I32], Tag::Void),
        ManagedFn::new(|frame| {
            let sides = frame.arg(0)?.clone();
            frame.set_field("sides", &sides)?;
            Ok(())
        }),
    );
    let sub = TypeDef::new("Square")
        .with_base("Shape")
        .with_field("side_len", Tag::F32);
    engine.provide_unit(
        UnitDefinition::new("shapes")
            .with_type(base)
            .with_type(sub),
    );
    engine.load_module("shapes", false, true).unwrap();

    let square = engine.find_type("Square").unwrap();
    let token = engine
        .construct(square, false, &mut [Value::I32(4)])
        .expect("base constructor should apply");

    // The object is the requested subtype: its own field exists and the
    // inherited field was set by the base constructor.
    assert_eq!(engine.get_field(token, "sides").unwrap(), Value::I32(4));
    assert_eq!(engine.get_field(token, "side_len").unwrap(), Value::F32(0.0));

    let shape = engine.find_type("Shape").unwrap();
    assert!(engine.is_assignable(square, shape).unwrap());
    assert!(!engine.is_assignable(shape, square).unwrap());
}

#[test]
fn construct_without_matching_constructor_fails() {
    let engine = engine();
    let (_, ty) = load_player(&engine);
    let err = engine
        .construct(ty, false, &mut [Value::Str("wrong".into())])
        .unwrap_err();
    assert!(matches!(
        err,
        InteropError::Invoke(InvokeError::NoSuitableConstructor { .. })
    ));
}

#[test]
fn weak_object_is_collected() {
    let engine = engine();
    let (_, ty) = load_player(&engine);
    let token = engine.construct(ty, true, &mut [Value::I32(1)]).unwrap();
    assert!(!token.is_strong());
    assert_eq!(engine.get_field(token, "x").unwrap(), Value::I32(1));
    assert!(engine.collect() >= 1);
    assert!(engine.get_field(token, "x").is_err());
}

// ============================================================================
// Invocation
// ============================================================================

#[test]
fn instance_method_reads_and_writes_fields() {
    let engine = engine();
    let (_, ty) = load_player(&engine);
    let token = engine.construct(ty, false, &mut [Value::I32(10)]).unwrap();
    let shift = engine.find_method(ty, "shift").unwrap();

    let ret = engine
        .invoke_method(Some(token), shift, &mut [Value::I32(5)])
        .unwrap();
    assert_eq!(ret, Value::I32(15));
    assert_eq!(engine.get_field(token, "x").unwrap(), Value::I32(15));
    engine.destroy_object(token).unwrap();
}

#[test]
fn static_method_needs_no_target() {
    let engine = engine();
    let (_, ty) = load_player(&engine);
    let add = engine.find_method(ty, "add").unwrap();
    let ret = engine
        .invoke_method(None, add, &mut [Value::I32(40), Value::I32(2)])
        .unwrap();
    assert_eq!(ret, Value::I32(42));
}

#[test]
fn instance_call_on_null_target_is_an_error() {
    let engine = engine();
    let (_, ty) = load_player(&engine);
    let shift = engine.find_method(ty, "shift").unwrap();
    let err = engine
        .invoke_method(None, shift, &mut [Value::I32(1)])
        .unwrap_err();
    assert!(matches!(err, InteropError::Invoke(InvokeError::NullTarget)));
}

#[test]
fn module_callable_invokes_by_handle() {
    let engine = engine();
    load_player(&engine);
    let handle = engine.find_callable("magnitude").unwrap();
    let ret = engine
        .invoke_callable(handle, &mut [Value::F64(-3.5)])
        .unwrap();
    assert_eq!(ret, Value::F64(3.5));
}

// ============================================================================
// Module lifecycle
// ============================================================================

#[test]
fn load_name_unload_scenario() {
    let engine = engine();
    engine.provide_unit(UnitDefinition::new("pluginA"));
    let id = engine
        .load_module("pluginA", true, true)
        .expect("load pluginA");
    assert_ne!(id.raw(), 0);
    assert_eq!(engine.last_load_status(), LoadStatus::Ok);
    assert_eq!(engine.module_name(id).unwrap(), "pluginA");

    engine.unload_module(id).expect("unload pluginA");
    assert!(engine.module_name(id).is_err());
}

#[test]
fn load_failures_are_distinguishable() {
    let engine = engine();

    assert!(engine.load_module("", false, true).is_err());
    assert_eq!(engine.last_load_status(), LoadStatus::InvalidPath);

    assert!(engine.load_module("missing_unit", false, true).is_err());
    assert_eq!(engine.last_load_status(), LoadStatus::FileNotFound);

    engine.provide_unit(
        UnitDefinition::new("broken")
            .with_type(TypeDef::new("Orphan").with_base("NoSuchBase")),
    );
    assert!(engine.load_module("broken", false, true).is_err());
    assert_eq!(engine.last_load_status(), LoadStatus::InvalidFormat);
}

#[test]
fn remove_extension_strips_the_suffix() {
    let engine = engine();
    engine.provide_unit(UnitDefinition::new("pluginB"));
    let id = engine
        .load_module("plugins/pluginB.unit", true, true)
        .expect("load");
    assert_eq!(engine.module_name(id).unwrap(), "pluginB");
}

#[test]
fn non_collectible_module_refuses_unload() {
    let engine = engine();
    engine.provide_unit(UnitDefinition::new("pinned"));
    let id = engine.load_module("pinned", false, false).unwrap();
    assert!(matches!(
        engine.unload_module(id),
        Err(UnloadError::NotCollectible(_))
    ));
    assert_eq!(engine.module_name(id).unwrap(), "pinned");
}

#[test]
fn shared_dependencies_resolve_against_loaded_set() {
    let engine = engine();
    engine.provide_unit(UnitDefinition::new("base_lib"));
    engine.provide_unit(UnitDefinition::new("consumer").with_dependency("base_lib"));

    let base = engine.load_module("base_lib", false, true).unwrap();
    let consumer = engine.load_module("consumer", false, true).unwrap();

    // base_lib stays owned by its own module, not duplicated.
    let record_name = engine.module_name(base).unwrap();
    assert_eq!(record_name, "base_lib");
    assert_eq!(engine.module_name(consumer).unwrap(), "consumer");
}

#[test]
fn unload_with_pinned_object_fails_within_deadline_and_is_retryable() {
    let engine = engine();
    let (id, ty) = load_player(&engine);
    let token = engine.construct(ty, false, &mut [Value::I32(1)]).unwrap();

    assert!(engine.pin_object(token));
    let started = Instant::now();
    let result = engine.unload_module(id);
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(UnloadError::TimedOut { .. })));
    assert!(elapsed.as_millis() >= 900, "timed out too early: {elapsed:?}");
    assert!(elapsed.as_millis() < 2500, "timed out too late: {elapsed:?}");

    // The module stays loaded and resolvable.
    assert_eq!(engine.module_name(id).unwrap(), "player");
    assert!(engine.find_type("Player").is_ok());

    // Releasing the external pin makes the retry succeed.
    engine.unpin_object(token);
    engine.unload_module(id).expect("retry after unpin");
    assert!(engine.module_name(id).is_err());
}

#[test]
fn unload_releases_leaked_strong_tokens_with_a_diagnostic() {
    let engine = engine();
    let (id, ty) = load_player(&engine);
    let _leaked = engine.construct(ty, false, &mut [Value::I32(1)]).unwrap();

    DiagnosticSink::drain();
    engine.unload_module(id).expect("unload");
    let diagnostics = DiagnosticSink::drain();
    assert!(
        diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::Warning && d.message.contains("leaked")),
        "expected a leaked-token warning, got {diagnostics:?}"
    );
}

// ============================================================================
// Forward trampoline
// ============================================================================

/// Native target with a direct-bindable signature.
unsafe extern "C" fn native_mul(a: u64, b: u64) -> u64 {
    a * b
}

#[test]
fn direct_bind_fast_path_calls_word_scalars() {
    let engine = engine();
    let sig = Signature::of(&[Tag::U64, Tag::U64], Tag::U64);
    let parts = RawParts {
        entry: native_mul as usize,
        ctx: 0,
    };
    let ret = engine
        .call_native(parts, &sig, &mut [Value::U64(6), Value::U64(7)])
        .unwrap();
    assert_eq!(ret, Value::U64(42));
}

/// Native (int32, string) -> string target following the boundary's
/// hidden-return convention: the out slot comes first, then the real
/// parameters; string values are host string handles.
unsafe extern "C" fn native_concat(out: *mut *mut c_void, n: i32, s: *mut c_void) {
    let mut buf = [0u8; 64];
    let len = unsafe { reference_host::string_read(s, buf.as_mut_ptr(), buf.len()) };
    let text = format!("{}{}", String::from_utf8_lossy(&buf[..len]), n);
    let handle = unsafe { reference_host::string_construct(text.as_ptr(), text.len()) };
    unsafe { out.write(handle) };
}

#[test]
fn forward_trampoline_marshals_string_args_and_frees_scratch_once() {
    let engine = engine();
    let sig = Signature::of(&[Tag::I32, Tag::Str], Tag::Str);
    let parts = RawParts {
        entry: native_concat as usize,
        ctx: 0,
    };

    let before = reference_host::live_strings();
    let ret = engine
        .call_native(parts, &sig, &mut [Value::I32(7), Value::Str("x".into())])
        .unwrap();
    assert_eq!(ret, Value::Str("x7".into()));
    assert_eq!(
        reference_host::live_strings(),
        before,
        "argument scratch and the returned cell must each be freed exactly once"
    );
}

/// Native target mutating a by-ref int32.
unsafe extern "C" fn native_double_in_place(slot: *mut i32) {
    unsafe { *slot *= 2 };
}

#[test]
fn by_ref_parameters_are_pulled_back() {
    let engine = engine();
    let sig = Signature::new(vec![Param::by_ref(Tag::I32)], Tag::Void);
    let parts = RawParts {
        entry: native_double_in_place as usize,
        ctx: 0,
    };
    let mut args = [Value::I32(21)];
    engine.call_native(parts, &sig, &mut args).unwrap();
    assert_eq!(args[0], Value::I32(42));
}

// ============================================================================
// Reverse trampoline
// ============================================================================

#[test]
fn managed_callable_round_trips_through_the_wire_form() {
    let engine = engine();
    let bindings = engine.bindings_snapshot();
    let sum = Callable::new(
        0x5eed,
        Signature::of(&[Tag::I32, Tag::I32], Tag::I64),
        |args| {
            let (a, b) = match (&args[0], &args[1]) {
                (Value::I32(a), Value::I32(b)) => (*a, *b),
                _ => (0, 0),
            };
            Ok(Value::I64(i64::from(a) + i64::from(b)))
        },
    );

    // Encode to the wire descriptor native code would receive, then
    // decode it back and call through the shim pool.
    let mut slot = [0u8; 8];
    let owned = engine
        .codec()
        .encode(
            &bindings,
            &Value::Function(sum),
            Tag::Function,
            slot.as_mut_ptr(),
        )
        .unwrap()
        .expect("function encode allocates a descriptor");

    let decoded = engine
        .codec()
        .decode(&bindings, slot.as_ptr(), Tag::Function)
        .unwrap();
    let Value::Function(callable) = decoded else {
        panic!("expected a callable, got {decoded:?}");
    };
    let ret = callable
        .invoke(&mut [Value::I32(40), Value::I32(2)])
        .unwrap();
    assert_eq!(ret, Value::I64(42));

    engine.codec().release(&bindings, owned);
}

// ============================================================================
// Properties, attributes and enums
// ============================================================================

fn gauge_unit() -> UnitDefinition {
    let ty = TypeDef::new("Gauge")
        .with_field("raw", Tag::F32)
        .with_property(
            "level",
            Tag::F32,
            Some(ManagedFn::new(|frame| {
                let raw = frame.get_field("raw")?;
                frame.set_ret(raw);
                Ok(())
            })),
            Some(ManagedFn::new(|frame| {
                let value = frame.arg(0)?.clone();
                frame.set_field("raw", &value)?;
                Ok(())
            })),
        )
        .with_attribute(
            AttributeDef::new("Range")
                .with_value("min", Value::F32(0.0))
                .with_value("max", Value::F32(100.0)),
        );
    UnitDefinition::new("gauge").with_type(ty)
}

#[test]
fn property_get_set_through_accessors() {
    let engine = engine();
    engine.provide_unit(gauge_unit());
    engine.load_module("gauge", false, true).unwrap();
    let ty = engine.find_type("Gauge").unwrap();
    let token = engine.construct(ty, false, &mut []).unwrap();

    engine
        .set_property(token, "level", Value::F32(61.5))
        .unwrap();
    assert_eq!(
        engine.get_property(token, "level").unwrap(),
        Value::F32(61.5)
    );
    assert_eq!(engine.get_field(token, "raw").unwrap(), Value::F32(61.5));
}

#[test]
fn attribute_values_are_queryable() {
    let engine = engine();
    engine.provide_unit(gauge_unit());
    engine.load_module("gauge", false, true).unwrap();
    let ty = engine.find_type("Gauge").unwrap();

    let attributes = engine.type_attributes(ty).unwrap();
    assert_eq!(attributes.len(), 1);
    assert_eq!(engine.member_name(attributes[0]).unwrap(), "Range");
    assert_eq!(
        engine.attribute_value(attributes[0], "max").unwrap(),
        Value::F32(100.0)
    );
    assert!(engine.attribute_value(attributes[0], "missing").is_err());
}

#[test]
fn enum_entries_define_and_query() {
    let engine = engine();
    engine.provide_unit(
        UnitDefinition::new("colors").with_type(TypeDef::new("Color").with_enum(
            Tag::I32,
            vec![("Red".into(), 0), ("Green".into(), 1), ("Blue".into(), 2)],
        )),
    );
    engine.load_module("colors", false, true).unwrap();
    let ty = engine.find_type("Color").unwrap();

    assert!(engine.type_traits(ty).unwrap().contains(TypeTraits::ENUM));
    let (names, values) = engine.enum_entries(ty).unwrap();
    assert_eq!(names, vec!["Red", "Green", "Blue"]);
    assert_eq!(values, vec![0, 1, 2]);

    engine
        .define_enum(ty, Tag::I32, vec![("Cyan".into(), 7)])
        .unwrap();
    let (names, values) = engine.enum_entries(ty).unwrap();
    assert_eq!(names, vec!["Cyan"]);
    assert_eq!(values, vec![7]);
}

// ============================================================================
// Boundary entry points
// ============================================================================

mod boundary {
    use super::*;
    use std::ffi::CString;
    use tether::boundary::*;

    fn global_with_host() -> &'static Arc<Engine> {
        let engine = Engine::global();
        engine.install_reference_host();
        engine
    }

    #[test]
    fn load_query_unload_through_the_boundary() {
        let engine = global_with_host();
        engine.provide_unit(player_unit());

        let path = CString::new("player").unwrap();
        let id = unsafe { tether_load_module(path.as_ptr(), 0, 1) };
        assert_ne!(id, 0);
        assert_eq!(tether_last_load_status(), 0);

        let mut name = [0u8; 32];
        let len = tether_module_name(id, name.as_mut_ptr(), name.len());
        assert_eq!(&name[..len as usize], b"player");

        let ty_name = CString::new("Player").unwrap();
        let ty = unsafe { tether_type_find(ty_name.as_ptr()) };
        assert_ne!(ty, 0);
        assert!(tether_type_size(ty) >= 12);

        let method_name = CString::new("add").unwrap();
        let method = unsafe { tether_method_find(ty, method_name.as_ptr()) };
        assert_ne!(method, 0);

        // Static invoke through word slots: (40, 2) -> 42.
        let args: [u64; 2] = [40, 2];
        let mut ret = [0u8; 8];
        let ok = tether_invoke_method_ret(
            0,
            method,
            args.as_ptr() as *const u8,
            2,
            ret.as_mut_ptr(),
        );
        assert_eq!(ok, 1);
        assert_eq!(i32::from_ne_bytes(ret[..4].try_into().unwrap()), 42);

        assert_eq!(tether_unload_module(id), 1);
        let len = tether_module_name(id, name.as_mut_ptr(), name.len());
        assert_eq!(len, -1, "unloaded module name must report an error");
    }

    #[test]
    fn construct_through_boxed_any_arguments() {
        let engine = global_with_host();
        engine.provide_unit(
            UnitDefinition::new("boxed").with_type(
                TypeDef::new("Boxed").with_field("x", Tag::I32).with_ctor(
                    Signature::of(&[Tag::I32], Tag::Void),
                    ManagedFn::new(|frame| {
                        let x = frame.arg(0)?.clone();
                        frame.set_field("x", &x)?;
                        Ok(())
                    }),
                ),
            ),
        );
        let path = CString::new("boxed").unwrap();
        let id = unsafe { tether_load_module(path.as_ptr(), 0, 1) };
        assert_ne!(id, 0);

        let ty_name = CString::new("Boxed").unwrap();
        let ty = unsafe { tether_type_find(ty_name.as_ptr()) };

        // The argument kind selects the constructor, so it crosses boxed.
        let value = 42i32.to_ne_bytes();
        let boxed =
            unsafe { reference_host::box_construct(u32::from(Tag::I32), value.as_ptr()) };
        let args = [boxed];
        let token = unsafe { tether_object_construct(ty, 0, args.as_ptr(), 1) };
        assert_ne!(token, 0);
        unsafe { reference_host::box_destroy(boxed) };

        let field = CString::new("x").unwrap();
        let mut out = [0u8; 8];
        assert_eq!(
            unsafe { tether_field_get(token, field.as_ptr(), out.as_mut_ptr()) },
            1
        );
        assert_eq!(i32::from_ne_bytes(out[..4].try_into().unwrap()), 42);

        assert_eq!(tether_object_destroy(token), 1);
        assert_eq!(tether_unload_module(id), 1);
    }

    #[test]
    fn boundary_failures_return_neutral_values() {
        let _ = global_with_host();
        assert_eq!(tether_unload_module(u64::MAX), 0);
        assert_eq!(tether_type_name(u64::MAX, std::ptr::null_mut(), 0), -1);
        let bad = CString::new("NoSuchType").unwrap();
        assert_eq!(unsafe { tether_type_find(bad.as_ptr()) }, 0);
        assert_eq!(tether_tag_element(u32::from(Tag::I32Array)), u32::from(Tag::I32));
        assert_eq!(tether_tag_element(9999), 0);
    }
}
