//! Performance benchmarks for the dispatch hot path: scalar marshaling,
//! cached-invoker method calls and direct-bound native calls.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};

use tether::prelude::*;
use tether_core::value::RawParts;

fn engine_with_player() -> (Arc<Engine>, Handle, Token) {
    let engine = Engine::new();
    engine.install_reference_host();
    engine.provide_unit(
        UnitDefinition::new("bench").with_type(
            TypeDef::new("Counter")
                .with_field("total", Tag::I64)
                .with_ctor(
                    Signature::of(&[], Tag::Void),
                    ManagedFn::new(|_| Ok(())),
                )
                .with_method(
                    "bump",
                    Signature::of(&[Tag::I64], Tag::I64),
                    false,
                    ManagedFn::new(|frame| {
                        let delta = match frame.arg(0)? {
                            Value::I64(v) => *v,
                            _ => 0,
                        };
                        let total = match frame.get_field("total")? {
                            Value::I64(v) => v,
                            _ => 0,
                        };
                        frame.set_field("total", &Value::I64(total + delta))?;
                        frame.set_ret(Value::I64(total + delta));
                        Ok(())
                    }),
                ),
        ),
    );
    engine.load_module("bench", false, false).expect("load");
    let ty = engine.find_type("Counter").expect("type");
    let token = engine.construct(ty, false, &mut []).expect("construct");
    (engine, ty, token)
}

fn bench_scalar_codec(c: &mut Criterion) {
    let engine = Engine::new();
    engine.install_reference_host();
    let bindings = engine.bindings_snapshot();
    let codec = engine.codec();
    let mut slot = [0u8; 8];

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(1));
    group.bench_function("scalar_round_trip", |b| {
        b.iter(|| {
            codec
                .encode(
                    &bindings,
                    black_box(&Value::I64(-123456789)),
                    Tag::I64,
                    slot.as_mut_ptr(),
                )
                .unwrap();
            black_box(codec.decode(&bindings, slot.as_ptr(), Tag::I64).unwrap())
        })
    });
    group.finish();
}

fn bench_method_invoke(c: &mut Criterion) {
    let (engine, ty, token) = engine_with_player();
    let bump = engine.find_method(ty, "bump").expect("method");

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));
    group.bench_function("cached_invoker_call", |b| {
        b.iter(|| {
            engine
                .invoke_method(Some(token), bump, &mut [black_box(Value::I64(1))])
                .unwrap()
        })
    });
    group.finish();
}

unsafe extern "C" fn native_add(a: u64, b: u64) -> u64 {
    a.wrapping_add(b)
}

fn bench_direct_bind(c: &mut Criterion) {
    let engine = Engine::new();
    engine.install_reference_host();
    let sig = Signature::of(&[Tag::U64, Tag::U64], Tag::U64);
    let parts = RawParts {
        entry: native_add as usize,
        ctx: 0,
    };

    let mut group = c.benchmark_group("trampoline");
    group.throughput(Throughput::Elements(1));
    group.bench_function("direct_bind_call", |b| {
        b.iter(|| {
            engine
                .call_native(
                    parts,
                    &sig,
                    &mut [black_box(Value::U64(40)), black_box(Value::U64(2))],
                )
                .unwrap()
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_scalar_codec,
    bench_method_invoke,
    bench_direct_bind
);
criterion_main!(benches);
