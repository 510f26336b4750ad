//! Throughput benchmarks for dispatch-table packing and bytecode emission.
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use bc_backend::config::BackendConfig;
use bc_backend::dispatch;
use bc_backend::image::{RecordingImage, RecordingSourceMap};
use bc_backend::ir::{Class, ClassRef, Expr, Literal, Method, MethodKind, MethodRef, Program, Shape};
use bc_backend::shape::{CallShape, PlainShape};

fn instance_shape(explicit_arity: usize) -> Shape {
    Shape::Plain(PlainShape::new(CallShape::positional(explicit_arity).with_implicit_this()))
}

fn static_shape(arity: usize) -> Shape {
    Shape::Plain(PlainShape::new(CallShape::positional(arity)))
}

/// A linear class chain `C0 <- C1 <- ... <- C{n-1}`, every class overriding
/// the same zero-arg selector `value`, plus one free function that invokes
/// it virtually on a parameter. Exercises row-displacement packing with a
/// single, deep row rather than many shallow ones.
fn chain_program(depth: usize) -> Program {
    let mut program = Program::default();

    for i in 0..depth {
        let mut class = Class::new(format!("C{i}"));
        class.is_instantiated = true;
        if i > 0 {
            class.super_class = Some(ClassRef(i - 1));
        }
        program.classes.push(class);
    }
    program.tree_roots = vec![ClassRef(0)];

    for i in 0..depth {
        let mut method = Method::new("value", MethodKind::Instance, instance_shape(0));
        method.holder = Some(ClassRef(i));
        method.body = Some(Expr::LiteralNode(Literal::Integer(i as i64)));
        program.methods.push(method);
        program.classes[i].methods.push(MethodRef(i));
    }

    let mut caller = Method::new("use_value", MethodKind::Static, static_shape(1));
    caller.body = Some(Expr::CallVirtual {
        selector_name: "value".into(),
        shape: CallShape::positional(0).with_implicit_this(),
        kind: bc_backend::emitter::InvokeVirtualKind::Normal,
        receiver: Box::new(Expr::ParameterRef(0)),
        args: Vec::new(),
    });
    program.methods.push(caller);
    program.entry_points.push(("use_value".to_string(), MethodRef(depth)));

    program
}

fn bench_dispatch_table_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_table_build");
    let config = BackendConfig::default();

    for depth in [8usize, 32, 128] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter_batched(
                || chain_program(depth),
                |mut program| dispatch::build(&mut program, &config.dispatch_table),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_full_driver_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("driver_run");
    let config = BackendConfig::default();

    for depth in [8usize, 32, 128] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter_batched(
                || chain_program(depth),
                |mut program| {
                    let mut image = RecordingImage::default();
                    let mut source_map = RecordingSourceMap::default();
                    bc_backend::driver::run(&mut program, &config, &mut image, &mut source_map).unwrap()
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dispatch_table_build, bench_full_driver_run);
criterion_main!(benches);
