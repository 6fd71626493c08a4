//! Compiled-program evaluation benchmarks.
//!
//! Compares bytecode programs against hand-written Rust closures over the
//! same expressions, for both the scalar and the lane-vector interpreters,
//! and measures end-to-end compilation time. Compilation is excluded from
//! the evaluation measurements: programs are compiled once during setup.
//!
//! Run with: `cargo bench --bench programs`

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use exprvm::{Compiler, Program, Real, Vector, COS, SIN};

/// Hand-written baselines for the benchmarked expressions.
struct DirectEvaluator;

impl DirectEvaluator {
    /// Evaluates: 2.2*x + 1.1
    fn linear(x: Real) -> Real {
        2.2 * x + 1.1
    }

    /// Evaluates: (x+1)*(x+1)*(x+1)*(x+1)
    fn quartic(x: Real) -> Real {
        let s = x + 1.0;
        let p = s * s;
        p * p
    }

    /// Evaluates: sin(x)*sin(x) + cos(x)*cos(x) + x*sin(x)
    fn trigonometric(x: Real) -> Real {
        x.sin() * x.sin() + x.cos() * x.cos() + x * x.sin()
    }
}

const SCRIPTS: &[(&str, &str, fn(Real) -> Real)] = &[
    (
        "linear",
        "input x\noutput y = 2.2*x + 1.1",
        DirectEvaluator::linear,
    ),
    (
        "quartic",
        "input x\noutput y = (x+1)*(x+1)*(x+1)*(x+1)",
        DirectEvaluator::quartic,
    ),
    (
        "trigonometric",
        "input x\noutput y = sin(x)*sin(x) + cos(x)*cos(x) + x*sin(x)",
        DirectEvaluator::trigonometric,
    ),
];

fn compile(script: &str) -> Program {
    let mut compiler = Compiler::new();
    compiler.add_function("sin", SIN).unwrap();
    compiler.add_function("cos", COS).unwrap();
    compiler.add_source_script(script).unwrap();
    compiler.compile().unwrap()
}

fn benchmark_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluation");
    for (name, script, direct) in SCRIPTS {
        let program = compile(script);
        let x = program.input_address("x").unwrap();
        let y = program.output_address("y").unwrap();

        group.bench_with_input(BenchmarkId::new("direct", name), &0.7, |b, &point| {
            b.iter(|| direct(black_box(point)))
        });

        let mut scalar = program.make_scalar_executable();
        group.bench_with_input(BenchmarkId::new("scalar", name), &0.7, |b, &point| {
            b.iter(|| {
                scalar.write(x, black_box(point));
                scalar.run();
                scalar.read(y)
            })
        });

        let mut vector = program.make_vector_executable();
        let lanes = Vector::new([0.7, 0.701, 0.702, 0.703]);
        group.bench_with_input(BenchmarkId::new("vector", name), &lanes, |b, &point| {
            b.iter(|| {
                vector.write(x, black_box(point));
                vector.run();
                vector.read(y)
            })
        });
    }
    group.finish();
}

fn benchmark_compilation(c: &mut Criterion) {
    let mut group = c.benchmark_group("compilation");
    for (name, script, _) in SCRIPTS {
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| compile(black_box(script)))
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_evaluation, benchmark_compilation);
criterion_main!(benches);
