//! # Derivation Pipeline Benchmark
//!
//! This benchmark measures the symbolic pipeline that turns transition rules into
//! noise statistics, starting from a freshly parsed model on every iteration so that
//! no cached stage is reused.
//!
//! ## Models
//!
//! - **Two species**: a conversion model `A + B -> A + A`, `A -> B` with a closed
//!   population, giving three second moments of the noise.
//! - **Three species**: an open chain `A -> B -> C` with influx into `A`, decay of
//!   `C` and an `A`-catalysed second step, giving six second moments of the noise.
//!
//! ## Stages Measured
//!
//! 1. **Mean-field ODEs**: parse, stoichiometry, Master equation and van Kampen
//!    expansion up to the leading-order equations.
//! 2. **Stationary noise**: the full pipeline through the linear Fokker-Planck
//!    equation and the exact solve of the moment equations.
//! 3. **Numeric system**: building an `OdeSystem` from the rule equations and
//!    integrating it with fixed-step RK4.

use std::collections::HashMap;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use mumot::Model;

const TWO_SPECIES: &str = "A + B -> A + A : k\nA -> B : g";

const THREE_SPECIES: &str = "\\emptyset -> A : a\n\
                             A -> B : b\n\
                             B + A -> C + A : c\n\
                             C -> \\emptyset : d";

fn benchmark_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Derivation Pipeline");

    for (name, rules) in [("two species", TWO_SPECIES), ("three species", THREE_SPECIES)] {
        group.bench_function(format!("mean-field ODEs, {name}"), |b| {
            b.iter(|| {
                let model = Model::parse(black_box(rules)).unwrap();
                black_box(model.odes_vke().unwrap().len());
            })
        });

        group.bench_function(format!("stationary noise, {name}"), |b| {
            b.iter(|| {
                let model = Model::parse(black_box(rules)).unwrap();
                black_box(model.noise_stationary().unwrap().second.len());
            })
        });
    }

    group.finish();
}

fn benchmark_numeric(c: &mut Criterion) {
    let model = Model::parse(THREE_SPECIES).unwrap();
    let parameters: HashMap<String, f64> = [("a", 1.0), ("b", 1.2), ("c", 0.8), ("d", 0.1)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    let system = model.ode_system(&parameters).unwrap();

    let mut group = c.benchmark_group("Numeric System");
    group.bench_function("RK4, three species", |b| {
        b.iter(|| {
            let evolution = system
                .integrate(black_box(&[0.3, 0.3, 0.4]), 50.0, 0.01)
                .unwrap();
            black_box(evolution.len());
        })
    });
    group.bench_function("Jacobian, three species", |b| {
        b.iter(|| black_box(system.jacobian(black_box(&[0.3, 0.3, 0.4])).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, benchmark_derivation, benchmark_numeric);
criterion_main!(benches);
