use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{ArrayD, IxDyn};
use rtorch_optim::optim::{create_optimizer, OptimizerOptions};
use rtorch_optim::tensor::Tensor;
use rtorch_optim::Optimizer;

fn layer(rows: usize, cols: usize) -> Vec<Tensor> {
    let weight = ArrayD::from_shape_fn(IxDyn(&[rows, cols]), |ix| ((ix[0] * cols + ix[1]) % 17) as f32 * 0.01);
    vec![Tensor::new(weight, true), Tensor::new(ArrayD::zeros(IxDyn(&[cols])), true)]
}

fn bench_step(c: &mut Criterion) {
    let cases = [
        ("adam", OptimizerOptions::new().with("lr", 1e-3)),
        ("spam", OptimizerOptions::new().with("lr", 1e-3).with("density", 0.25)),
        ("sgdsai", OptimizerOptions::new().with("lr", 1e-2)),
        ("tam", OptimizerOptions::new().with("lr", 1e-2)),
        ("adam", OptimizerOptions::new().with("lr", 1e-3).with("lookahead", true)),
        ("sgd", OptimizerOptions::new().with("lr", 1e-2).with("trac", true)),
        ("adamw", OptimizerOptions::new().with("lr", 1e-3).with("orthograd", true)),
    ];

    let mut group = c.benchmark_group("step_256x256");
    for (name, options) in cases {
        let wrappers: Vec<&str> = ["lookahead", "trac", "orthograd"]
            .into_iter()
            .filter(|w| options.get(w).is_some())
            .collect();
        let label = if wrappers.is_empty() { name.to_string() } else { format!("{name}+{}", wrappers.join("+")) };

        let params = layer(256, 256);
        let mut opt = create_optimizer(name, params.clone(), &options).expect("optimizer");
        for p in &params {
            p.set_grad(p.data().mapv(|w| w - 0.5));
        }
        group.bench_with_input(BenchmarkId::from_parameter(label), &(), |b, _| {
            b.iter(|| {
                opt.step().expect("step");
                black_box(&params);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_step);
criterion_main!(benches);
