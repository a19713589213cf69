use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use damds::ProcessLayout;
use damds::bofz::BoundMatrix;
use damds::linalg::{WeightedLaplacian, multiply};
use damds::parallel::{ParallelContext, SelfComm};
use damds::shared::{DistanceBlock, Quantizer, WeightMatrix};
use damds::timing::{NoopTimer, Phase};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

const WIDTH: usize = 3;

struct Problem {
    distances: DistanceBlock,
    x: Vec<f64>,
}

fn random_problem(points: usize) -> Problem {
    let mut rng = StdRng::seed_from_u64(0x5EED_D15 + points as u64);
    let coords: Array2<f64> = Array2::from_shape_fn((points, 8), |_| rng.sample(StandardNormal));
    let delta = Array2::from_shape_fn((points, points), |(i, j)| {
        let diff = &coords.row(i) - &coords.row(j);
        diff.dot(&diff).sqrt()
    });
    let largest = delta.iter().copied().fold(0.0, f64::max);
    let distances = DistanceBlock::from_matrix(delta.view(), 0..points, Quantizer::new(largest), None);
    let x = (0..points * WIDTH).map(|_| rng.gen_range(0.0..1.0)).collect();
    Problem { distances, x }
}

fn context(points: usize, threads: usize) -> ParallelContext {
    ParallelContext::from_layout(
        Box::new(SelfComm),
        points,
        points * WIDTH,
        &ProcessLayout::single_process(threads),
        "bench",
    )
    .unwrap()
}

fn benchmark_majorization(c: &mut Criterion) {
    let sizes = [256_usize, 1024];
    let threads = [1_usize, 4];
    let weights = WeightMatrix::Uniform(1.0);

    let mut group = c.benchmark_group("majorization");
    for &points in &sizes {
        let problem = random_problem(points);
        group.throughput(Throughput::Elements((points * points) as u64));
        for &thread_count in &threads {
            let ctx = context(points, thread_count);
            let label = format!("{points}x{thread_count}t");

            let mut bound = BoundMatrix::new(0..points, points, 64);
            group.bench_function(BenchmarkId::new("bofz_build", &label), |b| {
                b.iter(|| {
                    bound.build(&ctx, &problem.distances, &weights, black_box(&problem.x), WIDTH, 0.1, &NoopTimer);
                });
            });

            let mut out = vec![0.0; points * WIDTH];
            group.bench_function(BenchmarkId::new("bofz_multiply", &label), |b| {
                b.iter(|| {
                    multiply(&ctx, &bound, black_box(&problem.x), WIDTH, &mut out, Phase::BofZMultiply, &NoopTimer)
                        .unwrap();
                    black_box(&out);
                });
            });

            let laplacian = WeightedLaplacian::new(&problem.distances, &weights, 64);
            group.bench_function(BenchmarkId::new("laplacian_multiply", &label), |b| {
                b.iter(|| {
                    multiply(&ctx, &laplacian, black_box(&problem.x), WIDTH, &mut out, Phase::CgMultiply, &NoopTimer)
                        .unwrap();
                    black_box(&out);
                });
            });
        }
    }
    group.finish();
}

criterion_group!(majorization, benchmark_majorization);
criterion_main!(majorization);
