use damds::bofz::BoundMatrix;
use damds::linalg::{WeightedLaplacian, inner_product, multiply};
use damds::parallel::{Communicator, LocalWorld, ParallelContext, SelfComm};
use damds::shared::{DistanceBlock, Quantizer, WeightMatrix};
use damds::stress::StressEvaluator;
use damds::timing::{NoopTimer, Phase};
use damds::ProcessLayout;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;

const POINTS: usize = 23;
const WIDTH: usize = 3;

/// Everything a rank computes from one configuration.
#[derive(Debug, Clone)]
struct Products {
    laplacian: Vec<f64>,
    bound: Vec<f64>,
    inner: f64,
    stress: f64,
}

fn dissimilarities(seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let coords: Vec<f64> = (0..POINTS * 4).map(|_| rng.gen_range(0.0..1.0)).collect();
    let mut delta = Array2::from_shape_fn((POINTS, POINTS), |(i, j)| {
        (0..4)
            .map(|k| (coords[i * 4 + k] - coords[j * 4 + k]).powi(2))
            .sum::<f64>()
            .sqrt()
    });
    // A few missing pairs, kept symmetric.
    for (i, j) in [(0, 5), (3, 17), (11, 12)] {
        delta[[i, j]] = -1.0;
        delta[[j, i]] = -1.0;
    }
    delta
}

fn configuration(seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..POINTS * WIDTH).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn compute(comm: Box<dyn Communicator>, layout: &ProcessLayout) -> Products {
    let ctx = ParallelContext::from_layout(comm, POINTS, POINTS * WIDTH, layout, "invariance").unwrap();
    let delta = dissimilarities(3);
    let x = configuration(9);
    let distances = DistanceBlock::from_matrix(delta.view(), ctx.process_rows(), Quantizer::new(2.0), None);
    let weights = WeightMatrix::Uniform(1.0);
    let timer = NoopTimer;

    let kernel = WeightedLaplacian::new(&distances, &weights, 5);
    let mut laplacian = vec![0.0; POINTS * WIDTH];
    multiply(&ctx, &kernel, &x, WIDTH, &mut laplacian, Phase::CgMultiply, &timer).unwrap();

    let mut matrix = BoundMatrix::new(ctx.process_rows(), POINTS, 4);
    matrix.build(&ctx, &distances, &weights, &x, WIDTH, 0.05, &timer);
    let mut bound = vec![0.0; POINTS * WIDTH];
    multiply(&ctx, &matrix, &x, WIDTH, &mut bound, Phase::BofZMultiply, &timer).unwrap();

    let inner = inner_product(&ctx, &x, &laplacian, WIDTH, &timer).unwrap();
    let evaluator = StressEvaluator::new(&ctx, &distances, &weights).unwrap();
    let stress = evaluator.evaluate(&ctx, &x, WIDTH, 0.05, &timer).unwrap();
    ctx.barrier().unwrap();

    Products {
        laplacian,
        bound,
        inner,
        stress,
    }
}

/// Runs every rank of `layout` and returns what each of them computed.
fn run_layout(layout: &ProcessLayout) -> Vec<Products> {
    if layout.process_count == 1 {
        return vec![compute(Box::new(SelfComm), layout)];
    }
    thread::scope(|scope| {
        let handles: Vec<_> = LocalWorld::create(layout.process_count)
            .into_iter()
            .map(|comm| scope.spawn(move || compute(Box::new(comm), layout)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn assert_close(a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let scale = x.abs().max(y.abs()).max(1.0);
        assert!((x - y).abs() <= 1e-10 * scale, "entry {i}: {x} vs {y}");
    }
}

fn assert_same(reference: &Products, other: &Products) {
    assert_close(&reference.laplacian, &other.laplacian);
    assert_close(&reference.bound, &other.bound);
    assert_close(&[reference.inner], &[other.inner]);
    assert_close(&[reference.stress], &[other.stress]);
}

#[test]
fn products_do_not_depend_on_the_decomposition() {
    let reference = run_layout(&ProcessLayout::single_process(1)).remove(0);

    let layouts = [
        ProcessLayout::single_process(4),
        ProcessLayout::spread(2, 1, 2).unwrap(),
        ProcessLayout::spread(3, 1, 1).unwrap(),
        ProcessLayout::spread(4, 2, 3).unwrap(),
    ];
    for layout in &layouts {
        let results = run_layout(layout);
        assert_eq!(results.len(), layout.process_count);
        for products in &results {
            assert_same(&reference, products);
        }
    }
}

#[test]
fn communicating_groups_reduce_to_the_same_values() {
    let dir = tempfile::tempdir().unwrap();
    let reference = run_layout(&ProcessLayout::spread(4, 1, 2).unwrap()).remove(0);
    let grouped = ProcessLayout {
        groups_per_node: 2,
        scratch_dir: Some(dir.path().to_path_buf()),
        ..ProcessLayout::spread(4, 1, 2).unwrap()
    };
    for products in run_layout(&grouped) {
        assert_same(&reference, &products);
    }
}

#[test]
fn every_rank_holds_the_replicated_result() {
    let results = run_layout(&ProcessLayout::spread(3, 1, 2).unwrap());
    for products in &results[1..] {
        assert_eq!(products.laplacian, results[0].laplacian);
        assert_eq!(products.bound, results[0].bound);
        assert_eq!(products.inner, results[0].inner);
        assert_eq!(products.stress, results[0].stress);
    }
}
