//! Manual benchmark driver: median-of-samples timing with GB/s output.
//!
//! Run with `cargo bench --bench transpose`. Includes a thread-scaling
//! table over the 6-D tensor-contraction shape; speedup should grow
//! close to linearly through 4 threads on most machines.

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::hint::black_box;
use std::time::{Duration, Instant};
use strided_transpose::{create_plan, SelectionMethod};

fn median(samples: &mut [Duration]) -> Duration {
    samples.sort();
    let n = samples.len();
    if n % 2 == 1 {
        samples[n / 2]
    } else {
        (samples[n / 2 - 1] + samples[n / 2]) / 2
    }
}

fn bench_n(label: &str, warmup: usize, iters: usize, bytes: usize, mut f: impl FnMut()) -> Duration {
    for _ in 0..warmup {
        f();
    }
    let mut samples = Vec::with_capacity(iters);
    for _ in 0..iters {
        let t0 = Instant::now();
        f();
        samples.push(t0.elapsed());
    }
    let med = median(&mut samples);
    let ms = med.as_secs_f64() * 1e3;
    let gbps = (bytes as f64) / med.as_secs_f64() / 1e9;
    println!("  {label:44} {ms:9.3} ms  {gbps:7.2} GB/s");
    med
}

fn random_f32(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.sample(StandardNormal)).collect()
}

fn run_shape(label: &str, size: &[usize], perm: &[usize], threads: usize, method: SelectionMethod) -> Duration {
    let total: usize = size.iter().product();
    let a = random_f32(total, 42);
    let mut b = vec![0.0f32; total];
    let mut plan = create_plan(
        perm, size, 1.0f32, &a, None, 0.0f32, &mut b, None, method, threads,
    )
    .unwrap();
    // read A once, write B once
    let bytes = 2 * total * std::mem::size_of::<f32>();
    let med = bench_n(label, 2, 9, bytes, || {
        plan.execute();
    });
    drop(plan);
    black_box(&b);
    med
}

fn main() {
    println!("single-thread shapes (Estimate):");
    run_shape("2d 4096x4096 transpose", &[4096, 4096], &[1, 0], 1, SelectionMethod::Estimate);
    run_shape(
        "3d 256^3 rotate (2,0,1)",
        &[256, 256, 256],
        &[2, 0, 1],
        1,
        SelectionMethod::Estimate,
    );
    run_shape(
        "4d 64^4 reverse",
        &[64, 64, 64, 64],
        &[3, 2, 1, 0],
        1,
        SelectionMethod::Estimate,
    );
    run_shape(
        "identity copy 16M",
        &[4096, 4096],
        &[0, 1],
        1,
        SelectionMethod::Estimate,
    );

    println!("plan quality (Measure vs Estimate, 4 threads):");
    run_shape(
        "4d 48x28x48x28 (3,0,2,1) estimate",
        &[48, 28, 48, 28],
        &[3, 0, 2, 1],
        4,
        SelectionMethod::Estimate,
    );
    run_shape(
        "4d 48x28x48x28 (3,0,2,1) measure",
        &[48, 28, 48, 28],
        &[3, 0, 2, 1],
        4,
        SelectionMethod::Measure,
    );

    println!("thread scaling, 6d 16^6 perm (5,2,0,4,1,3):");
    let size = [16usize; 6];
    let perm = [5usize, 2, 0, 4, 1, 3];
    let t1 = run_shape("  1 thread", &size, &perm, 1, SelectionMethod::Estimate);
    for t in [2usize, 4, 8] {
        let tt = run_shape(&format!("  {t} threads"), &size, &perm, t, SelectionMethod::Estimate);
        let speedup = t1.as_secs_f64() / tt.as_secs_f64();
        println!("    speedup vs 1 thread: {speedup:5.2}x");
    }
}
