//! Replay sampling and experience pipeline throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{Array1, Array2};
use pallas::experience::{AgentData, Experience};
use pallas::pipeline::{process_records, ExperienceTransform, ShapeRegime};
use pallas::replay_buffer::{ExperienceBuffer, ReplayBuffer};

fn record(i: usize, n_envs: usize) -> AgentData<Experience> {
    let v = i as f32;
    AgentData::Single(Experience::new(
        Array2::from_elem((n_envs, 8), v).into_dyn(),
        Array1::from_elem(n_envs, 1.0).into_dyn(),
        Array1::from_elem(n_envs, v * 0.1).into_dyn(),
        Array2::from_elem((n_envs, 8), v + 1.0).into_dyn(),
        Array1::zeros(n_envs).into_dyn(),
    ))
}

// Discounted reward as a stand-in for a regression target stage
fn target_stage() -> ExperienceTransform<f32, Experience> {
    ExperienceTransform::from_fn(0.99f32, |gamma, _seed, e: Experience| {
        let target = &e.reward + &(e.done.mapv(|d| 1.0 - d) * *gamma);
        Ok(e.with_extra("target", target))
    })
}

fn bench_replay_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay_sample");
    for &batch in &[32usize, 256] {
        let mut buffer = ReplayBuffer::new(10_000, 0);
        for i in 0..10_000 {
            buffer.add(record(i, 1));
        }
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| black_box(buffer.sample(batch).unwrap()))
        });
    }
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("experience_pipeline");
    let stages = [target_stage()];
    for &n_envs in &[1usize, 8] {
        let records: Vec<_> = (0..256).map(|i| record(i, n_envs)).collect();
        let regime = ShapeRegime::new(n_envs > 1, false);
        group.bench_with_input(BenchmarkId::new("envs", n_envs), &records, |b, records| {
            b.iter(|| black_box(process_records(&stages, regime, 7, records).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_replay_sampling, bench_pipeline);
criterion_main!(benches);
