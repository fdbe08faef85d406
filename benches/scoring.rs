use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use das_sim::core::operations::scoring::{rank, CandidateProfile};
use das_sim::core::operations::{OperationContext, RandomSamplingOperation, SamplingOperation};
use das_sim::core::{DasConfig, GridBlock, Neighbour, SearchTable};
use das_sim::types::{KeyspaceExt, PeerId, U256};
use das_sim::{Config, Simulation};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

fn profiles(count: usize, rng: &mut ChaCha8Rng) -> Vec<CandidateProfile> {
    (0..count)
        .map(|i| CandidateProfile {
            peer: PeerId::from(i as u64),
            ancestors: (0..rng.gen_range(0..8))
                .map(|_| PeerId::from(rng.gen_range(0..64u64)))
                .collect::<HashSet<_>>(),
            rating: rng.gen_range(0.0..1.0),
        })
        .collect()
}

/// Benchmark candidate ranking
fn bench_rank(c: &mut Criterion) {
    let mut group = c.benchmark_group("rank");
    let mut rng = ChaCha8Rng::seed_from_u64(1);

    for count in &[16, 64, 256] {
        let candidates = profiles(*count, &mut rng);

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &candidates, |b, candidates| {
            b.iter(|| rank(black_box(candidates), 0.5, 0.5));
        });
    }

    group.finish();
}

/// Benchmark one selection round against a populated search table
fn bench_select_targets(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_targets");
    let config = DasConfig::default();
    let max_key = U256::keyspace_max(32).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(2);

    for peers in &[100usize, 1_000] {
        let block = GridBlock::new(1, 32, max_key, *peers).unwrap();
        let mut table = SearchTable::new(U256::random_key(&mut rng, &max_key), max_key, &config);
        for _ in 0..*peers {
            let id = U256::random_key(&mut rng, &max_key);
            table.add_neighbour(Neighbour::new(id, 0, false), None);
            table.add_nodes(&[id]);
        }

        let ctx = OperationContext {
            id: 1,
            src: PeerId::zero(),
            start: 0,
            validator: false,
            num_validators: peers / 4,
        };

        group.bench_function(BenchmarkId::from_parameter(peers), |b| {
            b.iter(|| {
                let mut op = RandomSamplingOperation::new(ctx, &block, &config, &mut rng);
                black_box(op.do_sampling(&mut table))
            });
        });
    }

    group.finish();
}

/// Benchmark a whole small simulation
fn bench_simulation(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulation");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));

    group.bench_function("small", |b| {
        b.iter(|| {
            let config = Config::for_scenario("small").unwrap();
            let cancel = AtomicBool::new(false);
            black_box(Simulation::new(config).unwrap().run(&cancel))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_rank, bench_select_targets, bench_simulation);
criterion_main!(benches);
