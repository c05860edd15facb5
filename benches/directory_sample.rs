use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, SeedableRng};
use seedmesh::address::Address;
use seedmesh::config::SeedConfig;
use seedmesh::directory::{PeerDirectory, DEFAULT_MAX_SAMPLE};
use seedmesh::seed::SeedCoordinator;
use tokio::runtime::Builder;

fn directory_of(size: u16) -> PeerDirectory {
    let mut directory = PeerDirectory::new();
    directory.merge((0..size).map(|i| Address::new("10.0.0.1", 10_000 + i)));
    directory
}

fn sample_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("PeerDirectory");

    for size in [10u16, 100, 1_000] {
        let directory = directory_of(size);
        let mut rng = StdRng::seed_from_u64(7);
        group.bench_with_input(BenchmarkId::new("sample", size), &directory, |b, directory| {
            b.iter(|| directory.sample(DEFAULT_MAX_SAMPLE, &mut rng));
        });

        let exclude = Address::new("10.0.0.1", 10_000);
        group.bench_with_input(
            BenchmarkId::new("snapshot_excluding", size),
            &directory,
            |b, directory| {
                b.iter(|| directory.snapshot_excluding(&exclude));
            },
        );
    }

    group.finish();
}

fn seed_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("SeedCoordinator");

    group.bench_function("register", |b| {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        let seed = rt.block_on(async {
            let seed = SeedCoordinator::start(SeedConfig::new(Address::new("127.0.0.1", 0)))
                .await
                .unwrap();
            for i in 0..100 {
                seed.register(Address::new("10.0.0.1", 10_000 + i)).await.unwrap();
            }
            seed
        });
        let _guard = rt.enter();
        b.to_async(&rt).iter(|| async {
            seed.register(Address::new("10.0.0.1", 10_000)).await.unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, sample_benchmarks, seed_benchmarks);
criterion_main!(benches);
