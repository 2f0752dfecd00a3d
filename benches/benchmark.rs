use control::Directory;
use criterion::*;
use dataplane::ip_pool::IpPool;

fn directory_benchmark(c: &mut Criterion) {
    let directory = Directory::new();
    for i in 0..256 {
        directory.register(&format!("coord-{i}"), "us", &format!("10.0.{i}.1:9000"), i as u32 % 50, 100);
    }

    let mut group = c.benchmark_group("directory");
    group.bench_function("candidates_us", |b| {
        b.iter(|| {
            let candidates = directory.candidates("us");
            black_box(candidates.len())
        })
    });
    group.finish();
}

fn ip_pool_benchmark(c: &mut Criterion) {
    let pool = IpPool::new("10.0.0.0/16".parse().unwrap());

    let mut group = c.benchmark_group("ip_pool");
    group.bench_function("allocate_then_release", |b| {
        b.iter(|| {
            let addr = pool.allocate().unwrap();
            pool.release(addr);
            black_box(addr)
        })
    });
    group.finish();
}

criterion_group!(benches, directory_benchmark, ip_pool_benchmark);
criterion_main!(benches);
