use criterion::{criterion_group, criterion_main, Criterion};

use tapeline::clock::{Clock, SystemClock, TscClock};

fn bench_clocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("clock");

    let tsc = TscClock::calibrate().expect("calibration");
    group.bench_function("tsc_now_ns", |b| {
        b.iter(|| criterion::black_box(tsc.now_ns()));
    });

    let system = SystemClock;
    group.bench_function("system_now_ns", |b| {
        b.iter(|| criterion::black_box(system.now_ns()));
    });

    group.finish();
}

criterion_group!(benches, bench_clocks);
criterion_main!(benches);
