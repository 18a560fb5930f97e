use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use parcel_net::protocol::signal::Signal;

#[allow(clippy::unwrap_used)]
fn bench_signal_parcels(c: &mut Criterion) {
    let mut group = c.benchmark_group("signal_parcels");
    let signals = vec![
        Signal::Alive,
        Signal::AliveEcho,
        Signal::Ping { ping_id: 7 },
        Signal::Tempo { speed: 1_000_000 },
        Signal::FileAbort {
            file_id: 3,
            sender_side: true,
            reason: "a".repeat(128),
        },
    ];

    group.bench_function("to_parcel", |b| {
        b.iter_batched(
            || signals.clone(),
            |signals| {
                for s in signals {
                    let _ = s.to_parcel().unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });

    let parcel = Signal::Close {
        cause: 0,
        message: Some("shutting down".into()),
    }
    .to_parcel()
    .unwrap();
    group.bench_function("from_parcel", |b| {
        b.iter(|| Signal::from_parcel(&parcel).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_signal_parcels);
criterion_main!(benches);
