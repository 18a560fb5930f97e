use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use parcel_net::core::codec::ParcelCodec;
use parcel_net::core::parcel::{Parcel, Priority};
use parcel_net::core::serialization::{ObjectRegistry, SerializationFormat};
use tokio_util::codec::{Decoder, Encoder};

fn fragment(size: usize) -> Parcel {
    Parcel::object_fragment(1, Priority::Normal, 0, size as u64, true, Bytes::from(vec![0u8; size]))
}

#[allow(clippy::unwrap_used)]
fn bench_parcel_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("parcel_encode_decode");
    let payload_sizes = [64usize, 512, 4096, 32 * 1024, 256 * 1024];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || fragment(size),
                |parcel| {
                    let mut buf = BytesMut::with_capacity(size + 64);
                    let mut codec = ParcelCodec::default();
                    codec.encode(parcel, &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });

        let mut encoded = BytesMut::new();
        ParcelCodec::default()
            .encode(fragment(size), &mut encoded)
            .unwrap();
        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter_batched(
                || encoded.clone(),
                |mut buf| {
                    let decoded = ParcelCodec::default().decode(&mut buf).unwrap();
                    assert!(decoded.is_some());
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_object_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("object_registry");
    let registry = ObjectRegistry::new();
    let text = "a".repeat(1024);

    for format in [SerializationFormat::Bincode, SerializationFormat::Json] {
        group.bench_function(format!("serialize_{}", format.name()), |b| {
            b.iter(|| registry.serialize(&text, format).unwrap())
        });

        let blob = registry.serialize(&text, format).unwrap();
        group.bench_function(format!("deserialize_{}", format.name()), |b| {
            b.iter(|| registry.deserialize(&blob).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parcel_encode_decode, bench_object_registry);
criterion_main!(benches);
