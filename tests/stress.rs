use bytes::{Bytes, BytesMut};
use parcel_net::config::MAX_PARCEL_SIZE;
use parcel_net::core::codec::ParcelCodec;
use parcel_net::core::parcel::{Parcel, Priority};
use parcel_net::protocol::signal::Signal;
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn stress_parcel_encode_decode_large_series() {
    // Heavy burst of parcels through one buffer, no panics or leftovers
    let mut codec = ParcelCodec::default();
    let mut buf = BytesMut::new();

    for size in [0usize, 1, 64, 512, 4096, 65536, MAX_PARCEL_SIZE] {
        for i in 0..2_000u64 {
            let parcel = Parcel::object_fragment(
                i,
                Priority::Low,
                0,
                size as u64,
                true,
                Bytes::from(vec![0u8; size]),
            );
            codec.encode(parcel, &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap();
            assert!(decoded.is_some());
            assert!(buf.is_empty());
        }
    }
}

#[test]
fn stress_signal_stream() {
    let mut codec = ParcelCodec::default();
    let mut buf = BytesMut::new();

    for ping_id in 0..50_000u32 {
        let signal = if ping_id % 2 == 0 {
            Signal::Ping { ping_id }
        } else {
            Signal::PingEcho { ping_id }
        };
        codec.encode(signal.to_parcel().unwrap(), &mut buf).unwrap();
    }

    let mut count = 0u32;
    while let Some(parcel) = codec.decode(&mut buf).unwrap() {
        let signal = Signal::from_parcel(&parcel).unwrap();
        match signal {
            Signal::Ping { ping_id } | Signal::PingEcho { ping_id } => assert_eq!(ping_id, count),
            other => panic!("unexpected {other:?}"),
        }
        count += 1;
    }
    assert_eq!(count, 50_000);
}
