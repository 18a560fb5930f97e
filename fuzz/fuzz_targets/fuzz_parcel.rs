#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use parcel_net::core::codec::ParcelCodec;
use parcel_net::Parcel;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Parcel decoding must never panic, whatever the input
    let _ = Parcel::from_bytes(data);

    // Nor may the streaming decoder, fed the same bytes as a stream
    let mut codec = ParcelCodec::default();
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
