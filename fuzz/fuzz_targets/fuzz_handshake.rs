#![no_main]

use libfuzzer_sys::fuzz_target;
use parcel_net::protocol::handshake::{check_connect_request, check_response};
use parcel_net::protocol::signal::Signal;
use parcel_net::Parcel;

fuzz_target!(|data: &[u8]| {
    // Fuzz signal decoding
    if let Ok(signal) = Signal::from_bytes(data) {
        // A decoded signal must survive its own parcel
        if let Ok(parcel) = signal.to_parcel() {
            let _ = Signal::from_parcel(&parcel);
        }
    }

    // Handshake checks on arbitrary framed input
    if let Ok(parcel) = Parcel::from_bytes(data) {
        let _ = check_connect_request(&parcel);
        let _ = check_response(&parcel);
    }
});
