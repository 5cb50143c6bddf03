//! Property-based tests for the envelope codec.
//!
//! Over every address family pairing, any port and payloads up to 64 KiB:
//! - Encode then decode yields the same endpoints and payload
//! - Every strict prefix of an encoded envelope decodes as `Truncated`
//! - Arbitrary input never panics the decoder

#![cfg(test)]

use std::net::{IpAddr, SocketAddr};

use proptest::prelude::*;

use super::{decode, encode, Envelope, MAX_HEADER_LEN, MIN_HEADER_LEN};
use crate::error::EnvelopeError;

// =============================================================================
// Arbitrary Generators
// =============================================================================

fn arb_ip() -> impl Strategy<Value = IpAddr> {
    prop_oneof![
        any::<[u8; 4]>().prop_map(IpAddr::from),
        any::<[u8; 16]>().prop_map(IpAddr::from),
    ]
    .prop_filter("unspecified addresses do not encode", |ip| !ip.is_unspecified())
}

prop_compose! {
    fn arb_endpoint()(ip in arb_ip(), port in any::<u16>()) -> SocketAddr {
        SocketAddr::new(ip, port)
    }
}

fn arb_payload(max: usize) -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..=64),
        prop::collection::vec(any::<u8>(), 0..=max),
        Just(vec![0x5a; max]),
    ]
}

fn header_len(target: &SocketAddr, source: &SocketAddr) -> usize {
    let extra = |addr: &SocketAddr| if addr.is_ipv6() { 12 } else { 0 };
    MIN_HEADER_LEN + extra(target) + extra(source)
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_round_trip(
        target in arb_endpoint(),
        source in arb_endpoint(),
        payload in arb_payload(65535),
    ) {
        let bytes = encode(target, source, &payload).unwrap();
        prop_assert_eq!(bytes.len(), header_len(&target, &source) + payload.len());
        prop_assert!(bytes.len() <= MAX_HEADER_LEN + payload.len());

        let env = decode(&bytes).unwrap();
        prop_assert_eq!(env.target, target);
        prop_assert_eq!(env.source, source);
        prop_assert_eq!(env.payload, &payload[..]);
        prop_assert_eq!(env.encoded_len(), bytes.len());
    }

    #[test]
    fn prop_trailing_bytes_ignored(
        target in arb_endpoint(),
        source in arb_endpoint(),
        payload in arb_payload(1500),
        trailer in prop::collection::vec(any::<u8>(), 1..64),
    ) {
        let mut bytes = Envelope::new(target, source, &payload).to_bytes().unwrap().to_vec();
        bytes.extend_from_slice(&trailer);

        let env = decode(&bytes).unwrap();
        prop_assert_eq!(env.payload, &payload[..]);
    }

    #[test]
    fn prop_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
        if let Ok(env) = decode(&data) {
            prop_assert!(env.encoded_len() <= data.len());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_every_prefix_is_truncated(
        target in arb_endpoint(),
        source in arb_endpoint(),
        payload in arb_payload(65535),
    ) {
        let bytes = encode(target, source, &payload).unwrap();
        for cut in 0..bytes.len() {
            match decode(&bytes[..cut]) {
                Err(EnvelopeError::Truncated { needed, available }) => {
                    prop_assert_eq!(available, cut);
                    prop_assert!(needed > cut);
                }
                other => prop_assert!(false, "prefix {}: expected Truncated, got {:?}", cut, other),
            }
        }
    }
}
