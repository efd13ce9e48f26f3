//! Property tests for the encryption metadata codec and object sealing.
//!
//! - Round-trip identity for all valid (nonce, tag, header) triples
//! - Length guard rejects any wrong-sized nonce or tag
//! - Sealed objects open to the original plaintext under the same key

use keywheel_crypto::{
    MetadataError, NONCE_SIZE, TAG_SIZE, decode_metadata, encode_metadata, open_object,
    seal_object,
};
use proptest::prelude::*;

fn arb_nonce() -> impl Strategy<Value = [u8; NONCE_SIZE]> {
    any::<[u8; NONCE_SIZE]>()
}

fn arb_tag() -> impl Strategy<Value = [u8; TAG_SIZE]> {
    any::<[u8; TAG_SIZE]>()
}

proptest! {
    #[test]
    fn prop_metadata_roundtrip(
        nonce in arb_nonce(),
        tag in arb_tag(),
        header in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let attributes = encode_metadata(&nonce, &tag, &header);
        let decoded = decode_metadata(&attributes).unwrap();

        prop_assert_eq!(decoded.nonce, nonce);
        prop_assert_eq!(decoded.tag, tag);
        prop_assert_eq!(decoded.nested_header, header);
    }

    #[test]
    fn prop_wrong_sized_nonce_is_rejected(
        tag in arb_tag(),
        bad_nonce in proptest::collection::vec(any::<u8>(), 0..64)
            .prop_filter("must not be the cipher nonce size", |v| v.len() != NONCE_SIZE),
    ) {
        let good_nonce = [0u8; NONCE_SIZE];
        let mut attributes = encode_metadata(&good_nonce, &tag, b"hdr");
        attributes.insert("keywheel_nonce".to_string(), hex::encode(&bad_nonce));

        let err = decode_metadata(&attributes).unwrap_err();
        prop_assert_eq!(err, MetadataError::NonceSize { actual: bad_nonce.len() });
    }

    #[test]
    fn prop_wrong_sized_tag_is_rejected(
        nonce in arb_nonce(),
        bad_tag in proptest::collection::vec(any::<u8>(), 0..64)
            .prop_filter("must not be the cipher tag size", |v| v.len() != TAG_SIZE),
    ) {
        let good_tag = [0u8; TAG_SIZE];
        let mut attributes = encode_metadata(&nonce, &good_tag, b"hdr");
        attributes.insert("keywheel_tag".to_string(), hex::encode(&bad_tag));

        let err = decode_metadata(&attributes).unwrap_err();
        prop_assert_eq!(err, MetadataError::TagSize { actual: bad_tag.len() });
    }

    #[test]
    fn prop_seal_open_roundtrip(
        key in any::<[u8; 32]>(),
        nonce in arb_nonce(),
        plaintext in proptest::collection::vec(any::<u8>(), 0..1024),
        header in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let (ciphertext, attributes) = seal_object(&key, &plaintext, &header, nonce);
        let opened = open_object(&key, &ciphertext, &attributes).unwrap();

        prop_assert_eq!(opened, plaintext);
    }
}
