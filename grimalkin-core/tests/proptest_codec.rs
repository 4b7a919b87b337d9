use grimalkin_core::codec::{decode, encode, StorageUuid, UUID_LEN};
use grimalkin_core::MalformedUuid;
use proptest::prelude::*;
use uuid::Uuid;

proptest! {
    /// Property: decode(encode(u)) == u for every 128-bit value
    #[test]
    fn prop_round_trip(raw in any::<u128>()) {
        let id = Uuid::from_u128(raw);
        prop_assert_eq!(decode(&encode(id)), Ok(id));
    }

    /// Property: every 16-byte storage value decodes, and re-encodes to itself
    #[test]
    fn prop_storage_bytes_round_trip(bytes in prop::collection::vec(any::<u8>(), UUID_LEN)) {
        let stored = StorageUuid::from_raw(bytes.clone());
        let id = decode(&stored).unwrap();
        prop_assert_eq!(encode(id).into_bytes(), bytes);
    }

    /// Property: any other length is rejected with its length, never truncated
    #[test]
    fn prop_wrong_length_rejected(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        prop_assume!(bytes.len() != UUID_LEN);
        let len = bytes.len();
        prop_assert_eq!(decode(&StorageUuid::from_raw(bytes)), Err(MalformedUuid { len }));
    }

    /// Property: byte order of encoded values matches UUID ordering
    #[test]
    fn prop_encoding_preserves_order(a in any::<u128>(), b in any::<u128>()) {
        let (ua, ub) = (Uuid::from_u128(a), Uuid::from_u128(b));
        prop_assert_eq!(ua.cmp(&ub), encode(ua).cmp(&encode(ub)));
    }
}
