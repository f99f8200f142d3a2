use flapbus::frame::*;
use proptest::prelude::*;

fn variant() -> impl Strategy<Value = WireVariant> {
    prop_oneof![Just(WireVariant::V1), Just(WireVariant::V2)]
}

proptest! {
    #[test]
    fn test_decode_inverts_encode(
        variant in variant(),
        address in any::<u16>(),
        payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_LEN),
    ) {
        let codec = FrameCodec::new(variant);
        let bytes = codec.encode(address, &payload).unwrap();
        prop_assert_eq!(bytes.len(), payload.len() + variant.overhead() + 2);

        let mut source = SliceSource::new(&bytes);
        match codec.decode(&mut source, address).unwrap() {
            Decoded::Frame(frame) => {
                prop_assert_eq!(frame.address, address);
                prop_assert_eq!(frame.payload.as_slice(), payload.as_slice());
            }
            Decoded::NotForUs { .. } => prop_assert!(false, "frame not matched"),
        }
        prop_assert!(source.remaining().is_empty());
    }

    #[test]
    fn test_foreign_frames_leave_stream_aligned(
        variant in variant(),
        foreign in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_LEN),
        ours in proptest::collection::vec(any::<u8>(), 1..8),
    ) {
        let codec = FrameCodec::new(variant);
        let mut line = codec.encode(0x0102, &foreign).unwrap().to_vec();
        line.extend(codec.encode(REPLY_ADDRESS, &ours).unwrap());

        let mut source = SliceSource::new(&line);
        prop_assert_eq!(
            codec.decode(&mut source, REPLY_ADDRESS).unwrap(),
            Decoded::NotForUs { address: 0x0102 }
        );
        let frame = codec.decode_any(&mut source).unwrap();
        prop_assert_eq!(frame.payload.as_slice(), ours.as_slice());
    }

    #[test]
    fn test_single_bit_flip_in_crc_payload_detected(
        payload in proptest::collection::vec(any::<u8>(), 1..16),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let codec = FrameCodec::new(WireVariant::V2);
        let mut bytes = codec.encode(7, &payload).unwrap().to_vec();
        let target = 5 + index.index(payload.len());
        bytes[target] ^= 1 << bit;

        let result = codec.decode(&mut SliceSource::new(&bytes), 7);
        prop_assert!(
            matches!(result, Err(FrameError::Integrity(IntegrityFault::Crc { .. }))),
            "corruption not detected"
        );
    }
}

#[test]
fn test_crc16_reference_vectors() {
    assert_eq!(crc16(&[]), 0xFFFF);
    assert_eq!(crc16(&[0x00]), 0x40BF);
    assert_eq!(crc16(b"123456789"), 0x4B37);
}

#[test]
fn test_status_request_v2_bytes() {
    let bytes = FrameCodec::new(WireVariant::V2).encode(0x0010, &[0xF8]).unwrap();
    assert_eq!(bytes.as_slice(), &[b'+', 0x01, 0x05, 0x10, 0x00, 0xF8, 0xBE, 0xC2]);
}
