//! Frame codec tests

use bytes::Bytes;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use test_case::test_case;

use super::*;

#[test]
fn test_decode_sensor_frame() {
    let frame = decode(Bytes::from_static(br#"sensors/1|{"t":21.5}"#)).unwrap();
    assert_eq!(frame.topic, "sensors/1");
    assert_eq!(&frame.payload[..], br#"{"t":21.5}"#);
}

#[test]
fn test_decode_splits_at_first_delimiter() {
    let frame = decode(Bytes::from_static(b"a/b|x|y||")).unwrap();
    assert_eq!(frame.topic, "a/b");
    assert_eq!(&frame.payload[..], b"x|y||");
}

#[test]
fn test_decode_empty_payload() {
    let frame = decode(Bytes::from_static(b"topic|")).unwrap();
    assert_eq!(frame.topic, "topic");
    assert!(frame.payload.is_empty());
}

#[test_case(b"nodelimiter", FrameError::MissingDelimiter ; "no delimiter")]
#[test_case(b"", FrameError::MissingDelimiter ; "empty frame")]
#[test_case(b"|payload", FrameError::EmptyTopic ; "empty topic")]
#[test_case(b"\xff\xfe|payload", FrameError::InvalidTopic ; "non utf8 topic")]
fn test_decode_rejects(input: &'static [u8], expected: FrameError) {
    assert_eq!(decode(Bytes::from_static(input)), Err(expected));
}

#[test]
fn test_decode_binary_payload_untouched() {
    let mut raw = b"bin|".to_vec();
    raw.extend_from_slice(&[0x00, 0xff, 0x80, b'|', 0x0a]);
    let frame = decode(Bytes::from(raw)).unwrap();
    assert_eq!(&frame.payload[..], &[0x00, 0xff, 0x80, b'|', 0x0a]);
}

#[test]
fn test_encode_sensor_frame() {
    let encoded = encode("sensors/1", br#"{"t":22.0}"#);
    assert_eq!(&encoded[..], br#"sensors/1|{"t":22.0}"#);
    assert_eq!(Frame::new("sensors/1", &br#"{"t":22.0}"#[..]).encode(), encoded);
}

proptest! {
    #[test]
    fn prop_payload_survives_framing(
        topic in "[a-z0-9/ _-]{1,32}",
        payload in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let frame = decode(encode(&topic, &payload)).unwrap();
        prop_assert_eq!(frame.topic, topic);
        prop_assert_eq!(&frame.payload[..], &payload[..]);
    }
}
