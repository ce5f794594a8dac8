//! Property tests for the frame codec

use proptest::prelude::*;
use shmem_value::codec::{decode, decode_prefix, encode};
use shmem_value::{DType, NumericArray, ShmError, Value};

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Integer),
        any::<f64>()
            .prop_filter("NaN never compares equal", |f| !f.is_nan())
            .prop_map(Value::Float),
        any::<bool>().prop_map(Value::Bool),
        (-1e9f64..1e9, -1e9f64..1e9).prop_map(|(re, im)| Value::complex(re, im)),
        ".{0,40}".prop_map(Value::Str),
    ]
}

fn array() -> impl Strategy<Value = Value> {
    prop_oneof![
        prop::collection::vec(any::<i32>(), 0..12).prop_map(|xs| {
            let n = xs.len();
            NumericArray::from_elements(vec![n], &xs).unwrap()
        }),
        prop::collection::vec(-1e6f64..1e6, 0..4).prop_map(|xs| {
            let n = xs.len();
            NumericArray::from_elements(vec![1, n], &xs).unwrap()
        }),
        (1usize..4, 1usize..4)
            .prop_map(|(r, c)| NumericArray::zeros(DType::UInt16, vec![r, c]).unwrap()),
    ]
    .prop_map(Value::NumericArray)
}

/// Nested List/Tuple/Mapping values up to depth 4
fn value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![4 => scalar(), 1 => array()];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Tuple),
            prop::collection::vec((scalar(), inner), 0..6).prop_map(Value::mapping),
        ]
    })
}

proptest! {
    #[test]
    fn decode_inverts_encode(v in value()) {
        let frame = encode(&v).unwrap();
        prop_assert_eq!(decode(&frame).unwrap(), v);
    }

    #[test]
    fn stale_bytes_after_frame_are_ignored(v in value(), tail in prop::collection::vec(any::<u8>(), 0..64)) {
        let mut region = encode(&v).unwrap();
        let used = region.len();
        region.extend_from_slice(&tail);
        let (back, consumed) = decode_prefix(&region).unwrap();
        prop_assert_eq!(consumed, used);
        prop_assert_eq!(back, v);
    }

    #[test]
    fn truncated_frames_are_rejected(v in value(), cut in any::<prop::sample::Index>()) {
        let frame = encode(&v).unwrap();
        let at = cut.index(frame.len());
        let is_frame_error = matches!(decode(&frame[..at]), Err(ShmError::FrameFormat { .. }));
        prop_assert!(is_frame_error);
    }
}
