//! Property-based round trips through every serializer.

use proptest::prelude::*;
use serde_json::{Map, Number, Value};
use steward_protocol::Serializer;

fn serializers() -> [Serializer; 4] {
    [
        Serializer::json(),
        Serializer::json().compressed(),
        Serializer::cbor(),
        Serializer::cbor().compressed(),
    ]
}

/// Numbers, weighted towards the edges of each integer range.
fn number_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<u64>().prop_map(Value::from),
        prop::sample::select(vec![i64::MIN, i64::MIN + 1, -1, 0, 1, i64::MAX]).prop_map(Value::from),
        prop::sample::select(vec![u64::from(u32::MAX), u64::MAX - 1, u64::MAX]).prop_map(Value::from),
        any::<f64>().prop_filter_map("finite floats only", |f| Number::from_f64(f).map(Value::Number)),
    ]
}

fn leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        number_strategy(),
        any::<String>().prop_map(Value::String),
    ]
}

fn value_strategy() -> impl Strategy<Value = Value> {
    leaf_strategy().prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            prop::collection::btree_map(any::<String>(), inner, 0..8)
                .prop_map(|entries| Value::Object(entries.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn every_serializer_round_trips(value in value_strategy()) {
        for serializer in serializers() {
            let bytes = serializer.serialize(&value).unwrap();
            let decoded = serializer.deserialize(&bytes).unwrap();
            prop_assert_eq!(&decoded, &value, "{:?}", serializer);
        }
    }

    #[test]
    fn floats_come_back_exactly(f in any::<f64>().prop_filter("finite", |f| f.is_finite())) {
        let value = Value::from(f);
        for serializer in serializers() {
            let bytes = serializer.serialize(&value).unwrap();
            let decoded = serializer.deserialize(&bytes).unwrap();
            prop_assert_eq!(decoded.as_f64(), Some(f), "{:?}", serializer);
        }
    }
}

#[test]
fn known_lossy_floats_round_trip() {
    for f in [1.0715660391465826e-75, -1.81996730402717e-179, -1.603964615428183e143] {
        let value = Value::from(f);
        for serializer in serializers() {
            let bytes = serializer.serialize(&value).unwrap();
            assert_eq!(serializer.deserialize(&bytes).unwrap().as_f64(), Some(f), "{serializer:?}");
        }
    }
}
