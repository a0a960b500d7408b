//! Property tests for type inference and widening

use batchflow_common::types::{ColumnType, Value};
use proptest::prelude::*;

fn any_type() -> impl Strategy<Value = ColumnType> {
    prop_oneof![
        Just(ColumnType::String),
        Just(ColumnType::Int),
        Just(ColumnType::Float),
        Just(ColumnType::Bool),
        Just(ColumnType::Date),
        Just(ColumnType::Timestamp),
    ]
}

proptest! {
    #[test]
    fn widen_is_commutative(a in any_type(), b in any_type()) {
        prop_assert_eq!(a.widen(b), b.widen(a));
    }

    #[test]
    fn widen_is_idempotent(a in any_type(), b in any_type()) {
        let w = a.widen(b);
        prop_assert_eq!(w.widen(a), w);
        prop_assert_eq!(w.widen(b), w);
    }

    #[test]
    fn integers_infer_as_int(n in any::<i64>()) {
        prop_assert_eq!(ColumnType::infer(&n.to_string()), Some(ColumnType::Int));
        prop_assert_eq!(Value::parse_as(&n.to_string(), ColumnType::Int).ok(), Some(Value::Int(n)));
    }

    #[test]
    fn inferred_type_always_parses(s in "[a-z0-9 .:/-]{0,20}") {
        if let Some(ty) = ColumnType::infer(&s) {
            prop_assert!(Value::parse_as(&s, ty).is_ok());
        }
    }
}
