//! Property tests for fragment composition: the placeholder/param invariant
//! holds under arbitrary nesting, and flattening is shape-independent.

use proptest::prelude::*;
use sql::{
    sql,
    RawSql,
    SqlValue,
};

fn arbitrary_value() -> impl Strategy<Value = SqlValue> {
    prop_oneof![
        Just(SqlValue::Null),
        any::<i64>().prop_map(SqlValue::Integer),
        (-1.0e9..1.0e9f64).prop_map(SqlValue::Real),
        "[a-zA-Z0-9 '?]{0,12}".prop_map(SqlValue::Text),
        proptest::collection::vec(any::<u8>(), 0..8).prop_map(SqlValue::Blob),
    ]
}

proptest! {
    #[test]
    fn bound_values_never_break_the_invariant(values in proptest::collection::vec(arbitrary_value(), 0..20)) {
        let mut fragment = RawSql::new("SELECT * FROM t WHERE x IN (");
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                fragment.push_str(", ");
            }
            fragment.bind(value.clone());
        }
        fragment.push_str(")");
        prop_assert!(fragment.verify());
        prop_assert_eq!(fragment.params.len(), values.len());
        prop_assert_eq!(fragment.debug_params.len(), values.len());
    }

    #[test]
    fn splicing_preserves_order_and_count(
        left in proptest::collection::vec(arbitrary_value(), 0..8),
        right in proptest::collection::vec(arbitrary_value(), 0..8),
    ) {
        let mut a = RawSql::new("a IN (");
        for (i, value) in left.iter().enumerate() {
            if i > 0 {
                a.push_str(", ");
            }
            a.bind(value.clone());
        }
        a.push_str(")");
        let mut b = RawSql::new("b IN (");
        for (i, value) in right.iter().enumerate() {
            if i > 0 {
                b.push_str(", ");
            }
            b.bind(value.clone());
        }
        b.push_str(")");

        let combined = sql!("SELECT * FROM t WHERE " [&a] " AND " [&b]);
        prop_assert!(combined.verify());
        let expected: Vec<SqlValue> = left.iter().chain(right.iter()).cloned().collect();
        prop_assert_eq!(combined.params, expected);
    }

    #[test]
    fn nesting_shape_does_not_change_the_flattened_fragment(value in arbitrary_value()) {
        let leaf = {
            let mut f = RawSql::new("x = ");
            f.bind(value.clone());
            f
        };
        let deep = sql!("(" [sql!("(" [&leaf] ")")] ")");
        let shallow = {
            let mut f = RawSql::new("((x = ");
            f.bind(value.clone());
            f.push_str("))");
            f
        };
        prop_assert_eq!(deep, shallow);
    }
}
