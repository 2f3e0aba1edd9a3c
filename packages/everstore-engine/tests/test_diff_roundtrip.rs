//! Property tests for the JSON-Patch diff.

use proptest::prelude::*;
use serde_json::Value;

use everstore_storage::diff::{apply, changed_fields, diff};

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| Value::from(n)),
        "[a-z]{0,8}".prop_map(Value::String),
    ]
}

/// Nested JSON objects with scalar leaves (no lists).
fn object() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(3, 32, 8, |inner| {
        proptest::collection::btree_map("[a-z]{1,4}", inner, 0..6)
            .prop_map(|map| Value::Object(map.into_iter().collect()))
    })
}

proptest! {
    #[test]
    fn diff_apply_roundtrip(a in object(), b in object()) {
        let patch = diff(&a, &b);
        let patched = apply(&a, &patch).unwrap();
        prop_assert_eq!(patched, b);
    }

    #[test]
    fn diff_on_identical_is_empty(a in object()) {
        prop_assert!(diff(&a, &a).is_empty());
    }

    #[test]
    fn changed_fields_matches_delta_keys(a in object(), b in object()) {
        // Only meaningful over top-level maps.
        prop_assume!(a.is_object() && b.is_object());
        let fields = changed_fields(&a, &b);
        let patch = diff(&a, &b);

        // Every patched path's head segment appears in changed_fields.
        for op in &patch {
            let path = match op {
                everstore_storage::diff::PatchOp::Add { path, .. } => path,
                everstore_storage::diff::PatchOp::Remove { path } => path,
                everstore_storage::diff::PatchOp::Replace { path, .. } => path,
            };
            let head = path
                .trim_start_matches('/')
                .split('/')
                .next()
                .unwrap()
                .replace("~1", "/")
                .replace("~0", "~");
            prop_assert!(fields.contains(&head));
        }
    }
}
