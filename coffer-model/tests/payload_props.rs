use coffer_model::{ContentReference, ContentType, ItemContent};
use proptest::prelude::*;

fn reference_strategy() -> impl Strategy<Value = ContentReference> {
    ("[a-f0-9]{8}", prop_oneof!["Note", "Tag"]).prop_map(|(uuid, ct)| ContentReference {
        uuid,
        content_type: ContentType::from_wire(&ct),
    })
}

proptest! {
    /// Structural equality is insensitive to reference order.
    #[test]
    fn content_equality_ignores_reference_permutation(
        refs in prop::collection::vec(reference_strategy(), 0..6),
        text in "\\PC{0,32}",
    ) {
        let mut a = ItemContent::new();
        a.references = refs.clone();
        a.extra.insert("text".into(), serde_json::Value::String(text.clone()));

        let mut reversed = refs;
        reversed.reverse();
        let mut b = ItemContent::new();
        b.references = reversed;
        b.extra.insert("text".into(), serde_json::Value::String(text));

        prop_assert!(a.structurally_equals(&b));
    }

    /// Any extra-value change is visible to structural equality.
    #[test]
    fn content_equality_sees_extra_changes(text in "\\PC{1,32}") {
        let mut a = ItemContent::new();
        a.extra.insert("text".into(), serde_json::Value::String(text.clone()));
        let mut b = ItemContent::new();
        b.extra.insert("text".into(), serde_json::Value::String(format!("{}!", text)));
        prop_assert!(!a.structurally_equals(&b));
    }
}
