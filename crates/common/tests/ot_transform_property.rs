use coedit_common::ot::{apply, char_len, check, transform, EditKind, Operation};
use proptest::prelude::*;
use uuid::Uuid;

fn op(position: u64, edit: EditKind) -> Operation {
    Operation {
        op_id: format!("op-{position}"),
        doc_id: Uuid::nil(),
        user_id: "prop".to_string(),
        base_version: 0,
        position,
        edit,
    }
}

fn arb_edit(content_len: u64) -> BoxedStrategy<Operation> {
    let insert = (0..=content_len, "[a-z]{1,4}")
        .prop_map(|(position, text)| op(position, EditKind::Insert { text }));

    if content_len == 0 {
        return insert.boxed();
    }

    let delete = (0..content_len)
        .prop_flat_map(move |position| (Just(position), 1..=content_len - position))
        .prop_map(|(position, length)| op(position, EditKind::Delete { length }));

    prop_oneof![insert, delete].boxed()
}

fn content_and_pair() -> impl Strategy<Value = (String, Operation, Operation)> {
    "[a-z0-9é日 ]{1,24}".prop_flat_map(|content| {
        let content_len = char_len(&content);
        (Just(content), arb_edit(content_len), arb_edit(content_len))
    })
}

/// Pairs for which intent preservation is underdetermined: two inserts at
/// the same offset (tie-break picks a winner), or an insert landing strictly
/// inside a concurrent delete's range.
fn aliasing(a: &Operation, b: &Operation) -> bool {
    match (&a.edit, &b.edit) {
        (EditKind::Insert { .. }, EditKind::Insert { .. }) => a.position == b.position,
        (EditKind::Insert { .. }, EditKind::Delete { length }) => {
            b.position < a.position && a.position < b.position + length
        }
        (EditKind::Delete { length }, EditKind::Insert { .. }) => {
            a.position < b.position && b.position < a.position + length
        }
        (EditKind::Delete { .. }, EditKind::Delete { .. }) => false,
    }
}

fn apply_rebased(content: &str, operation: &Operation) -> String {
    if operation.is_noop() {
        content.to_string()
    } else {
        apply(content, operation)
    }
}

proptest! {
    #[test]
    fn transform_converges_for_non_aliasing_pairs((content, a, b) in content_and_pair()) {
        prop_assume!(!matches!(
            (&a.edit, &b.edit),
            (EditKind::Delete { .. }, EditKind::Delete { .. })
        ));
        prop_assume!(!aliasing(&a, &b));

        let left = apply_rebased(&apply(&content, &a), &transform(&b, &a));
        let right = apply_rebased(&apply(&content, &b), &transform(&a, &b));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn concurrent_deletes_converge_in_either_order((content, a, b) in content_and_pair()) {
        prop_assume!(matches!(
            (&a.edit, &b.edit),
            (EditKind::Delete { .. }, EditKind::Delete { .. })
        ));

        let left = apply_rebased(&apply(&content, &a), &transform(&b, &a));
        let right = apply_rebased(&apply(&content, &b), &transform(&a, &b));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn transform_against_noop_is_identity(
        (content, a, _) in content_and_pair(),
        noop_position in 0u64..32,
    ) {
        let _ = content;
        let noop = op(noop_position, EditKind::Delete { length: 0 });
        prop_assert_eq!(transform(&a, &noop), a);
    }

    #[test]
    fn check_agrees_with_the_invariant_oracle((content, a, _) in content_and_pair()) {
        // Re-validate against a truncated document so out-of-bounds cases
        // actually occur.
        let truncated: String = content.chars().take(content.chars().count() / 2).collect();
        let truncated_len = char_len(&truncated);

        let expected = a.position <= truncated_len
            && match &a.edit {
                EditKind::Insert { text } => !text.is_empty(),
                EditKind::Delete { length } => {
                    *length > 0 && a.position + length <= truncated_len
                }
            };
        prop_assert_eq!(check(&truncated, &a).is_ok(), expected);
    }

    #[test]
    fn applied_operations_preserve_untouched_content((content, a, _) in content_and_pair()) {
        let applied = apply(&content, &a);
        match &a.edit {
            EditKind::Insert { text } => {
                prop_assert_eq!(char_len(&applied), char_len(&content) + char_len(text));
            }
            EditKind::Delete { length } => {
                prop_assert_eq!(char_len(&applied), char_len(&content) - length);
            }
        }

        let prefix: String = content.chars().take(a.position as usize).collect();
        prop_assert!(applied.starts_with(&prefix));
    }
}
