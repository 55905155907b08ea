//! Semantic invariants for session records not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::types::{Relation, Session, StepKind, StepStatus, WorkItem};

const STATUS_STEPS: [StepKind; 3] = [StepKind::Primary, StepKind::Response, StepKind::Secondary];

/// Check record invariants:
/// - item ids are non-empty and unique
/// - a non-pending secondary step implies a related counterparty
pub fn validate_session(session: &Session) -> Vec<String> {
    let mut errors = Vec::new();
    if session.session_id.trim().is_empty() {
        errors.push("session_id must be non-empty".to_string());
    }

    let mut seen = HashSet::new();
    for (index, item) in session.items.iter().enumerate() {
        if item.item_id.trim().is_empty() {
            errors.push(format!("items[{index}]: item_id must be non-empty"));
        } else if !seen.insert(item.item_id.as_str()) {
            errors.push(format!("duplicate item id '{}'", item.item_id));
        }
        if !item.secondary_status.is_pending() && item.origin_relation != Relation::Related {
            errors.push(format!(
                "{}: secondary step settled for a counterparty that is not related",
                item.item_id
            ));
        }
    }
    errors
}

/// Check that `next` only moves `prev` forward:
/// - no item removed or reordered (appends allowed)
/// - a known relation never changes
/// - a settled step status never changes
pub fn check_forward_only(prev: &Session, next: &Session) -> Vec<String> {
    let mut errors = Vec::new();
    if next.items.len() < prev.items.len() {
        errors.push(format!(
            "item count shrank from {} to {}",
            prev.items.len(),
            next.items.len()
        ));
    }

    for (index, (before, after)) in prev.items.iter().zip(&next.items).enumerate() {
        if before.item_id != after.item_id {
            errors.push(format!(
                "items[{index}]: expected '{}' but found '{}'",
                before.item_id, after.item_id
            ));
            continue;
        }
        check_item_forward_only(before, after, &mut errors);
    }
    errors
}

fn check_item_forward_only(before: &WorkItem, after: &WorkItem, errors: &mut Vec<String>) {
    if before.origin_relation != Relation::Unknown && before.origin_relation != after.origin_relation
    {
        errors.push(format!(
            "{}: relation changed from {:?} to {:?}",
            before.item_id, before.origin_relation, after.origin_relation
        ));
    }
    for step in STATUS_STEPS {
        let was = before.status(step);
        let now = after.status(step);
        if was != StepStatus::Pending && was != now {
            errors.push(format!(
                "{}: {step} status changed from {was:?} to {now:?}",
                before.item_id
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{done_item, item, session_with};

    #[test]
    fn validate_session_reports_duplicates_and_orphan_secondary() {
        let mut orphan = item("b");
        orphan.secondary_status = StepStatus::Done;
        let session = session_with(vec![item("a"), item("a"), orphan]);

        let errors = validate_session(&session);
        assert!(errors.iter().any(|e| e.contains("duplicate item id 'a'")));
        assert!(errors.iter().any(|e| e.contains("b: secondary step settled")));
    }

    #[test]
    fn forward_moves_and_appends_are_allowed() {
        let prev = session_with(vec![item("a")]);
        let mut next = prev.clone();
        next.items[0].origin_relation = Relation::Related;
        next.items[0].primary_status = StepStatus::Done;
        next.items.push(item("b"));

        assert!(check_forward_only(&prev, &next).is_empty());
    }

    #[test]
    fn settled_steps_and_order_are_immutable() {
        let prev = session_with(vec![done_item("a", Relation::Related), item("b")]);
        let mut next = prev.clone();
        next.items[0].response_status = StepStatus::Pending;
        next.items[0].origin_relation = Relation::Unrelated;
        next.items.swap(0, 1);

        let errors = check_forward_only(&prev, &next);
        assert!(errors.iter().any(|e| e.contains("expected 'a' but found 'b'")));

        let mut reverted = prev.clone();
        reverted.items[0].response_status = StepStatus::Pending;
        reverted.items[0].origin_relation = Relation::Unrelated;
        let errors = check_forward_only(&prev, &reverted);
        assert!(errors.iter().any(|e| e.contains("relation changed")));
        assert!(errors.iter().any(|e| e.contains("response status changed")));
    }

    #[test]
    fn removing_items_is_rejected() {
        let prev = session_with(vec![item("a"), item("b")]);
        let mut next = prev.clone();
        next.items.pop();
        let errors = check_forward_only(&prev, &next);
        assert!(errors.iter().any(|e| e.contains("shrank")));
    }
}
