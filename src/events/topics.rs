//! Topic naming
//!
//! Topics are `{EntityType}.Deleted` and `{EntityType}.Restored`. A `*`
//! segment in a subscription pattern matches exactly one topic segment, so
//! `*.Deleted` receives every deletion.

use crate::entity::Entity;

pub const DELETED: &str = "Deleted";
pub const RESTORED: &str = "Restored";
pub const WILDCARD: &str = "*";

pub fn deleted(entity_type: &str) -> String {
    format!("{}.{}", entity_type, DELETED)
}

pub fn restored(entity_type: &str) -> String {
    format!("{}.{}", entity_type, RESTORED)
}

pub fn deleted_for<T: Entity>() -> String {
    deleted(T::ENTITY_TYPE)
}

/// Every deletion, whatever the entity type
pub fn any_deleted() -> String {
    deleted(WILDCARD)
}

/// Split a topic into entity type and suffix
pub fn split(topic: &str) -> Option<(&str, &str)> {
    let (entity_type, suffix) = topic.rsplit_once('.')?;
    if entity_type.is_empty() || suffix.is_empty() {
        return None;
    }
    Some((entity_type, suffix))
}

pub fn is_restore_topic(topic: &str) -> bool {
    matches!(split(topic), Some((_, RESTORED)))
}

/// Whether `pattern` (possibly holding `*` segments) matches `topic`
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split('.');
    let mut topic_segments = topic.split('.');
    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(t)) if p == WILDCARD || p == t => continue,
            _ => return false,
        }
    }
}

/// Expand a conventional handler alias to its topic.
///
/// `On{Type}Delete` maps to `{Type}.Deleted`, `On{Type}Restore` to
/// `{Type}.Restored`, and `OnAnyDelete` to `*.Deleted`.
pub fn expand_alias(name: &str) -> Option<String> {
    let body = name.strip_prefix("On")?;
    let (entity_type, topic): (&str, fn(&str) -> String) =
        if let Some(t) = body.strip_suffix("Delete") {
            (t, deleted)
        } else if let Some(t) = body.strip_suffix("Restore") {
            (t, restored)
        } else {
            return None;
        };

    match entity_type {
        "" => None,
        "Any" => Some(topic(WILDCARD)),
        t if t.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => Some(topic(t)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(deleted("Display"), "Display.Deleted");
        assert_eq!(restored("Display"), "Display.Restored");
        assert_eq!(any_deleted(), "*.Deleted");
        assert_eq!(split("DisplayType.Deleted"), Some(("DisplayType", "Deleted")));
        assert_eq!(split("Deleted"), None);
        assert!(is_restore_topic("Batch.Restored"));
        assert!(!is_restore_topic("Batch.Deleted"));
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(matches("Display.Deleted", "Display.Deleted"));
        assert!(matches("*.Deleted", "Display.Deleted"));
        assert!(!matches("*.Deleted", "Display.Restored"));
        assert!(!matches("Display.Deleted", "DisplayType.Deleted"));
        assert!(!matches("*", "Display.Deleted"));
    }

    #[test]
    fn test_alias_expansion() {
        assert_eq!(expand_alias("OnDisplayDelete").as_deref(), Some("Display.Deleted"));
        assert_eq!(
            expand_alias("OnDisplayTypeDelete").as_deref(),
            Some("DisplayType.Deleted")
        );
        assert_eq!(expand_alias("OnBatchRestore").as_deref(), Some("Batch.Restored"));
        assert_eq!(expand_alias("OnAnyDelete").as_deref(), Some("*.Deleted"));
        assert_eq!(expand_alias("OnDelete"), None);
        assert_eq!(expand_alias("Display.Deleted"), None);
    }
}
