//! Topic filter helpers.

/// Split a shared subscription `$share/{group}/{filter}` into (group, filter).
pub fn parse_shared_topic(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix("$share/")?;
    let (group, filter) = rest.split_once('/')?;
    if group.is_empty() || filter.is_empty() {
        return None;
    }
    Some((group, filter))
}

/// Whether a filter uses `+` or `#`.
pub fn has_wildcard(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}

/// Check if a filter matches a topic name.
///
/// Wildcards in the first level never match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut levels = topic.split('/');
    for part in filter.split('/') {
        if part == "#" {
            return true;
        }
        match levels.next() {
            Some(level) if part == "+" || part == level => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shared_topic() {
        assert_eq!(parse_shared_topic("$share/g/a/b"), Some(("g", "a/b")));
        assert_eq!(parse_shared_topic("$share//a"), None);
        assert_eq!(parse_shared_topic("$share/g"), None);
        assert_eq!(parse_shared_topic("a/b"), None);
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("a/b", "a/b"));
        assert!(topic_matches("a/+", "a/b"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("+/+", "a/b"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(!topic_matches("a/b", "a"));
        assert!(!topic_matches("#", "$SYS/x"));
        assert!(topic_matches("$SYS/#", "$SYS/x"));
    }

    #[test]
    fn test_has_wildcard() {
        assert!(has_wildcard("a/+/c"));
        assert!(has_wildcard("#"));
        assert!(!has_wildcard("a/b+"));
    }
}
