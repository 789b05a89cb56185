//! Topic name and topic filter rules.
//!
//! Filters support `+` (single level) and `#` (multi-level, last segment only),
//! and the `$share/<group>/<filter>` prefix for shared subscriptions.

use crate::error::Result;
use crate::types::invalid_topic;

/// Maximum length of a UTF-8 string on the wire.
const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// Validate a topic name used in PUBLISH.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(invalid_topic(topic, "empty topic name"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(invalid_topic(topic, "topic name too long"));
    }
    if topic.contains(['+', '#']) {
        return Err(invalid_topic(topic, "wildcards are not allowed in topic names"));
    }
    if topic.contains('\0') {
        return Err(invalid_topic(topic, "null character"));
    }
    Ok(())
}

/// Validate a topic filter used in SUBSCRIBE.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(invalid_topic(filter, "empty topic filter"));
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err(invalid_topic(filter, "topic filter too long"));
    }
    if filter.contains('\0') {
        return Err(invalid_topic(filter, "null character"));
    }

    let pattern = strip_share(filter)?;
    let mut segments = pattern.split('/').peekable();
    while let Some(seg) = segments.next() {
        match seg {
            "#" if segments.peek().is_some() => {
                return Err(invalid_topic(filter, "# must be the last segment"));
            }
            "#" | "+" => {}
            s if s.contains(['+', '#']) => {
                return Err(invalid_topic(filter, "wildcard must occupy a whole segment"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check whether `topic` matches `filter`.
///
/// Wildcards at the first level never match topics starting with `$`.
pub fn matches(filter: &str, topic: &str) -> bool {
    let Ok(pattern) = strip_share(filter) else {
        return false;
    };

    if topic.starts_with('$') && (pattern.starts_with('+') || pattern.starts_with('#')) {
        return false;
    }

    let mut pattern_segs = pattern.split('/');
    let mut topic_segs = topic.split('/');

    loop {
        match (pattern_segs.next(), topic_segs.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Strip a `$share/<group>/` prefix, returning the filter proper.
fn strip_share(filter: &str) -> Result<&str> {
    match filter.strip_prefix("$share/") {
        None => Ok(filter),
        Some(rest) => match rest.split_once('/') {
            Some((group, pattern))
                if !group.is_empty() && !group.contains(['+', '#']) && !pattern.is_empty() =>
            {
                Ok(pattern)
            }
            _ => Err(invalid_topic(filter, "invalid share subscription")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert!(validate_topic_name("a/b").is_ok());
        assert!(validate_topic_name("/").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/#").is_err());
        assert!(validate_topic_name("a/+/c").is_err());
    }

    #[test]
    fn test_topic_filters() {
        assert!(validate_topic_filter("a/b").is_ok());
        assert!(validate_topic_filter("a/+/c").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("a/#").is_ok());
        assert!(validate_topic_filter("$share/group/a/#").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("a/#/c").is_err());
        assert!(validate_topic_filter("a/b#").is_err());
        assert!(validate_topic_filter("a/+b").is_err());
        assert!(validate_topic_filter("$share/group").is_err());
    }

    #[test]
    fn test_exact_match() {
        assert!(matches("a/b", "a/b"));
        assert!(!matches("a/b", "a/c"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(matches("a/+", "a/"));
        assert!(!matches("a/+", "a/b/c"));
        assert!(!matches("a/+/c", "a/b/d"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("a/#", "a"));
        assert!(matches("a/#", "a/b"));
        assert!(matches("a/#", "a/b/c"));
        assert!(matches("#", "x/y"));
        assert!(!matches("a/#", "b/c"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!matches("#", "$SYS/broker"));
        assert!(!matches("+/broker", "$SYS/broker"));
        assert!(matches("$SYS/#", "$SYS/broker"));
    }

    #[test]
    fn test_share_subscription_matches() {
        assert!(matches("$share/g/a/+", "a/b"));
        assert!(!matches("$share/g/a/+", "b/b"));
    }
}
