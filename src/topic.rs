//! MQTT topic filter algebra: wildcard-aware superset comparison and the
//! validation rules applied to subscribe/publish topics.

use crate::error::InvalidRequest;
use crate::limits::{is_basic_ingest_prefix, BASIC_INGEST_PREFIX_SEGMENTS, MAX_LENGTH_OF_TOPIC, MAX_NUMBER_OF_FORWARD_SLASHES};

/// Strips a leading `$aws/rules/<rule>/` (case-insensitive) Basic Ingest
/// prefix, returning the remainder. The first three segments of a Basic
/// Ingest topic do not count against the slash/length limits.
fn strip_basic_ingest_prefix(topic: &str) -> &str {
    let mut segments = topic.splitn(BASIC_INGEST_PREFIX_SEGMENTS + 1, '/');
    let (Some(first), Some(second), Some(_rule), Some(rest)) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return topic;
    };

    if is_basic_ingest_prefix((first, second)) {
        rest
    } else {
        topic
    }
}

fn check_length_and_slashes(checked: &str) -> Result<(), InvalidRequest> {
    if checked.len() > MAX_LENGTH_OF_TOPIC {
        return Err(InvalidRequest::TopicTooLong {
            max: MAX_LENGTH_OF_TOPIC,
            actual: checked.len(),
        });
    }

    let slashes = checked.matches('/').count();
    if slashes > MAX_NUMBER_OF_FORWARD_SLASHES {
        return Err(InvalidRequest::TooManySlashes {
            max: MAX_NUMBER_OF_FORWARD_SLASHES,
            actual: slashes,
        });
    }

    Ok(())
}

/// Validates a topic filter intended for `subscribe`. Wildcards (`+`, `#`)
/// are permitted but constrained: `#` only as the terminal level, `+`/`#`
/// only as whole levels.
pub fn validate_subscribe_topic(topic: &str) -> Result<(), InvalidRequest> {
    let checked = strip_basic_ingest_prefix(topic);
    check_length_and_slashes(checked)?;

    let levels: Vec<&str> = checked.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && *level != "#" {
            return Err(InvalidRequest::MalformedFilter(topic.to_owned()));
        }
        if *level == "#" && i != levels.len() - 1 {
            return Err(InvalidRequest::MalformedFilter(topic.to_owned()));
        }
        if level.contains('+') && *level != "+" {
            return Err(InvalidRequest::MalformedFilter(topic.to_owned()));
        }
    }

    Ok(())
}

/// Validates a topic intended for `publish`: wildcards are forbidden
/// entirely, and the same length/slash caps apply.
pub fn validate_publish_topic(topic: &str) -> Result<(), InvalidRequest> {
    let checked = strip_basic_ingest_prefix(topic);
    check_length_and_slashes(checked)?;

    if checked.contains('+') || checked.contains('#') {
        return Err(InvalidRequest::WildcardInPublishTopic(topic.to_owned()));
    }

    Ok(())
}

/// Returns `true` iff every concrete topic matched by `other` is also
/// matched by `self` — i.e. `self` is a superset filter of `other`.
/// Literal equality is the trivial case (`a.is_superset_of(a) == true`).
pub fn is_superset_of(a: &str, b: &str) -> bool {
    let a_levels: Vec<&str> = a.split('/').collect();
    let b_levels: Vec<&str> = b.split('/').collect();

    let mut i = 0;
    let mut j = 0;
    loop {
        match (a_levels.get(i), b_levels.get(j)) {
            (Some(&"#"), _) => return true,
            (Some(_), Some(&"#")) => return false,
            (Some(&"+"), Some(_)) => {
                i += 1;
                j += 1;
            }
            (Some(al), Some(bl)) => {
                if al != bl {
                    return false;
                }
                i += 1;
                j += 1;
            }
            (None, None) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_equality_is_superset() {
        assert!(is_superset_of("a/b/c", "a/b/c"));
    }

    #[test]
    fn plus_wildcard_matches_single_level() {
        assert!(is_superset_of("a/+/c", "a/b/c"));
        assert!(is_superset_of("a/+/c", "a/+/c"));
        assert!(!is_superset_of("a/+/c", "a/b/c/d"));
    }

    #[test]
    fn hash_wildcard_absorbs_tail() {
        assert!(is_superset_of("a/b/#", "a/b/c/d/e"));
        assert!(is_superset_of("a/b/#", "a/b"));
        assert!(!is_superset_of("a/b/c", "a/b/#"));
    }

    #[test]
    fn mismatched_length_without_hash_fails() {
        assert!(!is_superset_of("a/b", "a/b/c"));
        assert!(!is_superset_of("a/b/c", "a/b"));
    }

    #[test]
    fn consolidation_example_from_spec() {
        assert!(is_superset_of("A/B/+", "A/B/C"));
        assert!(!is_superset_of("A/B/C", "A/B/+"));
    }

    #[test]
    fn publish_rejects_wildcards() {
        assert!(validate_publish_topic("a/+/c").is_err());
        assert!(validate_publish_topic("a/#").is_err());
        assert!(validate_publish_topic("a/b/c").is_ok());
    }

    #[test]
    fn subscribe_allows_wildcards_in_right_position() {
        assert!(validate_subscribe_topic("a/+/c").is_ok());
        assert!(validate_subscribe_topic("a/b/#").is_ok());
        assert!(validate_subscribe_topic("a/#/c").is_err());
        assert!(validate_subscribe_topic("a/b+/c").is_err());
    }

    #[test]
    fn boundary_seven_slashes_ok_eight_fails() {
        let seven = "a/b/c/d/e/f/g/h";
        assert_eq!(seven.matches('/').count(), 7);
        assert!(validate_publish_topic(seven).is_ok());

        let eight = "a/b/c/d/e/f/g/h/i";
        assert!(validate_publish_topic(eight).is_err());
    }

    #[test]
    fn basic_ingest_prefix_strips_before_slash_count() {
        // 3 prefix segments + 6 more slashes in the remainder = 9 total slashes.
        let topic = "$aws/rules/myrule/a/b/c/d/e/f/g";
        assert_eq!(topic.matches('/').count(), 9);
        assert!(validate_publish_topic(topic).is_ok());

        // 11 total slashes -> remainder has 8, over the limit.
        let too_many = "$aws/rules/myrule/a/b/c/d/e/f/g/h/i";
        assert!(validate_publish_topic(too_many).is_err());
    }

    #[test]
    fn basic_ingest_prefix_is_case_insensitive() {
        let topic = "$AWS/RULES/myrule/a/b/c";
        assert!(validate_publish_topic(topic).is_ok());
    }

    #[test]
    fn basic_ingest_length_boundary() {
        let remainder = "a".repeat(MAX_LENGTH_OF_TOPIC);
        let topic = format!("$aws/rules/r/{remainder}");
        assert!(validate_publish_topic(&topic).is_ok());

        let too_long = format!("$aws/rules/r/{}", "a".repeat(MAX_LENGTH_OF_TOPIC + 1));
        assert!(validate_publish_topic(&too_long).is_err());
    }
}
