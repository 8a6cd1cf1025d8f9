//! Subject validation, composition, and wildcard matching.
//!
//! Every message travels on a subject of the form `{env}.{app}.{topic}`.
//! Environment and application segments are literal; topic segments may be
//! literal, `*` (exactly one segment), or a trailing `>` (one or more
//! segments). Segments are lowercase alphanumeric plus `-`.

use crate::error::{Error, Result};

/// Compose a full subject from environment, application, and topic.
///
/// The topic may contain wildcards; env and app may not.
pub fn compose(env: &str, app: &str, topic: &str) -> Result<String> {
    validate_literal_segment(env, "env")?;
    validate_literal_segment(app, "app")?;
    validate_topic(topic)?;
    Ok(format!("{env}.{app}.{topic}"))
}

/// Validate a topic pattern: dot-separated segments, wildcards allowed,
/// `>` only in trailing position.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::Subject("topic must not be empty".into()));
    }
    let segments: Vec<&str> = topic.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "" => {
                return Err(Error::Subject(format!("empty segment in topic '{topic}'")));
            }
            "*" => {}
            ">" => {
                if i != segments.len() - 1 {
                    return Err(Error::Subject(format!(
                        "'>' must be the final segment in topic '{topic}'"
                    )));
                }
            }
            s => validate_literal_segment(s, "topic")?,
        }
    }
    Ok(())
}

fn validate_literal_segment(segment: &str, kind: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::Subject(format!("{kind} segment must not be empty")));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::Subject(format!(
            "{kind} segment '{segment}' must be lowercase alphanumeric or '-'"
        )));
    }
    Ok(())
}

/// Match a subject pattern against a concrete subject.
///
/// `*` matches exactly one segment; `>` matches one or more trailing
/// segments. Literal segments match byte-for-byte. A pattern also matches
/// another pattern when the two can deliver the same concrete subject, which
/// is what the topology overlap guard relies on.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.').peekable();

    loop {
        match (pat.next(), sub.peek()) {
            (None, None) => return true,
            (None, Some(_)) => return false,
            (Some(">"), Some(_)) => return true,
            (Some(">"), None) => return false,
            (Some(p), Some(&s)) => {
                // Two patterns overlap if either side wildcards the segment.
                if s == ">" {
                    return true;
                }
                if p != "*" && s != "*" && p != s {
                    return false;
                }
                sub.next();
            }
            (Some(_), None) => return false,
        }
    }
}

/// Deterministic prefix for durable consumer names, derived from identity.
pub fn prefix_of(env: &str, app: &str) -> String {
    format!("{env}-{app}")
}

/// Validate a subscriber or stream-facing name: same alphabet as a literal
/// segment, since it ends up inside durable consumer names.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    validate_literal_segment(name, "name")
}
