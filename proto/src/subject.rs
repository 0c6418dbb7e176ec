// Copyright 2025 the natter project authors.
// This file is dual-licensed as Apache-2.0 or GPL-3.0.
// see LICENSE for license details.

//! Subject grammar: validation of subjects, subject patterns and queue
//! group names, plus wildcard matching.
//!
//! A subject is a sequence of dot-separated tokens. Token characters are
//! printable ASCII minus whitespace, `.`, `*` and `>`. In a subscription
//! pattern `*` stands for exactly one token and `>` for one or more
//! trailing tokens; `>` is only legal as the final token.

use crate::ProtocolError;

/// Returns whether `c` may appear inside a literal subject token.
fn is_token_char(c: u8) -> bool {
    c.is_ascii_graphic() && c != b'.' && c != b'*' && c != b'>'
}

fn is_literal_token(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(is_token_char)
}

/// Validate a subject used for publishing: non-empty dot-separated literal
/// tokens, no wildcards anywhere.
pub fn validate_subject(subject: &str) -> Result<(), ProtocolError> {
    let ok = !subject.is_empty() && subject.split('.').all(is_literal_token);
    if ok {
        Ok(())
    } else {
        Err(ProtocolError::BadSubject(subject.to_owned()))
    }
}

/// Validate a subject used for subscribing. Wildcards are allowed: `*` may
/// stand in for any token, and `>` for the final one.
pub fn validate_subject_pattern(pattern: &str) -> Result<(), ProtocolError> {
    if pattern.is_empty() {
        return Err(ProtocolError::BadSubject(pattern.to_owned()));
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        let ok = match *token {
            "*" => true,
            ">" => i == last,
            t => is_literal_token(t),
        };
        if !ok {
            return Err(ProtocolError::BadSubject(pattern.to_owned()));
        }
    }
    Ok(())
}

/// Validate a queue group name: a single literal token.
pub fn validate_queue_group(name: &str) -> Result<(), ProtocolError> {
    if is_literal_token(name) {
        Ok(())
    } else {
        Err(ProtocolError::BadQueueGroup(name.to_owned()))
    }
}

/// Returns whether `subject` (a literal subject) is matched by `pattern`
/// (which may contain wildcards).
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_subjects() {
        assert!(validate_subject("foo").is_ok());
        assert!(validate_subject("foo.bar.baz").is_ok());
        assert!(validate_subject("FOO-2.bar_1").is_ok());

        assert!(validate_subject("").is_err());
        assert!(validate_subject(".foo").is_err());
        assert!(validate_subject("foo.").is_err());
        assert!(validate_subject("foo..bar").is_err());
        assert!(validate_subject("foo bar").is_err());
        assert!(validate_subject("foo.*").is_err());
        assert!(validate_subject("foo.>").is_err());
        assert!(validate_subject("foo\tbar").is_err());
    }

    #[test]
    fn patterns() {
        assert!(validate_subject_pattern("foo.*").is_ok());
        assert!(validate_subject_pattern("*.bar").is_ok());
        assert!(validate_subject_pattern("foo.>").is_ok());
        assert!(validate_subject_pattern(">").is_ok());
        assert!(validate_subject_pattern("*").is_ok());

        // `>` must be the final token.
        assert!(validate_subject_pattern(">.foo").is_err());
        assert!(validate_subject_pattern("foo.>.bar").is_err());
        // Wildcards must stand alone in their token.
        assert!(validate_subject_pattern("fo*.bar").is_err());
        assert!(validate_subject_pattern("foo*").is_err());
    }

    #[test]
    fn queue_groups() {
        assert!(validate_queue_group("workers").is_ok());
        assert!(validate_queue_group("").is_err());
        assert!(validate_queue_group("a.b").is_err());
        assert!(validate_queue_group("a b").is_err());
    }

    #[test]
    fn matching() {
        assert!(matches("foo", "foo"));
        assert!(matches("foo.*", "foo.bar"));
        assert!(matches("foo.>", "foo.bar"));
        assert!(matches("foo.>", "foo.bar.baz"));
        assert!(matches("*.bar", "foo.bar"));
        assert!(matches("*", "foo"));

        assert!(!matches("foo", "bar"));
        assert!(!matches("foo.*", "foo"));
        assert!(!matches("foo.*", "foo.bar.baz"));
        assert!(!matches("foo.>", "foo"));
        assert!(!matches("foo.bar", "foo"));
        assert!(!matches("foo", "foo.bar"));
    }
}
