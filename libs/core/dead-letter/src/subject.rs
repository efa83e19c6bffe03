//! Subject matching with NATS wildcard rules.
//!
//! `*` matches exactly one token, `>` matches one or more trailing tokens.

/// Whether `subject` is captured by `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(token)) if !token.is_empty() => continue,
            (Some(expected), Some(token)) if expected == token => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether any subject published on `subject` would be stored by a stream
/// listening on `patterns`.
pub fn captured_by<S: AsRef<str>>(patterns: &[S], subject: &str) -> bool {
    patterns.iter().any(|p| subject_matches(p.as_ref(), subject))
}
