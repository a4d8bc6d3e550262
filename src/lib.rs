pub mod artifact;
pub mod config;
pub mod error;
pub mod extractor;
pub mod sandbox;
pub mod stager;

/// Returns the trailing `max_bytes` of `s`, starting on a char boundary.
pub fn tail_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Reduces an untrusted identifier to the safe charset `[A-Za-z0-9_.-]`.
///
/// Submission ids are opaque caller-supplied strings, used for naming and
/// correlation only; they must pass through here before touching a path or
/// an environment-naming API.
pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect()
}
