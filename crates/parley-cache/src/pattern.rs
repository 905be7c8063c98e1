//! Key patterns for bulk invalidation.
//!
//! Patterns use glob syntax (`*`, `?`, `[...]`), the same language the shared
//! store understands for key scans.

use glob::Pattern;

/// Compiles `pattern`, or logs and returns `None` when it is not a valid
/// glob. An invalid pattern invalidates nothing.
pub fn compile(pattern: &str) -> Option<Pattern> {
    match Pattern::new(pattern) {
        Ok(compiled) => Some(compiled),
        Err(e) => {
            tracing::warn!(pattern, "ignoring invalid cache key pattern: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::compile;

    fn matches(pattern: &str, key: &str) -> bool {
        compile(pattern).is_some_and(|p| p.matches(key))
    }

    #[test]
    fn star_spans_key_segments() {
        assert!(matches("llm:*", "llm:response:abc"));
        assert!(matches("user:*:voice", "user:42:voice"));
        assert!(!matches("llm:*", "stt:response"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(matches("key?", "key1"));
        assert!(!matches("key?", "key12"));
    }

    #[test]
    fn invalid_pattern_matches_nothing() {
        assert!(compile("llm:[").is_none());
        assert!(!matches("llm:[", "llm:["));
    }
}
