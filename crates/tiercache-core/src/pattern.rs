//! Glob patterns for invalidation.
//!
//! Two metacharacters are recognised: `*` matches any run of characters
//! (including `:`) and `?` matches exactly one character. Everything else is
//! literal. The same pattern is used against the local tier (compiled to an
//! anchored regex) and handed to the distributed store's key scan.

use regex::Regex;

use crate::error::CacheError;

#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(glob: &str) -> Result<Self, CacheError> {
        if glob.is_empty() {
            return Err(CacheError::InvalidPattern {
                pattern: String::new(),
                message: "pattern must not be empty".into(),
            });
        }

        let mut source = String::with_capacity(glob.len() + 8);
        source.push('^');
        let mut literal = [0u8; 4];
        for ch in glob.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(other.encode_utf8(&mut literal))),
            }
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| CacheError::InvalidPattern {
            pattern: glob.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    /// The pattern as given.
    pub fn as_str(&self) -> &str {
        &self.glob
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// The pattern in Redis `SCAN MATCH` syntax.
    ///
    /// Redis also treats `[`, `]` and `\` as special, so they are escaped to
    /// keep them literal.
    pub fn redis_match(&self) -> String {
        let mut out = String::with_capacity(self.glob.len());
        for ch in self.glob.chars() {
            if matches!(ch, '[' | ']' | '\\') {
                out.push('\\');
            }
            out.push(ch);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_across_segments() {
        let p = KeyPattern::new("v1:api:items*").unwrap();
        assert!(p.matches("v1:api:items"));
        assert!(p.matches("v1:api:items:aa11"));
        assert!(p.matches("v1:api:items-archive:bb22"));
        assert!(!p.matches("v1:api:users:aa11"));
        assert!(!p.matches("v2:api:items:aa11"));
    }

    #[test]
    fn test_question_mark_matches_one_char() {
        let p = KeyPattern::new("v1:ns:item?").unwrap();
        assert!(p.matches("v1:ns:item1"));
        assert!(!p.matches("v1:ns:item"));
        assert!(!p.matches("v1:ns:item12"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let p = KeyPattern::new("v1:ns:a.b+(c)").unwrap();
        assert!(p.matches("v1:ns:a.b+(c)"));
        assert!(!p.matches("v1:ns:aXbb(c)"));
    }

    #[test]
    fn test_empty_pattern_is_rejected() {
        assert!(matches!(KeyPattern::new(""), Err(CacheError::InvalidPattern { .. })));
    }

    #[test]
    fn test_anchored() {
        let p = KeyPattern::new("api:*").unwrap();
        assert!(!p.matches("v1:api:items"));
    }

    #[test]
    fn test_redis_match_escapes_brackets() {
        let p = KeyPattern::new("v1:ns:[draft]*").unwrap();
        assert_eq!(p.redis_match(), "v1:ns:\\[draft\\]*");
        assert!(p.matches("v1:ns:[draft]:1"));
    }
}
