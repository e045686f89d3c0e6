//! Versioned cache key construction.
//!
//! ## Key Format
//!
//! `{schema_version}:{namespace}:{identifier}[:{params_digest}]`, e.g.
//! `v1:api:items:3f2a9c0d1b7e4a55`.
//!
//! `%` and `:` inside a segment are written as `%25` and `%3A`, so a segment
//! never contains the separator and no identifier can forge a digest suffix.
//!
//! ## Parameter Digest
//!
//! Parameters are serialized to JSON, objects are re-emitted with their keys
//! sorted (recursively), and the compact result is hashed with SHA-256. The
//! first 8 bytes of the digest are hex encoded, giving a fixed 16-character
//! suffix. The same parameters therefore produce the same key in every process
//! regardless of field order.
//!
//! Bumping the schema version changes every key, which orphans all entries
//! written under the previous version without an explicit purge.

use std::borrow::Cow;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Number of digest bytes kept in the key (hex encoded to twice as many chars).
const PARAMS_DIGEST_BYTES: usize = 8;

/// An opaque, fully qualified cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already built key, e.g. one read back from the distributed tier.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds deterministic cache keys under a schema version.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    schema_version: String,
}

impl KeyBuilder {
    pub fn new(schema_version: impl Into<String>) -> Self {
        Self {
            schema_version: schema_version.into(),
        }
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Build a key without parameters.
    pub fn build_key(&self, namespace: &str, identifier: &str) -> CacheKey {
        CacheKey(format!(
            "{}:{}:{}",
            escape_segment(&self.schema_version),
            escape_segment(namespace),
            escape_segment(identifier)
        ))
    }

    /// Build a key whose suffix is a digest of `params`.
    ///
    /// # Panics
    ///
    /// Panics if `params` cannot be serialized to JSON (e.g. a map with
    /// non-string keys). That is a programming error, and silently producing
    /// a key would risk collisions.
    pub fn build_key_with<P>(&self, namespace: &str, identifier: &str, params: &P) -> CacheKey
    where
        P: Serialize + ?Sized,
    {
        let digest = params_digest(params).unwrap_or_else(|e| {
            panic!("cache key params for {namespace}:{identifier} are not serializable: {e}")
        });
        CacheKey(format!(
            "{}:{}:{}:{digest}",
            escape_segment(&self.schema_version),
            escape_segment(namespace),
            escape_segment(identifier)
        ))
    }

    /// Build a key from optional parameters; `None` yields the plain key.
    pub fn build_key_opt(&self, namespace: &str, identifier: &str, params: Option<&Value>) -> CacheKey {
        match params {
            Some(params) => self.build_key_with(namespace, identifier, params),
            None => self.build_key(namespace, identifier),
        }
    }

    /// Glob pattern matching keys of `namespace` whose identifier matches `identifier_glob`,
    /// with or without a parameter digest. Glob metacharacters pass through unescaped.
    pub fn pattern(&self, namespace: &str, identifier_glob: &str) -> String {
        format!(
            "{}:{}:{}",
            escape_segment(&self.schema_version),
            escape_segment(namespace),
            escape_segment(identifier_glob)
        )
    }
}

/// Escape the separator (and the escape character itself) inside one key segment.
fn escape_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains(['%', ':']) {
        return Cow::Borrowed(segment);
    }
    let mut out = String::with_capacity(segment.len() + 4);
    for c in segment.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Hex-encoded, truncated SHA-256 of the canonical JSON form of `params`.
pub fn params_digest<P>(params: &P) -> Result<String, serde_json::Error>
where
    P: Serialize + ?Sized,
{
    let value = serde_json::to_value(params)?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(&digest[..PARAMS_DIGEST_BYTES]))
}

/// Compact JSON with object keys in lexicographic order at every depth.
fn write_canonical(value: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k)?);
                out.push(':');
                write_canonical(v, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
