use std::fmt;

use globset::{Glob, GlobMatcher};
use regex::Regex;

use crate::error::AclError;
use crate::key::MeshKey;

/// A key pattern whose match strategy is fixed when it is parsed.
///
/// A leading `/` compiles the body as a regular expression (a trailing `/`
/// is stripped), `*` or `?` compiles as a glob, anything else matches the
/// encoded key exactly.
#[derive(Clone)]
pub enum KeyPattern {
    Exact(String),
    Glob { raw: String, matcher: GlobMatcher },
    Regex { raw: String, regex: Regex },
}

impl KeyPattern {
    pub fn parse(raw: &str) -> Result<Self, AclError> {
        if raw.is_empty() {
            return Err(AclError::EmptyPattern);
        }
        if let Some(body) = raw.strip_prefix('/') {
            let body = body.strip_suffix('/').unwrap_or(body);
            let regex = Regex::new(body).map_err(|err| AclError::InvalidRegex {
                pattern: raw.to_string(),
                detail: err.to_string(),
            })?;
            return Ok(Self::Regex {
                raw: raw.to_string(),
                regex,
            });
        }
        if raw.contains('*') || raw.contains('?') {
            let matcher = Glob::new(raw)
                .map_err(|err| AclError::InvalidGlob {
                    pattern: raw.to_string(),
                    detail: err.to_string(),
                })?
                .compile_matcher();
            return Ok(Self::Glob {
                raw: raw.to_string(),
                matcher,
            });
        }
        Ok(Self::Exact(raw.to_string()))
    }

    pub fn raw(&self) -> &str {
        match self {
            Self::Exact(raw) => raw,
            Self::Glob { raw, .. } => raw,
            Self::Regex { raw, .. } => raw,
        }
    }

    pub fn matches(&self, key: &MeshKey) -> bool {
        self.matches_encoded(&key.encoded())
    }

    pub fn matches_encoded(&self, encoded: &str) -> bool {
        match self {
            Self::Exact(raw) => raw == encoded,
            Self::Glob { matcher, .. } => matcher.is_match(encoded),
            Self::Regex { regex, .. } => regex.is_match(encoded),
        }
    }
}

impl fmt::Debug for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(raw) => f.debug_tuple("Exact").field(raw).finish(),
            Self::Glob { raw, .. } => f.debug_tuple("Glob").field(raw).finish(),
            Self::Regex { raw, .. } => f.debug_tuple("Regex").field(raw).finish(),
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw())
    }
}
