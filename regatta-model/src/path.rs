use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Sentinel used when a path id has to live inside an opaque string such as
/// an instance id or a persistence key. Segments themselves never contain it,
/// so the encoding is reversible.
pub const SAFE_PATH_SEPARATOR: char = '_';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathIdError {
    #[error("path segment {0:?} is not a valid identifier")]
    InvalidSegment(String),
    #[error("path {0:?} is relative where an absolute path is required")]
    NotAbsolute(String),
}

/// A hierarchical, slash separated identifier for groups and run specs.
///
/// Paths are either absolute (`/prod/db`) or relative (`db`); relative paths
/// only exist transiently inside group updates and are resolved against the
/// update's target group before anything is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathId {
    segments: Vec<String>,
    absolute: bool,
}

impl PathId {
    pub fn root() -> Self {
        PathId {
            segments: Vec::new(),
            absolute: true,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PathIdError> {
        let trimmed = raw.trim();
        let absolute = trimmed.starts_with('/');
        let mut segments = Vec::new();
        for seg in trimmed.split('/') {
            if seg.is_empty() {
                continue;
            }
            if !valid_segment(seg) {
                return Err(PathIdError::InvalidSegment(seg.to_string()));
            }
            segments.push(seg.to_string());
        }
        Ok(PathId { segments, absolute })
    }

    /// Parse, then require the result to be absolute.
    pub fn parse_absolute(raw: &str) -> Result<Self, PathIdError> {
        let id = PathId::parse(raw)?;
        if !id.absolute {
            return Err(PathIdError::NotAbsolute(raw.to_string()));
        }
        Ok(id)
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn is_root(&self) -> bool {
        self.absolute && self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Final segment, or the empty string for the root path.
    pub fn name(&self) -> &str {
        self.segments.last().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn parent(&self) -> PathId {
        let mut segments = self.segments.clone();
        segments.pop();
        PathId {
            segments,
            absolute: self.absolute,
        }
    }

    pub fn append(&self, segment: &str) -> Result<PathId, PathIdError> {
        if !valid_segment(segment) {
            return Err(PathIdError::InvalidSegment(segment.to_string()));
        }
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(PathId {
            segments,
            absolute: self.absolute,
        })
    }

    /// Resolve `self` against `base`: absolute ids are returned untouched,
    /// relative ids become children of `base`.
    pub fn canonical(&self, base: &PathId) -> PathId {
        if self.absolute {
            return self.clone();
        }
        let mut segments = base.segments.clone();
        segments.extend(self.segments.iter().cloned());
        PathId {
            segments,
            absolute: base.absolute,
        }
    }

    /// True if `self` sits strictly below `ancestor`.
    pub fn is_child_of(&self, ancestor: &PathId) -> bool {
        self.segments.len() > ancestor.segments.len()
            && self.segments[..ancestor.segments.len()] == ancestor.segments[..]
    }

    /// All paths from the root down to (and excluding) `self`.
    pub fn ancestors(&self) -> Vec<PathId> {
        let mut out = Vec::with_capacity(self.segments.len());
        for n in 0..self.segments.len() {
            out.push(PathId {
                segments: self.segments[..n].to_vec(),
                absolute: self.absolute,
            });
        }
        out
    }

    /// Reversible encoding for embedding in opaque strings: segments joined
    /// by [`SAFE_PATH_SEPARATOR`] instead of `/`.
    pub fn safe_path(&self) -> String {
        self.segments.join(&SAFE_PATH_SEPARATOR.to_string())
    }

    /// Inverse of [`PathId::safe_path`]; always yields an absolute id.
    pub fn from_safe_path(safe: &str) -> Result<Self, PathIdError> {
        let raw = safe.replace(SAFE_PATH_SEPARATOR, "/");
        Ok(PathId {
            segments: PathId::parse(&raw)?.segments,
            absolute: true,
        })
    }
}

/// Segments are restricted to lowercase alphanumerics and inner dashes.
/// `.` and `/` are reserved by the id syntax, and keeping the underscore out
/// makes [`PathId::safe_path`] reversible.
fn valid_segment(seg: &str) -> bool {
    !seg.is_empty()
        && seg
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !seg.starts_with('-')
        && !seg.ends_with('-')
}

impl Display for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.absolute {
            write!(f, "/{}", self.segments.join("/"))
        } else {
            write!(f, "{}", self.segments.join("/"))
        }
    }
}

impl FromStr for PathId {
    type Err = PathIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PathId::parse(s)
    }
}

impl PartialOrd for PathId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl Serialize for PathId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PathId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PathId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_absolute_and_relative() {
        let abs = PathId::parse("/prod/db").unwrap();
        assert!(abs.is_absolute());
        assert_eq!(abs.segments(), &["prod", "db"]);

        let rel = PathId::parse("db").unwrap();
        assert!(!rel.is_absolute());
        assert_eq!(rel.to_string(), "db");
    }

    #[test]
    fn test_reserved_characters_rejected() {
        assert!(PathId::parse("/a.b").is_err());
        assert!(PathId::parse("/a_b").is_err());
        assert!(PathId::parse("/A").is_err());
        // empty segments collapse instead of erroring
        assert_eq!(PathId::parse("/a//b").unwrap().to_string(), "/a/b");
    }

    #[test]
    fn test_canonical_resolves_relative_against_base() {
        let base = PathId::parse("/parent").unwrap();
        // a relative id becomes a child of the target group
        let rel = PathId::parse("a").unwrap();
        assert_eq!(rel.canonical(&base).to_string(), "/parent/a");
        // an absolute id is untouched
        let abs = PathId::parse("/a").unwrap();
        assert_eq!(abs.canonical(&base).to_string(), "/a");
    }

    #[test]
    fn test_safe_path_round_trip() {
        let id = PathId::parse("/test/app").unwrap();
        assert_eq!(id.safe_path(), "test_app");
        assert_eq!(PathId::from_safe_path("test_app").unwrap(), id);
    }

    #[test]
    fn test_parent_and_child_relationships() {
        let id = PathId::parse("/prod/sleep/goodnight").unwrap();
        assert_eq!(id.parent().to_string(), "/prod/sleep");
        assert!(id.is_child_of(&PathId::parse("/prod").unwrap()));
        assert!(id.is_child_of(&PathId::root()));
        assert!(!id.is_child_of(&PathId::parse("/other").unwrap()));
        // not a child of itself
        assert!(!id.is_child_of(&id));
    }

    #[test]
    fn test_ancestors_walk_down_from_root() {
        let id = PathId::parse("/a/b/c").unwrap();
        let ancestors: Vec<String> = id.ancestors().iter().map(|p| p.to_string()).collect();
        assert_eq!(ancestors, vec!["/", "/a", "/a/b"]);
    }

    #[test]
    fn test_ordering_is_lexicographic_on_canonical_form() {
        let mut ids = vec![
            PathId::parse("/b").unwrap(),
            PathId::parse("/a/c").unwrap(),
            PathId::parse("/a").unwrap(),
        ];
        ids.sort();
        let sorted: Vec<String> = ids.iter().map(|p| p.to_string()).collect();
        assert_eq!(sorted, vec!["/a", "/a/c", "/b"]);
    }

    #[test]
    fn test_serde_round_trips_as_string() {
        let id = PathId::parse("/prod/db").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"/prod/db\"");
        let back: PathId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
