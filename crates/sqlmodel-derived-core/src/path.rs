//! Dotted relation paths.
//!
//! A [`Path`] is an immutable sequence of attribute names such as
//! `comments.author`. It knows nothing about classes; binding it to a root class
//! is the job of [`AttrPath`](crate::AttrPath).

use crate::error::{Error, PathErrorKind, Result};
use crate::ident::is_identifier;
use std::fmt;
use std::ops::{Bound, Index, RangeBounds};
use std::str::FromStr;

/// An ordered list of attribute names. The empty path is allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// Parse a dotted path. `""` is the empty path.
    pub fn new(dotted: &str) -> Result<Self> {
        if dotted.is_empty() {
            return Ok(Self::empty());
        }
        Self::from_segments(dotted.split('.'))
    }

    /// Build a path from individual segments.
    pub fn from_segments<I>(segments: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if let Some(bad) = segments.iter().find(|s| !is_identifier(s)) {
            let dotted = segments.join(".");
            return Err(Error::Path(
                crate::error::PathError::new(
                    PathErrorKind::InvalidSegment,
                    "",
                    dotted,
                    "path segments must be identifiers",
                )
                .segment(bad.clone()),
            ));
        }
        Ok(Self { segments })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    pub fn first(&self) -> Option<&str> {
        self.get(0)
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.segments.iter()
    }

    /// Sub-path over `range`. Bounds past the end are clamped, so slicing an
    /// empty path always yields the empty path.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Path {
        let (start, end) = clamp(&range, self.len());
        Path {
            segments: self.segments[start..end].to_vec(),
        }
    }

    /// Segment-aligned position of `sub` inside this path.
    ///
    /// The empty path is found at position 0.
    pub fn index_of(&self, sub: &Path) -> Result<usize> {
        if sub.is_empty() {
            return Ok(0);
        }
        self.segments
            .windows(sub.len())
            .position(|w| w == sub.segments.as_slice())
            .ok_or_else(|| {
                Error::path(
                    PathErrorKind::NotFound,
                    "",
                    self.to_string(),
                    format!("'{sub}' is not a sub-path"),
                )
            })
    }

    /// Whether `prefix` is a leading sub-path.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// This path followed by `other`.
    #[must_use]
    pub fn concat(&self, other: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Path { segments }
    }

    /// This path with its segments in reverse order.
    #[must_use]
    pub fn reversed(&self) -> Path {
        Path {
            segments: self.segments.iter().rev().cloned().collect(),
        }
    }
}

pub(crate) fn clamp(range: &impl RangeBounds<usize>, len: usize) -> (usize, usize) {
    let start = match range.start_bound() {
        Bound::Included(&s) => s,
        Bound::Excluded(&s) => s.saturating_add(1),
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&e) => e.saturating_add(1),
        Bound::Excluded(&e) => e,
        Bound::Unbounded => len,
    };
    let end = end.min(len);
    (start.min(end), end)
}

impl Index<usize> for Path {
    type Output = str;

    fn index(&self, index: usize) -> &str {
        &self.segments[index]
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Path::new(s)
    }
}

impl TryFrom<&str> for Path {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Path::new(s)
    }
}

impl TryFrom<String> for Path {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Path::new(&s)
    }
}

impl PartialEq<str> for Path {
    fn eq(&self, other: &str) -> bool {
        self.to_string() == other
    }
}

impl PartialEq<&str> for Path {
    fn eq(&self, other: &&str) -> bool {
        self.to_string() == *other
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

impl IntoIterator for Path {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.into_iter()
    }
}

/// Build a [`Path`] from identifiers: `path!(comments.author)`.
///
/// Raw identifiers lose their prefix, so `path!(r#type)` is the path `type`.
///
/// # Panics
///
/// Panics when a segment is a Rust identifier but not a plain ASCII name,
/// such as `path!(café)`. Use [`Path::new`] to handle such input as an error.
#[macro_export]
macro_rules! path {
    () => {
        $crate::Path::empty()
    };
    ($first:ident $(. $rest:ident)*) => {
        $crate::Path::from_idents(&[stringify!($first) $(, stringify!($rest))*])
    };
}

impl Path {
    #[doc(hidden)]
    pub fn from_idents(idents: &[&str]) -> Self {
        let segments = idents.iter().map(|&i| i.strip_prefix("r#").unwrap_or(i));
        match Self::from_segments(segments) {
            Ok(path) => path,
            Err(e) => panic!("path!({}): {e}", idents.join(".")),
        }
    }
}
