//! Relation paths bound to a mapped class.

use crate::error::{Error, PathError, PathErrorKind, Result};
use crate::mapper::{Mapper, Registry};
use crate::path::{Path, clamp};
use crate::relationship::{Relationship, RelationshipKind};
use std::fmt;
use std::ops::RangeBounds;
use std::sync::Arc;

/// One resolved segment of an [`AttrPath`].
#[derive(Debug, Clone)]
pub struct PathStep {
    /// Class the relationship is traversed from.
    pub parent: Arc<Mapper>,
    pub relationship: Relationship,
    /// Class the relationship leads to.
    pub target: Arc<Mapper>,
}

impl PathStep {
    pub fn name(&self) -> &str {
        self.relationship.name()
    }
}

/// A [`Path`] rooted at a mapped class, with every segment resolved to a
/// relationship.
///
/// ```ignore
/// let p = AttrPath::new(&registry, "Thread", "comments.author")?;
/// assert_eq!(p.leaf().name(), "User");
/// assert_eq!(p.inverse()?.to_string(), "User:comments.thread");
/// ```
#[derive(Debug, Clone)]
pub struct AttrPath {
    root: Arc<Mapper>,
    path: Path,
    steps: Vec<PathStep>,
}

impl AttrPath {
    /// Resolve `dotted` against `class`.
    pub fn new(registry: &Registry, class: &str, dotted: &str) -> Result<Self> {
        let path = Path::new(dotted).map_err(|e| match e {
            Error::Path(mut p) => {
                p.class = class.to_string();
                Error::Path(p)
            }
            other => other,
        })?;
        Self::from_path(registry, class, path)
    }

    /// Resolve a single relationship of `class`.
    pub fn from_relationship(registry: &Registry, class: &str, relationship: &str) -> Result<Self> {
        Self::new(registry, class, relationship)
    }

    /// Resolve `path` against `class`.
    pub fn from_path(registry: &Registry, class: &str, path: Path) -> Result<Self> {
        let root = registry
            .mapper(class)
            .map_err(|_| {
                Error::path(
                    PathErrorKind::UnknownClass,
                    class,
                    path.to_string(),
                    format!("'{class}' is not a mapped class"),
                )
            })?
            .clone();

        let mut steps = Vec::with_capacity(path.len());
        let mut current = Arc::clone(&root);
        for segment in &path {
            let relationship = current.relationship(segment).cloned().ok_or_else(|| {
                let message = if current.column(segment).is_some() {
                    format!("'{}.{}' is a column, not a relationship", current.name(), segment)
                } else {
                    format!("'{}' has no relationship '{}'", current.name(), segment)
                };
                Error::Path(
                    PathError::new(PathErrorKind::NotARelationship, class, path.to_string(), message)
                        .segment(segment.clone()),
                )
            })?;
            let target = registry
                .mapper(relationship.target())
                .map_err(|_| {
                    Error::Path(
                        PathError::new(
                            PathErrorKind::UnknownClass,
                            class,
                            path.to_string(),
                            format!("'{}' is not a mapped class", relationship.target()),
                        )
                        .segment(segment.clone()),
                    )
                })?
                .clone();
            steps.push(PathStep {
                parent: current,
                relationship,
                target: Arc::clone(&target),
            });
            current = target;
        }

        Ok(Self { root, path, steps })
    }

    fn from_steps(root: Arc<Mapper>, steps: Vec<PathStep>) -> Self {
        let path = Path::from_segments(steps.iter().map(|s| s.name().to_string()))
            .unwrap_or_default();
        Self { root, path, steps }
    }

    pub fn root(&self) -> &Arc<Mapper> {
        &self.root
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PathStep> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Class reached after `k` segments (`class_at(0)` is the root).
    pub fn class_at(&self, k: usize) -> &Arc<Mapper> {
        match k.checked_sub(1).and_then(|i| self.steps.get(i)) {
            Some(step) => &step.target,
            None if k == 0 => &self.root,
            None => self.leaf(),
        }
    }

    /// Class at the end of the path.
    pub fn leaf(&self) -> &Arc<Mapper> {
        self.steps.last().map_or(&self.root, |s| &s.target)
    }

    /// Kind of the final segment.
    pub fn direction(&self) -> Option<RelationshipKind> {
        self.steps.last().map(|s| s.relationship.kind())
    }

    /// Whether following the path can yield more than one object.
    pub fn is_many(&self) -> bool {
        self.steps.iter().any(|s| s.relationship.is_collection())
    }

    /// Sub-path over `range`, rooted at the class at the range's start.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> AttrPath {
        let (start, end) = clamp(&range, self.len());
        Self::from_steps(
            Arc::clone(self.class_at(start)),
            self.steps[start..end].to_vec(),
        )
    }

    /// The path walked backwards, rooted at the leaf class.
    ///
    /// Fails with [`PathErrorKind::MissingBackref`] naming the first segment that
    /// has no back-reference.
    pub fn inverse(&self) -> Result<AttrPath> {
        let mut steps = Vec::with_capacity(self.steps.len());
        for step in self.steps.iter().rev() {
            let back = step
                .relationship
                .back_populates()
                .and_then(|name| step.target.relationship(name))
                .ok_or_else(|| {
                    Error::Path(
                        PathError::new(
                            PathErrorKind::MissingBackref,
                            self.root.name(),
                            self.path.to_string(),
                            format!(
                                "'{}.{}' has no back-reference",
                                step.parent.name(),
                                step.name()
                            ),
                        )
                        .segment(step.name()),
                    )
                })?;
            steps.push(PathStep {
                parent: Arc::clone(&step.target),
                relationship: back.clone(),
                target: Arc::clone(&step.parent),
            });
        }
        Ok(Self::from_steps(Arc::clone(self.leaf()), steps))
    }
}

impl PartialEq for AttrPath {
    fn eq(&self, other: &Self) -> bool {
        self.root.name() == other.root.name() && self.path == other.path
    }
}

impl Eq for AttrPath {}

impl fmt::Display for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.root.name(), self.path)
    }
}

impl<'a> IntoIterator for &'a AttrPath {
    type Item = &'a PathStep;
    type IntoIter = std::slice::Iter<'a, PathStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldInfo;
    use crate::mapper::RegistryBuilder;
    use crate::relationship::{LinkTableInfo, RelationshipInfo};
    use crate::types::SqlType;

    fn registry() -> Arc<Registry> {
        RegistryBuilder::new()
            .mapper(
                Mapper::builder("User", "users")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("name", SqlType::Text))
                    .relationship(
                        RelationshipInfo::one_to_many("comments", "Comment", "author_id")
                            .back_populates("author"),
                    )
                    .relationship(RelationshipInfo::many_to_many(
                        "groups",
                        "Group",
                        LinkTableInfo::new("memberships", "user_id", "group_id"),
                    )),
            )
            .mapper(
                Mapper::builder("Group", "groups").column(FieldInfo::id("id")),
            )
            .mapper(
                Mapper::builder("Thread", "threads")
                    .column(FieldInfo::id("id"))
                    .relationship(
                        RelationshipInfo::one_to_many("comments", "Comment", "thread_id")
                            .back_populates("thread"),
                    ),
            )
            .mapper(
                Mapper::builder("Comment", "comments")
                    .column(FieldInfo::id("id"))
                    .column(FieldInfo::new("thread_id", SqlType::BigInt))
                    .column(FieldInfo::new("author_id", SqlType::BigInt))
                    .relationship(
                        RelationshipInfo::many_to_one("thread", "Thread", "thread_id")
                            .back_populates("comments"),
                    )
                    .relationship(
                        RelationshipInfo::many_to_one("author", "User", "author_id")
                            .back_populates("comments"),
                    ),
            )
            .configure()
            .unwrap()
    }

    #[test]
    fn resolves_every_segment() {
        let reg = registry();
        let p = AttrPath::new(&reg, "Thread", "comments.author").unwrap();
        assert_eq!(p.len(), 2);
        assert_eq!(p.class_at(0).name(), "Thread");
        assert_eq!(p.class_at(1).name(), "Comment");
        assert_eq!(p.leaf().name(), "User");
        assert_eq!(p.direction(), Some(RelationshipKind::ManyToOne));
        assert!(p.is_many());
        assert_eq!(p.to_string(), "Thread:comments.author");
    }

    #[test]
    fn unresolvable_segments_name_the_problem() {
        let reg = registry();
        let err = AttrPath::new(&reg, "Thread", "comments.body").unwrap_err();
        match err {
            Error::Path(e) => {
                assert_eq!(e.kind, PathErrorKind::NotARelationship);
                assert_eq!(e.class, "Thread");
                assert_eq!(e.path, "comments.body");
                assert_eq!(e.segment.as_deref(), Some("body"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let err = AttrPath::new(&reg, "Comment", "thread_id").unwrap_err();
        assert!(err.to_string().contains("is a column"));
        let err = AttrPath::new(&reg, "Nope", "comments").unwrap_err();
        assert!(matches!(err, Error::Path(ref e) if e.kind == PathErrorKind::UnknownClass));
    }

    #[test]
    fn inverse_walks_back_references() {
        let reg = registry();
        let p = AttrPath::new(&reg, "Thread", "comments.author").unwrap();
        let inv = p.inverse().unwrap();
        assert_eq!(inv.root().name(), "User");
        assert_eq!(inv.path().to_string(), "comments.thread");
        assert_eq!(inv.leaf().name(), "Thread");
        assert_eq!(inv.inverse().unwrap(), p);
    }

    #[test]
    fn inverse_fails_without_backref() {
        let reg = registry();
        let p = AttrPath::new(&reg, "User", "groups").unwrap();
        let err = p.inverse().unwrap_err();
        match err {
            Error::Path(e) => {
                assert_eq!(e.kind, PathErrorKind::MissingBackref);
                assert_eq!(e.segment.as_deref(), Some("groups"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn slices_are_rooted_where_they_start() {
        let reg = registry();
        let p = AttrPath::new(&reg, "Thread", "comments.author.groups").unwrap();
        let tail = p.slice(1..);
        assert_eq!(tail, AttrPath::new(&reg, "Comment", "author.groups").unwrap());
        assert_eq!(p.slice(0..p.len()), p);
        let empty = p.slice(3..);
        assert!(empty.is_empty());
        assert_eq!(empty.root().name(), "Group");
        assert_eq!(empty.inverse().unwrap(), empty);
    }
}
