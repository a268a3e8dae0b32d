//! Following relation paths through the live object graph.

use crate::attr_path::PathStep;
use crate::error::{Error, PathError, PathErrorKind, Result};
use crate::object::{ObjectRef, Related};
use crate::path::Path;
use std::collections::HashSet;

/// Result of following a dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Dotted {
    /// A scalar step led nowhere.
    #[default]
    None,
    /// Every step was scalar.
    One(ObjectRef),
    /// At least one step was a collection.
    Many(Vec<ObjectRef>),
}

impl Dotted {
    pub fn as_one(&self) -> Option<&ObjectRef> {
        match self {
            Dotted::One(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn into_vec(self) -> Vec<ObjectRef> {
        match self {
            Dotted::None => Vec::new(),
            Dotted::One(obj) => vec![obj],
            Dotted::Many(items) => items,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Dotted::None)
    }

    pub fn len(&self) -> usize {
        match self {
            Dotted::None => 0,
            Dotted::One(_) => 1,
            Dotted::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Follow `path` from `root`.
///
/// Scalar relationships yield the related object (or [`Dotted::None`], which
/// ends the walk); collections yield a flat list. Once the value is a list,
/// each further segment is applied per element and the results concatenated in
/// order. Reads in-memory state only.
pub fn getdotattr(root: &ObjectRef, path: &Path) -> Result<Dotted> {
    getdotattr_filtered(root, path, |_| true)
}

/// [`getdotattr`], keeping only objects accepted by `keep` at every step.
pub fn getdotattr_filtered<F>(root: &ObjectRef, path: &Path, keep: F) -> Result<Dotted>
where
    F: Fn(&ObjectRef) -> bool,
{
    let mut current = Dotted::One(root.clone());
    for segment in path {
        current = match current {
            Dotted::None => return Ok(Dotted::None),
            Dotted::One(obj) => match step(&obj, segment, root, path)? {
                Related::Scalar(target) => target.filter(|t| keep(t)).map_or(Dotted::None, Dotted::One),
                Related::Collection(items) => {
                    Dotted::Many(items.into_iter().filter(|t| keep(t)).collect())
                }
            },
            Dotted::Many(items) => {
                let mut next = Vec::new();
                for obj in &items {
                    match step(obj, segment, root, path)? {
                        Related::Scalar(Some(target)) if keep(&target) => next.push(target),
                        Related::Scalar(_) => {}
                        Related::Collection(found) => {
                            next.extend(found.into_iter().filter(|t| keep(t)));
                        }
                    }
                }
                Dotted::Many(next)
            }
        };
    }
    Ok(current)
}

fn step(obj: &ObjectRef, segment: &str, root: &ObjectRef, path: &Path) -> Result<Related> {
    if obj.mapper().relationship(segment).is_none() {
        return Err(Error::Path(
            PathError::new(
                PathErrorKind::NotARelationship,
                root.class_name(),
                path.to_string(),
                format!("'{}' has no relationship '{}'", obj.class_name(), segment),
            )
            .segment(segment),
        ));
    }
    obj.relation(segment)
}

/// Objects reachable from `root` along `steps`, following both current targets
/// and targets removed since the last flush. Deduplicated, first-seen order.
pub fn reachable_with_history(root: &ObjectRef, steps: &[PathStep]) -> Vec<ObjectRef> {
    let mut frontier = vec![root.clone()];
    for s in steps {
        let mut seen = HashSet::new();
        let mut next = Vec::new();
        for obj in &frontier {
            let current = obj.collection(s.name());
            let removed = obj.history(s.name()).removed;
            for target in current.into_iter().chain(removed) {
                if seen.insert(target.clone()) {
                    next.push(target);
                }
            }
        }
        frontier = next;
    }
    frontier
}
