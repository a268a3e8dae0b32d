//! Relationship metadata.
//!
//! Relationships are declared on a [`MapperBuilder`](crate::MapperBuilder) as
//! [`RelationshipInfo`] values and resolved into [`Relationship`]s when the
//! registry is configured. A resolved relationship knows the concrete column
//! pairs that join its parent table to its target table (through a link table
//! for many-to-many), which is what the join builders and the flush need.

use crate::error::{ConfigError, Error, Result};
use crate::value::Value;

/// The type of relationship between two mapped classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    /// One-to-one: `Hero` has one `Profile`.
    OneToOne,
    /// Many-to-one: many `Comment`s belong to one `Thread`.
    #[default]
    ManyToOne,
    /// One-to-many: one `Thread` has many `Comment`s.
    OneToMany,
    /// Many-to-many: `Hero`s have many `Power`s via a link table.
    ManyToMany,
}

impl RelationshipKind {
    /// Whether the relationship holds a collection.
    pub const fn is_collection(self) -> bool {
        matches!(self, RelationshipKind::OneToMany | RelationshipKind::ManyToMany)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RelationshipKind::OneToOne => "one-to-one",
            RelationshipKind::ManyToOne => "many-to-one",
            RelationshipKind::OneToMany => "one-to-many",
            RelationshipKind::ManyToMany => "many-to-many",
        }
    }
}

/// Information about a link/join table for many-to-many relationships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"hero_powers"`).
    pub table_name: String,

    /// Columns in the link table pointing to the parent's primary key.
    pub local_columns: Vec<String>,

    /// Columns in the link table pointing to the target's primary key.
    pub remote_columns: Vec<String>,
}

impl LinkTableInfo {
    /// Create a new single-column link-table definition.
    pub fn new(
        table_name: impl Into<String>,
        local_column: impl Into<String>,
        remote_column: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            local_columns: vec![local_column.into()],
            remote_columns: vec![remote_column.into()],
        }
    }

    /// Create a composite link-table definition.
    ///
    /// Column order must match the primary key ordering of each side.
    pub fn composite<L, R>(table_name: impl Into<String>, local_columns: L, remote_columns: R) -> Self
    where
        L: IntoIterator,
        L::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            table_name: table_name.into(),
            local_columns: local_columns.into_iter().map(Into::into).collect(),
            remote_columns: remote_columns.into_iter().map(Into::into).collect(),
        }
    }
}

/// Which side of a join a literal filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    Parent,
    Target,
    Link,
}

/// A `column = literal` term of a custom join condition.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinFilter {
    pub side: JoinSide,
    pub column: String,
    pub value: Value,
}

/// A custom primary-join condition.
///
/// `pairs` are `(parent column, target column)` equalities, or
/// `(parent column, link column)` for relationships through a link table.
/// Filters are ANDed to the pairs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinCondition {
    pub pairs: Vec<(String, String)>,
    pub filters: Vec<JoinFilter>,
}

impl JoinCondition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `parent.column = target.column` term.
    pub fn on(mut self, parent: impl Into<String>, target: impl Into<String>) -> Self {
        self.pairs.push((parent.into(), target.into()));
        self
    }

    /// Add a `side.column = value` term.
    pub fn filter(
        mut self,
        side: JoinSide,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.filters.push(JoinFilter {
            side,
            column: column.into(),
            value: value.into(),
        });
        self
    }
}

/// Metadata about a relationship as declared on a mapper.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipInfo {
    /// Name of the relationship attribute.
    pub name: String,

    /// The related class name.
    pub target: String,

    /// Kind of relationship.
    pub kind: RelationshipKind,

    /// Foreign key columns on the parent (many-to-one, owning one-to-one), or the
    /// referenced parent columns for one-to-many.
    pub local_keys: Vec<String>,

    /// Foreign key columns on the target (one-to-many, non-owning one-to-one), or
    /// the referenced target columns for many-to-one.
    pub remote_keys: Vec<String>,

    /// Link table for many-to-many relationships.
    pub link_table: Option<LinkTableInfo>,

    /// The attribute on the related class that points back.
    pub back_populates: Option<String>,

    /// Delete targets together with the parent.
    pub cascade_delete: bool,

    /// Custom primary-join condition, honoured verbatim when joining.
    pub primaryjoin: Option<JoinCondition>,
}

impl RelationshipInfo {
    /// Create a new relationship with required fields.
    pub fn new(name: impl Into<String>, target: impl Into<String>, kind: RelationshipKind) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind,
            local_keys: Vec::new(),
            remote_keys: Vec::new(),
            link_table: None,
            back_populates: None,
            cascade_delete: false,
            primaryjoin: None,
        }
    }

    /// Many-to-one through the foreign key column `fk` on the parent.
    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        fk: impl Into<String>,
    ) -> Self {
        Self::new(name, target, RelationshipKind::ManyToOne).local_key(fk)
    }

    /// One-to-many through the foreign key column `fk` on the target.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        fk: impl Into<String>,
    ) -> Self {
        Self::new(name, target, RelationshipKind::OneToMany).remote_key(fk)
    }

    /// Many-to-many through `link`.
    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        link: LinkTableInfo,
    ) -> Self {
        Self::new(name, target, RelationshipKind::ManyToMany).link_table(link)
    }

    /// Set a single local key column.
    pub fn local_key(mut self, key: impl Into<String>) -> Self {
        self.local_keys = vec![key.into()];
        self
    }

    /// Set composite local key columns.
    pub fn local_keys<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.local_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set a single remote key column.
    pub fn remote_key(mut self, key: impl Into<String>) -> Self {
        self.remote_keys = vec![key.into()];
        self
    }

    /// Set composite remote key columns.
    pub fn remote_keys<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.remote_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the link table (many-to-many).
    pub fn link_table(mut self, link: LinkTableInfo) -> Self {
        self.link_table = Some(link);
        self
    }

    /// Set the back-reference attribute name.
    pub fn back_populates(mut self, name: impl Into<String>) -> Self {
        self.back_populates = Some(name.into());
        self
    }

    /// Enable cascade delete.
    pub fn cascade_delete(mut self, value: bool) -> Self {
        self.cascade_delete = value;
        self
    }

    /// Use a custom primary-join condition.
    pub fn primaryjoin(mut self, condition: JoinCondition) -> Self {
        self.primaryjoin = Some(condition);
        self
    }

    /// Whether the foreign key lives on the parent table.
    pub fn fk_on_parent(&self) -> bool {
        match self.kind {
            RelationshipKind::ManyToOne => true,
            RelationshipKind::OneToOne => !self.local_keys.is_empty(),
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany => false,
        }
    }
}

/// Concrete join columns of a resolved relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinColumns {
    /// `(parent column, target column)` equalities.
    Direct { pairs: Vec<(String, String)> },
    /// Parent to link table, then link table to target.
    Link {
        table: String,
        /// `(parent column, link column)`
        parent: Vec<(String, String)>,
        /// `(link column, target column)`
        target: Vec<(String, String)>,
    },
}

/// A relationship resolved against the configured registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub info: RelationshipInfo,
    /// Class that declares the relationship.
    pub parent: String,
    pub join: JoinColumns,
    pub filters: Vec<JoinFilter>,
}

impl Relationship {
    /// Resolve `info` declared on `parent` given both sides' primary keys.
    pub fn resolve(
        info: RelationshipInfo,
        parent: &str,
        parent_pk: &[String],
        target_pk: &[String],
    ) -> Result<Self> {
        let fail = |message: String| -> Error {
            Error::Config(ConfigError::new(message).class(parent).attribute(&info.name))
        };

        let (join, filters) = match (&info.kind, &info.link_table) {
            (RelationshipKind::ManyToMany, None) => {
                return Err(fail("many-to-many relationship needs a link table".into()));
            }
            (RelationshipKind::ManyToMany, Some(link)) => {
                if link.local_columns.len() != parent_pk.len()
                    || link.remote_columns.len() != target_pk.len()
                {
                    return Err(fail(format!(
                        "link table '{}' columns do not match the primary keys",
                        link.table_name
                    )));
                }
                let (parent_pairs, filters) = match &info.primaryjoin {
                    Some(custom) => (custom.pairs.clone(), custom.filters.clone()),
                    None => (zip(parent_pk, &link.local_columns), Vec::new()),
                };
                (
                    JoinColumns::Link {
                        table: link.table_name.clone(),
                        parent: parent_pairs,
                        target: zip(&link.remote_columns, target_pk),
                    },
                    filters,
                )
            }
            (_, Some(_)) => {
                return Err(fail(format!(
                    "{} relationship cannot use a link table",
                    info.kind.as_str()
                )));
            }
            (_, None) => {
                let derived = if info.fk_on_parent() {
                    let remote = if info.remote_keys.is_empty() {
                        target_pk
                    } else {
                        &info.remote_keys
                    };
                    checked_zip(&info.local_keys, remote).ok_or_else(|| {
                        fail("foreign key columns do not match the target key".into())
                    })?
                } else {
                    let local = if info.local_keys.is_empty() {
                        parent_pk
                    } else {
                        &info.local_keys
                    };
                    checked_zip(local, &info.remote_keys).ok_or_else(|| {
                        fail("remote key columns do not match the parent key".into())
                    })?
                };
                match &info.primaryjoin {
                    Some(custom) => (
                        JoinColumns::Direct {
                            pairs: custom.pairs.clone(),
                        },
                        custom.filters.clone(),
                    ),
                    None => (JoinColumns::Direct { pairs: derived }, Vec::new()),
                }
            }
        };

        Ok(Self {
            info,
            parent: parent.to_string(),
            join,
            filters,
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn target(&self) -> &str {
        &self.info.target
    }

    pub fn kind(&self) -> RelationshipKind {
        self.info.kind
    }

    pub fn back_populates(&self) -> Option<&str> {
        self.info.back_populates.as_deref()
    }

    pub fn is_collection(&self) -> bool {
        self.info.kind.is_collection()
    }

    /// `(parent fk column, target column)` pairs when the parent holds the foreign key.
    pub fn parent_foreign_keys(&self) -> Vec<(String, String)> {
        if !self.info.fk_on_parent() {
            return Vec::new();
        }
        let remote = self.info.remote_keys.iter();
        match &self.join {
            JoinColumns::Direct { pairs } if self.info.primaryjoin.is_none() => pairs.clone(),
            _ => self.info.local_keys.iter().cloned().zip(remote.cloned()).collect(),
        }
    }

    /// `(parent column, target fk column)` pairs when the target holds the foreign key.
    pub fn target_foreign_keys(&self, parent_pk: &[String]) -> Vec<(String, String)> {
        if self.info.fk_on_parent() || self.info.kind == RelationshipKind::ManyToMany {
            return Vec::new();
        }
        let local: &[String] = if self.info.local_keys.is_empty() {
            parent_pk
        } else {
            &self.info.local_keys
        };
        zip(local, &self.info.remote_keys)
    }
}

fn zip(left: &[String], right: &[String]) -> Vec<(String, String)> {
    left.iter().cloned().zip(right.iter().cloned()).collect()
}

fn checked_zip(left: &[String], right: &[String]) -> Option<Vec<(String, String)>> {
    (!left.is_empty() && left.len() == right.len()).then(|| zip(left, right))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[test]
    fn many_to_one_joins_fk_to_target_pk() {
        let info = RelationshipInfo::many_to_one("thread", "Thread", "thread_id")
            .back_populates("comments");
        let rel = Relationship::resolve(info, "Comment", &pk(), &pk()).unwrap();
        assert_eq!(
            rel.join,
            JoinColumns::Direct {
                pairs: vec![("thread_id".into(), "id".into())]
            }
        );
        assert_eq!(rel.back_populates(), Some("comments"));
        assert!(!rel.is_collection());
        assert_eq!(rel.parent_foreign_keys().len(), 1);
        assert!(rel.target_foreign_keys(&pk()).is_empty());
    }

    #[test]
    fn one_to_many_joins_pk_to_remote_fk() {
        let info = RelationshipInfo::one_to_many("comments", "Comment", "thread_id");
        let rel = Relationship::resolve(info, "Thread", &pk(), &pk()).unwrap();
        assert_eq!(
            rel.join,
            JoinColumns::Direct {
                pairs: vec![("id".into(), "thread_id".into())]
            }
        );
        assert!(rel.is_collection());
        assert_eq!(
            rel.target_foreign_keys(&pk()),
            vec![("id".to_string(), "thread_id".to_string())]
        );
    }

    #[test]
    fn many_to_many_requires_link_table() {
        let info = RelationshipInfo::new("tags", "Tag", RelationshipKind::ManyToMany);
        let err = Relationship::resolve(info, "Post", &pk(), &pk()).unwrap_err();
        assert!(err.to_string().contains("Post.tags"));
    }

    #[test]
    fn many_to_many_resolves_both_sides() {
        let info = RelationshipInfo::many_to_many(
            "tags",
            "Tag",
            LinkTableInfo::new("post_tags", "post_id", "tag_id"),
        );
        let rel = Relationship::resolve(info, "Post", &pk(), &pk()).unwrap();
        match rel.join {
            JoinColumns::Link {
                table,
                parent,
                target,
            } => {
                assert_eq!(table, "post_tags");
                assert_eq!(parent, vec![("id".to_string(), "post_id".to_string())]);
                assert_eq!(target, vec![("tag_id".to_string(), "id".to_string())]);
            }
            JoinColumns::Direct { .. } => panic!("expected link join"),
        }
    }

    #[test]
    fn composite_keys_must_line_up() {
        let composite = vec!["region".to_string(), "code".to_string()];
        let info = RelationshipInfo::many_to_one("store", "Store", "store_region");
        assert!(Relationship::resolve(info, "Sale", &pk(), &composite).is_err());

        let info = RelationshipInfo::many_to_one("store", "Store", "x")
            .local_keys(["store_region", "store_code"]);
        let rel = Relationship::resolve(info, "Sale", &pk(), &composite).unwrap();
        assert_eq!(rel.parent_foreign_keys().len(), 2);
    }

    #[test]
    fn custom_primaryjoin_is_kept_verbatim() {
        let cond = JoinCondition::new()
            .on("id", "thread_id")
            .filter(JoinSide::Target, "published", true);
        let info = RelationshipInfo::one_to_many("published", "Comment", "thread_id")
            .primaryjoin(cond);
        let rel = Relationship::resolve(info, "Thread", &pk(), &pk()).unwrap();
        assert_eq!(rel.filters.len(), 1);
        assert_eq!(rel.filters[0].value, Value::Bool(true));
    }
}
