//! The relation engine: descriptors for the six relation kinds, single
//! parent traversal, and batched eager loading over nested dot paths.
//!
//! Every kind answers two operations: `get` for one parent and an eager
//! load over a whole batch of parents. Eager loads issue a bounded number
//! of statements per relation regardless of batch size: one for the
//! has/belongs/morphOne/morphMany kinds, two for pivot and through
//! traversals, and one per distinct target type for morphTo.

mod belongs_to;
mod belongs_to_many;
mod has;
mod morph;
mod through;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::builder::Query;
use crate::connection::Connection;
use crate::entity::{Entity, EntityDef, Related};
use crate::error::{OrmError, OrmResult};
use crate::value::Value;

/// Sub-builder callback applied to a relation's query before it executes.
pub type Constraint = Arc<dyn Fn(Query) -> Query + Send + Sync>;

/// A declared relation: its kind, key layout, and target entity name.
/// `target` is `None` only for morphTo, whose target is carried per-row in
/// the type column.
#[derive(Debug, Clone)]
pub struct RelationDef {
    pub name: String,
    pub target: Option<String>,
    pub kind: RelationKind,
}

#[derive(Debug, Clone)]
pub enum RelationKind {
    HasOne {
        foreign_key: String,
        local_key: String,
    },
    HasMany {
        foreign_key: String,
        local_key: String,
    },
    BelongsTo {
        foreign_key: String,
        owner_key: String,
        touch: bool,
        default: Option<serde_json::Value>,
    },
    BelongsToMany {
        pivot_table: String,
        foreign_pivot_key: String,
        related_pivot_key: String,
        parent_key: String,
        related_key: String,
        pivot_columns: Vec<String>,
        pivot_timestamps: bool,
        pivot_alias: String,
        pivot_wheres: Vec<(String, String, Value)>,
    },
    HasOneThrough {
        through: String,
        first_key: String,
        second_key: String,
        local_key: String,
        through_local_key: String,
    },
    HasManyThrough {
        through: String,
        first_key: String,
        second_key: String,
        local_key: String,
        through_local_key: String,
    },
    MorphOne {
        type_column: String,
        id_column: String,
        local_key: String,
    },
    MorphMany {
        type_column: String,
        id_column: String,
        local_key: String,
    },
    MorphTo {
        type_column: String,
        id_column: String,
    },
}

/// One eager-load declaration as accumulated by `Query::with`.
#[derive(Clone)]
pub struct EagerSpec {
    pub(crate) path: String,
    pub(crate) constraint: Option<Constraint>,
}

impl std::fmt::Debug for EagerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EagerSpec")
            .field("path", &self.path)
            .field("constraint", &self.constraint.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// A dot path `a.b.c` normalized into a tree node. Constraints sit on the
/// leaf of the path they were declared with; intermediate levels load
/// unfiltered.
pub(crate) struct EagerNode {
    pub(crate) name: String,
    pub(crate) constraint: Option<Constraint>,
    pub(crate) children: Vec<EagerNode>,
}

pub(crate) fn build_eager_tree(specs: &[EagerSpec]) -> Vec<EagerNode> {
    let mut roots = Vec::new();
    for spec in specs {
        let segments: Vec<&str> = spec.path.split('.').filter(|s| !s.is_empty()).collect();
        if !segments.is_empty() {
            insert_path(&mut roots, &segments, spec.constraint.clone());
        }
    }
    roots
}

fn insert_path(nodes: &mut Vec<EagerNode>, segments: &[&str], constraint: Option<Constraint>) {
    let (head, tail) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    let idx = match nodes.iter().position(|n| n.name == *head) {
        Some(i) => i,
        None => {
            nodes.push(EagerNode {
                name: head.to_string(),
                constraint: None,
                children: Vec::new(),
            });
            nodes.len() - 1
        }
    };
    let node = &mut nodes[idx];
    if tail.is_empty() {
        if constraint.is_some() {
            node.constraint = constraint;
        }
    } else {
        insert_path(&mut node.children, tail, constraint);
    }
}

/// Loads every relation in `nodes`, in declaration order, across the whole
/// parent batch, then recurses into the union of the loaded entities for
/// nested paths.
pub(crate) fn eager_load_tree<'a>(
    parents: &'a mut [Entity],
    nodes: &'a [EagerNode],
    conn: &'a Arc<Connection>,
) -> Pin<Box<dyn Future<Output = OrmResult<()>> + Send + 'a>> {
    Box::pin(async move {
        if parents.is_empty() {
            return Ok(());
        }
        let def = parents[0].def().clone();
        for node in nodes {
            let rel = def
                .relation(&node.name)
                .cloned()
                .ok_or_else(|| OrmError::RelationUnknown(node.name.clone()))?;
            match &rel.kind {
                RelationKind::HasOne { .. }
                | RelationKind::HasMany { .. }
                | RelationKind::MorphOne { .. }
                | RelationKind::MorphMany { .. } => {
                    has::eager_load(&def, &rel, parents, node, conn).await?
                }
                RelationKind::BelongsTo { .. } => {
                    belongs_to::eager_load(&def, &rel, parents, node, conn).await?
                }
                RelationKind::BelongsToMany { .. } => {
                    belongs_to_many::eager_load(&def, &rel, parents, node, conn).await?
                }
                RelationKind::HasOneThrough { .. } | RelationKind::HasManyThrough { .. } => {
                    through::eager_load(&def, &rel, parents, node, conn).await?
                }
                RelationKind::MorphTo { .. } => {
                    morph::eager_load(&def, &rel, parents, node, conn).await?
                }
            }
        }
        Ok(())
    })
}

/// Instance-side handle over one relation of one parent entity, either
/// declared on the descriptor or constructed ad hoc.
pub struct Relation<'a> {
    pub(crate) parent: &'a Entity,
    pub(crate) def: RelationDef,
    pub(crate) target: Option<Arc<EntityDef>>,
}

impl Relation<'_> {
    /// Fetches the related side for this parent.
    pub async fn get(&self) -> OrmResult<Related> {
        match &self.def.kind {
            RelationKind::HasOne { .. }
            | RelationKind::HasMany { .. }
            | RelationKind::MorphOne { .. }
            | RelationKind::MorphMany { .. } => {
                has::get(self.parent, &self.def, self.required_target()?).await
            }
            RelationKind::BelongsTo { .. } => {
                belongs_to::get(self.parent, &self.def, self.required_target()?).await
            }
            RelationKind::BelongsToMany { .. } => {
                belongs_to_many::get(self.parent, &self.def, self.required_target()?).await
            }
            RelationKind::HasOneThrough { .. } | RelationKind::HasManyThrough { .. } => {
                through::get(self.parent, &self.def, self.required_target()?).await
            }
            RelationKind::MorphTo { .. } => morph::get(self.parent, &self.def).await,
        }
    }

    /// Scalar form of [`get`](Self::get); `None` when nothing matched.
    pub async fn get_one(&self) -> OrmResult<Option<Entity>> {
        Ok(match self.get().await? {
            Related::One(entity) => Some(*entity),
            Related::Many(mut entities) => {
                if entities.is_empty() {
                    None
                } else {
                    Some(entities.remove(0))
                }
            }
            Related::None => None,
        })
    }

    /// List form of [`get`](Self::get).
    pub async fn get_many(&self) -> OrmResult<Vec<Entity>> {
        Ok(match self.get().await? {
            Related::Many(entities) => entities,
            Related::One(entity) => vec![*entity],
            Related::None => Vec::new(),
        })
    }

    /// Inserts pivot rows linking this parent to each id.
    pub async fn attach(&self, ids: &[i64]) -> OrmResult<()> {
        belongs_to_many::attach(self.parent, &self.def, ids, None).await
    }

    /// Inserts one pivot row carrying extra pivot columns.
    pub async fn attach_with(&self, id: i64, pivot_attrs: &serde_json::Value) -> OrmResult<()> {
        belongs_to_many::attach(self.parent, &self.def, &[id], Some(pivot_attrs)).await
    }

    /// Deletes pivot rows for this parent; `None` detaches everything.
    pub async fn detach(&self, ids: Option<&[i64]>) -> OrmResult<u64> {
        belongs_to_many::detach(self.parent, &self.def, ids).await
    }

    /// Replaces the attached set with exactly `ids`.
    pub async fn sync(&self, ids: &[i64]) -> OrmResult<()> {
        belongs_to_many::detach(self.parent, &self.def, None).await?;
        belongs_to_many::attach(self.parent, &self.def, ids, None).await
    }

    /// Attaches only the ids not already present.
    pub async fn sync_without_detaching(&self, ids: &[i64]) -> OrmResult<()> {
        let current = belongs_to_many::attached_ids(self.parent, &self.def).await?;
        let missing: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| !current.contains(id))
            .collect();
        belongs_to_many::attach(self.parent, &self.def, &missing, None).await
    }

    /// Detaches the ids already attached and attaches the rest.
    pub async fn toggle(&self, ids: &[i64]) -> OrmResult<()> {
        let current = belongs_to_many::attached_ids(self.parent, &self.def).await?;
        let (on, off): (Vec<i64>, Vec<i64>) =
            ids.iter().copied().partition(|id| current.contains(id));
        if !on.is_empty() {
            belongs_to_many::detach(self.parent, &self.def, Some(&on)).await?;
        }
        belongs_to_many::attach(self.parent, &self.def, &off, None).await
    }

    /// Updates the pivot row for one attached id.
    pub async fn update_existing_pivot(
        &self,
        id: i64,
        attrs: &serde_json::Value,
    ) -> OrmResult<u64> {
        belongs_to_many::update_existing_pivot(self.parent, &self.def, id, attrs).await
    }

    /// Creates a related entity and attaches it in one go.
    pub async fn create(
        &self,
        attrs: &serde_json::Value,
        pivot_attrs: Option<&serde_json::Value>,
    ) -> OrmResult<Entity> {
        belongs_to_many::create(self.parent, &self.def, self.required_target()?, attrs, pivot_attrs)
            .await
    }

    /// Creates and attaches several related entities.
    pub async fn create_many(&self, attrs: &[serde_json::Value]) -> OrmResult<Vec<Entity>> {
        let mut created = Vec::with_capacity(attrs.len());
        for row in attrs {
            created.push(self.create(row, None).await?);
        }
        Ok(created)
    }

    fn required_target(&self) -> OrmResult<&Arc<EntityDef>> {
        self.target
            .as_ref()
            .ok_or_else(|| OrmError::RelationUnknown(self.def.name.clone()))
    }
}

/// Non-null key values for `column` across the batch, deduplicated in
/// first-seen order.
pub(crate) fn batch_keys(parents: &[Entity], column: &str) -> Vec<Value> {
    let mut seen = Vec::new();
    let mut keys = Vec::new();
    for parent in parents {
        if let Some(value) = parent.raw_attribute(column) {
            if let Some(key) = value.as_key() {
                if !seen.contains(&key) {
                    seen.push(key);
                    keys.push(value.clone());
                }
            }
        }
    }
    keys
}

/// Groups loaded entities by the stringified value of `column`, preserving
/// row order within each bucket.
pub(crate) fn group_by_column(rows: Vec<Entity>, column: &str) -> IndexMap<String, Vec<Entity>> {
    let mut groups: IndexMap<String, Vec<Entity>> = IndexMap::new();
    for row in rows {
        let key = match row.raw_attribute(column).and_then(Value::as_key) {
            Some(key) => key,
            None => continue,
        };
        groups.entry(key).or_default().push(row);
    }
    groups
}

pub(crate) fn key_of(parent: &Entity, column: &str) -> Option<String> {
    parent.raw_attribute(column).and_then(Value::as_key)
}

/// Resolves a declared relation's target descriptor through the registry.
pub(crate) fn resolve_target(def: &EntityDef, rel: &RelationDef) -> OrmResult<Arc<EntityDef>> {
    let name = rel
        .target
        .as_ref()
        .ok_or_else(|| OrmError::RelationUnknown(rel.name.clone()))?;
    def.registry()?.entity(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(nodes: &[EagerNode]) -> Vec<String> {
        let mut out = Vec::new();
        for node in nodes {
            out.push(node.name.clone());
            for child in paths(&node.children) {
                out.push(format!("{}.{}", node.name, child));
            }
        }
        out
    }

    #[test]
    fn dot_paths_normalize_into_a_tree() {
        let specs = vec![
            EagerSpec {
                path: "posts.comments.author".to_string(),
                constraint: None,
            },
            EagerSpec {
                path: "posts.tags".to_string(),
                constraint: None,
            },
            EagerSpec {
                path: "profile".to_string(),
                constraint: None,
            },
        ];
        let tree = build_eager_tree(&specs);
        assert_eq!(tree.len(), 2);
        assert_eq!(
            paths(&tree),
            vec![
                "posts",
                "posts.comments",
                "posts.comments.author",
                "posts.tags",
                "profile"
            ]
        );
    }

    #[test]
    fn constraint_sits_on_the_leaf_of_its_path() {
        let cb: Constraint = Arc::new(|q| q);
        let specs = vec![EagerSpec {
            path: "posts.comments".to_string(),
            constraint: Some(cb),
        }];
        let tree = build_eager_tree(&specs);
        assert!(tree[0].constraint.is_none());
        assert!(tree[0].children[0].constraint.is_some());
    }

    #[test]
    fn shared_prefixes_merge() {
        let specs = vec![
            EagerSpec {
                path: "posts".to_string(),
                constraint: None,
            },
            EagerSpec {
                path: "posts.comments".to_string(),
                constraint: None,
            },
        ];
        let tree = build_eager_tree(&specs);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].children.len(), 1);
    }
}
