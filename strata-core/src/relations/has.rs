//! hasOne / hasMany and their polymorphic cousins morphOne / morphMany.
//! The morph kinds are the same traversal with an extra `*_type = parent
//! table` predicate on every query.

use std::sync::Arc;

use crate::connection::Connection;
use crate::entity::{Entity, EntityDef, Related};
use crate::error::{OrmError, OrmResult};
use crate::relations::{
    batch_keys, eager_load_tree, group_by_column, key_of, resolve_target, EagerNode, RelationDef,
    RelationKind,
};

struct Shape<'a> {
    foreign_key: &'a str,
    local_key: &'a str,
    type_column: Option<&'a str>,
    many: bool,
}

fn shape(rel: &RelationDef) -> OrmResult<Shape<'_>> {
    match &rel.kind {
        RelationKind::HasOne {
            foreign_key,
            local_key,
        } => Ok(Shape {
            foreign_key,
            local_key,
            type_column: None,
            many: false,
        }),
        RelationKind::HasMany {
            foreign_key,
            local_key,
        } => Ok(Shape {
            foreign_key,
            local_key,
            type_column: None,
            many: true,
        }),
        RelationKind::MorphOne {
            type_column,
            id_column,
            local_key,
        } => Ok(Shape {
            foreign_key: id_column,
            local_key,
            type_column: Some(type_column),
            many: false,
        }),
        RelationKind::MorphMany {
            type_column,
            id_column,
            local_key,
        } => Ok(Shape {
            foreign_key: id_column,
            local_key,
            type_column: Some(type_column),
            many: true,
        }),
        _ => Err(OrmError::RelationUnknown(rel.name.clone())),
    }
}

fn empty(many: bool) -> Related {
    if many {
        Related::Many(Vec::new())
    } else {
        Related::None
    }
}

pub(crate) async fn get(
    parent: &Entity,
    rel: &RelationDef,
    target: &Arc<EntityDef>,
) -> OrmResult<Related> {
    let shape = shape(rel)?;
    let key = match parent.raw_attribute(shape.local_key) {
        Some(value) if !value.is_null() => value.clone(),
        _ => return Ok(empty(shape.many)),
    };

    let mut query = target.query().filter(shape.foreign_key, "=", key);
    if let Some(type_column) = shape.type_column {
        query = query.filter(type_column, "=", parent.def().table());
    }

    if shape.many {
        Ok(Related::Many(query.get().await?))
    } else {
        Ok(match query.first().await? {
            Some(entity) => Related::One(Box::new(entity)),
            None => Related::None,
        })
    }
}

pub(crate) async fn eager_load(
    def: &Arc<EntityDef>,
    rel: &RelationDef,
    parents: &mut [Entity],
    node: &EagerNode,
    conn: &Arc<Connection>,
) -> OrmResult<()> {
    let target = resolve_target(def, rel)?;
    let shape = shape(rel)?;

    let keys = batch_keys(parents, shape.local_key);
    let mut related = if keys.is_empty() {
        Vec::new()
    } else {
        let mut query = target.query().filter_in(shape.foreign_key, keys);
        if let Some(type_column) = shape.type_column {
            query = query.filter(type_column, "=", def.table());
        }
        if let Some(constraint) = &node.constraint {
            query = constraint(query);
        }
        query.get().await?
    };

    eager_load_tree(&mut related, &node.children, conn).await?;

    let groups = group_by_column(related, shape.foreign_key);
    for parent in parents.iter_mut() {
        let bucket = key_of(parent, shape.local_key)
            .and_then(|key| groups.get(&key))
            .cloned()
            .unwrap_or_default();
        let related = if shape.many {
            Related::Many(bucket)
        } else {
            match bucket.into_iter().next() {
                Some(entity) => Related::One(Box::new(entity)),
                None => Related::None,
            }
        };
        parent.set_relation(&rel.name, related);
    }
    Ok(())
}
