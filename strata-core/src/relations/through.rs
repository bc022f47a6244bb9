//! hasOneThrough / hasManyThrough: reach the final entity across an
//! intermediate table. Two hops, two queries, batch size notwithstanding.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::connection::Connection;
use crate::entity::{Entity, EntityDef, Related};
use crate::error::{OrmError, OrmResult};
use crate::relations::{
    batch_keys, eager_load_tree, group_by_column, key_of, resolve_target, EagerNode, RelationDef,
    RelationKind,
};
use crate::value::Value;

struct Shape<'a> {
    through: &'a str,
    first_key: &'a str,
    second_key: &'a str,
    local_key: &'a str,
    through_local_key: &'a str,
    many: bool,
}

fn shape(rel: &RelationDef) -> OrmResult<Shape<'_>> {
    match &rel.kind {
        RelationKind::HasOneThrough {
            through,
            first_key,
            second_key,
            local_key,
            through_local_key,
        } => Ok(Shape {
            through,
            first_key,
            second_key,
            local_key,
            through_local_key,
            many: false,
        }),
        RelationKind::HasManyThrough {
            through,
            first_key,
            second_key,
            local_key,
            through_local_key,
        } => Ok(Shape {
            through,
            first_key,
            second_key,
            local_key,
            through_local_key,
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

fn wrap(mut finals: Vec<Entity>, many: bool) -> Related {
    if many {
        Related::Many(finals)
    } else if finals.is_empty() {
        Related::None
    } else {
        Related::One(Box::new(finals.remove(0)))
    }
}

pub(crate) async fn get(
    parent: &Entity,
    rel: &RelationDef,
    target: &Arc<EntityDef>,
) -> OrmResult<Related> {
    let shape = shape(rel)?;
    let through_def = parent.def().registry()?.entity(shape.through)?;

    let key = match parent.raw_attribute(shape.local_key) {
        Some(value) if !value.is_null() => value.clone(),
        _ => return Ok(empty(shape.many)),
    };

    let throughs = through_def
        .query()
        .filter(shape.first_key, "=", key)
        .get()
        .await?;
    let through_keys = batch_keys(&throughs, shape.through_local_key);
    if through_keys.is_empty() {
        return Ok(empty(shape.many));
    }

    let finals = target
        .query()
        .filter_in(shape.second_key, through_keys)
        .get()
        .await?;
    Ok(wrap(finals, shape.many))
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
    let through_def = def.registry()?.entity(shape.through)?;

    let parent_keys = batch_keys(parents, shape.local_key);
    let throughs = if parent_keys.is_empty() {
        Vec::new()
    } else {
        through_def
            .query()
            .filter_in(shape.first_key, parent_keys)
            .get()
            .await?
    };

    let through_keys = batch_keys(&throughs, shape.through_local_key);
    let mut finals = if through_keys.is_empty() {
        Vec::new()
    } else {
        let mut query = target.query().filter_in(shape.second_key, through_keys);
        if let Some(constraint) = &node.constraint {
            query = constraint(query);
        }
        query.get().await?
    };

    eager_load_tree(&mut finals, &node.children, conn).await?;

    // parent key -> ordered through keys, then through key -> finals
    let final_groups = group_by_column(finals, shape.second_key);
    let mut through_groups: IndexMap<String, Vec<String>> = IndexMap::new();
    for through in &throughs {
        let parent_key = match key_of(through, shape.first_key) {
            Some(key) => key,
            None => continue,
        };
        if let Some(through_key) = through
            .raw_attribute(shape.through_local_key)
            .and_then(Value::as_key)
        {
            through_groups.entry(parent_key).or_default().push(through_key);
        }
    }

    for parent in parents.iter_mut() {
        let mut bucket = Vec::new();
        if let Some(parent_key) = key_of(parent, shape.local_key) {
            if let Some(through_keys) = through_groups.get(&parent_key) {
                for through_key in through_keys {
                    if let Some(finals) = final_groups.get(through_key) {
                        bucket.extend(finals.iter().cloned());
                    }
                }
            }
        }
        parent.set_relation(&rel.name, wrap(bucket, shape.many));
    }
    Ok(())
}
