//! belongsTo: the child holds the foreign key, the related side owns the
//! row. Supports a declared default instance for children with no match.

use std::sync::Arc;

use crate::connection::Connection;
use crate::entity::{Entity, EntityDef, Related};
use crate::error::{OrmError, OrmResult};
use crate::relations::{
    batch_keys, eager_load_tree, group_by_column, key_of, resolve_target, EagerNode, RelationDef,
    RelationKind,
};

fn keys(rel: &RelationDef) -> OrmResult<(&str, &str, &Option<serde_json::Value>)> {
    match &rel.kind {
        RelationKind::BelongsTo {
            foreign_key,
            owner_key,
            default,
            ..
        } => Ok((foreign_key, owner_key, default)),
        _ => Err(OrmError::RelationUnknown(rel.name.clone())),
    }
}

/// Builds the placeholder instance declared by `with_default`, if any.
fn default_instance(
    target: &Arc<EntityDef>,
    default: &Option<serde_json::Value>,
) -> OrmResult<Related> {
    match default {
        Some(attrs) => {
            let mut entity = Entity::new(target.clone());
            if attrs.as_object().is_some_and(|o| !o.is_empty()) {
                entity.fill(attrs)?;
            }
            Ok(Related::One(Box::new(entity)))
        }
        None => Ok(Related::None),
    }
}

pub(crate) async fn get(
    parent: &Entity,
    rel: &RelationDef,
    target: &Arc<EntityDef>,
) -> OrmResult<Related> {
    let (foreign_key, owner_key, default) = keys(rel)?;
    let key = match parent.raw_attribute(foreign_key) {
        Some(value) if !value.is_null() => value.clone(),
        _ => return default_instance(target, default),
    };

    match target.query().filter(owner_key, "=", key).first().await? {
        Some(entity) => Ok(Related::One(Box::new(entity))),
        None => default_instance(target, default),
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
    let (foreign_key, owner_key, default) = keys(rel)?;

    let keys = batch_keys(parents, foreign_key);
    let mut related = if keys.is_empty() {
        Vec::new()
    } else {
        let mut query = target.query().filter_in(owner_key, keys);
        if let Some(constraint) = &node.constraint {
            query = constraint(query);
        }
        query.get().await?
    };

    eager_load_tree(&mut related, &node.children, conn).await?;

    let groups = group_by_column(related, owner_key);
    for parent in parents.iter_mut() {
        let matched = key_of(parent, foreign_key)
            .and_then(|key| groups.get(&key))
            .and_then(|bucket| bucket.first())
            .cloned();
        let related = match matched {
            Some(entity) => Related::One(Box::new(entity)),
            None => default_instance(&target, default)?,
        };
        parent.set_relation(&rel.name, related);
    }
    Ok(())
}
