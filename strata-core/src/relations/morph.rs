//! morphTo: the inverse side of a polymorphic association. The target type
//! lives in the row's `*_type` column and resolves through the morph map;
//! eager loading partitions the batch by type and issues one query per
//! distinct target.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::connection::Connection;
use crate::entity::{Entity, EntityDef, Related};
use crate::error::{OrmError, OrmResult};
use crate::relations::{eager_load_tree, group_by_column, EagerNode, RelationDef, RelationKind};
use crate::value::Value;

fn columns(rel: &RelationDef) -> OrmResult<(&str, &str)> {
    match &rel.kind {
        RelationKind::MorphTo {
            type_column,
            id_column,
        } => Ok((type_column, id_column)),
        _ => Err(OrmError::RelationUnknown(rel.name.clone())),
    }
}

pub(crate) async fn get(parent: &Entity, rel: &RelationDef) -> OrmResult<Related> {
    let (type_column, id_column) = columns(rel)?;

    let alias = match parent.raw_attribute(type_column) {
        Some(Value::Str(alias)) => alias.clone(),
        _ => return Ok(Related::None),
    };
    let id = match parent.raw_attribute(id_column) {
        Some(value) if !value.is_null() => value.clone(),
        _ => return Ok(Related::None),
    };

    let target = parent.def().registry()?.morph_target(&alias)?;
    Ok(
        match target
            .query()
            .filter(target.primary_key(), "=", id)
            .first()
            .await?
        {
            Some(entity) => Related::One(Box::new(entity)),
            None => Related::None,
        },
    )
}

pub(crate) async fn eager_load(
    def: &Arc<EntityDef>,
    rel: &RelationDef,
    parents: &mut [Entity],
    node: &EagerNode,
    conn: &Arc<Connection>,
) -> OrmResult<()> {
    let (type_column, id_column) = columns(rel)?;
    let registry = def.registry()?;

    // Partition the batch by discriminator value.
    let mut partitions: IndexMap<String, Vec<Value>> = IndexMap::new();
    for parent in parents.iter() {
        let alias = match parent.raw_attribute(type_column) {
            Some(Value::Str(alias)) => alias.clone(),
            _ => continue,
        };
        let id = match parent.raw_attribute(id_column) {
            Some(value) if !value.is_null() => value.clone(),
            _ => continue,
        };
        let bucket = partitions.entry(alias).or_default();
        if !bucket.contains(&id) {
            bucket.push(id);
        }
    }

    // One query per distinct type, each indexed by the target's primary key.
    let mut loaded: IndexMap<String, IndexMap<String, Vec<Entity>>> = IndexMap::new();
    for (alias, ids) in partitions {
        let target = registry.morph_target(&alias)?;
        let mut query = target.query().filter_in(target.primary_key(), ids);
        if let Some(constraint) = &node.constraint {
            query = constraint(query);
        }
        let mut related = query.get().await?;
        eager_load_tree(&mut related, &node.children, conn).await?;
        let key_column = target.primary_key().to_string();
        loaded.insert(alias, group_by_column(related, &key_column));
    }

    for parent in parents.iter_mut() {
        let matched = match (
            parent.raw_attribute(type_column).cloned(),
            parent.raw_attribute(id_column).and_then(Value::as_key),
        ) {
            (Some(Value::Str(alias)), Some(id)) => loaded
                .get(&alias)
                .and_then(|index| index.get(&id))
                .and_then(|bucket| bucket.first())
                .cloned(),
            _ => None,
        };
        let related = match matched {
            Some(entity) => Related::One(Box::new(entity)),
            None => Related::None,
        };
        parent.set_relation(&rel.name, related);
    }
    Ok(())
}
