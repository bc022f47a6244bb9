//! belongsToMany: many-to-many through a pivot table. Traversal is always
//! two steps (pivot rows, then related rows); the pivot payload is surfaced
//! on each related entity under the relation's pivot alias.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::connection::Connection;
use crate::entity::{now_value, Entity, EntityDef, Related};
use crate::error::{OrmError, OrmResult};
use crate::ir::{insert_sql, Connector, PredicateExpr, QueryIr};
use crate::relations::{
    batch_keys, eager_load_tree, group_by_column, EagerNode, RelationDef, RelationKind,
};
use crate::value::{attrs_from_json, Row, Value};

struct PivotShape<'a> {
    pivot_table: &'a str,
    foreign_pivot_key: &'a str,
    related_pivot_key: &'a str,
    parent_key: &'a str,
    related_key: &'a str,
    pivot_columns: &'a [String],
    pivot_timestamps: bool,
    pivot_alias: &'a str,
    pivot_wheres: &'a [(String, String, Value)],
}

fn shape(rel: &RelationDef) -> OrmResult<PivotShape<'_>> {
    match &rel.kind {
        RelationKind::BelongsToMany {
            pivot_table,
            foreign_pivot_key,
            related_pivot_key,
            parent_key,
            related_key,
            pivot_columns,
            pivot_timestamps,
            pivot_alias,
            pivot_wheres,
        } => Ok(PivotShape {
            pivot_table,
            foreign_pivot_key,
            related_pivot_key,
            parent_key,
            related_key,
            pivot_columns,
            pivot_timestamps: *pivot_timestamps,
            pivot_alias,
            pivot_wheres,
        }),
        _ => Err(OrmError::RelationUnknown(rel.name.clone())),
    }
}

fn parent_key_value(parent: &Entity, shape: &PivotShape<'_>) -> OrmResult<Value> {
    match parent.raw_attribute(shape.parent_key) {
        Some(value) if !value.is_null() => Ok(value.clone()),
        _ => Err(OrmError::Query {
            code: None,
            message: format!(
                "parent key '{}' is not set; save the entity before touching its pivot",
                shape.parent_key
            ),
        }),
    }
}

/// SELECT over the pivot table for the given parent keys: both key columns,
/// any declared payload columns, and the pivot timestamps when tracked.
fn pivot_select_ir(shape: &PivotShape<'_>, parent_keys: Vec<Value>) -> QueryIr {
    let mut ir = QueryIr::new(shape.pivot_table);
    let mut columns = vec![
        shape.foreign_pivot_key.to_string(),
        shape.related_pivot_key.to_string(),
    ];
    columns.extend(shape.pivot_columns.iter().cloned());
    if shape.pivot_timestamps {
        columns.push("created_at".to_string());
        columns.push("updated_at".to_string());
    }
    ir.columns = columns;
    ir.push_where(
        Connector::And,
        PredicateExpr::In {
            column: shape.foreign_pivot_key.to_string(),
            values: parent_keys,
        },
    );
    for (column, op, value) in shape.pivot_wheres {
        ir.push_where(
            Connector::And,
            PredicateExpr::Basic {
                column: column.clone(),
                op: op.clone(),
                value: value.clone(),
            },
        );
    }
    ir
}

fn pivot_payload(row: &Row) -> Value {
    let mut obj = serde_json::Map::new();
    for (column, value) in row {
        obj.insert(column.clone(), value.to_json());
    }
    Value::Json(serde_json::Value::Object(obj))
}

/// Assembles the related entities for one parent, in pivot-row order, each
/// carrying its pivot payload.
fn collect_for_parent(
    parent_key: &str,
    pivot_rows: &[Row],
    related_index: &IndexMap<String, Vec<Entity>>,
    shape: &PivotShape<'_>,
) -> Vec<Entity> {
    let mut out = Vec::new();
    for row in pivot_rows {
        let row_parent = row
            .get(shape.foreign_pivot_key)
            .and_then(Value::as_key);
        if row_parent.as_deref() != Some(parent_key) {
            continue;
        }
        let related_key = match row.get(shape.related_pivot_key).and_then(Value::as_key) {
            Some(key) => key,
            None => continue,
        };
        if let Some(entity) = related_index.get(&related_key).and_then(|b| b.first()) {
            let mut entity = entity.clone();
            entity.set_raw_attribute(shape.pivot_alias, pivot_payload(row));
            out.push(entity);
        }
    }
    out
}

pub(crate) async fn get(
    parent: &Entity,
    rel: &RelationDef,
    target: &Arc<EntityDef>,
) -> OrmResult<Related> {
    let shape = shape(rel)?;
    let conn = parent.def().connection()?;
    let parent_key = match parent.raw_attribute(shape.parent_key) {
        Some(value) if !value.is_null() => value.clone(),
        _ => return Ok(Related::Many(Vec::new())),
    };

    let (sql, params) = pivot_select_ir(&shape, vec![parent_key.clone()]).select_sql();
    let pivot_rows = conn.query(&sql, &params).await?;

    let mut ids = Vec::new();
    for row in &pivot_rows {
        if let Some(id) = row.get(shape.related_pivot_key) {
            if !id.is_null() && !ids.contains(id) {
                ids.push(id.clone());
            }
        }
    }
    if ids.is_empty() {
        return Ok(Related::Many(Vec::new()));
    }

    let related = target.query().filter_in(shape.related_key, ids).get().await?;
    let index = group_by_column(related, shape.related_key);
    let parent_key = parent_key.as_key().unwrap_or_default();
    Ok(Related::Many(collect_for_parent(
        &parent_key,
        &pivot_rows,
        &index,
        &shape,
    )))
}

pub(crate) async fn eager_load(
    def: &Arc<EntityDef>,
    rel: &RelationDef,
    parents: &mut [Entity],
    node: &EagerNode,
    conn: &Arc<Connection>,
) -> OrmResult<()> {
    let target = crate::relations::resolve_target(def, rel)?;
    let shape = shape(rel)?;

    let parent_keys = batch_keys(parents, shape.parent_key);
    let pivot_rows = if parent_keys.is_empty() {
        Vec::new()
    } else {
        let (sql, params) = pivot_select_ir(&shape, parent_keys).select_sql();
        conn.query(&sql, &params).await?
    };

    let mut ids = Vec::new();
    for row in &pivot_rows {
        if let Some(id) = row.get(shape.related_pivot_key) {
            if !id.is_null() && !ids.contains(id) {
                ids.push(id.clone());
            }
        }
    }

    let mut related = if ids.is_empty() {
        Vec::new()
    } else {
        let mut query = target.query().filter_in(shape.related_key, ids);
        if let Some(constraint) = &node.constraint {
            query = constraint(query);
        }
        query.get().await?
    };

    eager_load_tree(&mut related, &node.children, conn).await?;

    let index = group_by_column(related, shape.related_key);
    for parent in parents.iter_mut() {
        let bucket = match crate::relations::key_of(parent, shape.parent_key) {
            Some(key) => collect_for_parent(&key, &pivot_rows, &index, &shape),
            None => Vec::new(),
        };
        parent.set_relation(&rel.name, Related::Many(bucket));
    }
    Ok(())
}

pub(crate) async fn attach(
    parent: &Entity,
    rel: &RelationDef,
    ids: &[i64],
    pivot_attrs: Option<&serde_json::Value>,
) -> OrmResult<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let shape = shape(rel)?;
    let conn = parent.def().connection()?;
    let parent_key = parent_key_value(parent, &shape)?;

    let extra = match pivot_attrs {
        Some(json) => attrs_from_json(json)?,
        None => IndexMap::new(),
    };

    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        let mut row: IndexMap<String, Value> = IndexMap::new();
        row.insert(shape.foreign_pivot_key.to_string(), parent_key.clone());
        row.insert(shape.related_pivot_key.to_string(), Value::Int(*id));
        for (column, value) in &extra {
            row.insert(column.clone(), value.clone());
        }
        if shape.pivot_timestamps {
            let now = now_value();
            row.insert("created_at".to_string(), now.clone());
            row.insert("updated_at".to_string(), now);
        }
        rows.push(row);
    }

    let (sql, params) = insert_sql(shape.pivot_table, &rows, false);
    conn.execute(&sql, &params).await?;
    Ok(())
}

pub(crate) async fn detach(
    parent: &Entity,
    rel: &RelationDef,
    ids: Option<&[i64]>,
) -> OrmResult<u64> {
    let shape = shape(rel)?;
    let conn = parent.def().connection()?;
    let parent_key = parent_key_value(parent, &shape)?;

    let mut ir = QueryIr::new(shape.pivot_table);
    ir.push_where(
        Connector::And,
        PredicateExpr::Basic {
            column: shape.foreign_pivot_key.to_string(),
            op: "=".to_string(),
            value: parent_key,
        },
    );
    if let Some(ids) = ids {
        ir.push_where(
            Connector::And,
            PredicateExpr::In {
                column: shape.related_pivot_key.to_string(),
                values: ids.iter().map(|id| Value::Int(*id)).collect(),
            },
        );
    }

    let (sql, params) = ir.delete_sql();
    Ok(conn.execute(&sql, &params).await?.rows_affected)
}

/// Ids currently attached to the parent, in pivot-row order.
pub(crate) async fn attached_ids(parent: &Entity, rel: &RelationDef) -> OrmResult<Vec<i64>> {
    let shape = shape(rel)?;
    let conn = parent.def().connection()?;
    let parent_key = parent_key_value(parent, &shape)?;

    let mut ir = QueryIr::new(shape.pivot_table);
    ir.columns = vec![shape.related_pivot_key.to_string()];
    ir.push_where(
        Connector::And,
        PredicateExpr::Basic {
            column: shape.foreign_pivot_key.to_string(),
            op: "=".to_string(),
            value: parent_key,
        },
    );

    let (sql, params) = ir.select_sql();
    let rows = conn.query(&sql, &params).await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get(shape.related_pivot_key).and_then(Value::as_i64))
        .collect())
}

pub(crate) async fn update_existing_pivot(
    parent: &Entity,
    rel: &RelationDef,
    id: i64,
    attrs: &serde_json::Value,
) -> OrmResult<u64> {
    let shape = shape(rel)?;
    let conn = parent.def().connection()?;
    let parent_key = parent_key_value(parent, &shape)?;

    let mut assignments = attrs_from_json(attrs)?;
    if shape.pivot_timestamps {
        assignments.insert("updated_at".to_string(), now_value());
    }

    let mut ir = QueryIr::new(shape.pivot_table);
    ir.push_where(
        Connector::And,
        PredicateExpr::Basic {
            column: shape.foreign_pivot_key.to_string(),
            op: "=".to_string(),
            value: parent_key,
        },
    );
    ir.push_where(
        Connector::And,
        PredicateExpr::Basic {
            column: shape.related_pivot_key.to_string(),
            op: "=".to_string(),
            value: Value::Int(id),
        },
    );

    let (sql, params) = ir.update_sql(&assignments);
    Ok(conn.execute(&sql, &params).await?.rows_affected)
}

pub(crate) async fn create(
    parent: &Entity,
    rel: &RelationDef,
    target: &Arc<EntityDef>,
    attrs: &serde_json::Value,
    pivot_attrs: Option<&serde_json::Value>,
) -> OrmResult<Entity> {
    let shape_ref = shape(rel)?;
    let entity = target.create(attrs).await?;
    let id = entity
        .raw_attribute(shape_ref.related_key)
        .and_then(Value::as_i64)
        .ok_or_else(|| OrmError::Query {
            code: None,
            message: format!(
                "created entity has no '{}' key to attach",
                shape_ref.related_key
            ),
        })?;
    attach(parent, rel, &[id], pivot_attrs).await?;
    Ok(entity)
}
