use std::sync::Arc;

use serde::Serialize;

use crate::entity::{now_value, Entity, EntityDef};
use crate::error::{OrmError, OrmResult};
use crate::ir::{
    insert_sql, Connector, Direction, Having, Join, JoinKind, OrderClause, Predicate,
    PredicateExpr, QueryIr,
};
use crate::relations::{build_eager_tree, eager_load_tree, Constraint, EagerSpec, RelationKind};
use crate::value::{attrs_from_json, Value};

/// One page of results, shaped for direct serialization.
#[derive(Debug, Serialize)]
pub struct Page {
    pub data: Vec<Entity>,
    pub total: u64,
    pub per_page: u64,
    pub current_page: u64,
    pub last_page: u64,
    pub from: Option<u64>,
    pub to: u64,
}

/// Fluent query builder bound to one entity descriptor.
///
/// Chainable calls accumulate the IR in call order; terminals compile it,
/// run it on the entity's connection, and hydrate the rows. `clone`
/// produces a fully independent builder.
#[derive(Clone, Debug)]
pub struct Query {
    def: Arc<EntityDef>,
    ir: QueryIr,
    eager: Vec<EagerSpec>,
    count_relations: Vec<String>,
    reveal_hidden: bool,
}

impl Query {
    pub fn new(def: Arc<EntityDef>) -> Self {
        let ir = QueryIr::new(def.table());
        Self {
            def,
            ir,
            eager: Vec::new(),
            count_relations: Vec::new(),
            reveal_hidden: false,
        }
    }

    // -- selection ---------------------------------------------------------

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.ir.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.ir.columns = columns;
        self
    }

    pub fn distinct(mut self) -> Self {
        self.ir.distinct = true;
        self
    }

    // -- filtering ---------------------------------------------------------

    pub fn filter(mut self, column: &str, op: &str, value: impl Into<Value>) -> Self {
        self.ir.push_where(
            Connector::And,
            PredicateExpr::Basic {
                column: column.to_string(),
                op: op.to_string(),
                value: value.into(),
            },
        );
        self
    }

    pub fn or_filter(mut self, column: &str, op: &str, value: impl Into<Value>) -> Self {
        self.ir.push_where(
            Connector::Or,
            PredicateExpr::Basic {
                column: column.to_string(),
                op: op.to_string(),
                value: value.into(),
            },
        );
        self
    }

    pub fn filter_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.ir.push_where(
            Connector::And,
            PredicateExpr::In {
                column: column.to_string(),
                values: values.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    pub fn filter_not_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.ir.push_where(
            Connector::And,
            PredicateExpr::NotIn {
                column: column.to_string(),
                values: values.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    pub fn filter_is_null(mut self, column: &str) -> Self {
        self.ir.push_where(
            Connector::And,
            PredicateExpr::Null {
                column: column.to_string(),
            },
        );
        self
    }

    pub fn filter_is_not_null(mut self, column: &str) -> Self {
        self.ir.push_where(
            Connector::And,
            PredicateExpr::NotNull {
                column: column.to_string(),
            },
        );
        self
    }

    pub fn filter_between(
        mut self,
        column: &str,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.ir.push_where(
            Connector::And,
            PredicateExpr::Between {
                column: column.to_string(),
                low: low.into(),
                high: high.into(),
            },
        );
        self
    }

    pub fn filter_like(mut self, column: &str, pattern: &str) -> Self {
        self.ir.push_where(
            Connector::And,
            PredicateExpr::Like {
                column: column.to_string(),
                pattern: pattern.to_string(),
            },
        );
        self
    }

    // -- relational filtering ---------------------------------------------

    /// Keeps only parents with at least one related row (INNER JOIN).
    pub fn filter_has(self, relation: &str) -> OrmResult<Self> {
        self.existence_join(relation, JoinKind::Inner, None)
    }

    /// `filter_has` with a sub-builder constraining the related side; the
    /// callback's predicates are qualified with the related table and
    /// appended to the outer wheres.
    pub fn filter_has_with<F>(self, relation: &str, constraint: F) -> OrmResult<Self>
    where
        F: FnOnce(Query) -> Query,
    {
        self.existence_join(relation, JoinKind::Inner, Some(Box::new(constraint)))
    }

    /// Keeps only parents whose related count satisfies `op n`; builds on
    /// the existence join plus GROUP BY / HAVING COUNT.
    pub fn has(self, relation: &str, op: &str, n: i64) -> OrmResult<Self> {
        let pk = format!("{}.{}", self.def.table(), self.def.primary_key());
        let mut query = self.existence_join(relation, JoinKind::Inner, None)?;
        query.ir.group_bys.push(pk);
        query.ir.havings.push(Having::Count {
            column: "*".to_string(),
            op: op.to_string(),
            value: Value::Int(n),
        });
        Ok(query)
    }

    /// Keeps only parents with no related row (LEFT JOIN + IS NULL).
    pub fn filter_doesnt_have(self, relation: &str) -> OrmResult<Self> {
        self.existence_join(relation, JoinKind::Left, None)
    }

    #[allow(clippy::type_complexity)]
    fn existence_join(
        mut self,
        relation: &str,
        kind: JoinKind,
        constraint: Option<Box<dyn FnOnce(Query) -> Query + '_>>,
    ) -> OrmResult<Self> {
        let rel = self
            .def
            .relation(relation)
            .cloned()
            .ok_or_else(|| OrmError::RelationUnknown(relation.to_string()))?;
        let registry = self.def.registry()?;
        let parent_table = self.def.table().to_string();
        let absent = kind == JoinKind::Left;

        // Joined columns must not leak into hydration.
        if self.ir.columns == ["*"] {
            self.ir.columns = vec![format!("{}.*", parent_table)];
        }

        let target = match &rel.target {
            Some(name) => registry.entity(name)?,
            None => {
                return Err(OrmError::Query {
                    code: None,
                    message: format!(
                        "relation '{}' does not support existence filters",
                        relation
                    ),
                })
            }
        };
        let related_table = target.table().to_string();

        match &rel.kind {
            RelationKind::HasOne {
                foreign_key,
                local_key,
            }
            | RelationKind::HasMany {
                foreign_key,
                local_key,
            } => {
                self.ir.joins.push(Join {
                    kind,
                    table: related_table.clone(),
                    left: format!("{}.{}", related_table, foreign_key),
                    op: "=".to_string(),
                    right: format!("{}.{}", parent_table, local_key),
                });
                if absent {
                    self.ir.push_where(
                        Connector::And,
                        PredicateExpr::Null {
                            column: format!("{}.{}", related_table, target.primary_key()),
                        },
                    );
                }
            }
            RelationKind::MorphOne {
                type_column,
                id_column,
                local_key,
            }
            | RelationKind::MorphMany {
                type_column,
                id_column,
                local_key,
            } => {
                self.ir.joins.push(Join {
                    kind,
                    table: related_table.clone(),
                    left: format!("{}.{}", related_table, id_column),
                    op: "=".to_string(),
                    right: format!("{}.{}", parent_table, local_key),
                });
                self.ir.push_where(
                    Connector::And,
                    PredicateExpr::Basic {
                        column: format!("{}.{}", related_table, type_column),
                        op: "=".to_string(),
                        value: Value::Str(parent_table.clone()),
                    },
                );
                if absent {
                    self.ir.push_where(
                        Connector::And,
                        PredicateExpr::Null {
                            column: format!("{}.{}", related_table, target.primary_key()),
                        },
                    );
                }
            }
            RelationKind::BelongsTo {
                foreign_key,
                owner_key,
                ..
            } => {
                self.ir.joins.push(Join {
                    kind,
                    table: related_table.clone(),
                    left: format!("{}.{}", related_table, owner_key),
                    op: "=".to_string(),
                    right: format!("{}.{}", parent_table, foreign_key),
                });
                if absent {
                    self.ir.push_where(
                        Connector::And,
                        PredicateExpr::Null {
                            column: format!("{}.{}", related_table, owner_key),
                        },
                    );
                }
            }
            RelationKind::BelongsToMany {
                pivot_table,
                foreign_pivot_key,
                related_pivot_key,
                parent_key,
                related_key,
                ..
            } => {
                self.ir.joins.push(Join {
                    kind,
                    table: pivot_table.clone(),
                    left: format!("{}.{}", pivot_table, foreign_pivot_key),
                    op: "=".to_string(),
                    right: format!("{}.{}", parent_table, parent_key),
                });
                if absent {
                    self.ir.push_where(
                        Connector::And,
                        PredicateExpr::Null {
                            column: format!("{}.{}", pivot_table, foreign_pivot_key),
                        },
                    );
                } else {
                    self.ir.joins.push(Join {
                        kind,
                        table: related_table.clone(),
                        left: format!("{}.{}", related_table, related_key),
                        op: "=".to_string(),
                        right: format!("{}.{}", pivot_table, related_pivot_key),
                    });
                }
            }
            RelationKind::HasOneThrough {
                through,
                first_key,
                second_key,
                local_key,
                through_local_key,
            }
            | RelationKind::HasManyThrough {
                through,
                first_key,
                second_key,
                local_key,
                through_local_key,
            } => {
                let through_def = registry.entity(through)?;
                let through_table = through_def.table().to_string();
                self.ir.joins.push(Join {
                    kind,
                    table: through_table.clone(),
                    left: format!("{}.{}", through_table, first_key),
                    op: "=".to_string(),
                    right: format!("{}.{}", parent_table, local_key),
                });
                self.ir.joins.push(Join {
                    kind,
                    table: related_table.clone(),
                    left: format!("{}.{}", related_table, second_key),
                    op: "=".to_string(),
                    right: format!("{}.{}", through_table, through_local_key),
                });
                if absent {
                    self.ir.push_where(
                        Connector::And,
                        PredicateExpr::Null {
                            column: format!("{}.{}", related_table, target.primary_key()),
                        },
                    );
                }
            }
            RelationKind::MorphTo { .. } => unreachable!("morphTo has no target"),
        }

        if let Some(constraint) = constraint {
            let sub = constraint(Query::new(target.clone()));
            for predicate in sub.ir.wheres {
                self.ir.wheres.push(Predicate {
                    connector: predicate.connector,
                    expr: qualify(predicate.expr, &related_table),
                });
            }
        }

        Ok(self)
    }

    // -- ordering, grouping, paging ---------------------------------------

    pub fn order_by(mut self, column: &str, direction: Direction) -> Self {
        self.ir.orders.push(OrderClause {
            column: column.to_string(),
            direction,
        });
        self
    }

    pub fn group_by(mut self, column: &str) -> Self {
        self.ir.group_bys.push(column.to_string());
        self
    }

    pub fn having(mut self, column: &str, op: &str, value: impl Into<Value>) -> Self {
        self.ir.havings.push(Having::Basic {
            column: column.to_string(),
            op: op.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn having_count(mut self, column: &str, op: &str, value: i64) -> Self {
        self.ir.havings.push(Having::Count {
            column: column.to_string(),
            op: op.to_string(),
            value: Value::Int(value),
        });
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.ir.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.ir.offset = Some(n);
        self
    }

    pub fn take(self, n: u64) -> Self {
        self.limit(n)
    }

    pub fn skip(self, n: u64) -> Self {
        self.offset(n)
    }

    // -- joins -------------------------------------------------------------

    pub fn join(mut self, table: &str, left: &str, op: &str, right: &str) -> Self {
        self.ir.joins.push(Join {
            kind: JoinKind::Inner,
            table: table.to_string(),
            left: left.to_string(),
            op: op.to_string(),
            right: right.to_string(),
        });
        self
    }

    pub fn left_join(mut self, table: &str, left: &str, op: &str, right: &str) -> Self {
        self.ir.joins.push(Join {
            kind: JoinKind::Left,
            table: table.to_string(),
            left: left.to_string(),
            op: op.to_string(),
            right: right.to_string(),
        });
        self
    }

    // -- eager loading declarations ---------------------------------------

    /// Declares a relation (or nested dot path) to eager load with `get`.
    pub fn with(mut self, path: &str) -> Self {
        self.eager.push(EagerSpec {
            path: path.to_string(),
            constraint: None,
        });
        self
    }

    /// `with` plus a constraint applied to the leaf of the path.
    pub fn with_constrained<F>(mut self, path: &str, constraint: F) -> Self
    where
        F: Fn(Query) -> Query + Send + Sync + 'static,
    {
        let constraint: Constraint = Arc::new(constraint);
        self.eager.push(EagerSpec {
            path: path.to_string(),
            constraint: Some(constraint),
        });
        self
    }

    /// Annotates each result with `<name>_count` via a scalar subquery.
    pub fn with_count(mut self, relation: &str) -> Self {
        self.count_relations.push(relation.to_string());
        self
    }

    // -- hidden projection -------------------------------------------------

    pub fn with_hidden(mut self) -> Self {
        self.reveal_hidden = true;
        self
    }

    pub fn without_hidden(mut self, show: bool) -> Self {
        self.reveal_hidden = show;
        self
    }

    /// The SELECT this builder would run, for inspection and logging.
    pub fn to_sql(&self) -> String {
        self.ir.select_sql().0
    }

    // -- terminals ---------------------------------------------------------

    pub async fn get(mut self) -> OrmResult<Vec<Entity>> {
        self.apply_count_columns()?;
        let conn = self.def.connection()?;
        let (sql, params) = self.ir.select_sql();
        let rows = conn.query(&sql, &params).await?;
        let mut entities: Vec<Entity> = rows
            .into_iter()
            .map(|row| Entity::hydrate(self.def.clone(), row, self.reveal_hidden))
            .collect();
        if !self.eager.is_empty() {
            let nodes = build_eager_tree(&self.eager);
            eager_load_tree(&mut entities, &nodes, &conn).await?;
        }
        Ok(entities)
    }

    pub async fn first(mut self) -> OrmResult<Option<Entity>> {
        self.ir.limit = Some(1);
        Ok(self.get().await?.into_iter().next())
    }

    pub async fn first_or_fail(self) -> OrmResult<Entity> {
        self.first().await?.ok_or(OrmError::NotFound)
    }

    pub async fn count(self) -> OrmResult<u64> {
        let conn = self.def.connection()?;
        let (sql, params) = self.ir.count_sql();
        let rows = conn.query(&sql, &params).await?;
        Ok(rows
            .first()
            .and_then(|row| row.values().next())
            .and_then(Value::as_i64)
            .unwrap_or(0) as u64)
    }

    pub async fn exists(self) -> OrmResult<bool> {
        let conn = self.def.connection()?;
        let (sql, params) = self.ir.exists_sql();
        Ok(!conn.query(&sql, &params).await?.is_empty())
    }

    /// Runs a count plus a page-sized select and reports the standard
    /// pagination envelope.
    pub async fn paginate(self, page: u64, per_page: u64) -> OrmResult<Page> {
        let page = page.max(1);
        let offset = (page - 1) * per_page;

        let total = self.clone().count().await?;
        let data = self.offset(offset).limit(per_page).get().await?;

        let last_page = if per_page == 0 { 0 } else { total.div_ceil(per_page) };
        let from = if total > 0 { Some(offset + 1) } else { None };
        let to = offset + data.len() as u64;

        Ok(Page {
            data,
            total,
            per_page,
            current_page: page,
            last_page,
            from,
            to,
        })
    }

    /// Inserts one row. Timestamps are stamped when the entity manages
    /// them.
    pub async fn insert(self, row: &serde_json::Value) -> OrmResult<u64> {
        self.insert_many(std::slice::from_ref(row)).await
    }

    /// Multi-row insert in a single statement.
    pub async fn insert_many(self, rows: &[serde_json::Value]) -> OrmResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let conn = self.def.connection()?;
        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let mut attrs = attrs_from_json(row)?;
            if self.def.manages_timestamps() {
                let now = now_value();
                attrs.entry("created_at".to_string()).or_insert_with(|| now.clone());
                attrs.entry("updated_at".to_string()).or_insert(now);
            }
            prepared.push(attrs);
        }
        let (sql, params) = insert_sql(self.def.table(), &prepared, false);
        Ok(conn.execute(&sql, &params).await?.rows_affected)
    }

    /// Bulk update over the accumulated wheres. The caller's map is copied
    /// before `updated_at` is stamped.
    pub async fn update(self, attrs: &serde_json::Value) -> OrmResult<u64> {
        let conn = self.def.connection()?;
        let mut assignments = attrs_from_json(attrs)?;
        if self.def.manages_timestamps() {
            assignments.insert("updated_at".to_string(), now_value());
        }
        let (sql, params) = self.ir.update_sql(&assignments);
        Ok(conn.execute(&sql, &params).await?.rows_affected)
    }

    /// Updates, then re-selects the first matching row (with any declared
    /// eager loads).
    pub async fn update_and_fetch(self, attrs: &serde_json::Value) -> OrmResult<Option<Entity>> {
        let fetch = self.clone();
        self.update(attrs).await?;
        fetch.first().await
    }

    pub async fn delete(self) -> OrmResult<u64> {
        let conn = self.def.connection()?;
        let (sql, params) = self.ir.delete_sql();
        Ok(conn.execute(&sql, &params).await?.rows_affected)
    }

    /// Atomic `col = col + n` over the accumulated wheres.
    pub async fn increment(self, column: &str, n: i64) -> OrmResult<u64> {
        let conn = self.def.connection()?;
        let (sql, params) = self.ir.step_sql(column, '+', n);
        Ok(conn.execute(&sql, &params).await?.rows_affected)
    }

    /// Atomic `col = col - n` over the accumulated wheres.
    pub async fn decrement(self, column: &str, n: i64) -> OrmResult<u64> {
        let conn = self.def.connection()?;
        let (sql, params) = self.ir.step_sql(column, '-', n);
        Ok(conn.execute(&sql, &params).await?.rows_affected)
    }

    // -- internals ---------------------------------------------------------

    /// Appends one correlated `COUNT(*)` scalar subquery column per
    /// `with_count` declaration.
    fn apply_count_columns(&mut self) -> OrmResult<()> {
        if self.count_relations.is_empty() {
            return Ok(());
        }
        let registry = self.def.registry()?;
        let parent_table = self.def.table().to_string();
        let count_relations = std::mem::take(&mut self.count_relations);

        for name in &count_relations {
            let rel = self
                .def
                .relation(name)
                .ok_or_else(|| OrmError::RelationUnknown(name.clone()))?;
            let subquery = match &rel.kind {
                RelationKind::HasOne {
                    foreign_key,
                    local_key,
                }
                | RelationKind::HasMany {
                    foreign_key,
                    local_key,
                } => {
                    let target = registry.entity(rel.target.as_deref().unwrap_or_default())?;
                    format!(
                        "(SELECT COUNT(*) FROM {related} WHERE {related}.{fk} = {parent}.{lk})",
                        related = target.table(),
                        fk = foreign_key,
                        parent = parent_table,
                        lk = local_key,
                    )
                }
                RelationKind::MorphOne {
                    type_column,
                    id_column,
                    local_key,
                }
                | RelationKind::MorphMany {
                    type_column,
                    id_column,
                    local_key,
                } => {
                    let target = registry.entity(rel.target.as_deref().unwrap_or_default())?;
                    format!(
                        "(SELECT COUNT(*) FROM {related} WHERE {related}.{fk} = {parent}.{lk} \
                         AND {related}.{tc} = '{parent}')",
                        related = target.table(),
                        fk = id_column,
                        parent = parent_table,
                        lk = local_key,
                        tc = type_column,
                    )
                }
                RelationKind::BelongsTo {
                    foreign_key,
                    owner_key,
                    ..
                } => {
                    let target = registry.entity(rel.target.as_deref().unwrap_or_default())?;
                    format!(
                        "(SELECT COUNT(*) FROM {related} WHERE {related}.{ok} = {parent}.{fk})",
                        related = target.table(),
                        ok = owner_key,
                        parent = parent_table,
                        fk = foreign_key,
                    )
                }
                RelationKind::BelongsToMany {
                    pivot_table,
                    foreign_pivot_key,
                    parent_key,
                    ..
                } => format!(
                    "(SELECT COUNT(*) FROM {pivot} WHERE {pivot}.{fpk} = {parent}.{pk})",
                    pivot = pivot_table,
                    fpk = foreign_pivot_key,
                    parent = parent_table,
                    pk = parent_key,
                ),
                RelationKind::HasOneThrough {
                    through,
                    first_key,
                    second_key,
                    local_key,
                    through_local_key,
                }
                | RelationKind::HasManyThrough {
                    through,
                    first_key,
                    second_key,
                    local_key,
                    through_local_key,
                } => {
                    let target = registry.entity(rel.target.as_deref().unwrap_or_default())?;
                    let through_def = registry.entity(through)?;
                    format!(
                        "(SELECT COUNT(*) FROM {related} INNER JOIN {through} \
                         ON {related}.{sk} = {through}.{tlk} \
                         WHERE {through}.{fk} = {parent}.{lk})",
                        related = target.table(),
                        through = through_def.table(),
                        sk = second_key,
                        tlk = through_local_key,
                        fk = first_key,
                        parent = parent_table,
                        lk = local_key,
                    )
                }
                RelationKind::MorphTo { .. } => {
                    return Err(OrmError::Query {
                        code: None,
                        message: format!("relation '{}' does not support with_count", name),
                    })
                }
            };
            self.ir
                .columns
                .push(format!("{} AS {}_count", subquery, name));
        }
        Ok(())
    }
}

/// Prefixes unqualified predicate columns with the related table name when
/// merging a `filter_has_with` sub-builder into the outer query.
fn qualify(expr: PredicateExpr, table: &str) -> PredicateExpr {
    let prefix = |column: String| {
        if column.contains('.') {
            column
        } else {
            format!("{}.{}", table, column)
        }
    };
    match expr {
        PredicateExpr::Basic { column, op, value } => PredicateExpr::Basic {
            column: prefix(column),
            op,
            value,
        },
        PredicateExpr::In { column, values } => PredicateExpr::In {
            column: prefix(column),
            values,
        },
        PredicateExpr::NotIn { column, values } => PredicateExpr::NotIn {
            column: prefix(column),
            values,
        },
        PredicateExpr::Null { column } => PredicateExpr::Null {
            column: prefix(column),
        },
        PredicateExpr::NotNull { column } => PredicateExpr::NotNull {
            column: prefix(column),
        },
        PredicateExpr::Between { column, low, high } => PredicateExpr::Between {
            column: prefix(column),
            low,
            high,
        },
        PredicateExpr::Like { column, pattern } => PredicateExpr::Like {
            column: prefix(column),
            pattern,
        },
    }
}
