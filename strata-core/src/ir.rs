use std::fmt::Write;

use indexmap::IndexMap;

use crate::value::Value;

/// Boolean connector between adjacent predicates. The first predicate's
/// connector is ignored during emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

impl Connector {
    fn keyword(self) -> &'static str {
        match self {
            Connector::And => "AND",
            Connector::Or => "OR",
        }
    }
}

/// The exclusive set of WHERE predicate shapes.
#[derive(Debug, Clone)]
pub enum PredicateExpr {
    Basic {
        column: String,
        op: String,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
    NotIn {
        column: String,
        values: Vec<Value>,
    },
    Null {
        column: String,
    },
    NotNull {
        column: String,
    },
    Between {
        column: String,
        low: Value,
        high: Value,
    },
    Like {
        column: String,
        pattern: String,
    },
}

#[derive(Debug, Clone)]
pub struct Predicate {
    pub connector: Connector,
    pub expr: PredicateExpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub left: String,
    pub op: String,
    pub right: String,
}

/// HAVING has two shapes: a plain comparison and an aggregate count.
#[derive(Debug, Clone)]
pub enum Having {
    Basic {
        column: String,
        op: String,
        value: Value,
    },
    Count {
        column: String,
        op: String,
        value: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn keyword(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderClause {
    pub column: String,
    pub direction: Direction,
}

/// Dialect-neutral description of one statement.
///
/// Values are always emitted as `?` placeholders; identifiers (tables,
/// columns, raw subquery projections) are emitted verbatim. Parameter order
/// is wheres left-to-right, then havings; limit and offset are inlined as
/// integers.
#[derive(Debug, Clone)]
pub struct QueryIr {
    pub table: String,
    pub columns: Vec<String>,
    pub distinct: bool,
    pub joins: Vec<Join>,
    pub wheres: Vec<Predicate>,
    pub group_bys: Vec<String>,
    pub havings: Vec<Having>,
    pub orders: Vec<OrderClause>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryIr {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: vec!["*".to_string()],
            distinct: false,
            joins: Vec::new(),
            wheres: Vec::new(),
            group_bys: Vec::new(),
            havings: Vec::new(),
            orders: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn push_where(&mut self, connector: Connector, expr: PredicateExpr) {
        self.wheres.push(Predicate { connector, expr });
    }

    pub fn select_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::with_capacity(128);
        let mut params = Vec::new();

        sql.push_str("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&self.columns.join(", "));
        sql.push_str(" FROM ");
        sql.push_str(&self.table);

        self.render_joins(&mut sql);
        self.render_wheres(&mut sql, &mut params);

        if !self.group_bys.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_bys.join(", "));
        }
        self.render_havings(&mut sql, &mut params);

        if !self.orders.is_empty() {
            sql.push_str(" ORDER BY ");
            for (i, order) in self.orders.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                let _ = write!(sql, "{} {}", order.column, order.direction.keyword());
            }
        }

        if let Some(limit) = self.limit {
            let _ = write!(sql, " LIMIT {}", limit);
        }
        if let Some(offset) = self.offset {
            let _ = write!(sql, " OFFSET {}", offset);
        }

        (sql, params)
    }

    /// A fresh `SELECT COUNT(*)` over the accumulated joins and wheres.
    /// Orders, limit, and offset do not affect the count.
    pub fn count_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::with_capacity(128);
        let mut params = Vec::new();

        sql.push_str("SELECT COUNT(*) AS aggregate FROM ");
        sql.push_str(&self.table);
        self.render_joins(&mut sql);
        self.render_wheres(&mut sql, &mut params);

        (sql, params)
    }

    /// Short-circuiting existence probe over the accumulated joins/wheres.
    pub fn exists_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::with_capacity(128);
        let mut params = Vec::new();

        sql.push_str("SELECT 1 FROM ");
        sql.push_str(&self.table);
        self.render_joins(&mut sql);
        self.render_wheres(&mut sql, &mut params);
        sql.push_str(" LIMIT 1");

        (sql, params)
    }

    pub fn update_sql(&self, assignments: &IndexMap<String, Value>) -> (String, Vec<Value>) {
        let mut sql = String::with_capacity(128);
        let mut params = Vec::with_capacity(assignments.len());

        let _ = write!(sql, "UPDATE {} SET ", self.table);
        for (i, (column, value)) in assignments.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "{} = ?", column);
            params.push(value.clone());
        }
        self.render_wheres(&mut sql, &mut params);

        (sql, params)
    }

    /// Atomic in-place arithmetic: the column reference on the right-hand
    /// side is an identifier, only the delta is parameterized.
    pub fn step_sql(&self, column: &str, sign: char, amount: i64) -> (String, Vec<Value>) {
        let mut sql = String::with_capacity(96);
        let mut params = vec![Value::Int(amount)];

        let _ = write!(
            sql,
            "UPDATE {} SET {} = {} {} ?",
            self.table, column, column, sign
        );
        self.render_wheres(&mut sql, &mut params);

        (sql, params)
    }

    pub fn delete_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::with_capacity(96);
        let mut params = Vec::new();

        let _ = write!(sql, "DELETE FROM {}", self.table);
        self.render_wheres(&mut sql, &mut params);

        (sql, params)
    }

    fn render_joins(&self, sql: &mut String) {
        for join in &self.joins {
            let keyword = match join.kind {
                JoinKind::Inner => "INNER JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            let _ = write!(
                sql,
                " {} {} ON {} {} {}",
                keyword, join.table, join.left, join.op, join.right
            );
        }
    }

    fn render_wheres(&self, sql: &mut String, params: &mut Vec<Value>) {
        for (i, predicate) in self.wheres.iter().enumerate() {
            if i == 0 {
                sql.push_str(" WHERE ");
            } else {
                let _ = write!(sql, " {} ", predicate.connector.keyword());
            }
            render_predicate(&predicate.expr, sql, params);
        }
    }

    fn render_havings(&self, sql: &mut String, params: &mut Vec<Value>) {
        for (i, having) in self.havings.iter().enumerate() {
            if i == 0 {
                sql.push_str(" HAVING ");
            } else {
                sql.push_str(" AND ");
            }
            match having {
                Having::Basic { column, op, value } => {
                    let _ = write!(sql, "{} {} ?", column, op);
                    params.push(value.clone());
                }
                Having::Count { column, op, value } => {
                    let _ = write!(sql, "COUNT({}) {} ?", column, op);
                    params.push(value.clone());
                }
            }
        }
    }
}

fn render_predicate(expr: &PredicateExpr, sql: &mut String, params: &mut Vec<Value>) {
    match expr {
        PredicateExpr::Basic { column, op, value } => {
            let _ = write!(sql, "{} {} ?", column, op);
            params.push(value.clone());
        }
        PredicateExpr::In { column, values } => {
            if values.is_empty() {
                sql.push_str("1=0");
                return;
            }
            let _ = write!(sql, "{} IN (", column);
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push('?');
                params.push(value.clone());
            }
            sql.push(')');
        }
        PredicateExpr::NotIn { column, values } => {
            if values.is_empty() {
                sql.push_str("1=1");
                return;
            }
            let _ = write!(sql, "{} NOT IN (", column);
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push('?');
                params.push(value.clone());
            }
            sql.push(')');
        }
        PredicateExpr::Null { column } => {
            let _ = write!(sql, "{} IS NULL", column);
        }
        PredicateExpr::NotNull { column } => {
            let _ = write!(sql, "{} IS NOT NULL", column);
        }
        PredicateExpr::Between { column, low, high } => {
            let _ = write!(sql, "{} BETWEEN ? AND ?", column);
            params.push(low.clone());
            params.push(high.clone());
        }
        PredicateExpr::Like { column, pattern } => {
            let _ = write!(sql, "{} LIKE ?", column);
            params.push(Value::Str(pattern.clone()));
        }
    }
}

/// Renders a single- or multi-row INSERT. The column list is the union of
/// every row's keys in first-seen order; a row contributes `NULL` for any
/// column it omits.
pub fn insert_sql(
    table: &str,
    rows: &[IndexMap<String, Value>],
    returning: bool,
) -> (String, Vec<Value>) {
    let mut sql = String::with_capacity(128);
    let mut params = Vec::new();

    let mut columns: Vec<&String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.contains(&key) {
                columns.push(key);
            }
        }
    }
    if columns.is_empty() {
        return (sql, params);
    }

    let _ = write!(sql, "INSERT INTO {} (", table);
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(column);
    }
    sql.push_str(") VALUES ");

    for (r, row) in rows.iter().enumerate() {
        if r > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('?');
            params.push(row.get(*column).cloned().unwrap_or(Value::Null));
        }
        sql.push(')');
    }

    if returning {
        sql.push_str(" RETURNING *");
    }

    (sql, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(column: &str, op: &str, value: impl Into<Value>) -> PredicateExpr {
        PredicateExpr::Basic {
            column: column.to_string(),
            op: op.to_string(),
            value: value.into(),
        }
    }

    #[test]
    fn bare_select_has_no_clauses() {
        let ir = QueryIr::new("users");
        let (sql, params) = ir.select_sql();
        assert_eq!(sql, "SELECT * FROM users");
        assert!(params.is_empty());
    }

    #[test]
    fn first_connector_is_ignored() {
        let mut ir = QueryIr::new("users");
        ir.push_where(Connector::Or, basic("age", ">", 18));
        ir.push_where(Connector::Or, basic("name", "=", "Alice"));
        let (sql, _) = ir.select_sql();
        assert_eq!(
            sql,
            "SELECT * FROM users WHERE age > ? OR name = ?"
        );
    }

    #[test]
    fn predicate_templates_render_in_order() {
        let mut ir = QueryIr::new("users");
        ir.push_where(
            Connector::And,
            PredicateExpr::In {
                column: "id".to_string(),
                values: vec![Value::Int(1), Value::Int(2)],
            },
        );
        ir.push_where(
            Connector::And,
            PredicateExpr::Between {
                column: "age".to_string(),
                low: Value::Int(18),
                high: Value::Int(65),
            },
        );
        ir.push_where(
            Connector::And,
            PredicateExpr::NotNull {
                column: "email".to_string(),
            },
        );
        ir.push_where(
            Connector::Or,
            PredicateExpr::Like {
                column: "name".to_string(),
                pattern: "A%".to_string(),
            },
        );
        let (sql, params) = ir.select_sql();
        assert_eq!(
            sql,
            "SELECT * FROM users WHERE id IN (?, ?) AND age BETWEEN ? AND ? \
             AND email IS NOT NULL OR name LIKE ?"
        );
        // in/between contribute with multiplicity, null checks contribute none
        assert_eq!(params.len(), 5);
    }

    #[test]
    fn empty_in_and_not_in_short_circuit() {
        let mut ir = QueryIr::new("users");
        ir.push_where(
            Connector::And,
            PredicateExpr::In {
                column: "id".to_string(),
                values: vec![],
            },
        );
        ir.push_where(
            Connector::And,
            PredicateExpr::NotIn {
                column: "id".to_string(),
                values: vec![],
            },
        );
        let (sql, params) = ir.select_sql();
        assert_eq!(sql, "SELECT * FROM users WHERE 1=0 AND 1=1");
        assert!(params.is_empty());
    }

    #[test]
    fn select_renders_joins_group_having_order_limit() {
        let mut ir = QueryIr::new("users");
        ir.columns = vec!["users.*".to_string()];
        ir.joins.push(Join {
            kind: JoinKind::Inner,
            table: "posts".to_string(),
            left: "posts.user_id".to_string(),
            op: "=".to_string(),
            right: "users.id".to_string(),
        });
        ir.push_where(Connector::And, basic("posts.status", "=", "published"));
        ir.group_bys.push("users.id".to_string());
        ir.havings.push(Having::Count {
            column: "*".to_string(),
            op: ">=".to_string(),
            value: Value::Int(2),
        });
        ir.orders.push(OrderClause {
            column: "users.id".to_string(),
            direction: Direction::Asc,
        });
        ir.limit = Some(10);
        ir.offset = Some(20);
        let (sql, params) = ir.select_sql();
        assert_eq!(
            sql,
            "SELECT users.* FROM users INNER JOIN posts ON posts.user_id = users.id \
             WHERE posts.status = ? GROUP BY users.id HAVING COUNT(*) >= ? \
             ORDER BY users.id ASC LIMIT 10 OFFSET 20"
        );
        // wheres first, then havings; limit/offset are inlined
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], Value::Str("published".to_string()));
        assert_eq!(params[1], Value::Int(2));
    }

    #[test]
    fn count_ignores_orders_limit_offset() {
        let mut ir = QueryIr::new("users");
        ir.push_where(Connector::And, basic("age", ">", 21));
        ir.orders.push(OrderClause {
            column: "name".to_string(),
            direction: Direction::Desc,
        });
        ir.limit = Some(5);
        ir.offset = Some(5);
        let (sql, params) = ir.count_sql();
        assert_eq!(sql, "SELECT COUNT(*) AS aggregate FROM users WHERE age > ?");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn update_params_precede_where_params() {
        let mut ir = QueryIr::new("users");
        ir.push_where(Connector::And, basic("id", "=", 7));
        let mut assignments = IndexMap::new();
        assignments.insert("name".to_string(), Value::Str("Bob".to_string()));
        assignments.insert("age".to_string(), Value::Int(9));
        let (sql, params) = ir.update_sql(&assignments);
        assert_eq!(sql, "UPDATE users SET name = ?, age = ? WHERE id = ?");
        assert_eq!(
            params,
            vec![
                Value::Str("Bob".to_string()),
                Value::Int(9),
                Value::Int(7)
            ]
        );
    }

    #[test]
    fn step_keeps_column_as_identifier() {
        let mut ir = QueryIr::new("users");
        ir.push_where(Connector::And, basic("id", "=", 1));
        let (sql, params) = ir.step_sql("age", '+', 3);
        assert_eq!(sql, "UPDATE users SET age = age + ? WHERE id = ?");
        assert_eq!(params, vec![Value::Int(3), Value::Int(1)]);
    }

    #[test]
    fn delete_with_wheres() {
        let mut ir = QueryIr::new("users");
        ir.push_where(Connector::And, basic("name", "=", "Alice"));
        let (sql, params) = ir.delete_sql();
        assert_eq!(sql, "DELETE FROM users WHERE name = ?");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn multi_row_insert_concatenates_tuples() {
        let mut a = IndexMap::new();
        a.insert("name".to_string(), Value::Str("Alice".to_string()));
        a.insert("age".to_string(), Value::Int(30));
        let mut b = IndexMap::new();
        b.insert("name".to_string(), Value::Str("Bob".to_string()));
        let (sql, params) = insert_sql("users", &[a, b], false);
        assert_eq!(sql, "INSERT INTO users (name, age) VALUES (?, ?), (?, ?)");
        assert_eq!(params.len(), 4);
        // missing columns in later rows fall back to NULL
        assert_eq!(params[3], Value::Null);
    }

    #[test]
    fn insert_columns_are_the_union_across_rows() {
        let mut a = IndexMap::new();
        a.insert("name".to_string(), Value::Str("Alice".to_string()));
        let mut b = IndexMap::new();
        b.insert("name".to_string(), Value::Str("Carol".to_string()));
        b.insert("password".to_string(), Value::Str("x".to_string()));
        let (sql, params) = insert_sql("users", &[a, b], false);
        assert_eq!(
            sql,
            "INSERT INTO users (name, password) VALUES (?, ?), (?, ?)"
        );
        assert_eq!(params[1], Value::Null);
        assert_eq!(params[3], Value::Str("x".to_string()));
    }

    #[test]
    fn insert_appends_returning_when_asked() {
        let mut row = IndexMap::new();
        row.insert("name".to_string(), Value::Str("Alice".to_string()));
        let (sql, _) = insert_sql("users", &[row], true);
        assert_eq!(sql, "INSERT INTO users (name) VALUES (?) RETURNING *");
    }

    #[test]
    fn exists_probe_is_limited_to_one_row() {
        let mut ir = QueryIr::new("users");
        ir.push_where(Connector::And, basic("age", ">", 18));
        let (sql, _) = ir.exists_sql();
        assert_eq!(sql, "SELECT 1 FROM users WHERE age > ? LIMIT 1");
    }
}
