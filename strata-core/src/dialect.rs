/// The SQL dialect behind a [`Connection`](crate::connection::Connection).
///
/// The compiler always emits neutral `?` placeholders; everything the three
/// backends disagree on (placeholder style, identifier quoting, boolean
/// column typing, `RETURNING` support, catalog introspection) is answered
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    /// Rewrites the compiler's neutral `?` placeholders into the dialect's
    /// native style. Only PostgreSQL needs a rewrite (`$1, $2, …`); the
    /// scan is aware of single-quoted string literals.
    pub fn rewrite_placeholders(self, sql: &str) -> String {
        if self != Dialect::Postgres {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut n = 0usize;
        let mut in_string = false;
        for ch in sql.chars() {
            match ch {
                '\'' => {
                    in_string = !in_string;
                    out.push(ch);
                }
                '?' if !in_string => {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                _ => out.push(ch),
            }
        }
        out
    }

    /// Returns true if the dialect supports the `RETURNING` clause.
    pub fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Returns the SQL fragment for an auto-incrementing primary key.
    pub fn auto_increment_pk(self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "SERIAL PRIMARY KEY",
            Dialect::MySql => "INTEGER AUTO_INCREMENT PRIMARY KEY",
        }
    }

    /// Returns the native column type for booleans.
    pub fn bool_type(self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER",
            Dialect::Postgres => "BOOLEAN",
            Dialect::MySql => "TINYINT(1)",
        }
    }

    /// Returns the SQL function for the current timestamp.
    pub fn current_timestamp_fn(self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }

    /// Quotes an identifier (table/column name).
    pub fn quote_identifier(self, ident: &str) -> String {
        match self {
            Dialect::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
            Dialect::Sqlite | Dialect::MySql => format!("`{}`", ident.replace('`', "``")),
        }
    }

    /// Returns the catalog query listing user table names, one column per
    /// row. Used by `Migrator::fresh` to drop everything.
    pub fn table_catalog_sql(self) -> &'static str {
        match self {
            Dialect::Sqlite => {
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'"
            }
            Dialect::Postgres => "SELECT tablename FROM pg_tables WHERE schemaname = 'public'",
            Dialect::MySql => {
                "SELECT table_name FROM information_schema.tables WHERE table_schema = DATABASE()"
            }
        }
    }

    /// Renders a `DROP TABLE` for `Migrator::fresh`. PostgreSQL cascades so
    /// dependent tables do not block the drop order.
    pub fn drop_table_sql(self, table: &str) -> String {
        match self {
            Dialect::Postgres => format!("DROP TABLE IF EXISTS {} CASCADE", table),
            Dialect::Sqlite | Dialect::MySql => format!("DROP TABLE IF EXISTS {}", table),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_rewrites_placeholders_left_to_right() {
        let sql = "SELECT * FROM users WHERE name = ? AND age > ?";
        assert_eq!(
            Dialect::Postgres.rewrite_placeholders(sql),
            "SELECT * FROM users WHERE name = $1 AND age > $2"
        );
    }

    #[test]
    fn placeholders_inside_string_literals_survive() {
        let sql = "SELECT * FROM users WHERE name = '?' AND age = ?";
        assert_eq!(
            Dialect::Postgres.rewrite_placeholders(sql),
            "SELECT * FROM users WHERE name = '?' AND age = $1"
        );
    }

    #[test]
    fn sqlite_and_mysql_keep_question_marks() {
        let sql = "SELECT * FROM users WHERE id = ?";
        assert_eq!(Dialect::Sqlite.rewrite_placeholders(sql), sql);
        assert_eq!(Dialect::MySql.rewrite_placeholders(sql), sql);
    }

    #[test]
    fn identifier_quoting_per_dialect() {
        assert_eq!(Dialect::Postgres.quote_identifier("users"), "\"users\"");
        assert_eq!(Dialect::Sqlite.quote_identifier("users"), "`users`");
    }
}
