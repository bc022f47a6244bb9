/// Strata-specific error type with actionable variants.
#[derive(Debug)]
pub enum OrmError {
    /// The cargo feature for the requested database driver is disabled.
    DriverUnavailable(&'static str),
    /// Initial connect failed; carries the driver message.
    ConnectionFailed(String),
    /// A statement failed to execute; carries the dialect error code when
    /// the driver reports one.
    Query {
        code: Option<String>,
        message: String,
    },
    /// `first_or_fail` / `find_or_fail` matched no row.
    NotFound,
    /// A builder referenced a relation name the entity does not declare.
    RelationUnknown(String),
    /// A polymorphic type column has no morph map entry.
    MorphUnresolved(String),
    /// The `json` cast received malformed input.
    JsonParse(String),
    /// The `date` cast received a value that is not ISO-8601.
    DateParse(String),
    /// An ingress cast could not convert the value.
    CastFailed {
        column: String,
        expected: &'static str,
        value: String,
    },
    /// A migration unit failed; carries the unit identifier.
    MigrationFailed { id: String, message: String },
    /// The operation was aborted by the caller or the driver shut down.
    Cancelled,
}

impl std::fmt::Display for OrmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DriverUnavailable(feature) => {
                write!(f, "database driver unavailable: enable the `{}` feature", feature)
            }
            Self::ConnectionFailed(message) => write!(f, "connection failed: {}", message),
            Self::Query { code, message } => match code {
                Some(code) => write!(f, "query failed ({}): {}", code, message),
                None => write!(f, "query failed: {}", message),
            },
            Self::NotFound => write!(f, "no matching row"),
            Self::RelationUnknown(name) => write!(f, "unknown relation '{}'", name),
            Self::MorphUnresolved(alias) => {
                write!(f, "no morph map entry for type '{}'", alias)
            }
            Self::JsonParse(message) => write!(f, "json cast failed: {}", message),
            Self::DateParse(input) => write!(f, "date cast failed for '{}'", input),
            Self::CastFailed {
                column,
                expected,
                value,
            } => write!(
                f,
                "cannot cast '{}' to {} for attribute '{}'",
                value, expected, column
            ),
            Self::MigrationFailed { id, message } => {
                write!(f, "migration '{}' failed: {}", id, message)
            }
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for OrmError {}

impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        map_sqlx_error(err)
    }
}

/// Result alias for Strata operations.
pub type OrmResult<T> = Result<T, OrmError>;

/// Convert sqlx errors to actionable Strata errors when possible.
pub fn map_sqlx_error(err: sqlx::Error) -> OrmError {
    match err {
        sqlx::Error::RowNotFound => OrmError::NotFound,
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => OrmError::Cancelled,
        sqlx::Error::Database(db) => OrmError::Query {
            code: db.code().map(|c| c.into_owned()),
            message: db.message().to_string(),
        },
        other => OrmError::Query {
            code: None,
            message: other.to_string(),
        },
    }
}
