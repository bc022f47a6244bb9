//! # Strata ORM
//!
//! An Active Record style ORM for SQLite, PostgreSQL, and MySQL: runtime
//! entity descriptors, a fluent query builder over a dialect-neutral IR,
//! six relation kinds with batched eager loading, and a batch-tracked
//! migration runner.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata_orm::prelude::*;
//! use strata_orm::serde_json::json;
//!
//! # async fn example() -> OrmResult<()> {
//! let conn = Arc::new(Connection::connect("sqlite::memory:").await?);
//! let registry = Registry::with_connection(conn);
//!
//! let users = registry.register(
//!     EntityDef::new("User", "users")
//!         .timestamps(true)
//!         .fillable(["name", "age"])
//!         .cast("age", CastKind::Int)
//!         .has_many("posts", "Post", "user_id", "id"),
//! );
//!
//! let alice = users.create(&json!({"name": "Alice", "age": 30})).await?;
//! let adults = users
//!     .query()
//!     .filter("age", ">=", 18)
//!     .with("posts")
//!     .get()
//!     .await?;
//! # let _ = (alice, adults);
//! # Ok(())
//! # }
//! ```

pub use strata_core::*;

pub mod prelude {
    pub use strata_core::prelude::*;
}
