//! Core engine for the Strata ORM.
//!
//! Entities are runtime records described by [`EntityDef`] descriptors and
//! registered into a [`Registry`] at program start. Queries accumulate a
//! dialect-neutral IR and compile to SQL per backend; relations load in
//! bounded batches; migrations apply in tracked, batch-scoped order.

pub use async_trait;
pub use serde_json;
pub use sqlx;

pub mod builder;
pub mod connection;
pub mod dialect;
pub mod entity;
pub mod error;
pub mod ir;
pub mod migrator;
pub mod registry;
pub mod relations;
pub mod value;

pub use builder::{Page, Query};
pub use connection::{Connection, ExecResult};
pub use dialect::Dialect;
pub use entity::{CastKind, Entity, EntityDef, Related};
pub use error::{OrmError, OrmResult};
pub use ir::Direction;
pub use migrator::{Migration, MigrationStatus, Migrator, SqlMigration};
pub use registry::Registry;
pub use relations::{Relation, RelationDef, RelationKind};
pub use value::{Row, Value};

pub mod prelude {
    pub use crate::builder::{Page, Query};
    pub use crate::connection::Connection;
    pub use crate::dialect::Dialect;
    pub use crate::entity::{CastKind, Entity, EntityDef, Related};
    pub use crate::error::{OrmError, OrmResult};
    pub use crate::ir::Direction;
    pub use crate::migrator::{Migration, Migrator, SqlMigration};
    pub use crate::registry::Registry;
    pub use crate::value::Value;
}
