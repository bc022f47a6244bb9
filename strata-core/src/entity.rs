use std::collections::HashSet;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use chrono::NaiveDateTime;
use indexmap::IndexMap;

use crate::builder::Query;
use crate::connection::Connection;
use crate::error::{OrmError, OrmResult};
use crate::ir::{insert_sql, Connector, PredicateExpr, QueryIr};
use crate::registry::Registry;
use crate::relations::{
    build_eager_tree, eager_load_tree, EagerSpec, Relation, RelationDef, RelationKind,
};
use crate::value::{attrs_from_json, Value};

/// Declared attribute casts, applied on ingress and when reading through
/// the typed accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Int,
    Float,
    Str,
    Bool,
    Json,
    Date,
}

pub(crate) fn now_value() -> Value {
    Value::DateTime(chrono::Utc::now().naive_utc())
}

fn parse_date(input: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(input) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, format) {
            return Some(dt);
        }
    }
    chrono::NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Applies one cast to a non-null value. NULL bypasses casting entirely
/// (handled by the callers).
pub(crate) fn apply_cast(column: &str, kind: CastKind, value: Value) -> OrmResult<Value> {
    match kind {
        CastKind::Int => match &value {
            Value::Int(_) => Ok(value),
            Value::Float(f) => Ok(Value::Int(*f as i64)),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .or_else(|_| s.trim().parse::<f64>().map(|f| Value::Int(f as i64)))
                .map_err(|_| OrmError::CastFailed {
                    column: column.to_string(),
                    expected: "int",
                    value: s.clone(),
                }),
            other => Err(OrmError::CastFailed {
                column: column.to_string(),
                expected: "int",
                value: format!("{:?}", other),
            }),
        },
        CastKind::Float => match &value {
            Value::Float(_) => Ok(value),
            Value::Int(v) => Ok(Value::Float(*v as f64)),
            Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                OrmError::CastFailed {
                    column: column.to_string(),
                    expected: "float",
                    value: s.clone(),
                }
            }),
            other => Err(OrmError::CastFailed {
                column: column.to_string(),
                expected: "float",
                value: format!("{:?}", other),
            }),
        },
        CastKind::Str => Ok(match value {
            Value::Str(_) => value,
            Value::Int(v) => Value::Str(v.to_string()),
            Value::Float(v) => Value::Str(v.to_string()),
            Value::Bool(b) => Value::Str(b.to_string()),
            Value::Json(j) => Value::Str(j.to_string()),
            Value::DateTime(d) => Value::Str(d.format("%Y-%m-%dT%H:%M:%S").to_string()),
            Value::Bytes(b) => Value::Str(String::from_utf8_lossy(&b).into_owned()),
            Value::Null => Value::Null,
        }),
        CastKind::Bool => Ok(Value::Bool(value.is_truthy())),
        CastKind::Json => match value {
            Value::Str(s) => serde_json::from_str(&s)
                .map(Value::Json)
                .map_err(|e| OrmError::JsonParse(e.to_string())),
            other => Ok(other),
        },
        CastKind::Date => match &value {
            Value::DateTime(_) => Ok(value),
            Value::Str(s) => parse_date(s)
                .map(Value::DateTime)
                .ok_or_else(|| OrmError::DateParse(s.clone())),
            other => Err(OrmError::DateParse(format!("{:?}", other))),
        },
    }
}

/// Static description of one domain entity: table, keys, casts, guards,
/// and relation descriptors. Built fluently and registered once into a
/// [`Registry`] at program start; every runtime [`Entity`] holds a shared
/// handle to its descriptor.
#[derive(Debug)]
pub struct EntityDef {
    name: String,
    table: String,
    primary_key: String,
    timestamps: bool,
    fillable: HashSet<String>,
    hidden: HashSet<String>,
    casts: IndexMap<String, CastKind>,
    relations: IndexMap<String, RelationDef>,
    registry: OnceLock<Weak<Registry>>,
    connection: RwLock<Option<Arc<Connection>>>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            primary_key: "id".to_string(),
            timestamps: false,
            fillable: HashSet::new(),
            hidden: HashSet::new(),
            casts: IndexMap::new(),
            relations: IndexMap::new(),
            registry: OnceLock::new(),
            connection: RwLock::new(None),
        }
    }

    pub fn primary_key_name(mut self, key: impl Into<String>) -> Self {
        self.primary_key = key.into();
        self
    }

    /// Enables automatic `created_at` / `updated_at` maintenance.
    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    /// Restricts mass assignment to these attributes. An empty set (the
    /// default) permits everything.
    pub fn fillable<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fillable = names.into_iter().map(Into::into).collect();
        self
    }

    /// Strips these attributes from serialization unless the instance was
    /// hydrated with hidden attributes revealed.
    pub fn hidden<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hidden = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn cast(mut self, attribute: impl Into<String>, kind: CastKind) -> Self {
        self.casts.insert(attribute.into(), kind);
        self
    }

    pub fn has_one(
        self,
        name: &str,
        target: &str,
        foreign_key: &str,
        local_key: &str,
    ) -> Self {
        self.declare(name, Some(target), RelationKind::HasOne {
            foreign_key: foreign_key.to_string(),
            local_key: local_key.to_string(),
        })
    }

    pub fn has_many(
        self,
        name: &str,
        target: &str,
        foreign_key: &str,
        local_key: &str,
    ) -> Self {
        self.declare(name, Some(target), RelationKind::HasMany {
            foreign_key: foreign_key.to_string(),
            local_key: local_key.to_string(),
        })
    }

    pub fn belongs_to(
        self,
        name: &str,
        target: &str,
        foreign_key: &str,
        owner_key: &str,
    ) -> Self {
        self.declare(name, Some(target), RelationKind::BelongsTo {
            foreign_key: foreign_key.to_string(),
            owner_key: owner_key.to_string(),
            touch: false,
            default: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn belongs_to_many(
        self,
        name: &str,
        target: &str,
        pivot_table: &str,
        foreign_pivot_key: &str,
        related_pivot_key: &str,
        parent_key: &str,
        related_key: &str,
    ) -> Self {
        self.declare(name, Some(target), RelationKind::BelongsToMany {
            pivot_table: pivot_table.to_string(),
            foreign_pivot_key: foreign_pivot_key.to_string(),
            related_pivot_key: related_pivot_key.to_string(),
            parent_key: parent_key.to_string(),
            related_key: related_key.to_string(),
            pivot_columns: Vec::new(),
            pivot_timestamps: false,
            pivot_alias: "pivot".to_string(),
            pivot_wheres: Vec::new(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn has_many_through(
        self,
        name: &str,
        target: &str,
        through: &str,
        first_key: &str,
        second_key: &str,
        local_key: &str,
        through_local_key: &str,
    ) -> Self {
        self.declare(name, Some(target), RelationKind::HasManyThrough {
            through: through.to_string(),
            first_key: first_key.to_string(),
            second_key: second_key.to_string(),
            local_key: local_key.to_string(),
            through_local_key: through_local_key.to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn has_one_through(
        self,
        name: &str,
        target: &str,
        through: &str,
        first_key: &str,
        second_key: &str,
        local_key: &str,
        through_local_key: &str,
    ) -> Self {
        self.declare(name, Some(target), RelationKind::HasOneThrough {
            through: through.to_string(),
            first_key: first_key.to_string(),
            second_key: second_key.to_string(),
            local_key: local_key.to_string(),
            through_local_key: through_local_key.to_string(),
        })
    }

    /// Declares a polymorphic child with the conventional column pair
    /// `<morph_name>_type` / `<morph_name>_id` on the target table.
    pub fn morph_one(self, name: &str, target: &str, morph_name: &str, local_key: &str) -> Self {
        self.declare(name, Some(target), RelationKind::MorphOne {
            type_column: format!("{}_type", morph_name),
            id_column: format!("{}_id", morph_name),
            local_key: local_key.to_string(),
        })
    }

    pub fn morph_many(self, name: &str, target: &str, morph_name: &str, local_key: &str) -> Self {
        self.declare(name, Some(target), RelationKind::MorphMany {
            type_column: format!("{}_type", morph_name),
            id_column: format!("{}_id", morph_name),
            local_key: local_key.to_string(),
        })
    }

    /// Declares the inverse polymorphic side; the target entity is carried
    /// per row in `<morph_name>_type` and resolved through the morph map.
    pub fn morph_to(self, name: &str, morph_name: &str) -> Self {
        let type_column = format!("{}_type", morph_name);
        let id_column = format!("{}_id", morph_name);
        self.declare(name, None, RelationKind::MorphTo {
            type_column,
            id_column,
        })
    }

    pub fn morph_to_columns(self, name: &str, type_column: &str, id_column: &str) -> Self {
        self.declare(name, None, RelationKind::MorphTo {
            type_column: type_column.to_string(),
            id_column: id_column.to_string(),
        })
    }

    /// Marks a declared belongsTo so that saving this entity refreshes the
    /// parent's `updated_at`.
    pub fn touches(mut self, relation: &str) -> Self {
        if let Some(rel) = self.relations.get_mut(relation) {
            if let RelationKind::BelongsTo { touch, .. } = &mut rel.kind {
                *touch = true;
            }
        }
        self
    }

    /// Supplies placeholder attributes for a declared belongsTo when no
    /// row matches.
    pub fn with_default(mut self, relation: &str, attrs: serde_json::Value) -> Self {
        if let Some(rel) = self.relations.get_mut(relation) {
            if let RelationKind::BelongsTo { default, .. } = &mut rel.kind {
                *default = Some(attrs);
            }
        }
        self
    }

    /// Surfaces extra pivot columns on a declared belongsToMany.
    pub fn pivot_columns<I, S>(mut self, relation: &str, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(rel) = self.relations.get_mut(relation) {
            if let RelationKind::BelongsToMany { pivot_columns, .. } = &mut rel.kind {
                pivot_columns.extend(columns.into_iter().map(Into::into));
            }
        }
        self
    }

    /// Maintains `created_at` / `updated_at` on pivot rows of a declared
    /// belongsToMany.
    pub fn pivot_timestamps(mut self, relation: &str) -> Self {
        if let Some(rel) = self.relations.get_mut(relation) {
            if let RelationKind::BelongsToMany {
                pivot_timestamps, ..
            } = &mut rel.kind
            {
                *pivot_timestamps = true;
            }
        }
        self
    }

    pub fn pivot_alias(mut self, relation: &str, alias: &str) -> Self {
        if let Some(rel) = self.relations.get_mut(relation) {
            if let RelationKind::BelongsToMany { pivot_alias, .. } = &mut rel.kind {
                *pivot_alias = alias.to_string();
            }
        }
        self
    }

    /// Adds a standing predicate on pivot rows of a declared belongsToMany.
    pub fn where_pivot(mut self, relation: &str, column: &str, op: &str, value: impl Into<Value>) -> Self {
        if let Some(rel) = self.relations.get_mut(relation) {
            if let RelationKind::BelongsToMany { pivot_wheres, .. } = &mut rel.kind {
                pivot_wheres.push((column.to_string(), op.to_string(), value.into()));
            }
        }
        self
    }

    fn declare(mut self, name: &str, target: Option<&str>, kind: RelationKind) -> Self {
        self.relations.insert(
            name.to_string(),
            RelationDef {
                name: name.to_string(),
                target: target.map(str::to_string),
                kind,
            },
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn manages_timestamps(&self) -> bool {
        self.timestamps
    }

    pub fn hidden_set(&self) -> &HashSet<String> {
        &self.hidden
    }

    pub(crate) fn fillable_set(&self) -> &HashSet<String> {
        &self.fillable
    }

    pub fn cast_for(&self, attribute: &str) -> Option<CastKind> {
        self.casts.get(attribute).copied()
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.get(name)
    }

    pub(crate) fn relations(&self) -> &IndexMap<String, RelationDef> {
        &self.relations
    }

    pub(crate) fn bind_registry(&self, registry: Weak<Registry>) {
        let _ = self.registry.set(registry);
    }

    pub fn registry(&self) -> OrmResult<Arc<Registry>> {
        self.registry
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                OrmError::ConnectionFailed(format!("entity '{}' is not registered", self.name))
            })
    }

    /// Overrides the registry-wide connection for this entity.
    pub fn set_connection(&self, connection: Arc<Connection>) {
        *self
            .connection
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(connection);
    }

    pub fn connection(&self) -> OrmResult<Arc<Connection>> {
        if let Some(conn) = self
            .connection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Ok(conn);
        }
        self.registry()?.connection()
    }

    /// Starts a query builder bound to this entity.
    pub fn query(self: &Arc<Self>) -> Query {
        Query::new(self.clone())
    }

    pub fn new_entity(self: &Arc<Self>) -> Entity {
        Entity::new(self.clone())
    }

    pub async fn all(self: &Arc<Self>) -> OrmResult<Vec<Entity>> {
        self.query().get().await
    }

    pub async fn find(self: &Arc<Self>, id: impl Into<Value>) -> OrmResult<Option<Entity>> {
        self.query()
            .filter(&self.primary_key, "=", id)
            .first()
            .await
    }

    pub async fn find_or_fail(self: &Arc<Self>, id: impl Into<Value>) -> OrmResult<Entity> {
        self.find(id).await?.ok_or(OrmError::NotFound)
    }

    pub async fn first(self: &Arc<Self>) -> OrmResult<Option<Entity>> {
        self.query().first().await
    }

    pub async fn count(self: &Arc<Self>) -> OrmResult<u64> {
        self.query().count().await
    }

    /// Builds, fills, and persists a new entity in one step.
    pub async fn create(self: &Arc<Self>, attrs: &serde_json::Value) -> OrmResult<Entity> {
        let mut entity = Entity::new(self.clone());
        entity.fill(attrs)?;
        entity.save().await?;
        Ok(entity)
    }

    pub async fn insert(self: &Arc<Self>, rows: &[serde_json::Value]) -> OrmResult<u64> {
        self.query().insert_many(rows).await
    }

    pub async fn update_by_id(
        self: &Arc<Self>,
        id: impl Into<Value>,
        attrs: &serde_json::Value,
    ) -> OrmResult<u64> {
        self.query()
            .filter(&self.primary_key, "=", id)
            .update(attrs)
            .await
    }

    pub async fn update_and_fetch_by_id(
        self: &Arc<Self>,
        id: impl Into<Value>,
        attrs: &serde_json::Value,
        relations: &[&str],
    ) -> OrmResult<Option<Entity>> {
        let id = id.into();
        self.update_by_id(id.clone(), attrs).await?;
        let mut query = self.query().filter(&self.primary_key, "=", id);
        for path in relations {
            query = query.with(path);
        }
        query.first().await
    }

    pub async fn delete_by_id(self: &Arc<Self>, id: impl Into<Value>) -> OrmResult<u64> {
        self.query()
            .filter(&self.primary_key, "=", id)
            .delete()
            .await
    }
}

/// A loaded relation cache entry: nothing, one entity, or a list.
#[derive(Debug, Clone)]
pub enum Related {
    None,
    One(Box<Entity>),
    Many(Vec<Entity>),
}

impl Related {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Related::None => serde_json::Value::Null,
            Related::One(entity) => entity.to_json(),
            Related::Many(entities) => {
                serde_json::Value::Array(entities.iter().map(Entity::to_json).collect())
            }
        }
    }
}

/// A runtime row instance bound to its descriptor.
///
/// Attributes hold the raw ingress values; the typed accessor applies the
/// declared cast on the way out. `original` is the snapshot taken at the
/// last synchronization with storage and backs dirty detection. Instances
/// are cheap to clone but must not be mutated from two tasks at once.
#[derive(Debug, Clone)]
pub struct Entity {
    def: Arc<EntityDef>,
    attributes: IndexMap<String, Value>,
    original: IndexMap<String, Value>,
    relations: IndexMap<String, Related>,
    exists: bool,
    reveal_hidden: bool,
}

impl Entity {
    pub fn new(def: Arc<EntityDef>) -> Self {
        Self {
            def,
            attributes: IndexMap::new(),
            original: IndexMap::new(),
            relations: IndexMap::new(),
            exists: false,
            reveal_hidden: false,
        }
    }

    pub(crate) fn hydrate(def: Arc<EntityDef>, row: IndexMap<String, Value>, reveal_hidden: bool) -> Self {
        Self {
            original: row.clone(),
            attributes: row,
            relations: IndexMap::new(),
            exists: true,
            reveal_hidden,
            def,
        }
    }

    pub fn def(&self) -> &Arc<EntityDef> {
        &self.def
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Mass assignment: writes each key permitted by the fillable set
    /// (an empty set permits everything). Values pass through the declared
    /// casts.
    pub fn fill(&mut self, attrs: &serde_json::Value) -> OrmResult<&mut Self> {
        let attrs = attrs_from_json(attrs)?;
        let fillable = self.def.fillable_set().clone();
        for (key, value) in attrs {
            if fillable.is_empty() || fillable.contains(&key) {
                self.set_attribute(&key, value)?;
            }
        }
        Ok(self)
    }

    /// Writes one attribute, casting per the descriptor. NULL bypasses
    /// casting.
    pub fn set_attribute(&mut self, key: &str, value: impl Into<Value>) -> OrmResult<&mut Self> {
        let value = value.into();
        let value = if value.is_null() {
            Value::Null
        } else {
            match self.def.cast_for(key) {
                Some(kind) => apply_cast(key, kind, value)?,
                None => value,
            }
        };
        self.attributes.insert(key.to_string(), value);
        Ok(self)
    }

    /// Reads one attribute in casted form. Missing attributes read as NULL.
    pub fn get_attribute(&self, key: &str) -> OrmResult<Value> {
        match self.attributes.get(key) {
            None => Ok(Value::Null),
            Some(value) if value.is_null() => Ok(Value::Null),
            Some(value) => match self.def.cast_for(key) {
                Some(kind) => apply_cast(key, kind, value.clone()),
                None => Ok(value.clone()),
            },
        }
    }

    /// The raw stored value, no cast applied.
    pub fn raw_attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub(crate) fn set_raw_attribute(&mut self, key: &str, value: Value) {
        self.attributes.insert(key.to_string(), value);
    }

    pub fn primary_key_value(&self) -> Value {
        self.attributes
            .get(self.def.primary_key())
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// The loaded relation cache entry, if this relation has been loaded.
    pub fn related(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    /// The loaded relation as a list; empty when unloaded or scalar-null.
    pub fn related_many(&self, name: &str) -> &[Entity] {
        match self.relations.get(name) {
            Some(Related::Many(entities)) => entities,
            _ => &[],
        }
    }

    /// The loaded relation as a scalar.
    pub fn related_one(&self, name: &str) -> Option<&Entity> {
        match self.relations.get(name) {
            Some(Related::One(entity)) => Some(entity),
            Some(Related::Many(entities)) => entities.first(),
            _ => None,
        }
    }

    pub(crate) fn set_relation(&mut self, name: &str, related: Related) {
        self.relations.insert(name.to_string(), related);
    }

    pub(crate) fn set_reveal_hidden(&mut self, reveal: bool) {
        self.reveal_hidden = reveal;
    }

    /// Attributes whose current value differs from the last-synchronized
    /// snapshot.
    pub fn get_dirty(&self) -> IndexMap<String, Value> {
        self.attributes
            .iter()
            .filter(|(key, value)| self.original.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.attributes
            .iter()
            .any(|(key, value)| self.original.get(key) != Some(value))
    }

    fn sync_original(&mut self) {
        self.original = self.attributes.clone();
    }

    /// Persists the instance: INSERT when it does not exist yet, otherwise
    /// an UPDATE of the dirty attributes keyed by the primary key. A clean
    /// update is a no-op.
    pub async fn save(&mut self) -> OrmResult<&mut Self> {
        let conn = self.def.connection()?;
        if !self.exists {
            if self.def.manages_timestamps() {
                let now = now_value();
                self.attributes
                    .entry("created_at".to_string())
                    .or_insert_with(|| now.clone());
                self.attributes.insert("updated_at".to_string(), now);
            }
            if self.attributes.is_empty() {
                return Err(OrmError::Query {
                    code: None,
                    message: "cannot insert an entity with no attributes".to_string(),
                });
            }

            let dialect = conn.dialect();
            let (sql, params) = insert_sql(
                self.def.table(),
                std::slice::from_ref(&self.attributes),
                dialect.supports_returning(),
            );
            if dialect.supports_returning() {
                let rows = conn.query(&sql, &params).await?;
                if let Some(row) = rows.into_iter().next() {
                    if let Some(id) = row.get(self.def.primary_key()) {
                        self.attributes
                            .insert(self.def.primary_key().to_string(), id.clone());
                    }
                }
            } else {
                let result = conn.execute(&sql, &params).await?;
                let pk_missing = self
                    .attributes
                    .get(self.def.primary_key())
                    .map_or(true, Value::is_null);
                if pk_missing {
                    if let Some(id) = result.last_insert_id {
                        self.attributes
                            .insert(self.def.primary_key().to_string(), Value::Int(id));
                    }
                }
            }
            self.exists = true;
            self.sync_original();
            self.touch_parents(&conn).await?;
        } else {
            let mut dirty = self.get_dirty();
            if dirty.is_empty() {
                return Ok(self);
            }
            if self.def.manages_timestamps() {
                let now = now_value();
                self.attributes.insert("updated_at".to_string(), now.clone());
                dirty.insert("updated_at".to_string(), now);
            }

            let mut ir = QueryIr::new(self.def.table());
            ir.push_where(
                Connector::And,
                PredicateExpr::Basic {
                    column: self.def.primary_key().to_string(),
                    op: "=".to_string(),
                    value: self.primary_key_value(),
                },
            );
            let (sql, params) = ir.update_sql(&dirty);
            conn.execute(&sql, &params).await?;
            self.sync_original();
            self.touch_parents(&conn).await?;
        }
        Ok(self)
    }

    /// Refreshes `updated_at` on every parent reachable through a
    /// belongsTo marked with `touches`.
    async fn touch_parents(&self, conn: &Arc<Connection>) -> OrmResult<()> {
        for rel in self.def.relations().values() {
            let (foreign_key, owner_key) = match &rel.kind {
                RelationKind::BelongsTo {
                    foreign_key,
                    owner_key,
                    touch: true,
                    ..
                } => (foreign_key, owner_key),
                _ => continue,
            };
            let fk = match self.attributes.get(foreign_key) {
                Some(value) if !value.is_null() => value.clone(),
                _ => continue,
            };
            let target = match &rel.target {
                Some(name) => self.def.registry()?.entity(name)?,
                None => continue,
            };

            let mut ir = QueryIr::new(target.table());
            ir.push_where(
                Connector::And,
                PredicateExpr::Basic {
                    column: owner_key.clone(),
                    op: "=".to_string(),
                    value: fk,
                },
            );
            let mut assignments = IndexMap::new();
            assignments.insert("updated_at".to_string(), now_value());
            let (sql, params) = ir.update_sql(&assignments);
            conn.execute(&sql, &params).await?;
        }
        Ok(())
    }

    /// Deletes the backing row. A no-op returning `false` when the
    /// instance was never persisted.
    pub async fn destroy(&mut self) -> OrmResult<bool> {
        if !self.exists {
            return Ok(false);
        }
        let conn = self.def.connection()?;
        let mut ir = QueryIr::new(self.def.table());
        ir.push_where(
            Connector::And,
            PredicateExpr::Basic {
                column: self.def.primary_key().to_string(),
                op: "=".to_string(),
                value: self.primary_key_value(),
            },
        );
        let (sql, params) = ir.delete_sql();
        let affected = conn.execute(&sql, &params).await?.rows_affected;
        self.exists = false;
        Ok(affected > 0)
    }

    /// Loads relations onto an already-hydrated instance; same pipeline as
    /// `Query::with`, run over a single-element batch.
    pub async fn load(&mut self, paths: &[&str]) -> OrmResult<&mut Self> {
        let conn = self.def.connection()?;
        let specs: Vec<EagerSpec> = paths
            .iter()
            .map(|path| EagerSpec {
                path: path.to_string(),
                constraint: None,
            })
            .collect();
        let nodes = build_eager_tree(&specs);
        eager_load_tree(std::slice::from_mut(self), &nodes, &conn).await?;
        Ok(self)
    }

    /// Serializes attributes (hidden ones stripped unless revealed) with
    /// loaded relations overlaid by name.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.attributes {
            if !self.reveal_hidden && self.def.hidden_set().contains(key) {
                continue;
            }
            let rendered = self
                .get_attribute(key)
                .map(|v| v.to_json())
                .unwrap_or_else(|_| value.to_json());
            map.insert(key.clone(), rendered);
        }
        for (name, related) in &self.relations {
            map.insert(name.clone(), related.to_json());
        }
        serde_json::Value::Object(map)
    }

    /// Resolves a declared relation into a traversal handle.
    pub fn relation(&self, name: &str) -> OrmResult<Relation<'_>> {
        let rel = self
            .def
            .relation(name)
            .cloned()
            .ok_or_else(|| OrmError::RelationUnknown(name.to_string()))?;
        let target = match &rel.target {
            Some(target_name) => Some(self.def.registry()?.entity(target_name)?),
            None => None,
        };
        Ok(Relation {
            parent: self,
            def: rel,
            target,
        })
    }

    /// Points this child at a new parent row.
    pub fn associate(&mut self, relation: &str, parent: &Entity) -> OrmResult<&mut Self> {
        let (foreign_key, owner_key) = self.belongs_to_keys(relation)?;
        let owner_value = parent
            .raw_attribute(&owner_key)
            .cloned()
            .unwrap_or(Value::Null);
        self.attributes.insert(foreign_key, owner_value);
        Ok(self)
    }

    /// Clears the foreign key of a declared belongsTo.
    pub fn dissociate(&mut self, relation: &str) -> OrmResult<&mut Self> {
        let (foreign_key, _) = self.belongs_to_keys(relation)?;
        self.attributes.insert(foreign_key, Value::Null);
        Ok(self)
    }

    fn belongs_to_keys(&self, relation: &str) -> OrmResult<(String, String)> {
        match self.def.relation(relation).map(|rel| &rel.kind) {
            Some(RelationKind::BelongsTo {
                foreign_key,
                owner_key,
                ..
            }) => Ok((foreign_key.clone(), owner_key.clone())),
            _ => Err(OrmError::RelationUnknown(relation.to_string())),
        }
    }

    /// Ad hoc hasOne against an explicit target descriptor.
    pub fn has_one<'a>(
        &'a self,
        target: &Arc<EntityDef>,
        foreign_key: &str,
    ) -> Relation<'a> {
        self.ad_hoc(target, RelationKind::HasOne {
            foreign_key: foreign_key.to_string(),
            local_key: self.def.primary_key().to_string(),
        })
    }

    pub fn has_many<'a>(
        &'a self,
        target: &Arc<EntityDef>,
        foreign_key: &str,
    ) -> Relation<'a> {
        self.ad_hoc(target, RelationKind::HasMany {
            foreign_key: foreign_key.to_string(),
            local_key: self.def.primary_key().to_string(),
        })
    }

    pub fn belongs_to<'a>(
        &'a self,
        target: &Arc<EntityDef>,
        foreign_key: &str,
    ) -> Relation<'a> {
        self.ad_hoc(target, RelationKind::BelongsTo {
            foreign_key: foreign_key.to_string(),
            owner_key: target.primary_key().to_string(),
            touch: false,
            default: None,
        })
    }

    pub fn belongs_to_many<'a>(
        &'a self,
        target: &Arc<EntityDef>,
        pivot_table: &str,
        foreign_pivot_key: &str,
        related_pivot_key: &str,
    ) -> Relation<'a> {
        self.ad_hoc(target, RelationKind::BelongsToMany {
            pivot_table: pivot_table.to_string(),
            foreign_pivot_key: foreign_pivot_key.to_string(),
            related_pivot_key: related_pivot_key.to_string(),
            parent_key: self.def.primary_key().to_string(),
            related_key: target.primary_key().to_string(),
            pivot_columns: Vec::new(),
            pivot_timestamps: false,
            pivot_alias: "pivot".to_string(),
            pivot_wheres: Vec::new(),
        })
    }

    /// Ad hoc hasManyThrough: final entities reached across `through`
    /// rows keyed back to this instance.
    pub fn has_many_through<'a>(
        &'a self,
        target: &Arc<EntityDef>,
        through: &Arc<EntityDef>,
        first_key: &str,
        second_key: &str,
    ) -> Relation<'a> {
        self.ad_hoc(target, RelationKind::HasManyThrough {
            through: through.name().to_string(),
            first_key: first_key.to_string(),
            second_key: second_key.to_string(),
            local_key: self.def.primary_key().to_string(),
            through_local_key: through.primary_key().to_string(),
        })
    }

    pub fn has_one_through<'a>(
        &'a self,
        target: &Arc<EntityDef>,
        through: &Arc<EntityDef>,
        first_key: &str,
        second_key: &str,
    ) -> Relation<'a> {
        self.ad_hoc(target, RelationKind::HasOneThrough {
            through: through.name().to_string(),
            first_key: first_key.to_string(),
            second_key: second_key.to_string(),
            local_key: self.def.primary_key().to_string(),
            through_local_key: through.primary_key().to_string(),
        })
    }

    pub fn morph_one<'a>(&'a self, target: &Arc<EntityDef>, morph_name: &str) -> Relation<'a> {
        self.ad_hoc(target, RelationKind::MorphOne {
            type_column: format!("{}_type", morph_name),
            id_column: format!("{}_id", morph_name),
            local_key: self.def.primary_key().to_string(),
        })
    }

    pub fn morph_many<'a>(&'a self, target: &Arc<EntityDef>, morph_name: &str) -> Relation<'a> {
        self.ad_hoc(target, RelationKind::MorphMany {
            type_column: format!("{}_type", morph_name),
            id_column: format!("{}_id", morph_name),
            local_key: self.def.primary_key().to_string(),
        })
    }

    pub fn morph_to(&self, morph_name: &str) -> Relation<'_> {
        Relation {
            parent: self,
            def: RelationDef {
                name: morph_name.to_string(),
                target: None,
                kind: RelationKind::MorphTo {
                    type_column: format!("{}_type", morph_name),
                    id_column: format!("{}_id", morph_name),
                },
            },
            target: None,
        }
    }

    fn ad_hoc<'a>(&'a self, target: &Arc<EntityDef>, kind: RelationKind) -> Relation<'a> {
        Relation {
            parent: self,
            def: RelationDef {
                name: target.name().to_string(),
                target: Some(target.name().to_string()),
                kind,
            },
            target: Some(target.clone()),
        }
    }
}

impl serde::Serialize for Entity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}
