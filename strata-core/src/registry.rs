use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::connection::Connection;
use crate::entity::EntityDef;
use crate::error::{OrmError, OrmResult};

/// Holds every registered entity descriptor, the default driver adapter,
/// and the morph map.
///
/// Built once during program start; afterwards it is only read. Entity
/// descriptors reference their relation targets by name and resolve them
/// here at query time, which is what lets `User → Post → User` cycles be
/// declared without constructing circular descriptors.
pub struct Registry {
    inner: RwLock<Inner>,
}

struct Inner {
    entities: HashMap<String, Arc<EntityDef>>,
    connection: Option<Arc<Connection>>,
    morph_map: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner {
                entities: HashMap::new(),
                connection: None,
                morph_map: HashMap::new(),
            }),
        })
    }

    pub fn with_connection(connection: Arc<Connection>) -> Arc<Self> {
        let registry = Self::new();
        registry.set_connection(connection);
        registry
    }

    /// Sets the default driver adapter for every entity registered here.
    pub fn set_connection(&self, connection: Arc<Connection>) {
        self.write().connection = Some(connection);
    }

    pub fn connection(&self) -> OrmResult<Arc<Connection>> {
        self.read()
            .connection
            .clone()
            .ok_or_else(|| OrmError::ConnectionFailed("no connection configured".to_string()))
    }

    /// Registers a descriptor and hands back the shared handle used for all
    /// queries against that entity.
    pub fn register(self: &Arc<Self>, def: EntityDef) -> Arc<EntityDef> {
        let def = Arc::new(def);
        def.bind_registry(Arc::downgrade(self));
        self.write()
            .entities
            .insert(def.name().to_string(), def.clone());
        def
    }

    pub fn get(&self, name: &str) -> Option<Arc<EntityDef>> {
        self.read().entities.get(name).cloned()
    }

    /// Looks up a relation target by entity name.
    pub fn entity(&self, name: &str) -> OrmResult<Arc<EntityDef>> {
        self.get(name)
            .ok_or_else(|| OrmError::RelationUnknown(name.to_string()))
    }

    /// Installs the alias → entity mapping used to resolve polymorphic
    /// `*_type` columns. Call during initialization, before queries run.
    pub fn set_morph_map<I, A, E>(&self, pairs: I)
    where
        I: IntoIterator<Item = (A, E)>,
        A: Into<String>,
        E: Into<String>,
    {
        let mut inner = self.write();
        inner.morph_map = pairs
            .into_iter()
            .map(|(alias, entity)| (alias.into(), entity.into()))
            .collect();
    }

    /// Resolves a morph alias to its entity descriptor.
    pub fn morph_target(&self, alias: &str) -> OrmResult<Arc<EntityDef>> {
        let entity_name = self
            .read()
            .morph_map
            .get(alias)
            .cloned()
            .ok_or_else(|| OrmError::MorphUnresolved(alias.to_string()))?;
        self.get(&entity_name)
            .ok_or_else(|| OrmError::MorphUnresolved(alias.to_string()))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
