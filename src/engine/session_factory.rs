// Session factory - shared, thread-safe owner of everything sessions need
// Metamodel, connection provider, cache regions, listeners, id generators and statistics

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::FlushMode;
use crate::engine::listeners::{EntityListener, ListenerRegistry};
use crate::engine::session::Session;
use crate::error::{AppError, AppResult};
use crate::infrastructure::{
    CacheRegion, ConnectionProvider, IncrementGenerator, LruRegionFactory, RegionFactory,
    SnowflakeGenerator, Statement, Statistics, StatisticsSnapshot,
};
use crate::mapping::{schema, Metamodel};

/// What to do with the schema when the factory is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaAction {
    None,
    /// Create missing tables
    #[default]
    Create,
    /// Drop and create every table
    Recreate,
}

impl FromStr for SchemaAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "false" => Ok(SchemaAction::None),
            "create" | "true" => Ok(SchemaAction::Create),
            "recreate" => Ok(SchemaAction::Recreate),
            other => Err(AppError::ConfigurationError(format!(
                "Unknown schema action '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionFactoryConfig {
    pub flush_mode: FlushMode,
    pub order_inserts: bool,
    pub order_updates: bool,
    pub second_level_cache: bool,
    pub cache_ttl: Option<Duration>,
    pub schema_action: SchemaAction,
    /// Snowflake node id; random when unset
    pub node_id: Option<u16>,
}

impl Default for SessionFactoryConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Auto,
            order_inserts: true,
            order_updates: true,
            second_level_cache: true,
            cache_ttl: None,
            schema_action: SchemaAction::Create,
            node_id: None,
        }
    }
}

pub(crate) struct FactoryInner {
    pub(crate) metamodel: Arc<Metamodel>,
    pub(crate) provider: Arc<dyn ConnectionProvider>,
    pub(crate) regions: HashMap<String, Arc<dyn CacheRegion>>,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) config: SessionFactoryConfig,
    pub(crate) statistics: Statistics,
    pub(crate) snowflake: SnowflakeGenerator,
    pub(crate) increments: IncrementGenerator,
}

#[derive(Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("metamodel", &self.inner.metamodel)
            .field("regions", &self.inner.regions.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl SessionFactory {
    pub fn builder(metamodel: Metamodel, provider: Arc<dyn ConnectionProvider>) -> SessionFactoryBuilder {
        SessionFactoryBuilder {
            metamodel,
            provider,
            config: SessionFactoryConfig::default(),
            region_factory: Arc::new(LruRegionFactory::default()),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Open a session with its own gateway
    pub async fn open_session(&self) -> AppResult<Session> {
        let gateway = self.inner.provider.acquire().await?;
        debug!("Opened session");
        Ok(Session::new(self.inner.clone(), gateway))
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.inner.metamodel
    }

    pub fn config(&self) -> &SessionFactoryConfig {
        &self.inner.config
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.statistics.snapshot()
    }

    pub fn clear_statistics(&self) {
        self.inner.statistics.clear();
    }

    /// Empty the cache region of one entity, or of all entities
    pub async fn evict_cache(&self, entity_name: Option<&str>) -> AppResult<usize> {
        let mut evicted = 0;
        for (name, region) in &self.inner.regions {
            if entity_name.is_some_and(|wanted| wanted != name) {
                continue;
            }
            region.evict_all().await?;
            evicted += 1;
        }
        if let Some(name) = entity_name {
            if evicted == 0 && !self.inner.metamodel.contains(name) {
                return Err(AppError::InvalidArgument(format!("Unknown entity '{}'", name)));
            }
        }
        info!("Evicted {} cache regions", evicted);
        Ok(evicted)
    }

    /// Entries currently held per cache region
    pub async fn cache_sizes(&self) -> HashMap<String, usize> {
        let mut sizes = HashMap::new();
        for (name, region) in &self.inner.regions {
            sizes.insert(name.clone(), region.len().await);
        }
        sizes
    }

    pub async fn health_check(&self) -> AppResult<()> {
        self.inner.provider.health_check().await
    }
}

pub struct SessionFactoryBuilder {
    metamodel: Metamodel,
    provider: Arc<dyn ConnectionProvider>,
    config: SessionFactoryConfig,
    region_factory: Arc<dyn RegionFactory>,
    listeners: ListenerRegistry,
}

impl SessionFactoryBuilder {
    pub fn config(mut self, config: SessionFactoryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn region_factory(mut self, region_factory: Arc<dyn RegionFactory>) -> Self {
        self.region_factory = region_factory;
        self
    }

    pub fn listener(mut self, entity_name: &str, listener: Arc<dyn EntityListener>) -> Self {
        self.listeners.register(entity_name, listener);
        self
    }

    pub fn global_listener(mut self, listener: Arc<dyn EntityListener>) -> Self {
        self.listeners.register_global(listener);
        self
    }

    /// Validate the mappings, prepare the schema and build cache regions
    pub async fn build(self) -> AppResult<SessionFactory> {
        self.metamodel.validate()?;
        for name in self.listeners.registered_entities() {
            if !self.metamodel.contains(name) {
                return Err(AppError::ConfigurationError(format!(
                    "Listener registered for unknown entity '{}'",
                    name
                )));
            }
        }

        let snowflake = match self.config.node_id {
            Some(node_id) => SnowflakeGenerator::new(node_id)?,
            None => SnowflakeGenerator::random(),
        };

        let statements = match self.config.schema_action {
            SchemaAction::None => Vec::new(),
            SchemaAction::Create => schema::create_statements(&self.metamodel)?,
            SchemaAction::Recreate => {
                let mut statements = schema::drop_statements(&self.metamodel);
                statements.extend(schema::create_statements(&self.metamodel)?);
                statements
            }
        };
        if !statements.is_empty() {
            let mut gateway = self.provider.acquire().await?;
            for sql in statements {
                gateway.execute(&Statement::new(sql, "")).await?;
            }
            info!("Schema prepared ({:?})", self.config.schema_action);
        }

        let mut regions = HashMap::new();
        if self.config.second_level_cache {
            for meta in self.metamodel.iter().filter(|m| m.cacheable) {
                let region = self
                    .region_factory
                    .build_region(&meta.name, self.config.cache_ttl);
                regions.insert(meta.name.clone(), region);
            }
        }

        info!(
            "Session factory ready: {} entities, {} cache regions, node {}",
            self.metamodel.entity_names().len(),
            regions.len(),
            snowflake.node_id()
        );
        Ok(SessionFactory {
            inner: Arc::new(FactoryInner {
                metamodel: Arc::new(self.metamodel),
                provider: self.provider,
                regions,
                listeners: self.listeners,
                config: self.config,
                statistics: Statistics::new(),
                snowflake,
                increments: IncrementGenerator::new(),
            }),
        })
    }
}
