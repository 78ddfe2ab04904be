//! Handler Registry
//!
//! Explicit engine-name to constructor map, built once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use quarry_core::{FederationError, FederationResult};

use crate::config::PushdownConfig;
use crate::engine::args::ConnectionArgs;
use crate::engine::drivers::{mysql, postgres, shopify, sqlite};
use crate::engine::traits::Handler;

/// Everything a factory needs to build one named handler instance.
#[derive(Debug, Clone)]
pub struct HandlerSpec {
    pub name: String,
    pub args: ConnectionArgs,
    pub pushdown: PushdownConfig,
}

pub type HandlerFactory = fn(HandlerSpec) -> FederationResult<Arc<dyn Handler>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerInfo {
    pub id: String,
    pub title: String,
}

struct Entry {
    title: &'static str,
    factory: HandlerFactory,
}

pub struct HandlerRegistry {
    entries: HashMap<String, Entry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry with every handler this crate ships.
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(sqlite::HANDLER_TYPE, "SQLite", |spec| {
            Ok(Arc::new(sqlite::SqliteHandler::new(
                spec.name,
                sqlite::SqliteBackend::new(spec.args),
            )))
        });
        registry.register(postgres::HANDLER_TYPE, "PostgreSQL", |spec| {
            Ok(Arc::new(postgres::PostgresHandler::new(
                spec.name,
                postgres::PostgresBackend::new(spec.args),
            )))
        });
        registry.register(mysql::HANDLER_TYPE, "MySQL", |spec| {
            Ok(Arc::new(mysql::MySqlHandler::new(
                spec.name,
                mysql::MySqlBackend::new(spec.args),
            )))
        });
        registry.register(shopify::HANDLER_TYPE, "Shopify", |spec| {
            Ok(Arc::new(shopify::ShopifyHandler::new(
                spec.name,
                shopify::ShopifyBackend::new(),
                spec.args,
                spec.pushdown,
            )))
        });
        registry
    }

    /// Registers a factory; an existing entry with the same id is replaced.
    pub fn register(&mut self, id: &str, title: &'static str, factory: HandlerFactory) {
        self.entries
            .insert(id.to_ascii_lowercase(), Entry { title, factory });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(&id.to_ascii_lowercase())
    }

    /// Builds a handler instance. No connection is opened here.
    pub fn build(&self, engine: &str, spec: HandlerSpec) -> FederationResult<Arc<dyn Handler>> {
        let entry = self
            .entries
            .get(&engine.to_ascii_lowercase())
            .ok_or_else(|| {
                FederationError::configuration(format!("unknown handler engine '{engine}'"))
            })?;
        if spec.name.trim().is_empty() {
            return Err(FederationError::configuration("handler name must not be empty"));
        }
        (entry.factory)(spec)
    }

    pub fn list_infos(&self) -> Vec<HandlerInfo> {
        let mut infos: Vec<HandlerInfo> = self
            .entries
            .iter()
            .map(|(id, entry)| HandlerInfo {
                id: id.clone(),
                title: entry.title.to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
