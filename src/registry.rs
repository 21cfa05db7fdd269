//! Application registry.
//!
//! Startup-time directory from `application.type` names to constructors
//! of the concrete server applications. Built explicitly in `main` and
//! handed to the engine — there are no process-wide singletons, and the
//! initialization order is fixed: registry first, then engine.

use crate::apps::{EchoApp, RedisApp, WebSocketApp};
use crate::config::Config;
use crate::engine::Application;
use crate::error::{Error, Result};
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

type Constructor = Box<dyn Fn(&Config, &Arc<Store>) -> Arc<dyn Application> + Send + Sync>;

pub struct Registry {
    creators: HashMap<String, Constructor>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            creators: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, creator: F)
    where
        F: Fn(&Config, &Arc<Store>) -> Arc<dyn Application> + Send + Sync + 'static,
    {
        if self
            .creators
            .insert(name.to_string(), Box::new(creator))
            .is_some()
        {
            warn!(name, "application type re-registered, replacing constructor");
        }
        debug!(name, "application registered");
    }

    pub fn create(
        &self,
        name: &str,
        config: &Config,
        store: &Arc<Store>,
    ) -> Result<Arc<dyn Application>> {
        match self.creators.get(name) {
            Some(creator) => Ok(creator(config, store)),
            None => Err(Error::UnknownApplication(name.to_string())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.creators.contains_key(name)
    }

    /// Registered names, sorted for display.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.creators.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// The stock applications.
pub fn defaults() -> Registry {
    let mut registry = Registry::new();
    registry.register("websocket", |config, _store| {
        Arc::new(WebSocketApp::new(config.websocket.clone()))
    });
    registry.register("redis", |_config, store| {
        Arc::new(RedisApp::new(Arc::clone(store)))
    });
    registry.register("echo", |_config, _store| Arc::new(EchoApp));
    registry
}
