//! Per-location runtime state
//!
//! Each configured location gets:
//! - Its own session pool, registered in the shared registry
//! - A describe cache that lives as long as the process
//! - The file cache and realm challenge its requests use

use crate::binder::DescribeCache;
use crate::pool::{ConnectionPool, SharedPoolRegistry};
use crate::stream::{CacheStore, DirectoryCache};
use procgate_common::config::RegistrySettings;
use procgate_common::{BasicRealm, GatewayError, LocationConfig, RealmChallenge, Result};
use std::sync::Arc;
use tracing::info;

/// A pooled backend session and the user it was opened for
#[derive(Debug)]
pub struct BackendSession<S> {
    pub session: S,
    pub username: String,
}

/// Everything a request against one location needs
pub struct LocationContext<S> {
    pub config: LocationConfig,
    pub pool: ConnectionPool<BackendSession<S>>,
    pub describe: DescribeCache,
    pub cache: Option<Arc<dyn CacheStore>>,
    pub realm: Arc<dyn RealmChallenge>,
}

impl<S: Send + 'static> LocationContext<S> {
    /// Validate `config` and build the location's pool
    pub fn new(config: LocationConfig, registry: Option<Arc<SharedPoolRegistry>>) -> Result<Self> {
        config.validate()?;
        let registry = registry.filter(|_| config.registry.enabled);
        let pool = ConnectionPool::new(config.name.clone(), config.pool.clone(), registry)?;
        let cache = config
            .upload
            .cache_root
            .as_ref()
            .map(|root| Arc::new(DirectoryCache::new(root.clone())) as Arc<dyn CacheStore>);
        let realm = Arc::new(BasicRealm::new(config.realm.clone()));

        info!(
            location = %config.name,
            call_mode = ?config.call_mode,
            output = ?config.output.mode,
            upload_target = ?config.upload.target,
            "Location configured"
        );

        Ok(Self {
            config,
            pool,
            describe: DescribeCache::new(),
            cache,
            realm,
        })
    }

    /// Replace the challenge sent with 401 responses
    pub fn with_realm(mut self, realm: Arc<dyn RealmChallenge>) -> Self {
        self.realm = realm;
        self
    }

    /// Replace the file cache collaborator
    pub fn with_cache_store(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

/// Open the registry described by `settings`
///
/// A path selects a file mapping shared with sibling processes; without one
/// the registry is process-local.
pub fn open_registry(settings: &RegistrySettings) -> Result<Option<Arc<SharedPoolRegistry>>> {
    if !settings.enabled {
        return Ok(None);
    }
    let registry = match &settings.path {
        #[cfg(unix)]
        Some(path) => SharedPoolRegistry::mapped(path, settings.size_bytes)?,
        #[cfg(not(unix))]
        Some(_) => {
            return Err(GatewayError::Config(
                "file-backed registry requires a unix platform".into(),
            ))
        }
        None => SharedPoolRegistry::in_memory(settings.size_bytes)?,
    };
    Ok(Some(Arc::new(registry)))
}
