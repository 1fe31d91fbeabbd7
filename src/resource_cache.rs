//! Tenant-scoped resource caches.
//!
//! A requested domain resolves to its own resource when one exists and to the
//! shared `default` resource otherwise. Two flavours share that resolution
//! order:
//!
//! * [`LazyCache`] materializes one domain at a time on first request and can
//!   drop single entries when their backing file changes.
//! * [`EagerCache`] builds the whole index from the backing tree in one pass
//!   and only ever reads that index on request.
//!
//! Domain keys are case-insensitive. Absence of a key means "not resolved yet",
//! never "known absent".
//!
//! Loaders do blocking filesystem work, so they always run on the blocking
//! pool rather than on a runtime worker.

use crate::error::ResourceError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Key of the shared fallback resource.
pub const DEFAULT_KEY: &str = "default";

/// Builds a single resource from its backing store.
pub trait ResourceLoader: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    /// `Ok(None)` means the backing data does not exist. Data that exists but
    /// cannot be parsed must be an error so it never silently falls back.
    fn load(&self, key: &str) -> Result<Option<Self::Resource>, ResourceError>;
}

/// Builds every resource of a backing tree at once, keyed by lowercase domain.
pub trait TreeLoader: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    fn load_tree(&self) -> Result<HashMap<String, Self::Resource>, ResourceError>;
}

pub struct LazyCache<L: ResourceLoader> {
    loader: Arc<L>,
    index: RwLock<HashMap<String, Arc<L::Resource>>>,
}

impl<L: ResourceLoader> LazyCache<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader: Arc::new(loader),
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    async fn load(&self, key: &str) -> Result<Option<L::Resource>, ResourceError> {
        let loader = self.loader.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || loader.load(&key))
            .await
            .map_err(|e| ResourceError::Interrupted(e.to_string()))?
    }

    /// Resolve `domain`, loading it (or the default) on a miss.
    pub async fn resolve(&self, domain: &str) -> Result<Arc<L::Resource>, ResourceError> {
        let domain = domain.to_lowercase();

        {
            let index = self.index.read().await;
            if let Some(resource) = index.get(&domain) {
                return Ok(resource.clone());
            }
        }

        let mut index = self.index.write().await;
        // Another request may have built it while we waited for the write lock
        if let Some(resource) = index.get(&domain) {
            return Ok(resource.clone());
        }

        if let Some(resource) = self.load(&domain).await? {
            log::debug!("Loaded resource for domain: {domain}");
            let resource = Arc::new(resource);
            index.insert(domain, resource.clone());
            return Ok(resource);
        }

        let default = match index.get(DEFAULT_KEY) {
            Some(resource) => resource.clone(),
            None => match self.load(DEFAULT_KEY).await? {
                Some(resource) => {
                    let resource = Arc::new(resource);
                    index.insert(DEFAULT_KEY.to_string(), resource.clone());
                    resource
                }
                None => return Err(ResourceError::NotFound { domain }),
            },
        };

        log::debug!("No resource for {domain}, using default");
        index.insert(domain, default.clone());
        Ok(default)
    }

    /// Forget a single domain; the next request reloads it.
    pub async fn invalidate(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        self.index.write().await.remove(&domain).is_some()
    }

    /// Forget every domain.
    pub async fn invalidate_all(&self) -> usize {
        let mut index = self.index.write().await;
        let cleared = index.len();
        index.clear();
        cleared
    }

    pub async fn cached_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.index.read().await.keys().cloned().collect();
        domains.sort();
        domains
    }
}

pub struct EagerCache<L: TreeLoader> {
    loader: Arc<L>,
    index: RwLock<HashMap<String, Arc<L::Resource>>>,
    // One rebuild at a time so an older tree never replaces a newer one
    reloading: Mutex<()>,
}

impl<L: TreeLoader> EagerCache<L> {
    /// Build the index once. Failing here means there is nothing to serve.
    pub fn load(loader: L) -> Result<Self, ResourceError> {
        let index = Self::build(&loader)?;
        Ok(Self {
            loader: Arc::new(loader),
            index: RwLock::new(index),
            reloading: Mutex::new(()),
        })
    }

    fn build(loader: &L) -> Result<HashMap<String, Arc<L::Resource>>, ResourceError> {
        Ok(loader
            .load_tree()?
            .into_iter()
            .map(|(key, resource)| (key.to_lowercase(), Arc::new(resource)))
            .collect())
    }

    /// Rebuild the whole index off the request path and swap it in. On
    /// failure the previous index is kept.
    pub async fn reload(&self) -> Result<usize, ResourceError> {
        let _reloading = self.reloading.lock().await;

        let loader = self.loader.clone();
        let fresh = tokio::task::spawn_blocking(move || Self::build(&loader))
            .await
            .map_err(|e| ResourceError::Interrupted(e.to_string()))??;

        let count = fresh.len();
        *self.index.write().await = fresh;
        Ok(count)
    }

    pub async fn resolve(&self, domain: &str) -> Result<Arc<L::Resource>, ResourceError> {
        let domain = domain.to_lowercase();
        let index = self.index.read().await;
        index
            .get(&domain)
            .or_else(|| index.get(DEFAULT_KEY))
            .cloned()
            .ok_or(ResourceError::NotFound { domain })
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }
}
