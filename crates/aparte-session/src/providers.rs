//! External collaborator clients: ICE provisioning and block lists.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use aparte_media::IceConfig;
use aparte_store::{BlockSets, Database};
use aparte_shared::types::UserId;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider error: {0}")]
    Service(String),

    #[error("Store error: {0}")]
    Store(#[from] aparte_store::StoreError),
}

// ---------------------------------------------------------------------------
// ICE provisioning
// ---------------------------------------------------------------------------

/// Fetches STUN/TURN server configuration with credentials.
#[async_trait]
pub trait IceServerProvider: Send + Sync {
    async fn fetch(&self) -> Result<IceConfig, ProviderError>;
}

pub struct HttpIceProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpIceProvider {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl IceServerProvider for HttpIceProvider {
    async fn fetch(&self) -> Result<IceConfig, ProviderError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::Service(format!(
                "ICE endpoint returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

/// Fetch the ICE configuration, falling back to the STUN-only default when
/// no provider is configured or the call fails.
pub async fn load_ice_config(provider: Option<&dyn IceServerProvider>) -> IceConfig {
    match provider {
        Some(provider) => match provider.fetch().await {
            Ok(config) => {
                info!(servers = config.ice_servers.len(), "ICE configuration loaded");
                config
            }
            Err(e) => {
                warn!(error = %e, "ICE provisioning failed, using STUN-only fallback");
                IceConfig::default_stun()
            }
        },
        None => IceConfig::default_stun(),
    }
}

// ---------------------------------------------------------------------------
// Block lists
// ---------------------------------------------------------------------------

/// Fetches both directions of a user's block relationships.
#[async_trait]
pub trait BlockListProvider: Send + Sync {
    async fn fetch(&self, user: &UserId) -> Result<BlockSets, ProviderError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockListResponse {
    blocked_user_ids: Vec<String>,
    blocked_by_user_ids: Vec<String>,
}

pub struct HttpBlockListProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpBlockListProvider {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl BlockListProvider for HttpBlockListProvider {
    async fn fetch(&self, user: &UserId) -> Result<BlockSets, ProviderError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("user", user.to_hex())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProviderError::Service(format!(
                "block-list endpoint returned {}",
                response.status()
            )));
        }

        let body: BlockListResponse = response.json().await?;
        let mut sets = BlockSets::default();
        for hex in &body.blocked_user_ids {
            if let Ok(id) = UserId::from_hex(hex) {
                sets.blocked.insert(id);
            }
        }
        for hex in &body.blocked_by_user_ids {
            if let Ok(id) = UserId::from_hex(hex) {
                sets.blocked_by.insert(id);
            }
        }
        Ok(sets)
    }
}

/// Block lists read straight from the shared store (single-host
/// deployments and tests).
pub struct StoreBlockListProvider {
    db: Arc<Database>,
}

impl StoreBlockListProvider {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BlockListProvider for StoreBlockListProvider {
    async fn fetch(&self, user: &UserId) -> Result<BlockSets, ProviderError> {
        Ok(self.db.block_sets(user)?)
    }
}

// ---------------------------------------------------------------------------
// Runtime-mutable local copy
// ---------------------------------------------------------------------------

/// The block sets fetched once at session start, shared between the poll
/// loop and the report path. A mid-session report appends locally without
/// a refetch.
#[derive(Clone)]
pub struct SharedBlockList {
    inner: Arc<Mutex<BlockSets>>,
}

impl SharedBlockList {
    pub fn new(sets: BlockSets) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sets)),
        }
    }

    pub fn empty() -> Self {
        Self::new(BlockSets::default())
    }

    /// The combined exclusion set for resolver calls.
    pub fn combined(&self) -> std::collections::HashSet<UserId> {
        self.inner.lock().expect("block list poisoned").combined()
    }

    /// Append a newly blocked user (report filed mid-session).
    pub fn mark_blocked(&self, user: UserId) {
        self.inner
            .lock()
            .expect("block list poisoned")
            .blocked
            .insert(user);
    }
}
