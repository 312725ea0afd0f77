//! Platform adapters
//!
//! An adapter executes publish and credential calls against one external API
//! and reports failures as [`AdapterError`]. Adapters know nothing about
//! retries, queue slots or account status; the broker and orchestrator decide
//! what an error means.
//!
//! Adapters are collected in an [`AdapterRegistry`] built once at startup and
//! shared by `Arc`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use libcadence::platforms::{mock::MockAdapter, AdapterRegistry};
//!
//! let mut registry = AdapterRegistry::new();
//! registry.register(Arc::new(MockAdapter::new("mock")));
//! assert!(registry.get("mock").is_some());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::config::Config;
use crate::error::{AdapterError, Result};
use crate::types::Payload;

// Mock adapter is available for all builds (not just tests) to support integration tests
pub mod mock;
pub mod webhook;

/// A credential pair issued by a platform
#[derive(Debug)]
pub struct IssuedCredential {
    pub access_token: SecretString,
    /// `None` when the platform did not rotate or issue a refresh secret
    pub refresh_token: Option<SecretString>,
    /// `None` for credentials that do not expire
    pub expires_at: Option<DateTime<Utc>>,
}

/// Identifiers of a successfully published post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub platform_id: String,
    pub platform_url: Option<String>,
}

/// One external publishing API.
///
/// Every call must complete in bounded time; implementations apply their own
/// request timeouts and report them as [`AdapterError::Transport`].
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Registry key, matched against `Account::platform`
    fn name(&self) -> &str;

    /// Trade an authorization code for the account's first credential pair
    async fn exchange_for_credential(
        &self,
        code: &str,
    ) -> std::result::Result<IssuedCredential, AdapterError>;

    /// Obtain a fresh credential pair from a refresh secret.
    ///
    /// A refresh secret the platform will never accept again is reported as
    /// [`AdapterError::InvalidGrant`].
    async fn refresh(
        &self,
        refresh_secret: &SecretString,
    ) -> std::result::Result<IssuedCredential, AdapterError>;

    /// Publish a payload with a valid bearer credential
    async fn publish(
        &self,
        credential: &SecretString,
        payload: &Payload,
    ) -> std::result::Result<Published, AdapterError>;
}

#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from `[[webhook]]` config entries
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for webhook in &config.webhooks {
            let adapter = webhook::WebhookAdapter::from_config(webhook)?;
            registry.register(Arc::new(adapter));
        }
        Ok(registry)
    }

    /// Add an adapter, replacing any previous one with the same name
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(platform).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
