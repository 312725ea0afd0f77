//! Scriptable in-memory adapter
//!
//! Each call pops the next scripted response for that operation; once the
//! script is empty the adapter succeeds with generated identifiers. Call
//! counters and the payloads it received are exposed for assertions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};

use crate::error::AdapterError;
use crate::platforms::{IssuedCredential, PlatformAdapter, Published};
use crate::types::Payload;

type Script<T> = Mutex<VecDeque<Result<T, AdapterError>>>;

pub struct MockAdapter {
    name: String,
    delay: Duration,
    publish_script: Script<Published>,
    refresh_script: Script<IssuedCredential>,

    /// Number of times publish has been called
    pub publish_calls: Arc<Mutex<usize>>,
    /// Number of times refresh has been called
    pub refresh_calls: Arc<Mutex<usize>>,
    /// Number of times exchange_for_credential has been called
    pub exchange_calls: Arc<Mutex<usize>>,
    /// (credential, payload) of every publish call
    pub published: Arc<Mutex<Vec<(String, Payload)>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockAdapter {
    /// An adapter that always succeeds
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            publish_script: Mutex::new(VecDeque::new()),
            refresh_script: Mutex::new(VecDeque::new()),
            publish_calls: Arc::new(Mutex::new(0)),
            refresh_calls: Arc::new(Mutex::new(0)),
            exchange_calls: Arc::new(Mutex::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Simulated network latency for every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue the result of the next unscripted publish call
    pub fn push_publish(&self, result: Result<Published, AdapterError>) -> &Self {
        lock(&self.publish_script).push_back(result);
        self
    }

    /// Queue the result of the next unscripted refresh call
    pub fn push_refresh(&self, result: Result<IssuedCredential, AdapterError>) -> &Self {
        lock(&self.refresh_script).push_back(result);
        self
    }

    /// Shorthand for a rate-limited publish response
    pub fn rate_limit_next(&self, retry_after_secs: Option<u64>) -> &Self {
        self.push_publish(Err(AdapterError::RateLimited { retry_after_secs }))
    }

    /// Shorthand for a server error publish response
    pub fn fail_next(&self, status: u16) -> &Self {
        self.push_publish(Err(AdapterError::Server {
            status,
            message: "scripted failure".to_string(),
        }))
    }

    pub fn publish_count(&self) -> usize {
        *lock(&self.publish_calls)
    }

    pub fn refresh_count(&self) -> usize {
        *lock(&self.refresh_calls)
    }

    pub fn exchange_count(&self) -> usize {
        *lock(&self.exchange_calls)
    }

    /// Credentials used by publish calls, in call order
    pub fn credentials_seen(&self) -> Vec<String> {
        lock(&self.published).iter().map(|(c, _)| c.clone()).collect()
    }

    async fn simulate_latency(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn issue(&self, prefix: &str, seq: usize) -> IssuedCredential {
        IssuedCredential {
            access_token: SecretString::from(format!("{}-access-{}", prefix, seq)),
            refresh_token: Some(SecretString::from(format!("{}-refresh-{}", prefix, seq))),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        }
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exchange_for_credential(&self, code: &str) -> Result<IssuedCredential, AdapterError> {
        self.simulate_latency().await;
        let seq = {
            let mut count = lock(&self.exchange_calls);
            *count += 1;
            *count
        };

        if code.is_empty() {
            return Err(AdapterError::InvalidGrant {
                message: "empty authorization code".to_string(),
            });
        }
        Ok(self.issue(code, seq))
    }

    async fn refresh(&self, _refresh_secret: &SecretString) -> Result<IssuedCredential, AdapterError> {
        self.simulate_latency().await;
        let seq = {
            let mut count = lock(&self.refresh_calls);
            *count += 1;
            *count
        };

        if let Some(scripted) = lock(&self.refresh_script).pop_front() {
            return scripted;
        }
        Ok(self.issue("refreshed", seq))
    }

    async fn publish(
        &self,
        credential: &SecretString,
        payload: &Payload,
    ) -> Result<Published, AdapterError> {
        self.simulate_latency().await;
        let seq = {
            let mut count = lock(&self.publish_calls);
            *count += 1;
            *count
        };

        if let Some(scripted) = lock(&self.publish_script).pop_front() {
            return scripted;
        }

        lock(&self.published).push((credential.expose_secret().to_string(), payload.clone()));
        let platform_id = format!("{}-post-{}", self.name, seq);
        Ok(Published {
            platform_url: Some(format!("https://{}.invalid/{}", self.name, platform_id)),
            platform_id,
        })
    }
}
