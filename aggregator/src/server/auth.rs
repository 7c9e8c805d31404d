//! Tenant authentication seam.
//!
//! Ingest requests carry a credential (`Authorization: Bearer <key>` or
//! `X-API-Key: <key>`) that a [`TenantAuthenticator`] resolves to the
//! tenant the samples belong to.

use crate::audit;
use crate::config::ApiKeyEntry;
use crate::infra::MonitoredPool;
use crate::ingest::TenantId;
use async_trait::async_trait;
use hyper::header::{HeaderMap, AUTHORIZATION};
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("malformed authorization header")]
    Malformed,

    #[error("invalid credential")]
    Invalid,

    #[error("credential lookup failed: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TenantAuthenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<TenantId, AuthError>;
}

/// Keys from the configuration file.
#[derive(Debug, Default)]
pub struct StaticKeys {
    keys: HashMap<String, TenantId>,
}

impl StaticKeys {
    pub fn new(entries: &[ApiKeyEntry]) -> Self {
        let keys = entries
            .iter()
            .filter_map(|e| TenantId::new(e.tenant.clone()).map(|t| (e.key.clone(), t)))
            .collect();
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl TenantAuthenticator for StaticKeys {
    async fn authenticate(&self, credential: &str) -> Result<TenantId, AuthError> {
        self.keys.get(credential).cloned().ok_or(AuthError::Invalid)
    }
}

/// Keys looked up in the `api_keys(api_key, tenant_id)` table.
#[derive(Debug)]
pub struct PooledKeys {
    pool: Arc<MonitoredPool>,
}

impl PooledKeys {
    pub fn new(pool: Arc<MonitoredPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantAuthenticator for PooledKeys {
    async fn authenticate(&self, credential: &str) -> Result<TenantId, AuthError> {
        let pool = self.pool.clone();
        let credential = credential.to_string();
        let found = tokio::task::spawn_blocking(move || {
            pool.query(|conn| {
                conn.query_row(
                    "SELECT CAST(tenant_id AS TEXT) FROM api_keys WHERE api_key = ?1",
                    [&credential],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
        })
        .await
        .map_err(|e| AuthError::Unavailable(e.to_string()))?
        .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        found.and_then(TenantId::new).ok_or(AuthError::Invalid)
    }
}

/// Tries each authenticator in order; the first tenant wins.
#[derive(Default)]
pub struct FirstMatch {
    chain: Vec<Arc<dyn TenantAuthenticator>>,
}

impl FirstMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, authenticator: Arc<dyn TenantAuthenticator>) -> Self {
        self.chain.push(authenticator);
        self
    }
}

#[async_trait]
impl TenantAuthenticator for FirstMatch {
    async fn authenticate(&self, credential: &str) -> Result<TenantId, AuthError> {
        let mut last = AuthError::Invalid;
        for authenticator in &self.chain {
            match authenticator.authenticate(credential).await {
                Ok(tenant) => return Ok(tenant),
                Err(AuthError::Invalid) => {}
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

/// Pull the credential out of the request headers.
pub fn extract_credential(headers: &HeaderMap) -> Result<&str, AuthError> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        let value = value.to_str().map_err(|_| AuthError::Malformed)?;
        let token = value.strip_prefix("Bearer ").ok_or(AuthError::Malformed)?.trim();
        return if token.is_empty() {
            Err(AuthError::Missing)
        } else {
            Ok(token)
        };
    }
    match headers.get(API_KEY_HEADER) {
        Some(value) => {
            let key = value.to_str().map_err(|_| AuthError::Malformed)?.trim();
            if key.is_empty() {
                Err(AuthError::Missing)
            } else {
                Ok(key)
            }
        }
        None => Err(AuthError::Missing),
    }
}

/// Resolve the request's tenant, auditing the outcome.
pub async fn authenticate(
    authenticator: &dyn TenantAuthenticator,
    headers: &HeaderMap,
) -> Result<TenantId, AuthError> {
    let result = match extract_credential(headers) {
        Ok(credential) => authenticator.authenticate(credential).await,
        Err(e) => Err(e),
    };
    match &result {
        Ok(tenant) => audit::ingest_auth_success(tenant.as_str()),
        Err(e) => audit::ingest_auth_failure(&e.to_string()),
    }
    result
}
