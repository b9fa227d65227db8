//! One-time signed token service
//!
//! Bridges authentication where session cookies are unavailable (deep-linked
//! webviews, temporary upload flows). A token is `payload.signature` where
//! the payload encodes a random token id plus expiry and the signature is an
//! HMAC-SHA256 over the payload. The signature stops forged ids from ever
//! reaching the store; the store lookup is what makes a token single-use:
//! verification removes the entry with an atomic delete-and-return, so two
//! concurrent presentations of the same token cannot both succeed.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{collections::HashMap, sync::Arc};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::{config::EngineConfig, error::EscrowError, EscrowResult};

type HmacSha256 = Hmac<Sha256>;

/// Configuration for the token service
#[derive(Debug, Clone)]
pub struct TokenServiceConfig {
    /// HMAC signing secret; deployments must override the dev default
    pub secret: String,
    /// Default token lifetime in seconds
    pub default_ttl_secs: u64,
}

impl Default for TokenServiceConfig {
    fn default() -> Self {
        Self {
            secret: "dev-secret-change-me".to_string(),
            default_ttl_secs: 300,
        }
    }
}

/// The engine config carries the token knobs; this is the wiring-time bridge
impl From<&EngineConfig> for TokenServiceConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            secret: config.token_secret.clone(),
            default_ttl_secs: config.token_ttl_secs,
        }
    }
}

/// Durable mapping from token id to its owner and expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Keyed token storage; the production implementation is a shared database
/// row or cache with an atomic delete-and-return primitive
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert(&self, id: Uuid, entry: TokenEntry) -> EscrowResult<()>;

    /// Remove and return the entry in one step; `None` means the id was
    /// never minted or has already been consumed
    async fn take(&self, id: Uuid) -> EscrowResult<Option<TokenEntry>>;

    /// Drop entries whose expiry has passed; returns how many were removed
    async fn purge_expired(&self, now: DateTime<Utc>) -> EscrowResult<usize>;
}

/// In-memory token store for single-instance deployments and tests
pub struct MemoryTokenStore {
    entries: Arc<RwLock<HashMap<Uuid, TokenEntry>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn insert(&self, id: Uuid, entry: TokenEntry) -> EscrowResult<()> {
        self.entries.write().await.insert(id, entry);
        Ok(())
    }

    async fn take(&self, id: Uuid) -> EscrowResult<Option<TokenEntry>> {
        // HashMap::remove under the write lock is the atomic
        // delete-and-return.
        Ok(self.entries.write().await.remove(&id))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> EscrowResult<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at >= now);
        Ok(before - entries.len())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    id: Uuid,
    /// Expiry as unix milliseconds
    exp: i64,
}

/// Mints and single-use-verifies signed bridging tokens
pub struct TokenService {
    config: TokenServiceConfig,
    store: Arc<dyn TokenStore>,
}

impl TokenService {
    pub fn new(config: TokenServiceConfig, store: Arc<dyn TokenStore>) -> Self {
        Self { config, store }
    }

    /// Mint a token for `user_id`, persisted before the artifact is returned
    pub async fn mint(&self, user_id: Uuid, ttl_secs: Option<u64>) -> EscrowResult<String> {
        let ttl = ttl_secs.unwrap_or(self.config.default_ttl_secs);
        let expires_at = Utc::now() + Duration::seconds(ttl as i64);
        let token_id = Uuid::new_v4();

        self.store
            .insert(
                token_id,
                TokenEntry {
                    user_id,
                    expires_at,
                },
            )
            .await?;

        let payload = TokenPayload {
            id: token_id,
            exp: expires_at.timestamp_millis(),
        };
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?);
        let sig = self.sign(&payload_b64)?;
        debug!(%user_id, %token_id, ttl, "minted one-time token");
        Ok(format!("{payload_b64}.{sig}"))
    }

    /// Verify the signature and expiry, then consume the token; at most one
    /// presentation of a given token can ever succeed
    pub async fn verify_and_consume(&self, token: &str) -> EscrowResult<Uuid> {
        let (payload_b64, sig) = token
            .split_once('.')
            .ok_or_else(|| EscrowError::unauthenticated("malformed token"))?;

        let expected = self.sign(payload_b64)?;
        // Constant-time comparison over the encoded signatures.
        if !bool::from(expected.as_bytes().ct_eq(sig.as_bytes())) {
            return Err(EscrowError::unauthenticated("token signature mismatch"));
        }

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| EscrowError::unauthenticated("malformed token payload"))?;
        let payload: TokenPayload = serde_json::from_slice(&payload_bytes)
            .map_err(|_| EscrowError::unauthenticated("malformed token payload"))?;

        let now = Utc::now();
        if now.timestamp_millis() > payload.exp {
            return Err(EscrowError::precondition("token expired"));
        }

        let entry = self
            .store
            .take(payload.id)
            .await?
            .ok_or_else(|| EscrowError::precondition("token already used or unknown"))?;
        if now > entry.expires_at {
            return Err(EscrowError::precondition("token expired"));
        }
        debug!(user_id = %entry.user_id, token_id = %payload.id, "consumed one-time token");
        Ok(entry.user_id)
    }

    /// Drop expired entries from the backing store
    pub async fn purge_expired(&self) -> EscrowResult<usize> {
        self.store.purge_expired(Utc::now()).await
    }

    fn sign(&self, payload_b64: &str) -> EscrowResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.config.secret.as_bytes())
            .map_err(|e| EscrowError::config(format!("invalid token secret: {e}")))?;
        mac.update(payload_b64.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }
}
