// HLS Key Provider: fetches AES-128 keys with retry and caches them per URI.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::KeyConfig;
use crate::error::LoadError;
use crate::fragment::EncryptionInfo;
use crate::retry::{RetryAction, RetryPolicy, classify, retry_with_backoff};

const KEY_CACHE_CAPACITY: u64 = 64;
const KEY_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn load_key(&self, info: &EncryptionInfo) -> Result<[u8; 16], LoadError>;
}

pub struct HttpKeyProvider {
    client: Client,
    config: KeyConfig,
    cache: Cache<String, [u8; 16]>,
    token: CancellationToken,
}

impl HttpKeyProvider {
    pub fn new(client: Client, config: KeyConfig, token: CancellationToken) -> Self {
        Self {
            client,
            config,
            cache: Cache::builder()
                .max_capacity(KEY_CACHE_CAPACITY)
                .time_to_live(KEY_CACHE_TTL)
                .build(),
            token,
        }
    }

    async fn fetch_once(&self, uri: &str) -> Result<[u8; 16], LoadError> {
        let response = tokio::select! {
            _ = self.token.cancelled() => return Err(LoadError::Aborted),
            response = self.client.get(uri).timeout(self.config.load_timeout).send() => response,
        }
        .map_err(|e| LoadError::from_reqwest(uri, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::HttpStatus {
                status: status.as_u16(),
                url: uri.to_string(),
            });
        }
        let body = tokio::select! {
            _ = self.token.cancelled() => return Err(LoadError::Aborted),
            body = response.bytes() => body,
        }
        .map_err(|e| LoadError::from_reqwest(uri, &e))?;
        parse_key(uri, &body)
    }
}

impl fmt::Debug for HttpKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpKeyProvider")
            .field("cached", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyProvider for HttpKeyProvider {
    #[instrument(skip(self, info), fields(uri = %info.uri))]
    async fn load_key(&self, info: &EncryptionInfo) -> Result<[u8; 16], LoadError> {
        if let Some(key) = info.key {
            return Ok(key);
        }
        if let Some(key) = self.cache.get(&info.uri).await {
            debug!("Key served from cache");
            return Ok(key);
        }
        let policy = RetryPolicy::from(&self.config);
        let key = retry_with_backoff(&policy, &self.token, |_| async {
            match self.fetch_once(&info.uri).await {
                Err(LoadError::Aborted) => RetryAction::Fail(LoadError::Aborted),
                result => classify(result),
            }
        })
        .await?;
        self.cache.insert(info.uri.clone(), key).await;
        Ok(key)
    }
}

/// AES-128 keys are exactly 16 bytes.
pub fn parse_key(uri: &str, body: &Bytes) -> Result<[u8; 16], LoadError> {
    <[u8; 16]>::try_from(body.as_ref()).map_err(|_| {
        LoadError::invalid_content(
            uri,
            format!("key has {} bytes, expected 16", body.len()),
        )
    })
}

/// Parse a `0x`-prefixed hexadecimal IV attribute.
pub fn parse_iv(value: &str) -> Option<[u8; 16]> {
    let digits = value
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(digits, &mut iv).ok()?;
    Some(iv)
}
