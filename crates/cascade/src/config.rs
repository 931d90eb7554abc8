//! Session configuration.
//!
//! Media-timeline quantities (buffer lengths, positions) are plain seconds as
//! `f64`; wall-clock quantities (timeouts, retry delays) are [`Duration`]s and
//! deserialize from a number of seconds.

use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_USER_AGENT: &str = concat!("cascade/", env!("CARGO_PKG_VERSION"));

/// Which buffer is consulted to decide whether the playhead is covered when
/// the sink reports it is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureProbe {
    /// The combined media buffer, i.e. the intersection of every sink buffer.
    #[default]
    Media,
    /// Only the buffer of the stream type that hit the quota.
    OwnStream,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Seconds to buffer ahead of the playhead.
    pub max_buffer_length: f64,
    /// Upper bound for `max_buffer_length`, halved under sink backpressure.
    pub max_max_buffer_length: f64,
    /// Gaps smaller than this are treated as contiguous buffer.
    pub max_buffer_hole: f64,
    /// Seconds of played-out live content kept behind the playhead. `None` keeps everything.
    pub live_back_buffer_length: Option<f64>,
    pub append_error_max_retry: u32,
    /// Report an infinite duration for live streams.
    pub live_duration_infinity: bool,
    pub backpressure_probe: BackpressureProbe,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_length: 30.0,
            max_max_buffer_length: 600.0,
            max_buffer_hole: 0.5,
            live_back_buffer_length: None,
            append_error_max_retry: 3,
            live_duration_infinity: false,
            backpressure_probe: BackpressureProbe::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FragmentConfig {
    #[serde(with = "secs")]
    pub load_timeout: Duration,
    pub max_retry: u32,
    #[serde(with = "secs")]
    pub retry_delay: Duration,
    #[serde(with = "secs")]
    pub max_retry_timeout: Duration,
    /// Tolerance in seconds when matching a position against fragment bounds.
    pub max_frag_lookup_tolerance: f64,
    /// Fewest fragments a live playlist must list before loading starts.
    pub initial_live_manifest_size: usize,
    /// Distance from the live edge, in target durations, where live playback starts.
    pub live_sync_duration_count: u32,
    /// Initial load position in seconds; `None` starts at the beginning (VOD) or live sync point.
    pub start_position: Option<f64>,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(20),
            max_retry: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_timeout: Duration::from_secs(8),
            max_frag_lookup_tolerance: 0.25,
            initial_live_manifest_size: 1,
            live_sync_duration_count: 3,
            start_position: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    #[serde(with = "secs")]
    pub load_timeout: Duration,
    pub max_retry: u32,
    #[serde(with = "secs")]
    pub retry_delay: Duration,
    #[serde(with = "secs")]
    pub max_retry_timeout: Duration,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(10),
            max_retry: 1,
            retry_delay: Duration::from_secs(1),
            max_retry_timeout: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransmuxSettings {
    /// Decrypt AES-128 progressively in software instead of offloading whole fragments.
    pub enable_software_aes: bool,
    /// Feed fragments to the transmuxer while they download.
    pub progressive: bool,
    /// Bytes accumulated before a progress chunk is delivered.
    pub high_water_mark: usize,
}

impl Default for TransmuxSettings {
    fn default() -> Self {
        Self {
            enable_software_aes: true,
            progressive: true,
            high_water_mark: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "secs")]
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub user_agent: String,
    /// Timeout for manifest requests.
    #[serde(with = "secs")]
    pub timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub buffer: BufferConfig,
    pub fragment: FragmentConfig,
    pub key: KeyConfig,
    pub transmux: TransmuxSettings,
    pub scheduler: SchedulerConfig,
    pub network: NetworkConfig,
}

impl CascadeConfig {
    pub fn builder() -> CascadeConfigBuilder {
        CascadeConfigBuilder::new()
    }

    /// Effective buffer-ahead target in seconds.
    pub fn max_buffer_target(&self) -> f64 {
        self.buffer
            .max_buffer_length
            .min(self.buffer.max_max_buffer_length)
    }

    pub fn create_client(&self) -> reqwest::Result<reqwest::Client> {
        install_rustls_provider();
        reqwest::Client::builder()
            .user_agent(self.network.user_agent.clone())
            .build()
    }
}

/// Install the process-wide rustls crypto provider the HTTP client needs.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

pub struct CascadeConfigBuilder {
    config: CascadeConfig,
}

impl CascadeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CascadeConfig::default(),
        }
    }

    pub fn max_buffer_length(mut self, seconds: f64) -> Self {
        self.config.buffer.max_buffer_length = seconds;
        self
    }

    pub fn max_max_buffer_length(mut self, seconds: f64) -> Self {
        self.config.buffer.max_max_buffer_length = seconds;
        self
    }

    pub fn max_buffer_hole(mut self, seconds: f64) -> Self {
        self.config.buffer.max_buffer_hole = seconds;
        self
    }

    pub fn live_back_buffer_length(mut self, seconds: Option<f64>) -> Self {
        self.config.buffer.live_back_buffer_length = seconds;
        self
    }

    pub fn append_error_max_retry(mut self, retries: u32) -> Self {
        self.config.buffer.append_error_max_retry = retries;
        self
    }

    pub fn live_duration_infinity(mut self, enabled: bool) -> Self {
        self.config.buffer.live_duration_infinity = enabled;
        self
    }

    pub fn backpressure_probe(mut self, probe: BackpressureProbe) -> Self {
        self.config.buffer.backpressure_probe = probe;
        self
    }

    pub fn fragment_retry(mut self, max_retry: u32, delay: Duration, max_delay: Duration) -> Self {
        self.config.fragment.max_retry = max_retry;
        self.config.fragment.retry_delay = delay;
        self.config.fragment.max_retry_timeout = max_delay;
        self
    }

    pub fn fragment_load_timeout(mut self, timeout: Duration) -> Self {
        self.config.fragment.load_timeout = timeout;
        self
    }

    pub fn key_retry(mut self, max_retry: u32, delay: Duration, max_delay: Duration) -> Self {
        self.config.key.max_retry = max_retry;
        self.config.key.retry_delay = delay;
        self.config.key.max_retry_timeout = max_delay;
        self
    }

    pub fn start_position(mut self, seconds: Option<f64>) -> Self {
        self.config.fragment.start_position = seconds;
        self
    }

    pub fn live_sync_duration_count(mut self, count: u32) -> Self {
        self.config.fragment.live_sync_duration_count = count;
        self
    }

    pub fn enable_software_aes(mut self, enabled: bool) -> Self {
        self.config.transmux.enable_software_aes = enabled;
        self
    }

    pub fn progressive(mut self, enabled: bool) -> Self {
        self.config.transmux.progressive = enabled;
        self
    }

    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.config.transmux.high_water_mark = bytes;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler.tick_interval = interval;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.network.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> CascadeConfig {
        self.config
    }
}

impl Default for CascadeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `Duration` as a floating-point number of seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, de::Error};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CascadeConfig::default();
        assert_eq!(config.buffer.max_buffer_length, 30.0);
        assert_eq!(config.buffer.append_error_max_retry, 3);
        assert_eq!(config.fragment.retry_delay, Duration::from_secs(1));
        assert_eq!(config.key.max_retry, 1);
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(100));
        assert_eq!(config.buffer.backpressure_probe, BackpressureProbe::Media);
        assert_eq!(config.max_buffer_target(), 30.0);
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: CascadeConfig = serde_json::from_str(
            r#"{
                "buffer": { "max_buffer_length": 12.5, "backpressure_probe": "own_stream" },
                "fragment": { "retry_delay": 0.5 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.buffer.max_buffer_length, 12.5);
        assert_eq!(config.buffer.max_buffer_hole, 0.5);
        assert_eq!(config.buffer.backpressure_probe, BackpressureProbe::OwnStream);
        assert_eq!(config.fragment.retry_delay, Duration::from_millis(500));
        assert_eq!(config.fragment.max_retry, 3);
        assert!(config.transmux.progressive);
    }

    #[test]
    fn test_builder() {
        let config = CascadeConfig::builder()
            .max_buffer_length(10.0)
            .max_max_buffer_length(5.0)
            .fragment_retry(5, Duration::from_millis(250), Duration::from_secs(2))
            .live_back_buffer_length(Some(90.0))
            .build();
        assert_eq!(config.max_buffer_target(), 5.0);
        assert_eq!(config.fragment.max_retry, 5);
        assert_eq!(config.buffer.live_back_buffer_length, Some(90.0));
    }
}
