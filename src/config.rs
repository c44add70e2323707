use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<GatewayConfig> = OnceLock::new();

/// WebSocket server binding and auth.
#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Shared secret compared against `api_key` query param / `X-API-Key`
    /// header. Empty rejects all clients.
    pub api_key: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

/// Admission + rate limiting.
#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,
    #[serde(default = "default_message_window_seconds")]
    pub ws_message_window_seconds: f64,
    #[serde(default = "default_max_messages_per_window")]
    pub ws_max_messages_per_window: u64,
    #[serde(default = "default_cancel_window_seconds")]
    pub ws_cancel_window_seconds: f64,
    #[serde(default = "default_max_cancels_per_window")]
    pub ws_max_cancels_per_window: u64,
    #[serde(default = "default_inbound_queue_max")]
    pub inbound_queue_max: usize,
    /// 0 disables the server-side utterance audio cap.
    #[serde(default)]
    pub max_utterance_audio_seconds: f64,
}

fn default_max_concurrent_connections() -> usize {
    100
}
fn default_message_window_seconds() -> f64 {
    60.0
}
fn default_max_messages_per_window() -> u64 {
    200
}
fn default_cancel_window_seconds() -> f64 {
    60.0
}
fn default_max_cancels_per_window() -> u64 {
    50
}
fn default_inbound_queue_max() -> usize {
    64
}

/// Idle/max-duration lifecycle watchdog.
#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    #[serde(default = "default_idle_timeout_s")]
    pub idle_timeout_s: f64,
    #[serde(default = "default_watchdog_tick_s")]
    pub watchdog_tick_s: f64,
    /// 0 disables the max-duration close.
    #[serde(default)]
    pub max_connection_duration_s: f64,
}

fn default_idle_timeout_s() -> f64 {
    150.0
}
fn default_watchdog_tick_s() -> f64 {
    5.0
}

/// Engine adapter / segment rolling.
#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    #[serde(default = "default_true")]
    pub stt_internal_roll: bool,
    #[serde(default = "default_segment_seconds")]
    pub stt_segment_seconds: f64,
    #[serde(default = "default_segment_overlap_seconds")]
    pub stt_segment_overlap_seconds: f64,
    #[serde(default = "default_max_backlog_seconds")]
    pub stt_max_backlog_seconds: f64,
    #[serde(default = "default_engine_max_context_tokens")]
    pub engine_max_context_tokens: u64,
    #[serde(default = "default_audio_token_headroom")]
    pub audio_token_headroom: u64,
}

fn default_true() -> bool {
    true
}
fn default_segment_seconds() -> f64 {
    60.0
}
fn default_segment_overlap_seconds() -> f64 {
    0.8
}
fn default_max_backlog_seconds() -> f64 {
    5.0
}
fn default_engine_max_context_tokens() -> u64 {
    4096
}
fn default_audio_token_headroom() -> u64 {
    64
}

/// Audio format + served model identity.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub served_model_name: String,
    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: u32,
}

fn default_sample_rate_hz() -> u32 {
    16_000
}

impl ModelConfig {
    pub fn bytes_per_second(&self) -> u64 {
        // PCM16 mono: 2 bytes/sample.
        self.sample_rate_hz as u64 * 2
    }
}

/// Root gateway configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub web: WebConfig,
    #[serde(default = "default_limits")]
    pub limits: LimitsConfig,
    #[serde(default = "default_lifecycle")]
    pub lifecycle: LifecycleConfig,
    #[serde(default = "default_streaming")]
    pub streaming: StreamingConfig,
    pub model: ModelConfig,
}

fn default_limits() -> LimitsConfig {
    LimitsConfig {
        max_concurrent_connections: default_max_concurrent_connections(),
        ws_message_window_seconds: default_message_window_seconds(),
        ws_max_messages_per_window: default_max_messages_per_window(),
        ws_cancel_window_seconds: default_cancel_window_seconds(),
        ws_max_cancels_per_window: default_max_cancels_per_window(),
        inbound_queue_max: default_inbound_queue_max(),
        max_utterance_audio_seconds: 0.0,
    }
}

fn default_lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        idle_timeout_s: default_idle_timeout_s(),
        watchdog_tick_s: default_watchdog_tick_s(),
        max_connection_duration_s: 0.0,
    }
}

fn default_streaming() -> StreamingConfig {
    StreamingConfig {
        stt_internal_roll: true,
        stt_segment_seconds: default_segment_seconds(),
        stt_segment_overlap_seconds: default_segment_overlap_seconds(),
        stt_max_backlog_seconds: default_max_backlog_seconds(),
        engine_max_context_tokens: default_engine_max_context_tokens(),
        audio_token_headroom: default_audio_token_headroom(),
    }
}

impl GatewayConfig {
    /// Load configuration from files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Initialize the global config singleton.
    pub fn init() -> Result<&'static Self, ConfigError> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }

    /// Get reference to the global config.
    pub fn get() -> &'static Self {
        CONFIG
            .get()
            .expect("config not initialized; call GatewayConfig::init() first")
    }
}
