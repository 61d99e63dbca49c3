use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level gateway configuration. Constructed once at startup
/// (`Config::load`) and held behind an `Arc` — never a global singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub window: WindowConfig,

    #[serde(default)]
    pub mock_delay: MockDelayConfig,

    #[serde(default)]
    pub registry: RegistryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            server: ServerConfig::default(),
            admin: AdminConfig::default(),
            window: WindowConfig::default(),
            mock_delay: MockDelayConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
        }
    }
}

impl RedisConfig {
    /// Build a `redis://[:password@]host:port/db` connection URL.
    pub fn connection_url(&self) -> String {
        match &self.password {
            Some(pw) if !pw.is_empty() => {
                format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db)
            }
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8000
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Admin listener: `/healthz` liveness + `/metrics` Prometheus exposition.
/// Split from the public admission listener so health/metrics scraping
/// never contends with request-handling connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
        }
    }
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

/// Sliding-window parameters (default: 60s window, 12 segments).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_size")]
    pub window_size_seconds: u64,
    #[serde(default = "default_window_segments")]
    pub window_segments: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size_seconds: default_window_size(),
            window_segments: default_window_segments(),
        }
    }
}

fn default_window_size() -> u64 {
    60
}

fn default_window_segments() -> u64 {
    12
}

impl WindowConfig {
    pub fn segment_size_seconds(&self) -> u64 {
        (self.window_size_seconds / self.window_segments).max(1)
    }

    pub fn key_ttl_seconds(&self) -> u64 {
        self.window_size_seconds * 2
    }
}

/// Stub downstream responder's injected latency range, in seconds
/// (default: uniform in `[0.1, 0.5]`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MockDelayConfig {
    #[serde(default = "default_mock_delay_min")]
    pub min_seconds: f64,
    #[serde(default = "default_mock_delay_max")]
    pub max_seconds: f64,
}

impl Default for MockDelayConfig {
    fn default() -> Self {
        Self {
            min_seconds: default_mock_delay_min(),
            max_seconds: default_mock_delay_max(),
        }
    }
}

fn default_mock_delay_min() -> f64 {
    0.1
}

fn default_mock_delay_max() -> f64 {
    0.5
}

/// Per-API-key limit triple.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub rpm: u64,
    pub input_tpm: u64,
    pub output_tpm: u64,
}

/// Startup-loaded immutable `api_key -> Limits` mapping plus a default,
/// used only when the caller explicitly asks the registry to fall back —
/// never for authentication: an unknown key is still a 401 before the
/// registry is consulted for defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_api_key_limits")]
    pub api_keys: HashMap<String, LimitsConfig>,

    #[serde(default = "default_limits")]
    pub default: LimitsConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            api_keys: default_api_key_limits(),
            default: default_limits(),
        }
    }
}

/// Built-in test key limits, used when no config file overrides them.
fn default_api_key_limits() -> HashMap<String, LimitsConfig> {
    let mut m = HashMap::new();
    m.insert(
        "test-key-1".to_string(),
        LimitsConfig {
            rpm: 10000,
            input_tpm: 1000,
            output_tpm: 1000,
        },
    );
    m.insert(
        "test-key-2".to_string(),
        LimitsConfig {
            rpm: 2000,
            input_tpm: 10000,
            output_tpm: 10000,
        },
    );
    m.insert(
        "test-key-3".to_string(),
        LimitsConfig {
            rpm: 5000,
            input_tpm: 10000,
            output_tpm: 10000,
        },
    );
    m
}

fn default_limits() -> LimitsConfig {
    LimitsConfig {
        rpm: 100,
        input_tpm: 100000,
        output_tpm: 100000,
    }
}
