pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — allowing the gateway to start with zero configuration for
    /// local development (matching the default `test-key-*` limits).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded gateway configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("REDIS_HOST") {
            self.redis.host = v;
        }
        if let Ok(v) = std::env::var("REDIS_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.redis.port = n;
            }
        }
        if let Ok(v) = std::env::var("REDIS_DB") {
            if let Ok(n) = v.parse::<i64>() {
                self.redis.db = n;
            }
        }
        if let Ok(v) = std::env::var("REDIS_PASSWORD") {
            self.redis.password = Some(v);
        }
        if let Ok(v) = std::env::var("SERVER_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("SERVER_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.port = n;
            }
        }
        if let Ok(v) = std::env::var("WINDOW_SIZE_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.window.window_size_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("WINDOW_SEGMENTS") {
            if let Ok(n) = v.parse::<u64>() {
                self.window.window_segments = n;
            }
        }
        if let Ok(v) = std::env::var("MOCK_DELAY_MIN") {
            if let Ok(n) = v.parse::<f64>() {
                self.mock_delay.min_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("MOCK_DELAY_MAX") {
            if let Ok(n) = v.parse::<f64>() {
                self.mock_delay.max_seconds = n;
            }
        }

        // Ambient, not part of the documented knob set: admin bind
        // address (RUST_LOG is read directly by EnvFilter in bootstrap).
        if let Ok(v) = std::env::var("ADMIN_LISTEN") {
            self.admin.listen = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.redis.host.is_empty() {
            anyhow::bail!("redis host cannot be empty");
        }
        if self.window.window_segments == 0 {
            anyhow::bail!("window.window_segments must be > 0");
        }
        if self.window.window_size_seconds == 0 {
            anyhow::bail!("window.window_size_seconds must be > 0");
        }
        if self.window.window_size_seconds % self.window.window_segments != 0 {
            anyhow::bail!("window.window_size_seconds must be divisible by window_segments");
        }
        if self.mock_delay.min_seconds > self.mock_delay.max_seconds {
            anyhow::bail!("mock_delay.min_seconds must be <= max_seconds");
        }
        for (key, limits) in &self.registry.api_keys {
            if limits.rpm == 0 || limits.input_tpm == 0 || limits.output_tpm == 0 {
                anyhow::bail!("api key '{key}' has a zero limit, which would reject every request");
            }
        }
        Ok(())
    }
}
