use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RedisConfig {
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: u16,
    pub redis_username: Option<String>,
    pub redis_password: Option<String>,
    pub pool_size: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PostgresConfig {
    pub database_host: String,
    pub database_port: u16,
    pub database_user: String,
    pub database_password: String,
    pub database_name: String,
    pub database_schema: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkersConfig {
    #[serde(default = "default_schedule_concurrency")]
    pub schedule_concurrency: usize,
    #[serde(default = "default_post_concurrency")]
    pub post_concurrency: usize,
    #[serde(default = "default_view_concurrency")]
    pub view_concurrency: usize,
    /// Global post-comment throughput cap, jobs per second.
    #[serde(default = "default_post_rate")]
    pub post_rate_per_sec: u32,
    /// Job lease; a worker that stops renewing for this long loses the job.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Bounded grace for in-flight handlers on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_schedule_concurrency() -> usize {
    5
}
fn default_post_concurrency() -> usize {
    100
}
fn default_view_concurrency() -> usize {
    5
}
fn default_post_rate() -> u32 {
    100
}
fn default_lease_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            schedule_concurrency: default_schedule_concurrency(),
            post_concurrency: default_post_concurrency(),
            view_concurrency: default_view_concurrency(),
            post_rate_per_sec: default_post_rate(),
            lease_secs: default_lease_secs(),
            max_attempts: default_max_attempts(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QuotaConfig {
    /// IANA timezone whose midnight drives the daily reset.
    #[serde(default = "default_reset_timezone")]
    pub reset_timezone: String,
}

fn default_reset_timezone() -> String {
    "UTC".to_string()
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            reset_timezone: default_reset_timezone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpstreamConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_oauth_token_url")]
    pub oauth_token_url: String,
    /// Neutral URL for proxy liveness probes.
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "https://www.googleapis.com/youtube/v3".to_string()
}
fn default_oauth_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}
fn default_probe_url() -> String {
    "https://www.gstatic.com/generate_204".to_string()
}
fn default_probe_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            oauth_token_url: default_oauth_token_url(),
            probe_url: default_probe_url(),
            probe_timeout_secs: default_probe_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
}

fn default_llm_max_tokens() -> u32 {
    50
}
fn default_llm_temperature() -> f32 {
    0.9
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ViewerConfig {
    pub service_url: String,
    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,
}

fn default_navigation_timeout_secs() -> u64 {
    90
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Namespace for queue topics, cache keys and locks.
    pub name: String,
    pub db: PostgresConfig,
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    pub llm: Option<LlmConfig>,
    pub viewer: Option<ViewerConfig>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, String> {
        let config_str = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let config: Config = toml::from_str(&config_str).map_err(|e| e.to_string())?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let raw = r#"
            name = "chorus"

            [db]
            database_host = "localhost"
            database_port = 5432
            database_user = "chorus"
            database_password = "secret"
            database_name = "chorus"
            database_schema = "base"
        "#;

        let config: Config = toml::from_str(raw).expect("config should parse");
        assert_eq!(config.workers.post_concurrency, 100);
        assert_eq!(config.workers.post_rate_per_sec, 100);
        assert_eq!(config.workers.lease_secs, 60);
        assert_eq!(config.quota.reset_timezone, "UTC");
        assert_eq!(config.upstream.probe_timeout_secs, 10);
        assert!(config.llm.is_none());
    }
}
