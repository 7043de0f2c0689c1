use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub storage: StorageConfig,
    pub extractor: ExtractorConfig,
    pub provider: ProviderConfig,
    pub directory: DirectoryConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub local_path: String,
    pub scratch_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
    /// Items below this extractor confidence fail analysis.
    pub min_confidence: i32,
}

impl ExtractorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
    /// Total submit attempts per draft, first try included.
    pub max_attempts: u32,
    /// Concurrent in-flight calls to the provider.
    pub max_in_flight: usize,
    /// Provider-side throttling budget.
    pub requests_per_minute: u32,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl DirectoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Batch size cap; the whole batch is rejected above it.
    pub max_items: usize,
    /// Total source size cap in bytes.
    pub max_total_bytes: u64,
    /// TTL of the distributed batch record.
    pub record_ttl_secs: u64,
    /// Per-item analysis timeout.
    pub analysis_timeout_secs: u64,
    /// Bound on concurrent analysis of one batch's items.
    pub max_fan_out: usize,
    /// How long scratch artifacts survive after delivery.
    pub artifact_grace_secs: u64,
    /// Series used when a request does not name one.
    pub default_series: String,
}

impl PipelineConfig {
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    pub fn artifact_grace(&self) -> Duration {
        Duration::from_secs(self.artifact_grace_secs)
    }
}

impl BatchingConfig {
    pub fn load() -> Result<Self, AppError> {
        // Common layer handles .env and the APP__ prefix.
        let common = core_config::Config::load()?;

        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        Ok(BatchingConfig {
            common,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10")?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1")?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://localhost:6379"), is_prod)?,
            },
            storage: StorageConfig {
                local_path: get_env("STORAGE_LOCAL_PATH", Some("storage"), is_prod)?,
                scratch_path: get_env("STORAGE_SCRATCH_PATH", Some("scratch"), is_prod)?,
            },
            extractor: ExtractorConfig {
                endpoint: get_env("EXTRACTOR_ENDPOINT", None, is_prod)?,
                timeout_secs: parse_env("EXTRACTOR_TIMEOUT_SECS", "30")?,
                min_confidence: parse_env("EXTRACTOR_MIN_CONFIDENCE", "50")?,
            },
            provider: ProviderConfig {
                base_url: get_env("PROVIDER_BASE_URL", None, is_prod)?,
                api_key: get_env("PROVIDER_API_KEY", None, is_prod)?,
                timeout_secs: parse_env("PROVIDER_TIMEOUT_SECS", "30")?,
                max_attempts: parse_env("PROVIDER_MAX_ATTEMPTS", "3")?,
                max_in_flight: parse_env("PROVIDER_MAX_IN_FLIGHT", "4")?,
                requests_per_minute: parse_env("PROVIDER_REQUESTS_PER_MINUTE", "60")?,
            },
            directory: DirectoryConfig {
                base_url: get_env("DIRECTORY_BASE_URL", None, is_prod)?,
                timeout_secs: parse_env("DIRECTORY_TIMEOUT_SECS", "10")?,
            },
            pipeline: PipelineConfig {
                max_items: parse_env("PIPELINE_MAX_ITEMS", "10")?,
                max_total_bytes: parse_env("PIPELINE_MAX_TOTAL_BYTES", "104857600")?,
                record_ttl_secs: parse_env("PIPELINE_RECORD_TTL_SECS", "86400")?,
                analysis_timeout_secs: parse_env("PIPELINE_ANALYSIS_TIMEOUT_SECS", "30")?,
                max_fan_out: parse_env("PIPELINE_MAX_FAN_OUT", "10")?,
                artifact_grace_secs: parse_env("PIPELINE_ARTIFACT_GRACE_SECS", "300")?,
                default_series: get_env("PIPELINE_DEFAULT_SERIES", Some("A"), is_prod)?,
            },
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!(format!("Invalid value for {}: {}", key, e)))
    })
}
