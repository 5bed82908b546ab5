use crate::transform::PresetTable;
use anyhow::{Context, Result, anyhow, bail};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MAX_SOURCE_BYTES: usize = 25 * 1024 * 1024;
const DEFAULT_MAX_SOURCE_PIXELS: u64 = 100_000_000;
const GCS_INTEROP_ENDPOINT: &str = "https://storage.googleapis.com";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_parallel_transformations: usize,
    pub allow_custom_transformations: bool,
    pub presets: PresetTable,
    pub allowed_urls: Option<Vec<String>>,
    pub job_timeout: Duration,
    pub fetch_timeout: Duration,
    pub max_source_bytes: usize,
    pub max_source_pixels: u64,
    pub max_in_flight_requests: usize,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Filesystem { dir: PathBuf },
    Memory,
    S3(S3Config),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub force_path_style: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4444,
            max_parallel_transformations: 10,
            allow_custom_transformations: false,
            presets: PresetTable::default(),
            allowed_urls: None,
            job_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(20),
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            max_source_pixels: DEFAULT_MAX_SOURCE_PIXELS,
            max_in_flight_requests: 1024,
            storage: StorageConfig::Filesystem {
                dir: PathBuf::from("./data/cache"),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_u16("PORT", defaults.port),
            max_parallel_transformations: parse_usize(
                "MAX_PARALLEL_TRANSFORMATIONS",
                defaults.max_parallel_transformations,
            ),
            allow_custom_transformations: parse_flag("ALLOW_CUSTOM_TRANSFORMATIONS"),
            presets: PresetTable::from_vars(env::vars()),
            allowed_urls: parse_list_env("ALLOWED_URLS")?,
            job_timeout: Duration::from_secs(parse_u64(
                "JOB_TIMEOUT_SECONDS",
                defaults.job_timeout.as_secs(),
            )),
            fetch_timeout: Duration::from_secs(parse_u64(
                "FETCH_TIMEOUT_SECONDS",
                defaults.fetch_timeout.as_secs(),
            )),
            max_source_bytes: parse_usize("MAX_SOURCE_BYTES", defaults.max_source_bytes),
            max_source_pixels: parse_u64("MAX_SOURCE_PIXELS", defaults.max_source_pixels),
            max_in_flight_requests: parse_usize(
                "MAX_IN_FLIGHT_REQUESTS",
                defaults.max_in_flight_requests,
            ),
            storage: parse_storage()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_transformations == 0 {
            bail!("MAX_PARALLEL_TRANSFORMATIONS must be at least 1");
        }
        if self.job_timeout.is_zero() {
            bail!("JOB_TIMEOUT_SECONDS must be at least 1");
        }
        if self.fetch_timeout.is_zero() {
            bail!("FETCH_TIMEOUT_SECONDS must be at least 1");
        }
        if self.max_source_bytes == 0 || self.max_source_pixels == 0 {
            bail!("MAX_SOURCE_BYTES and MAX_SOURCE_PIXELS must be positive");
        }
        Ok(())
    }
}

fn parse_storage() -> Result<StorageConfig> {
    let backend = env::var("STORAGE_BACKEND")
        .or_else(|_| env::var("CLOUD_PROVIDER"))
        .unwrap_or_else(|_| "fs".to_string());
    match backend.trim().to_ascii_lowercase().as_str() {
        "fs" | "file" | "filesystem" => Ok(StorageConfig::Filesystem {
            dir: PathBuf::from(
                env::var("STORAGE_DIR").unwrap_or_else(|_| "./data/cache".to_string()),
            ),
        }),
        "memory" => Ok(StorageConfig::Memory),
        "s3" | "aws" => Ok(StorageConfig::S3(parse_s3(None)?)),
        "gcs" => Ok(StorageConfig::S3(parse_s3(Some(GCS_INTEROP_ENDPOINT))?)),
        other => Err(anyhow!("unknown STORAGE_BACKEND {other}")),
    }
}

fn parse_s3(default_endpoint: Option<&str>) -> Result<S3Config> {
    let bucket = required("BUCKET_NAME")?;
    let access_key = required("S3_KEY")?;
    let secret_key = required("S3_SECRET")?;
    let endpoint = non_empty("S3_ENDPOINT").or_else(|| default_endpoint.map(str::to_string));
    Ok(S3Config {
        bucket,
        region: non_empty("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
        endpoint,
        access_key,
        secret_key,
        force_path_style: parse_bool("S3_FORCE_PATH_STYLE", true),
    })
}

fn required(key: &str) -> Result<String> {
    non_empty(key).ok_or_else(|| anyhow!("{key} is required for s3 storage"))
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// `true` or `1`, any case; everything else is off.
fn parse_flag(key: &str) -> bool {
    env::var(key)
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1"))
        .unwrap_or(false)
}

/// Comma list or JSON array. A JSON list that does not parse is an error,
/// never an empty list.
fn parse_list_env(key: &str) -> Result<Option<Vec<String>>> {
    let Ok(raw) = env::var(key) else {
        return Ok(None);
    };
    if raw.trim_start().starts_with('[') {
        let list: Vec<String> = serde_json::from_str(&raw)
            .with_context(|| format!("{key} is not a JSON string array"))?;
        return Ok(Some(list));
    }
    let list = raw
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();
    Ok(if list.is_empty() { None } else { Some(list) })
}
