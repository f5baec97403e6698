use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

use crate::supervisor::{DEFAULT_POLLS_PER_CALLBACK, DEFAULT_POLL_INTERVAL, ExecutionSupervisor};

const VALKEY_URL_ENV_VAR: &str = "VALKEY_URL";
const DEFAULT_VALKEY_URL: &str = "redis://127.0.0.1:6379";
const PRESETS_DIR_ENV_VAR: &str = "PRESETS_DIR";
const DEFAULT_PRESETS_DIR: &str = "presets";
const WORK_ROOT_ENV_VAR: &str = "WORK_ROOT";
const DEFAULT_WORK_ROOT: &str = "temp_tasks";
const POLL_INTERVAL_MS_ENV_VAR: &str = "POLL_INTERVAL_MS";
const POLLS_PER_CALLBACK_ENV_VAR: &str = "POLLS_PER_CALLBACK";
const FFMPEG_BIN_ENV_VAR: &str = "FFMPEG_BIN";
const FFPROBE_BIN_ENV_VAR: &str = "FFPROBE_BIN";
const CONVERT_BIN_ENV_VAR: &str = "CONVERT_BIN";

const MINIO_ENDPOINT_URL_ENV_VAR: &str = "MINIO_ENDPOINT_URL";
const MINIO_REGION_ENV_VAR: &str = "MINIO_AWS_REGION";
const MINIO_ACCESS_KEY_ENV_VAR: &str = "MINIO_ACCESS_KEY";
const MINIO_SECRET_KEY_ENV_VAR: &str = "MINIO_SECRET_KEY";
const DEFAULT_MINIO_ENDPOINT_URL: &str = "http://localhost:9000";
const DEFAULT_MINIO_REGION: &str = "us-east-1";

/// External programs the pipeline drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub convert: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            convert: "convert".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub valkey_url: String,
    pub presets_dir: PathBuf,
    pub work_root: PathBuf,
    pub poll_interval: Duration,
    pub polls_per_callback: u32,
    pub tools: ToolPaths,
    pub storage: StorageConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let defaults = ToolPaths::default();

        WorkerConfig {
            valkey_url: string(VALKEY_URL_ENV_VAR, DEFAULT_VALKEY_URL),
            presets_dir: PathBuf::from(string(PRESETS_DIR_ENV_VAR, DEFAULT_PRESETS_DIR)),
            work_root: PathBuf::from(string(WORK_ROOT_ENV_VAR, DEFAULT_WORK_ROOT)),
            poll_interval: parsed(&lookup, POLL_INTERVAL_MS_ENV_VAR)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            polls_per_callback: parsed(&lookup, POLLS_PER_CALLBACK_ENV_VAR)
                .filter(|n: &u32| *n > 0)
                .unwrap_or(DEFAULT_POLLS_PER_CALLBACK),
            tools: ToolPaths {
                ffmpeg: string(FFMPEG_BIN_ENV_VAR, &defaults.ffmpeg),
                ffprobe: string(FFPROBE_BIN_ENV_VAR, &defaults.ffprobe),
                convert: string(CONVERT_BIN_ENV_VAR, &defaults.convert),
            },
            storage: StorageConfig {
                endpoint_url: string(MINIO_ENDPOINT_URL_ENV_VAR, DEFAULT_MINIO_ENDPOINT_URL),
                region: string(MINIO_REGION_ENV_VAR, DEFAULT_MINIO_REGION),
                access_key: lookup(MINIO_ACCESS_KEY_ENV_VAR),
                secret_key: lookup(MINIO_SECRET_KEY_ENV_VAR),
            },
        }
    }

    pub fn supervisor(&self) -> ExecutionSupervisor {
        ExecutionSupervisor::new(self.poll_interval, self.polls_per_callback)
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value '{}' for {}, using default", raw, key);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> WorkerConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]);
        assert_eq!(cfg.valkey_url, DEFAULT_VALKEY_URL);
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.polls_per_callback, 10);
        assert_eq!(cfg.tools, ToolPaths::default());
        assert_eq!(cfg.storage.region, DEFAULT_MINIO_REGION);
        assert_eq!(cfg.storage.access_key, None);
    }

    #[test]
    fn overrides_and_invalid_numbers() {
        let cfg = config(&[
            ("POLL_INTERVAL_MS", "250"),
            ("POLLS_PER_CALLBACK", "zero"),
            ("FFMPEG_BIN", "/opt/ffmpeg/bin/ffmpeg"),
            ("MINIO_ACCESS_KEY", "minio"),
            ("MINIO_SECRET_KEY", "minio123"),
        ]);
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.polls_per_callback, 10);
        assert_eq!(cfg.tools.ffmpeg, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(cfg.storage.secret_key.as_deref(), Some("minio123"));
    }
}
