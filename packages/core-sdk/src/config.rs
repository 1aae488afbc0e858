use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

pub const ENV_DB: &str = "LUCIDSELECT_DB";
pub const ENV_API_TIMEOUT_MS: &str = "LUCIDSELECT_API_TIMEOUT_MS";
pub const ENV_MAX_RETRIES: &str = "LUCIDSELECT_MAX_RETRIES";
pub const ENV_BASE_DELAY_MS: &str = "LUCIDSELECT_BASE_DELAY_MS";

/**
 * \brief 请求适配器参数：超时、最大尝试次数、退避基数。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/**
 * \brief 进程级配置。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /** \brief SQLite 设置库路径 */
    pub db_path: PathBuf,
    pub adapter: AdapterConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("lucidselect.db"),
            adapter: AdapterConfig::default(),
        }
    }
}

impl AppConfig {
    /**
     * \brief 从环境变量读取配置，未设置的项使用默认值。
     */
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 以任意键值来源构造配置，便于测试。
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AppConfig::default();
        let db_path = lookup(ENV_DB)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let timeout = parse_millis(&lookup, ENV_API_TIMEOUT_MS)?
            .unwrap_or(defaults.adapter.timeout);
        let base_delay = parse_millis(&lookup, ENV_BASE_DELAY_MS)?
            .unwrap_or(defaults.adapter.base_delay);
        let max_retries = match lookup(ENV_MAX_RETRIES) {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid {}: {}", ENV_MAX_RETRIES, raw))?,
            None => defaults.adapter.max_retries,
        };

        Ok(Self {
            db_path,
            adapter: AdapterConfig {
                timeout,
                max_retries,
                base_delay,
            },
        })
    }
}

fn parse_millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .with_context(|| format!("invalid {}: {}", key, raw))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let cfg = AppConfig::from_lookup(lookup_from(&[])).expect("config");
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.adapter.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides_are_parsed() {
        let cfg = AppConfig::from_lookup(lookup_from(&[
            (ENV_DB, "/tmp/ls.db"),
            (ENV_API_TIMEOUT_MS, "5000"),
            (ENV_MAX_RETRIES, "5"),
            (ENV_BASE_DELAY_MS, " 250 "),
        ]))
        .expect("config");
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/ls.db"));
        assert_eq!(cfg.adapter.timeout, Duration::from_secs(5));
        assert_eq!(cfg.adapter.max_retries, 5);
        assert_eq!(cfg.adapter.base_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = AppConfig::from_lookup(lookup_from(&[(ENV_MAX_RETRIES, "many")])).unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_RETRIES));
    }
}
