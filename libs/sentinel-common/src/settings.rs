use std::env;
use std::fmt::Debug;
use std::str::FromStr;

fn env_parse<T: FromStr>(key: &str, default: T) -> T
where
    T::Err: Debug,
{
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, raw, error = ?e, "ignoring unparsable environment variable");
                default
            }
        },
        Err(_) => default,
    }
}

/// Settings shared by the dispatcher and workers.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub redis_host: String,
    pub redis_port: u16,
    pub language_config_dir: String,
    /// Number of worker instances per language the dispatcher places
    /// across. 1 selects the canonical one-queue-per-language topology.
    pub executor_instances: u32,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 8910),
            redis_host: env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            redis_port: env_parse("REDIS_PORT", 6379),
            language_config_dir: env::var("LANGUAGE_CONFIG_DIR")
                .unwrap_or_else(|_| "config/languages".to_string()),
            executor_instances: env_parse("EXECUTOR_INSTANCES", 1).max(1),
        }
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }
}

/// Worker-only settings. `language` is required to start a worker; the
/// caller decides how loudly to refuse when it is missing.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub language: Option<String>,
    pub executor_id: Option<u32>,
    pub concurrency: usize,
}

impl WorkerSettings {
    pub fn from_env() -> Self {
        Self {
            language: env::var("LANGUAGE").ok().filter(|l| !l.is_empty()),
            executor_id: env::var("EXECUTOR_ID").ok().and_then(|v| v.parse().ok()),
            concurrency: env_parse("CONCURRENCY", 1).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_combines_host_and_port() {
        let settings = Settings {
            port: 8910,
            redis_host: "redis.internal".to_string(),
            redis_port: 6380,
            language_config_dir: "config/languages".to_string(),
            executor_instances: 1,
        };
        assert_eq!(settings.redis_url(), "redis://redis.internal:6380");
    }
}
