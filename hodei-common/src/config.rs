use crate::SafeDisplay;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix recognized by every Hodei service; nested keys
/// are separated by double underscores (`HODEI__WORKER__HEARTBEAT_INTERVAL`).
pub const ENV_PREFIX: &str = "HODEI__";

pub trait ConfigLoaderConfig: Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T: Default + Serialize + DeserializeOwned + Send + Sync + 'static> ConfigLoaderConfig for T {}

/// Layered configuration loading: defaults, overridden by a TOML file,
/// overridden by environment variables.
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        Self {
            config_file_name: config_file_name.to_path_buf(),
            phantom: PhantomData,
        }
    }

    fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the config, or dumps the defaults as TOML and returns `None`
    /// when `--dump-config-default` was passed on the command line. Load
    /// failures are reported on stderr and also yield `None`.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config-default") {
            match toml::to_string_pretty(&T::default()) {
                Ok(rendered) => println!("{rendered}"),
                Err(err) => eprintln!("Failed to render default config: {err}"),
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!(
                        "Failed to load config from {}: {err}",
                        self.config_file_name.display()
                    );
                    None
                }
            }
        }
    }
}

/// Backoff policy for transient failures against remote backends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "max attempts: {}", self.max_attempts);
        let _ = writeln!(&mut result, "min delay: {:?}", self.min_delay);
        let _ = writeln!(&mut result, "max delay: {:?}", self.max_delay);
        let _ = writeln!(&mut result, "multiplier: {}", self.multiplier);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use test_r::test;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        name: String,
        port: u16,
        retries: RetryConfig,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                name: "default-name".to_string(),
                port: 9000,
                retries: RetryConfig::default(),
            }
        }
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.toml");
        std::fs::write(&path, "port = 9999\n").unwrap();

        let config: TestConfig = ConfigLoader::new(&path).load().unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.name, "default-name");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config: TestConfig = ConfigLoader::new(Path::new("does-not-exist.toml"))
            .load()
            .unwrap();
        assert_eq!(config, TestConfig::default());
    }
}
