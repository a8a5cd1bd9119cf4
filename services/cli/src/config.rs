use aidis_core::{remote::RetryPolicy, shell::SafetyPolicy};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Key/value access to the local configuration store.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads configuration from process environment variables.
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Defines the supported backend providers for the chat model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

impl Provider {
    /// Base URL of the provider's OpenAI-compatible API.
    pub fn api_base(&self) -> &'static str {
        match self {
            Provider::OpenAI => "https://api.openai.com/v1/",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub aidis_url: String,
    pub client_id: String,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
    pub history_capacity: usize,
    pub shell_timeout: Duration,
    pub denylist_path: Option<PathBuf>,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub system_prompt_path: Option<PathBuf>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_source(&EnvSource)
    }

    /// Loads configuration from any key/value source.
    pub fn from_source(source: &impl ConfigSource) -> Result<Self, ConfigError> {
        let aidis_url = source
            .get("AIDIS_URL")
            .unwrap_or_else(|| "http://localhost:8080".to_string());
        let client_id = source
            .get("AIDIS_CLIENT_ID")
            .unwrap_or_else(|| "aidis-cli".to_string());

        let max_retries = parse(source, "AIDIS_MAX_RETRIES", 3u32)?;
        let base_delay = Duration::from_millis(parse(source, "AIDIS_BASE_DELAY_MS", 1000u64)?);
        let max_delay = Duration::from_millis(parse(source, "AIDIS_MAX_DELAY_MS", 10_000u64)?);
        let request_timeout =
            Duration::from_secs(parse(source, "AIDIS_REQUEST_TIMEOUT_SECS", 30u64)?);
        let history_capacity = parse(source, "HISTORY_CAPACITY", 50usize)?;
        let shell_timeout = Duration::from_secs(parse(source, "SHELL_TIMEOUT_SECS", 30u64)?);
        let denylist_path = source.get("SHELL_DENYLIST_PATH").map(PathBuf::from);

        let provider_str = source
            .get("LLM_PROVIDER")
            .unwrap_or_else(|| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "gemini" => Provider::Gemini,
            _ => Provider::OpenAI,
        };

        let openai_api_key = source.get("OPENAI_API_KEY");
        let gemini_api_key = source.get("GEMINI_API_KEY");

        let chat_model = source
            .get("CHAT_MODEL")
            .unwrap_or_else(|| "gpt-4o".to_string());
        let system_prompt_path = source.get("SYSTEM_PROMPT_PATH").map(PathBuf::from);

        let log_level_str = source.get("RUST_LOG").unwrap_or_else(|| "WARN".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            aidis_url,
            client_id,
            max_retries,
            base_delay,
            max_delay,
            request_timeout,
            history_capacity,
            shell_timeout,
            denylist_path,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            system_prompt_path,
            log_level,
        })
    }

    /// The API key for the selected provider, if one was configured.
    pub fn api_key(&self) -> Option<&str> {
        match self.provider {
            Provider::OpenAI => self.openai_api_key.as_deref(),
            Provider::Gemini => self.gemini_api_key.as_deref(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
        }
    }

    /// The shell denylist: the configured file, or the built-in list.
    pub fn safety_policy(&self) -> Result<SafetyPolicy, ConfigError> {
        match &self.denylist_path {
            Some(path) => Ok(SafetyPolicy::from_lines(&read(path)?)),
            None => Ok(SafetyPolicy::default()),
        }
    }

    /// The configured system prompt, if a prompt file was given.
    pub fn system_prompt(&self) -> Result<Option<String>, ConfigError> {
        self.system_prompt_path.as_deref().map(read).transpose()
    }
}

fn parse<T>(source: &impl ConfigSource, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match source.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::io::Write;

    fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_config_error_display() {
        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_source(&source(&[])).expect("Config should load successfully");

        assert_eq!(config.aidis_url, "http://localhost:8080");
        assert_eq!(config.client_id, "aidis-cli");
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.history_capacity, 50);
        assert_eq!(config.shell_timeout, Duration::from_secs(30));
        assert_eq!(config.denylist_path, None);
        assert_eq!(config.provider, Provider::OpenAI);
        assert_eq!(config.api_key(), None);
        assert_eq!(config.chat_model, "gpt-4o");
        assert_eq!(config.log_level, Level::WARN);
        assert_eq!(config.safety_policy().unwrap(), SafetyPolicy::default());
        assert!(config.system_prompt().unwrap().is_none());
    }

    #[test]
    fn test_config_custom_values() {
        let config = Config::from_source(&source(&[
            ("AIDIS_URL", "http://aidis.internal:9000"),
            ("AIDIS_CLIENT_ID", "laptop"),
            ("AIDIS_MAX_RETRIES", "5"),
            ("AIDIS_BASE_DELAY_MS", "250"),
            ("AIDIS_MAX_DELAY_MS", "4000"),
            ("HISTORY_CAPACITY", "10"),
            ("SHELL_TIMEOUT_SECS", " 5 "),
            ("LLM_PROVIDER", "Gemini"),
            ("OPENAI_API_KEY", "openai-key"),
            ("GEMINI_API_KEY", "gemini-key"),
            ("CHAT_MODEL", "gemini-2.0-flash"),
            ("RUST_LOG", "debug"),
        ]))
        .expect("Config should load successfully");

        assert_eq!(config.aidis_url, "http://aidis.internal:9000");
        assert_eq!(config.client_id, "laptop");
        assert_eq!(
            config.retry_policy(),
            RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_millis(4000),
            }
        );
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.shell_timeout, Duration::from_secs(5));
        assert_eq!(config.provider, Provider::Gemini);
        assert_eq!(config.api_key(), Some("gemini-key"));
        assert_eq!(config.chat_model, "gemini-2.0-flash");
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    fn test_config_invalid_number() {
        let err = Config::from_source(&source(&[("AIDIS_MAX_RETRIES", "many")])).unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "AIDIS_MAX_RETRIES"),
            _ => panic!("Expected InvalidValue for AIDIS_MAX_RETRIES"),
        }
    }

    #[test]
    fn test_config_invalid_log_level() {
        let err = Config::from_source(&source(&[("RUST_LOG", "not-a-level")])).unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }

    #[test]
    fn test_denylist_and_prompt_files() {
        let mut denylist = tempfile::NamedTempFile::new().unwrap();
        writeln!(denylist, "# team policy\ngit push --force\nDROP TABLE").unwrap();
        let mut prompt = tempfile::NamedTempFile::new().unwrap();
        write!(prompt, "Be brief.").unwrap();

        let config = Config::from_source(&source(&[
            ("SHELL_DENYLIST_PATH", denylist.path().to_str().unwrap()),
            ("SYSTEM_PROMPT_PATH", prompt.path().to_str().unwrap()),
        ]))
        .unwrap();

        let policy = config.safety_policy().unwrap();
        assert_eq!(policy.patterns(), ["git push --force", "drop table"]);
        assert!(policy.violation("rm -rf /").is_none());
        assert_eq!(config.system_prompt().unwrap().as_deref(), Some("Be brief."));
    }

    #[test]
    fn test_missing_denylist_file_is_an_error() {
        let config = Config::from_source(&source(&[(
            "SHELL_DENYLIST_PATH",
            "/definitely/not/here/denylist.txt",
        )]))
        .unwrap();
        assert!(matches!(config.safety_policy(), Err(ConfigError::Read { .. })));
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        unsafe {
            env::remove_var("RUST_LOG");
            env::remove_var("LLM_PROVIDER");
            env::set_var("AIDIS_URL", "http://127.0.0.1:7777");
            env::set_var("OPENAI_API_KEY", "test-openai-key");
        }

        let config = Config::from_env().expect("Config should load successfully");
        assert_eq!(config.aidis_url, "http://127.0.0.1:7777");
        assert_eq!(config.api_key(), Some("test-openai-key"));

        unsafe {
            env::remove_var("AIDIS_URL");
            env::remove_var("OPENAI_API_KEY");
        }
    }
}
