use std::path::PathBuf;
use tracing::Level;

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";
pub const DEFAULT_MEMORY_PATH: &str = "./data/oracle_memory.json";

/// A custom error type for configuration loading failures.
///
/// Every variable has a default or is optional, so only malformed values fail.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub relay_url: Option<String>,
    pub realtime_url: String,
    pub realtime_model: String,
    pub voice: String,
    pub memory_path: PathBuf,
    pub instructions_path: Option<PathBuf>,
    pub log_level: Level,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// A missing API key is not an error here: it only matters once a direct
    /// connection is attempted, and a relay does not need one.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let openai_api_key = non_empty_var("OPENAI_API_KEY");
        let relay_url = non_empty_var("REALTIME_RELAY_URL");

        let realtime_url = non_empty_var("REALTIME_URL").unwrap_or_else(|| DEFAULT_REALTIME_URL.to_string());
        if !realtime_url.starts_with("ws://") && !realtime_url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(
                "REALTIME_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", realtime_url),
            ));
        }

        let realtime_model =
            non_empty_var("REALTIME_MODEL").unwrap_or_else(|| DEFAULT_REALTIME_MODEL.to_string());
        let voice = non_empty_var("ORACLE_VOICE").unwrap_or_else(|| "ash".to_string());

        let memory_path = non_empty_var("ORACLE_MEMORY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MEMORY_PATH));
        let instructions_path = non_empty_var("ORACLE_INSTRUCTIONS_PATH").map(PathBuf::from);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            openai_api_key,
            relay_url,
            realtime_url,
            realtime_model,
            voice,
            memory_path,
            instructions_path,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("OPENAI_API_KEY");
            env::remove_var("REALTIME_RELAY_URL");
            env::remove_var("REALTIME_URL");
            env::remove_var("REALTIME_MODEL");
            env::remove_var("ORACLE_VOICE");
            env::remove_var("ORACLE_MEMORY_PATH");
            env::remove_var("ORACLE_INSTRUCTIONS_PATH");
            env::remove_var("RUST_LOG");
        }
    }

    #[test]
    fn test_config_error_display() {
        let invalid_value = ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_defaults() {
        clear_env_vars();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.openai_api_key, None);
        assert_eq!(config.relay_url, None);
        assert_eq!(config.realtime_url, DEFAULT_REALTIME_URL);
        assert_eq!(config.realtime_model, DEFAULT_REALTIME_MODEL);
        assert_eq!(config.voice, "ash");
        assert_eq!(config.memory_path, PathBuf::from(DEFAULT_MEMORY_PATH));
        assert_eq!(config.instructions_path, None);
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("OPENAI_API_KEY", "test-openai-key");
            env::set_var("REALTIME_RELAY_URL", "ws://localhost:8081");
            env::set_var("REALTIME_URL", "wss://example.test/realtime");
            env::set_var("REALTIME_MODEL", "gpt-4o-mini-realtime-preview");
            env::set_var("ORACLE_VOICE", "verse");
            env::set_var("ORACLE_MEMORY_PATH", "/tmp/memory.json");
            env::set_var("ORACLE_INSTRUCTIONS_PATH", "/etc/oracle/instructions.md");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.openai_api_key, Some("test-openai-key".to_string()));
        assert_eq!(config.relay_url, Some("ws://localhost:8081".to_string()));
        assert_eq!(config.realtime_url, "wss://example.test/realtime");
        assert_eq!(config.realtime_model, "gpt-4o-mini-realtime-preview");
        assert_eq!(config.voice, "verse");
        assert_eq!(config.memory_path, PathBuf::from("/tmp/memory.json"));
        assert_eq!(
            config.instructions_path,
            Some(PathBuf::from("/etc/oracle/instructions.md"))
        );
        assert_eq!(config.log_level, Level::DEBUG);
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_blank_values_fall_back_to_defaults() {
        clear_env_vars();
        unsafe {
            env::set_var("OPENAI_API_KEY", "  ");
            env::set_var("ORACLE_VOICE", "");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.openai_api_key, None);
        assert_eq!(config.voice, "ash");
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_invalid_realtime_url() {
        clear_env_vars();
        unsafe {
            env::set_var("REALTIME_URL", "https://api.openai.com/v1/realtime");
        }

        let err = Config::from_env().unwrap_err();
        let ConfigError::InvalidValue(var, _) = err;
        assert_eq!(var, "REALTIME_URL");
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        let ConfigError::InvalidValue(var, _) = err;
        assert_eq!(var, "RUST_LOG");
        clear_env_vars();
    }
}
