//! Configuration management for the transaction manager harness
//!
//! Loads the connection settings from a TOML file with environment variable
//! substitution, then overlays the mandatory environment variables.

pub mod gas;

pub use gas::GasEstimatorConfig;

use crate::error::{TxmError, TxmResult};

use anyhow::{Context, Result};
use ethers::types::Address;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Config file used when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "env.toml";

/// Environment variable that points at an alternative config file
pub const CONFIG_PATH_ENV: &str = "TXM_CONFIG";

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Connection settings: where to send transactions and who signs them
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub rpc: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub from_address: String,
}

impl AppConfig {
    /// Load settings from `$TXM_CONFIG`, or `env.toml` when unset
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        Self::load_from(config_path)
    }

    /// Load settings from a TOML file and the environment.
    ///
    /// A missing file is not an error, but `RPC`, `PRIVATE_KEY` and
    /// `FROM_ADDRESS` must always be present in the environment and take
    /// precedence over whatever the file holds.
    pub fn load_from(config_path: impl AsRef<Path>) -> Result<Self> {
        let mut config_path = config_path.as_ref().to_path_buf();
        if config_path.as_os_str().is_empty() {
            config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        }

        let mut config = match std::fs::read_to_string(&config_path) {
            Ok(contents) => {
                let contents = substitute_env_vars(&contents);
                toml::from_str::<AppConfig>(&contents)
                    .with_context(|| "failed to parse TOML config")?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("Config file {:?} not found, using environment only", config_path);
                AppConfig::default()
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read config file: {:?}", config_path))
            }
        };

        config.rpc = required_env("RPC")?;
        config.private_key = required_env("PRIVATE_KEY")?;
        config.from_address = required_env("FROM_ADDRESS")?;

        Ok(config)
    }

    /// Parse the configured sender address
    pub fn from_address(&self) -> TxmResult<Address> {
        self.from_address
            .parse::<Address>()
            .map_err(|e| TxmError::Config(format!("Invalid from address {}: {}", self.from_address, e)))
    }
}

fn required_env(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => anyhow::bail!("{} is required (set the {} environment variable)", name, name),
    }
}

/// Substitute environment variables in the format ${VAR_NAME}.
///
/// Values are escaped for a TOML basic string, so quotes and backslashes
/// in the environment cannot break the surrounding file.
pub fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            escape_toml_basic(&env::var(&caps[1]).unwrap_or_default())
        })
        .into_owned()
}

fn escape_toml_basic(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Mutex, MutexGuard};

    /// Serialises every test that touches process environment variables
    pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_required(rpc: &str, key: &str, from: &str) {
        env::set_var("RPC", rpc);
        env::set_var("PRIVATE_KEY", key);
        env::set_var("FROM_ADDRESS", from);
    }

    fn clear_required() {
        env::remove_var("RPC");
        env::remove_var("PRIVATE_KEY");
        env::remove_var("FROM_ADDRESS");
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("env.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_env_only_when_file_absent() {
        let _guard = lock_env();
        set_required("http://x", "abc", "0x0");
        let dir = tempfile::tempdir().unwrap();

        let config = AppConfig::load_from(dir.path().join("missing.toml")).unwrap();
        assert_eq!(
            config,
            AppConfig {
                rpc: "http://x".to_string(),
                private_key: "abc".to_string(),
                from_address: "0x0".to_string(),
            }
        );
        clear_required();
    }

    #[test]
    fn test_env_overrides_file_values() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "rpc = \"http://file\"\nprivate_key = \"filekey\"\nfrom_address = \"0x1\"\n",
        );
        set_required("http://env", "envkey", "0x2");

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.rpc, "http://env");
        assert_eq!(config.private_key, "envkey");
        assert_eq!(config.from_address, "0x2");
        clear_required();
    }

    #[test]
    fn test_missing_env_var_fails_regardless_of_file() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "rpc = \"http://file\"\nprivate_key = \"filekey\"\nfrom_address = \"0x1\"\n",
        );

        for missing in ["RPC", "PRIVATE_KEY", "FROM_ADDRESS"] {
            set_required("http://env", "envkey", "0x2");
            env::remove_var(missing);

            let err = AppConfig::load_from(&path).unwrap_err();
            assert!(
                err.to_string().contains(&format!("{} is required", missing)),
                "unexpected error: {}",
                err
            );
        }
        clear_required();
    }

    #[test]
    fn test_empty_env_var_counts_as_missing() {
        let _guard = lock_env();
        set_required("", "abc", "0x0");
        let dir = tempfile::tempdir().unwrap();

        let err = AppConfig::load_from(dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("RPC is required"));
        clear_required();
    }

    #[test]
    fn test_malformed_toml_is_wrapped() {
        let _guard = lock_env();
        set_required("http://x", "abc", "0x0");
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "rpc = [unterminated");

        let err = AppConfig::load_from(&path).unwrap_err();
        assert_eq!(err.to_string(), "failed to parse TOML config");
        assert!(err.chain().count() > 1);
        clear_required();
    }

    #[test]
    fn test_unreadable_path_is_wrapped() {
        let _guard = lock_env();
        set_required("http://x", "abc", "0x0");
        let dir = tempfile::tempdir().unwrap();

        // A directory cannot be read as a file
        let err = AppConfig::load_from(dir.path()).unwrap_err();
        assert!(err.to_string().starts_with("failed to read config file"));
        clear_required();
    }

    #[test]
    fn test_load_uses_config_path_env() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "rpc = \"http://file\"\n");
        env::set_var(CONFIG_PATH_ENV, &path);
        set_required("http://x", "abc", "0x0");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.rpc, "http://x");

        env::remove_var(CONFIG_PATH_ENV);
        clear_required();
    }

    #[test]
    fn test_env_var_substitution() {
        let _guard = lock_env();
        env::set_var("TXM_TEST_VAR", "test_value");
        let input = "rpc = \"https://rpc.example.com/${TXM_TEST_VAR}/v1\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "rpc = \"https://rpc.example.com/test_value/v1\"");

        let unset = substitute_env_vars("key = \"${TXM_TEST_UNSET_VAR}\"");
        assert_eq!(unset, "key = \"\"");
        env::remove_var("TXM_TEST_VAR");
    }

    #[test]
    fn test_substituted_quotes_keep_file_valid() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "rpc = \"${RPC}\"\nprivate_key = \"${TXM_TEST_KEY_PATH}\"\n");
        set_required("http://x/\"quoted\"", "abc", "0x0");
        env::set_var("TXM_TEST_KEY_PATH", "C:\\keys\\dev");

        let contents = substitute_env_vars(&std::fs::read_to_string(&path).unwrap());
        let parsed: AppConfig = toml::from_str(&contents).unwrap();
        assert_eq!(parsed.rpc, "http://x/\"quoted\"");
        assert_eq!(parsed.private_key, "C:\\keys\\dev");

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.rpc, "http://x/\"quoted\"");

        env::remove_var("TXM_TEST_KEY_PATH");
        clear_required();
    }

    #[test]
    fn test_from_address_parsing() {
        let config = AppConfig {
            from_address: "0x45BB36B79E02e59d3C49b863B31F530C991dd554".to_string(),
            ..Default::default()
        };
        assert!(config.from_address().is_ok());

        let bad = AppConfig {
            from_address: "0x0".to_string(),
            ..Default::default()
        };
        assert!(matches!(bad.from_address(), Err(TxmError::Config(_))));
    }
}
