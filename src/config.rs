use crate::cli::{Cli, Command};
use crate::leaf_selector::SelectionPolicy;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Trait for abstracting environment variable access
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

/// System environment variable provider for production use
pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable error: {0}")]
    Environment(String),

    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

const ENV_PREFIX: &str = "MZID_MIRROR_";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub connection: RetryConfig,
    pub download: RetryConfig,
    pub crawl: CrawlConfig,
    pub mirror: MirrorConfig,
    pub report: ReportConfig,
    pub validation: ValidationSettings,
    pub extract: ExtractConfig,
    pub metadata: MetadataConfig,
    pub output: OutputConfig,
}

/// Remote archive endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    /// Directory beneath which the period buckets live
    pub root: String,
    pub user: String,
    pub password: String,
    /// Ceiling for any single control or data channel operation
    pub timeout_seconds: u64,
}

/// Retry policy knobs; `max_attempts = 0` retries forever
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Leaf selection during the crawl
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrawlConfig {
    /// Case-insensitive substring a file name must contain
    pub target_marker: String,
    /// Companion formats never fetched even when they match the marker
    pub excluded_suffixes: Vec<String>,
    pub selection: SelectionPolicy,
}

/// Local mirror layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MirrorConfig {
    pub root: PathBuf,
}

/// Analysis ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportConfig {
    pub ledger_file: String,
    pub subset_file: String,
    /// Content marker whose presence flags a document for the subset
    pub marker: String,
    pub chunk_size: usize,
}

/// Schema validation stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationSettings {
    pub schema_dir: PathBuf,
    /// Schema files are named `<schema_name><major.minor.patch>.xsd`
    pub schema_name: String,
    pub timeout_seconds: u64,
    pub halt_on_exhaustion: bool,
    /// Re-attempt rows previously marked timed out or out of memory
    pub retry_exhausted: bool,
}

/// Archive post-processing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractConfig {
    pub expected_suffix: String,
}

/// Collection metadata retrieval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetadataConfig {
    pub api_base: String,
    pub file_name: String,
    pub accession_prefix: String,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub request_interval_ms: u64,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "ftp.pride.ebi.ac.uk".to_string(),
            port: 21,
            root: "pride/data/archive".to_string(),
            user: "anonymous".to_string(),
            password: "anonymous@".to_string(),
            timeout_seconds: 60,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 1000,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            target_marker: "mzid".to_string(),
            excluded_suffixes: vec![".md5".to_string(), ".sha1".to_string(), ".sha256".to_string()],
            selection: SelectionPolicy::All,
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("mzid_store"),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            ledger_file: "report.csv".to_string(),
            subset_file: "all_crosslinking.csv".to_string(),
            marker: "MS:1002511".to_string(),
            chunk_size: 1024 * 1024,
        }
    }
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            schema_dir: PathBuf::from("schema"),
            schema_name: "mzIdentML".to_string(),
            timeout_seconds: 600,
            halt_on_exhaustion: true,
            retry_exhausted: false,
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            expected_suffix: ".mzid".to_string(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            api_base: "https://www.ebi.ac.uk/pride/ws/archive/v2/projects/".to_string(),
            file_name: "pride_metadata.json".to_string(),
            accession_prefix: "PXD".to_string(),
            timeout_seconds: 30,
            retry_attempts: 5,
            retry_delay_ms: 1000,
            request_interval_ms: 1000,
        }
    }
}

impl Config {
    pub fn ledger_path(&self) -> PathBuf {
        self.mirror.root.join(&self.report.ledger_file)
    }

    pub fn subset_path(&self) -> PathBuf {
        self.mirror.root.join(&self.report.subset_file)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation.timeout_seconds)
    }
}

/// Configuration manager for loading and merging configurations
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration with precedence: file -> environment -> CLI
    pub async fn load_config(cli: &Cli) -> Result<Config> {
        let mut config = match &cli.config {
            Some(config_path) => Self::load_from_file(config_path).await?,
            None => Self::find_config_file().await?.unwrap_or_default(),
        };

        config = Self::apply_environment_overrides(config)?;
        config = Self::merge_with_cli(config, cli);

        Self::validate_config(&config)?;

        Ok(config)
    }

    /// Load configuration from a file (TOML or JSON)
    pub async fn load_from_file(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path).await?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => {
                // Try to parse as TOML first, then JSON
                if let Ok(config) = toml::from_str::<Config>(&content) {
                    Ok(config)
                } else {
                    Ok(serde_json::from_str(&content)?)
                }
            }
        }
    }

    /// Find configuration file in standard locations
    pub async fn find_config_file() -> Result<Option<Config>> {
        let config_names = [
            "mzid-mirror.toml",
            "mzid-mirror.json",
            ".mzid-mirror.toml",
            ".mzid-mirror.json",
        ];

        for name in &config_names {
            let path = PathBuf::from(name);
            if path.exists() {
                return Ok(Some(Self::load_from_file(&path).await?));
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let app_config_dir = config_dir.join("mzid-mirror");
            for name in &config_names {
                let path = app_config_dir.join(name);
                if path.exists() {
                    return Ok(Some(Self::load_from_file(&path).await?));
                }
            }
        }

        Ok(None)
    }

    /// Apply environment variable overrides using the system environment
    pub fn apply_environment_overrides(config: Config) -> Result<Config> {
        Self::apply_environment_overrides_with(&SystemEnvProvider, config)
    }

    /// Apply environment variable overrides with a custom environment provider
    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        let var = |name: &str| env.get(&format!("{ENV_PREFIX}{name}"));

        // Remote settings
        if let Some(host) = var("HOST") {
            config.remote.host = host;
        }
        if let Some(port) = var("PORT") {
            config.remote.port = parse_env("PORT", &port)?;
        }
        if let Some(root) = var("REMOTE_ROOT") {
            config.remote.root = root;
        }

        // Retry settings
        if let Some(attempts) = var("CONNECT_ATTEMPTS") {
            config.connection.max_attempts = parse_env("CONNECT_ATTEMPTS", &attempts)?;
        }
        if let Some(attempts) = var("DOWNLOAD_ATTEMPTS") {
            config.download.max_attempts = parse_env("DOWNLOAD_ATTEMPTS", &attempts)?;
        }
        if let Some(delay) = var("BASE_DELAY_MS") {
            let delay: u64 = parse_env("BASE_DELAY_MS", &delay)?;
            config.connection.base_delay_ms = delay;
            config.download.base_delay_ms = delay;
        }
        if let Some(delay) = var("MAX_DELAY_MS") {
            let delay: u64 = parse_env("MAX_DELAY_MS", &delay)?;
            config.connection.max_delay_ms = delay;
            config.download.max_delay_ms = delay;
        }

        // Crawl settings
        if let Some(selection) = var("SELECTION") {
            config.crawl.selection = match selection.to_lowercase().as_str() {
                "first" => SelectionPolicy::First,
                "all" => SelectionPolicy::All,
                _ => {
                    return Err(ConfigError::Environment(format!(
                        "Invalid {ENV_PREFIX}SELECTION value: {selection}"
                    )));
                }
            };
        }

        // Mirror and report settings
        if let Some(root) = var("ROOT") {
            config.mirror.root = PathBuf::from(root);
        }
        if let Some(marker) = var("MARKER") {
            config.report.marker = marker;
        }

        // Validation settings
        if let Some(schema_dir) = var("SCHEMA_DIR") {
            config.validation.schema_dir = PathBuf::from(schema_dir);
        }
        if let Some(timeout) = var("VALIDATION_TIMEOUT") {
            config.validation.timeout_seconds = parse_env("VALIDATION_TIMEOUT", &timeout)?;
        }
        if let Some(halt) = var("HALT_ON_EXHAUSTION") {
            config.validation.halt_on_exhaustion = parse_env("HALT_ON_EXHAUSTION", &halt)?;
        }

        // Output settings
        if let Some(verbose) = var("VERBOSE") {
            config.output.verbose = parse_env("VERBOSE", &verbose)?;
        }
        if let Some(quiet) = var("QUIET") {
            config.output.quiet = parse_env("QUIET", &quiet)?;
        }

        Ok(config)
    }

    /// Merge CLI arguments with configuration (CLI takes precedence)
    pub fn merge_with_cli(mut config: Config, cli: &Cli) -> Config {
        if let Some(root) = &cli.mirror_root {
            config.mirror.root = root.clone();
        }
        if cli.verbose {
            config.output.verbose = true;
            config.output.quiet = false;
        }
        if cli.quiet {
            config.output.quiet = true;
            config.output.verbose = false;
        }

        match &cli.command {
            Command::Crawl(args) | Command::Run(args) => {
                if let Some(selection) = args.selection {
                    config.crawl.selection = selection;
                }
            }
            Command::Validate(args) => {
                if let Some(timeout) = args.timeout {
                    config.validation.timeout_seconds = timeout;
                }
                if let Some(schema_dir) = &args.schema_dir {
                    config.validation.schema_dir = schema_dir.clone();
                }
                if args.continue_on_exhaustion {
                    config.validation.halt_on_exhaustion = false;
                }
                if args.retry_exhausted {
                    config.validation.retry_exhausted = true;
                }
            }
            _ => {}
        }

        config
    }

    /// Validate configuration values
    pub fn validate_config(config: &Config) -> Result<()> {
        if config.remote.host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Remote host must not be empty".to_string(),
            ));
        }

        if config.remote.timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "Remote timeout must be greater than 0".to_string(),
            ));
        }

        for (name, retry) in [("connection", &config.connection), ("download", &config.download)] {
            if retry.base_delay_ms == 0 {
                return Err(ConfigError::Validation(format!(
                    "{name} base delay must be greater than 0"
                )));
            }
            if retry.max_delay_ms < retry.base_delay_ms {
                return Err(ConfigError::Validation(format!(
                    "{name} max delay cannot be below the base delay"
                )));
            }
        }

        if config.crawl.target_marker.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Crawl target marker must not be empty".to_string(),
            ));
        }

        if config.report.marker.is_empty() {
            return Err(ConfigError::Validation(
                "Report marker must not be empty".to_string(),
            ));
        }

        if config.report.chunk_size == 0 {
            return Err(ConfigError::Validation(
                "Report chunk size must be greater than 0".to_string(),
            ));
        }

        if config.report.ledger_file == config.report.subset_file {
            return Err(ConfigError::Validation(
                "Ledger and subset files must differ".to_string(),
            ));
        }

        if config.validation.timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "Validation timeout must be greater than 0".to_string(),
            ));
        }

        if config.validation.schema_name.is_empty() {
            return Err(ConfigError::Validation(
                "Schema name must not be empty".to_string(),
            ));
        }

        if config.output.verbose && config.output.quiet {
            return Err(ConfigError::Validation(
                "Cannot enable both verbose and quiet modes".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ConfigError::Environment(format!("Invalid {ENV_PREFIX}{name} value: {value}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    /// Mock environment variable provider for testing
    #[derive(Default)]
    struct MockEnvProvider {
        vars: HashMap<String, String>,
    }

    impl MockEnvProvider {
        fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
            self.vars.insert(key.into(), value.into());
        }
    }

    impl EnvProvider for MockEnvProvider {
        fn get(&self, key: &str) -> Option<String> {
            self.vars.get(key).cloned()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.remote.host, "ftp.pride.ebi.ac.uk");
        assert_eq!(config.remote.root, "pride/data/archive");
        assert_eq!(config.connection.max_attempts, 10);
        assert_eq!(config.connection.base_delay_ms, 1000);
        assert_eq!(config.connection.max_delay_ms, 300_000);
        assert_eq!(config.crawl.selection, SelectionPolicy::All);
        assert!(config.mirror.root.ends_with("mzid_store"));
        assert_eq!(config.report.marker, "MS:1002511");
        assert_eq!(config.validation.timeout_seconds, 600);
        assert!(config.validation.halt_on_exhaustion);
        assert!(ConfigManager::validate_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_load_partial_toml_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let toml_content = r#"
[remote]
host = "ftp.example.org"

[download]
max_attempts = 0
base_delay_ms = 50
max_delay_ms = 500

[crawl]
selection = "first"

[mirror]
root = "/data/mirror"

[validation]
timeout_seconds = 30
halt_on_exhaustion = false
"#;

        fs::write(&config_path, toml_content).unwrap();

        let config = ConfigManager::load_from_file(&config_path).await.unwrap();

        assert_eq!(config.remote.host, "ftp.example.org");
        assert_eq!(config.remote.port, 21);
        assert_eq!(config.download.max_attempts, 0);
        assert_eq!(config.download.base_delay_ms, 50);
        assert_eq!(config.connection.max_attempts, 10);
        assert_eq!(config.crawl.selection, SelectionPolicy::First);
        assert_eq!(config.mirror.root, PathBuf::from("/data/mirror"));
        assert_eq!(config.validation.timeout_seconds, 30);
        assert!(!config.validation.halt_on_exhaustion);
        assert_eq!(
            config.ledger_path(),
            PathBuf::from("/data/mirror/report.csv")
        );
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");

        let json_content = r#"{
  "report": { "marker": "MS:1002512", "chunk_size": 4096 },
  "extract": { "expected_suffix": ".mzML" }
}"#;

        fs::write(&config_path, json_content).unwrap();

        let config = ConfigManager::load_from_file(&config_path).await.unwrap();

        assert_eq!(config.report.marker, "MS:1002512");
        assert_eq!(config.report.chunk_size, 4096);
        assert_eq!(config.report.ledger_file, "report.csv");
        assert_eq!(config.extract.expected_suffix, ".mzML");
    }

    #[tokio::test]
    async fn test_unsupported_file_format() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        fs::write(&config_path, "invalid: yaml").unwrap();

        match ConfigManager::load_from_file(&config_path).await {
            Err(ConfigError::UnsupportedFormat(ext)) => assert_eq!(ext, "yaml"),
            other => panic!("Expected UnsupportedFormat error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid toml [[[").unwrap();

        let result = ConfigManager::load_from_file(&config_path).await;
        assert!(matches!(result.unwrap_err(), ConfigError::TomlParsing(_)));
    }

    #[test]
    fn test_environment_overrides() {
        let mut mock_env = MockEnvProvider::default();
        mock_env.set("MZID_MIRROR_HOST", "ftp.mirror.test");
        mock_env.set("MZID_MIRROR_PORT", "2121");
        mock_env.set("MZID_MIRROR_DOWNLOAD_ATTEMPTS", "0");
        mock_env.set("MZID_MIRROR_BASE_DELAY_MS", "10");
        mock_env.set("MZID_MIRROR_SELECTION", "first");
        mock_env.set("MZID_MIRROR_ROOT", "/env/mirror");
        mock_env.set("MZID_MIRROR_VALIDATION_TIMEOUT", "120");
        mock_env.set("MZID_MIRROR_HALT_ON_EXHAUSTION", "false");

        let config =
            ConfigManager::apply_environment_overrides_with(&mock_env, Config::default()).unwrap();

        assert_eq!(config.remote.host, "ftp.mirror.test");
        assert_eq!(config.remote.port, 2121);
        assert_eq!(config.download.max_attempts, 0);
        assert_eq!(config.connection.base_delay_ms, 10);
        assert_eq!(config.download.base_delay_ms, 10);
        assert_eq!(config.crawl.selection, SelectionPolicy::First);
        assert_eq!(config.mirror.root, PathBuf::from("/env/mirror"));
        assert_eq!(config.validation.timeout_seconds, 120);
        assert!(!config.validation.halt_on_exhaustion);
    }

    #[test]
    fn test_invalid_environment_values() {
        let mut mock_env = MockEnvProvider::default();
        mock_env.set("MZID_MIRROR_PORT", "not-a-port");

        let result = ConfigManager::apply_environment_overrides_with(&mock_env, Config::default());
        assert!(matches!(result.unwrap_err(), ConfigError::Environment(_)));

        let mut mock_env = MockEnvProvider::default();
        mock_env.set("MZID_MIRROR_SELECTION", "some");
        let result = ConfigManager::apply_environment_overrides_with(&mock_env, Config::default());
        assert!(matches!(result.unwrap_err(), ConfigError::Environment(_)));
    }

    #[test]
    fn test_merge_with_cli() {
        use clap::Parser;

        let cli = Cli::try_parse_from([
            "mzid-mirror",
            "--mirror-root",
            "/cli/mirror",
            "--verbose",
            "validate",
            "--timeout",
            "90",
            "--continue-on-exhaustion",
        ])
        .unwrap();

        let config = ConfigManager::merge_with_cli(Config::default(), &cli);

        assert_eq!(config.mirror.root, PathBuf::from("/cli/mirror"));
        assert!(config.output.verbose);
        assert_eq!(config.validation.timeout_seconds, 90);
        assert!(!config.validation.halt_on_exhaustion);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(ConfigManager::validate_config(&config).is_ok());

        config.connection.base_delay_ms = 0;
        assert!(ConfigManager::validate_config(&config).is_err());
        config.connection.base_delay_ms = 1000;

        config.download.max_delay_ms = 10;
        assert!(ConfigManager::validate_config(&config).is_err());
        config.download.max_delay_ms = 300_000;

        config.report.chunk_size = 0;
        assert!(ConfigManager::validate_config(&config).is_err());
        config.report.chunk_size = 1024;

        config.report.subset_file = config.report.ledger_file.clone();
        assert!(ConfigManager::validate_config(&config).is_err());
        config.report.subset_file = "all_crosslinking.csv".to_string();

        config.validation.timeout_seconds = 0;
        assert!(ConfigManager::validate_config(&config).is_err());
        config.validation.timeout_seconds = 600;

        config.output.verbose = true;
        config.output.quiet = true;
        assert!(ConfigManager::validate_config(&config).is_err());
    }

    #[test]
    fn test_retry_config_policy() {
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 2000,
        };
        let policy = retry.policy();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.base_delay(), Duration::from_millis(250));
        assert_eq!(policy.max_delay(), Duration::from_millis(2000));
    }
}
