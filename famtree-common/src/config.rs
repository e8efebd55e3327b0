//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "famtree.db";

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "FAMTREE_ROOT_FOLDER";

/// TOML configuration file contents
///
/// Every field is optional so a partial file (or no file at all) is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding the tree database
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// HTTP listen address (e.g. "127.0.0.1:5740")
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Import pipeline tuning
    #[serde(default)]
    pub ingest: IngestTomlConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `[ingest]` section of the TOML file
///
/// Values here are the lowest-priority tier; database settings and
/// environment variables take precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestTomlConfig {
    pub match_threshold: Option<u8>,
    pub retention_hours: Option<u64>,
    pub max_upload_bytes: Option<u64>,
    pub commit_batch_size: Option<usize>,
    pub session_backend: Option<String>,
}

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&str>, toml_config: &TomlConfig) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(root) = &toml_config.root_folder {
        return root.clone();
    }

    // Priority 4: OS-dependent compiled default
    default_root_folder()
}

/// Path of the tree database inside a root folder
pub fn database_path(root_folder: &Path) -> PathBuf {
    root_folder.join(DATABASE_FILE_NAME)
}

/// Default configuration file path for the platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("famtree").join("config.toml"))
}

/// Load the TOML config file
///
/// A missing file yields the default configuration; a file that exists but
/// cannot be read or parsed is an error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/famtree (or /var/lib/famtree for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("famtree"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/famtree"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("famtree"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/famtree"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("famtree"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\famtree"))
    } else {
        PathBuf::from("./famtree_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_cli_argument_wins() {
        std::env::set_var(ROOT_FOLDER_ENV, "/from/env");
        let toml_config = TomlConfig {
            root_folder: Some(PathBuf::from("/from/toml")),
            ..Default::default()
        };

        let root = resolve_root_folder(Some("/from/cli"), &toml_config);
        assert_eq!(root, PathBuf::from("/from/cli"));

        std::env::remove_var(ROOT_FOLDER_ENV);
    }

    #[test]
    #[serial]
    fn test_env_beats_toml() {
        std::env::set_var(ROOT_FOLDER_ENV, "/from/env");
        let toml_config = TomlConfig {
            root_folder: Some(PathBuf::from("/from/toml")),
            ..Default::default()
        };

        let root = resolve_root_folder(None, &toml_config);
        assert_eq!(root, PathBuf::from("/from/env"));

        std::env::remove_var(ROOT_FOLDER_ENV);
    }

    #[test]
    #[serial]
    fn test_toml_then_default() {
        std::env::remove_var(ROOT_FOLDER_ENV);
        let toml_config = TomlConfig {
            root_folder: Some(PathBuf::from("/from/toml")),
            ..Default::default()
        };
        assert_eq!(
            resolve_root_folder(None, &toml_config),
            PathBuf::from("/from/toml")
        );

        let fallback = resolve_root_folder(None, &TomlConfig::default());
        assert!(fallback.ends_with("famtree") || fallback.ends_with("famtree_data"));
    }

    #[test]
    fn test_missing_config_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_toml_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(config.ingest.match_threshold.is_none());
    }

    #[test]
    fn test_partial_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "bind_address = \"0.0.0.0:6000\"\n[ingest]\nmatch_threshold = 70\n",
        )
        .unwrap();

        let config = load_toml_config(&path).unwrap();
        assert_eq!(config.bind_address.as_deref(), Some("0.0.0.0:6000"));
        assert_eq!(config.ingest.match_threshold, Some(70));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_malformed_config_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ingest\nmatch_threshold = ").unwrap();

        assert!(matches!(load_toml_config(&path), Err(Error::Config(_))));
    }
}
