pub mod settings;

pub use settings::{
    Backend, ClusterSettings, IngressSettings, RetrySettings, ServerSettings, Settings,
    TimeoutSettings, WorkloadSettings,
};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default settings file location: ~/.verso/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".verso")
        .join("config.yaml")
}

/// Errors for settings file I/O and parsing
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

/// Parse and validate settings from YAML
pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    let settings: Settings = if content.trim().is_empty() {
        Settings::default()
    } else {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?
    };
    settings.validate().map_err(ConfigError::Invalid)?;
    Ok(settings)
}

/// Serialize settings to YAML
pub fn serialize_settings(settings: &Settings) -> Result<String, ConfigError> {
    serde_yaml::to_string(settings).map_err(|e| ConfigError::ParseError(e.to_string()))
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load settings. An explicit path (`~` is expanded) must exist; the default
/// location is optional and falls back to built-in defaults.
pub fn load_settings(explicit: Option<&str>) -> Result<Settings, ConfigError> {
    match explicit {
        Some(path) => {
            let expanded = shellexpand::tilde(path);
            let path = Path::new(expanded.as_ref());
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            load_settings_from(path)
        }
        None => {
            let path = default_config_path();
            if !path.exists() {
                return Ok(Settings::default());
            }
            load_settings_from(&path)
        }
    }
}

/// Load settings from a specific file
pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8383);
        assert_eq!(settings.cluster.backend, Backend::Kube);
        assert_eq!(settings.timeouts.readiness(), Duration::from_secs(600));
        assert_eq!(settings.timeouts.sync(), Duration::from_secs(120));
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.workloads.log_path, "/var/log/app");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let content = r#"
cluster:
  backend: memory
  namespace: kre
timeouts:
  readiness_secs: 30
ingress:
  base_domain: example.com
  class_name: nginx
  annotations:
    nginx.ingress.kubernetes.io/backend-protocol: GRPC
"#;
        let settings = parse_settings(content).unwrap();
        assert_eq!(settings.cluster.backend, Backend::Memory);
        assert_eq!(settings.cluster.namespace, "kre");
        assert_eq!(settings.cluster.field_manager, "verso");
        assert_eq!(settings.timeouts.readiness_secs, 30);
        assert_eq!(settings.timeouts.sync_secs, 120);
        assert_eq!(settings.ingress.class_name.as_deref(), Some("nginx"));
        assert_eq!(settings.ingress.annotations.len(), 1);
        assert_eq!(settings.server.port, 8383);
    }

    #[test]
    fn test_empty_file_is_defaults() {
        assert_eq!(parse_settings("").unwrap(), Settings::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = parse_settings("retry:\n  max_attempts: 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_yaml() {
        let result = parse_settings("server: [unclosed");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_roundtrip_through_yaml() {
        let mut settings = Settings::default();
        settings.ingress.tls_secret = Some("wildcard-tls".to_string());
        let yaml = serialize_settings(&settings).unwrap();
        assert_eq!(parse_settings(&yaml).unwrap(), settings);
    }

    #[test]
    fn test_load_settings_from_file() {
        let file = create_temp_file("server:\n  port: 9999\n");
        let path = file.path().to_string_lossy().to_string();
        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.server.port, 9999);
    }

    #[test]
    fn test_load_explicit_missing_file() {
        let result = load_settings(Some("/nonexistent/verso.yaml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
