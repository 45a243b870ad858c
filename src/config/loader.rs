use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ProxyConfig;

/// Load a proxy configuration from a file using the config crate.
/// Supports multiple formats: YAML, JSON, TOML.
pub async fn load_config(config_path: &str) -> Result<ProxyConfig> {
    let path = config_path.to_string();
    tokio::task::spawn_blocking(move || load_config_sync(&path))
        .await
        .wrap_err("Config loading task failed")?
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ProxyConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let proxy_config: ProxyConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    tracing::debug!(
        proxy = %proxy_config.display_name(),
        path = %config_path.display(),
        "loaded proxy configuration"
    );
    Ok(proxy_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;
    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
name: "api"
server: "public"
rate_limiter:
  kind: "governor"
  requests: 100
  period: "1s"
fallback:
  kind: "mock"
  mock_code: 503
  for_stages: ["rate_limiter"]
backend:
  kind: "http"
  servers:
    - "http://10.0.0.1:8080"
    - "http://10.0.0.2:8080"
  load_balance: "random"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.display_name(), "api");
        assert_eq!(config.server, "public");
        assert_eq!(config.backend.kind, "http");
        assert_eq!(
            config.backend.params.get("load_balance"),
            Some(&json!("random"))
        );
        assert_eq!(config.rate_limiter.as_ref().unwrap().kind, "governor");
        assert_eq!(config.fallback.as_ref().unwrap().kind, "mock");
        assert!(config.validator.is_none());
        assert!(config.compression.is_none());
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "server": "internal",
  "candidate_backend": {
    "kind": "http",
    "servers": ["http://canary:8080"],
    "filter": { "percentage": 10 }
  },
  "backend": {
    "kind": "http",
    "servers": ["http://stable:8080"]
  }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        // name falls back to the server name
        assert_eq!(config.display_name(), "internal");
        assert_eq!(config.candidate_backend.as_ref().unwrap().kind, "http");
        assert_eq!(config.stages().count(), 2);
    }

    #[test]
    fn test_missing_backend_is_an_error() {
        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "server: \"public\"\n").unwrap();

        let err = load_config_sync(temp_file.path().to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to deserialize config"));
    }
}
