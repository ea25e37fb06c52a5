//! Configuration file loading via the `config` crate.
//! Supports multiple formats: YAML, JSON, TOML, etc.
use std::path::Path;

use config::{File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::Config;

/// Load configuration from a file, picking the format by extension.
pub async fn load_config(config_path: &str) -> Result<Config> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<Config> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let settings = config::Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to read config from {}", config_path.display()))?;

    let gateway_config: Config = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(gateway_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn loads_yaml_config() {
        let yaml_content = r#"
server:
  listen: "127.0.0.1:8080"
  shutdown_timeout: "10s"
clusters:
  - name: backend
    type: http
    endpoints:
      - url: "http://127.0.0.1:9001"
routes:
  - name: api
    host: "api.example.com"
    paths:
      - path: /v1
        type: prefix
    upstream: backend
rate_limit:
  enabled: true
  rate: 3
  window: "60s"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(
            config.server.shutdown_timeout,
            std::time::Duration::from_secs(10)
        );
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].host, "api.example.com");
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.rate, 3);
    }

    #[tokio::test]
    async fn loads_routes_v2_dsl() {
        let yaml_content = r#"
server:
  listen: "127.0.0.1:8080"
clusters:
  - name: greeter
    type: grpc
    endpoints:
      - target: "127.0.0.1:50051"
    grpc:
      authority: "greeter.internal"
routes_v2:
  - name: hello
    match:
      methods: ["POST"]
      path: /api/hello
    filters:
      - type: header_set
        args:
          key: x-gateway
          value: nexus
    upstream:
      cluster: greeter
      timeout_ms: 3000
      grpc:
        service: helloworld.Greeter
        method: SayHello
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        let route = &config.routes_v2[0];
        assert_eq!(route.name, "hello");
        assert_eq!(route.matcher.path, "/api/hello");
        assert_eq!(route.filters[0].filter_type, "header_set");
        assert_eq!(route.upstream.timeout_ms, Some(3000));
        assert_eq!(route.upstream.grpc.as_ref().unwrap().method, "SayHello");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        assert!(load_config("/does/not/exist.yaml").await.is_err());
    }
}
