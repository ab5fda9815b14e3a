//! NPU inference service configuration

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::engine::resolver::{SERVER_MOUNT_POINTS, SERVER_SEARCH_PATTERNS};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub delegate: DelegateConfig,
    pub labels: LabelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    /// TensorFlow Lite C library, loaded by name or path
    pub runtime_library: PathBuf,
    pub num_threads: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DelegateConfig {
    /// Pinned delegate path; skips the search when set
    pub library: Option<PathBuf>,
    pub mount_points: Vec<PathBuf>,
    pub search_patterns: Vec<String>,
    /// Key/value options passed to the delegate plugin
    pub options: BTreeMap<String, String>,
}

/// Labels reported by the index endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LabelsConfig {
    pub service: String,
    pub hardware: String,
    pub model: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/app/models/mobilenet_v1_1.0_224_quant.tflite"),
            runtime_library: PathBuf::from("libtensorflowlite_c.so"),
            num_threads: None,
        }
    }
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            library: None,
            mount_points: SERVER_MOUNT_POINTS.iter().map(PathBuf::from).collect(),
            search_patterns: SERVER_SEARCH_PATTERNS.iter().map(|s| s.to_string()).collect(),
            options: BTreeMap::new(),
        }
    }
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            service: "NPU Inference Server".to_string(),
            hardware: "RK3588 NPU (Rockchip)".to_string(),
            model: "MobileNetV1 (quantized)".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Config file path, `NPU_CONFIG` or `config.toml`
    pub fn default_path() -> String {
        std::env::var("NPU_CONFIG").unwrap_or_else(|_| "config.toml".to_string())
    }

    /// Apply `MODEL_PATH`, `PORT`, `TFLITE_LIBRARY` and `TEFLON_LIBRARY`
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("MODEL_PATH") {
            self.model.path = PathBuf::from(path);
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(e) => warn!("Ignoring PORT={}: {}", port, e),
            }
        }
        if let Some(lib) = lookup("TFLITE_LIBRARY") {
            self.model.runtime_library = PathBuf::from(lib);
        }
        if let Some(lib) = lookup("TEFLON_LIBRARY") {
            self.delegate.library = Some(PathBuf::from(lib));
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(
            config.model.path,
            PathBuf::from("/app/models/mobilenet_v1_1.0_224_quant.tflite")
        );
        assert_eq!(config.delegate.mount_points[0], PathBuf::from("/mesa-libs/libteflon.so"));
        assert!(config.delegate.library.is_none());
        assert_eq!(config.labels.hardware, "RK3588 NPU (Rockchip)");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9090

            [delegate]
            library = "/opt/mesa/lib/libteflon.so"

            [delegate.options]
            verbose = "1"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.delegate.library, Some(PathBuf::from("/opt/mesa/lib/libteflon.so")));
        assert_eq!(config.delegate.options.get("verbose").map(String::as_str), Some("1"));
        assert_eq!(config.delegate.search_patterns.len(), 3);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MODEL_PATH", "/models/other.tflite"),
            ("PORT", "9000"),
            ("TEFLON_LIBRARY", "/tmp/libteflon.so"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.model.path, PathBuf::from("/models/other.tflite"));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.delegate.library, Some(PathBuf::from("/tmp/libteflon.so")));
        assert_eq!(config.model.runtime_library, PathBuf::from("libtensorflowlite_c.so"));
    }

    #[test]
    fn test_invalid_port_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|k| (k == "PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(Config::load("/nonexistent/config.toml").is_err());
    }
}
