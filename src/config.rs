//! Configuration for the mock data server.
//!
//! Defines where mock definitions live, where the server listens, and how
//! much of each request is logged.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Main configuration for the mock data server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    /// Address the HTTP listener binds to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Root directory of the mock definition files
    #[serde(default = "default_mock_dir")]
    pub mock_dir: PathBuf,

    /// Extension of the template looked up for a matched path
    #[serde(default = "default_template_extension")]
    pub template_extension: String,

    /// Largest request body accepted, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mock_dir: default_mock_dir(),
            template_extension: default_template_extension(),
            max_body_bytes: default_max_body_bytes(),
            settings: GlobalSettings::default(),
        }
    }
}

impl MockServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.template_extension.is_empty() {
            anyhow::bail!("template_extension cannot be empty");
        }
        if self.template_extension.contains('.') || self.template_extension.contains('/') {
            anyhow::bail!(
                "template_extension must be a bare extension like \"yml\", got {:?}",
                self.template_extension
            );
        }
        if self.max_body_bytes == 0 {
            anyhow::bail!("max_body_bytes must be greater than zero");
        }
        Ok(())
    }

    /// Render the configuration as YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8888))
}

fn default_mock_dir() -> PathBuf {
    PathBuf::from("./mock_data")
}

fn default_template_extension() -> String {
    "yml".to_string()
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log path, headers and body of every request
    #[serde(default = "default_true")]
    pub log_requests: bool,

    /// Log the expanded template and the extracted response
    #[serde(default = "default_true")]
    pub log_rendered: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_requests: true,
            log_rendered: true,
        }
    }
}
