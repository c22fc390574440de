use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::RunFolderRef;
use crate::error::MetadataError;

pub const APP_CONFIG_FILE: &str = "app.yaml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_datadir")]
    pub datadir: String,
    pub snpseq_data_url: String,
    #[serde(default = "default_executable")]
    pub snpseq_metadata_executable: String,
    #[serde(default = "default_lims_timeout")]
    pub lims_timeout_secs: u64,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub workdir_root: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl AppConfig {
    pub fn lims_timeout(&self) -> Duration {
        Duration::from_secs(self.lims_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn datadir_template(&self) -> DataDirTemplate {
        DataDirTemplate::new(&self.datadir)
    }

    /// Route prefix with surrounding slashes normalized; empty means no prefix.
    pub fn route_prefix(&self) -> String {
        let trimmed = self.base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return String::new();
        }
        if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        }
    }
}

/// Run-folder path template with `{host}` and `{runfolder}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDirTemplate(String);

impl DataDirTemplate {
    pub fn new(template: &str) -> Self {
        Self(template.to_string())
    }

    /// Placeholders are expanded in one pass; substituted values are never
    /// scanned again.
    pub fn resolve(&self, target: &RunFolderRef) -> Utf8PathBuf {
        let mut rendered = String::with_capacity(self.0.len());
        let mut rest = self.0.as_str();
        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let tail = &rest[open..];
            if let Some(after) = tail.strip_prefix("{host}") {
                rendered.push_str(target.host());
                rest = after;
            } else if let Some(after) = tail.strip_prefix("{runfolder}") {
                rendered.push_str(target.runfolder());
                rest = after;
            } else {
                rendered.push('{');
                rest = &tail[1..];
            }
        }
        rendered.push_str(rest);
        Utf8PathBuf::from(rendered)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(config_root: &Path) -> Result<AppConfig, MetadataError> {
        if !config_root.is_dir() {
            return Err(MetadataError::ConfigRead(config_root.to_path_buf()));
        }
        let config_path = config_root.join(APP_CONFIG_FILE);
        let content = fs::read_to_string(&config_path)
            .map_err(|_| MetadataError::ConfigRead(config_path.clone()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<AppConfig, MetadataError> {
        let config: AppConfig = serde_yaml::from_str(content)
            .map_err(|err| MetadataError::ConfigParse(err.to_string()))?;
        if config.snpseq_data_url.trim().is_empty() {
            return Err(MetadataError::ConfigParse(
                "snpseq_data_url must not be empty".to_string(),
            ));
        }
        Ok(config)
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8345
}

fn default_datadir() -> String {
    ".".to_string()
}

fn default_executable() -> String {
    "snpseq_metadata".to_string()
}

fn default_lims_timeout() -> u64 {
    60
}

fn default_tool_timeout() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}
