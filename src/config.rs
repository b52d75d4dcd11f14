use crate::errors::{AppError, AppResult};
use crate::models::{PipelineSettings, ServerConfig, ServerKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogSettings {
    pub level: String,
    /// When set, logs go to a daily rolling JSON file in this directory
    /// instead of stdout.
    pub dir: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub log: LogSettings,
    pub status_interval_secs: u64,
    pub pipeline: PipelineSettings,
    pub servers: Vec<ServerConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("dashboard.sqlite"),
            log: LogSettings::default(),
            status_interval_secs: 5,
            pipeline: PipelineSettings::default(),
            servers: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read {}: {}", path.display(), err)))?;
        let mut config = Self::from_yaml(&raw)?;
        config.resolve_relative_paths(path.parent().unwrap_or_else(|| Path::new(".")));
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.pipeline.max_consecutive_errors == 0 {
            return Err(AppError::Config(
                "pipeline.maxConsecutiveErrors must be at least 1".to_string(),
            ));
        }
        if self.pipeline.max_cycles == Some(0) {
            return Err(AppError::Config("pipeline.maxCycles must be at least 1 when set".to_string()));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(AppError::Config("server name cannot be empty".to_string()));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(AppError::Config(format!("duplicate server name: {}", server.name)));
            }
            if server.kind == ServerKind::Sqlite && server.path.is_none() {
                return Err(AppError::Config(format!(
                    "server {} is of kind sqlite and requires a path",
                    server.name
                )));
            }
        }
        Ok(())
    }

    /// Relative paths in the file are taken relative to the file itself.
    fn resolve_relative_paths(&mut self, base: &Path) {
        if self.database_path.is_relative() {
            self.database_path = base.join(&self.database_path);
        }
        if let Some(dir) = self.log.dir.as_mut() {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        for server in &mut self.servers {
            if let Some(path) = server.path.as_mut() {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        }
    }
}
