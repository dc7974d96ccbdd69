use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    // Directory for executions.json and commands.json; the cmdhub home when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    pub shell: String,
    pub poll_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DisplayConfig {
    pub recent_limit: usize,
    pub language: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            recent_limit: 20,
            language: "auto".to_string(),
        }
    }
}

impl Config {
    /// Loads `config.toml` from the cmdhub home, writing defaults on first run.
    pub fn new() -> Result<Self> {
        Self::load_from(&home_dir())
    }

    pub fn load_from(home: &Path) -> Result<Self> {
        let config_path = home.join("config.toml");

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("invalid config {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(config_dir) = config_path.parent() {
            fs::create_dir_all(config_dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(home_dir)
    }

    pub fn executions_path(&self) -> PathBuf {
        self.data_dir().join("executions.json")
    }

    pub fn commands_path(&self) -> PathBuf {
        self.data_dir().join("commands.json")
    }

    /// Where worker processes append their log output.
    pub fn worker_log_path(&self) -> PathBuf {
        self.data_dir().join("worker.log")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.execution.poll_interval_ms.max(10))
    }

    pub fn get_effective_language(&self) -> String {
        if self.display.language == "auto" {
            // Try to get system language
            std::env::var("LANG")
                .unwrap_or_else(|_| "en_US".to_string())
                .split('.')
                .next()
                .unwrap_or("en")
                .to_string()
        } else {
            self.display.language.clone()
        }
    }
}

/// `$CMDHUB_HOME`, else `~/.cmdhub`.
pub fn home_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("CMDHUB_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cmdhub")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_run_writes_defaults() -> Result<()> {
        let home = TempDir::new()?;
        let config = Config::load_from(home.path())?;

        assert!(home.path().join("config.toml").exists());
        assert_eq!(config.execution.shell, "sh");
        assert_eq!(config.execution.poll_interval_ms, 500);
        assert_eq!(config.display.recent_limit, 20);
        Ok(())
    }

    #[test]
    fn test_partial_file_keeps_defaults() -> Result<()> {
        let home = TempDir::new()?;
        let data = home.path().join("data");
        fs::write(
            home.path().join("config.toml"),
            format!(
                "[storage]\ndata_dir = {:?}\n\n[execution]\nshell = \"bash\"\n",
                data.to_string_lossy()
            ),
        )?;

        let config = Config::load_from(home.path())?;
        assert_eq!(config.execution.shell, "bash");
        assert_eq!(config.execution.poll_interval_ms, 500);
        assert_eq!(config.display.language, "auto");
        assert_eq!(config.executions_path(), data.join("executions.json"));
        assert_eq!(config.commands_path(), data.join("commands.json"));
        assert_eq!(config.worker_log_path(), data.join("worker.log"));
        Ok(())
    }

    #[test]
    fn test_poll_interval_has_floor() {
        let mut config = Config::default();
        config.execution.poll_interval_ms = 0;
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
    }
}
