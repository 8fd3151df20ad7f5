use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable that overrides `extraction.api_key`.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub extraction: ExtractionConfig,
    pub capture: CaptureConfig,
    pub speech: SpeechConfig,
    pub till: TillConfig,
    pub ipc: IpcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout_seconds: u64,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub start_retry_delay_ms: u64,
    /// BCP 47 tag such as `en-IN` or `hi-IN`, substituted for `{language}` in `speech.args`.
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// External text-to-speech program; `None` only logs what would be said.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub greeting: String,
    pub follow_up: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TillConfig {
    pub catalog_path: Option<PathBuf>,
    pub default_unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub socket_path: PathBuf,
    pub timeout_seconds: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemini-2.0-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout_seconds: 15,
            role: "RETAILER".to_string(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            start_retry_delay_ms: 300,
            language: "en-IN".to_string(),
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            greeting: "Namaste! What have you sold? Please tell me.".to_string(),
            follow_up: "Ready to checkout or add more?".to_string(),
        }
    }
}

impl Default for TillConfig {
    fn default() -> Self {
        Self {
            catalog_path: None,
            default_unit: crate::types::DEFAULT_UNIT.to_string(),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/kirana-voice.sock"),
            timeout_seconds: 30,
        }
    }
}

impl ExtractionConfig {
    /// The environment wins over the file so keys need not be written to disk.
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| self.api_key.clone())
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kirana").join("config.yaml"))
    }

    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::default_path().context("could not determine config directory")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(config.extraction.role, "RETAILER");
        assert_eq!(config.capture.start_retry_delay_ms, 300);
        assert_eq!(config.till.default_unit, "pcs");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "extraction:\n  model: gemini-pro\ncapture:\n  start_retry_delay_ms: 50\n")
            .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.extraction.model, "gemini-pro");
        assert_eq!(config.extraction.timeout_seconds, 15);
        assert_eq!(config.capture.start_retry_delay_ms, 50);
        assert_eq!(config.ipc.socket_path, PathBuf::from("/tmp/kirana-voice.sock"));
    }

    #[test]
    fn malformed_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "extraction: [not, a, map").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.yaml"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut config = Config::default();
        config.speech.command = Some("espeak-ng".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.speech.command.as_deref(), Some("espeak-ng"));
    }
}
