//! narrate configuration management.

use crate::audio::DEFAULT_LEVEL_DB;
use crate::text::chunker::DEFAULT_MAX_CHUNK_WORDS;
use crate::tts::DEFAULT_VOICE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrateConfig {
    /// Default voice from the voice repository
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Device to use (cuda, cpu, ...). None means auto-detect.
    #[serde(default)]
    pub device: Option<String>,

    /// Maximum words per chunk
    #[serde(default = "default_max_chunk_words")]
    pub max_chunk_words: usize,

    /// Target loudness per chunk in dB
    #[serde(default = "default_level_db")]
    pub level_db: f32,

    /// Model repository override
    #[serde(default)]
    pub hf_repo: Option<String>,

    /// Voice repository override
    #[serde(default)]
    pub voice_repo: Option<String>,

    /// Quantization bits for the model weights
    #[serde(default)]
    pub quantize: Option<u32>,
}

fn default_voice() -> String {
    DEFAULT_VOICE.to_string()
}

fn default_max_chunk_words() -> usize {
    DEFAULT_MAX_CHUNK_WORDS
}

fn default_level_db() -> f32 {
    DEFAULT_LEVEL_DB
}

impl Default for NarrateConfig {
    fn default() -> Self {
        Self {
            voice: default_voice(),
            device: None,
            max_chunk_words: default_max_chunk_words(),
            level_db: default_level_db(),
            hf_repo: None,
            voice_repo: None,
            quantize: None,
        }
    }
}

impl NarrateConfig {
    /// Get the config file path: <config dir>/cli-programs/narrate.toml
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cli-programs")
            .join("narrate.toml")
    }

    /// Load config from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, returning the default if the file doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: NarrateConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }
}
