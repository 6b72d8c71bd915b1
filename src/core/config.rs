use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::services::tts::elevenlabs::ElevenLabsConfig;
use crate::services::tts::gemini::GeminiConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub tts: TtsConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// Manual speaker -> voice overrides.
    #[serde(default)]
    pub voices: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TtsConfig {
    #[serde(default = "default_tts_provider")]
    pub provider: String, // "gemini" or "elevenlabs"
    pub gemini: Option<GeminiConfig>,
    pub elevenlabs: Option<ElevenLabsConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    pub style: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Leaves headroom under the 4000 byte Gemini request limit.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_max_speakers")]
    pub max_speakers: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AssemblyConfig {
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u32,
    #[serde(default = "default_chapter_pause_ms")]
    pub chapter_pause_ms: u32,
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: u32,
    /// Checkpoint every N segments. A crash loses at most N - 1 segments of progress.
    #[serde(default = "default_state_save_interval")]
    pub state_save_interval: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            gemini: None,
            elevenlabs: None,
            retry: RetryConfig::default(),
            style: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            max_speakers: default_max_speakers(),
        }
    }
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            pause_ms: default_pause_ms(),
            chapter_pause_ms: default_chapter_pause_ms(),
            crossfade_ms: default_crossfade_ms(),
            state_save_interval: default_state_save_interval(),
        }
    }
}

fn default_tts_provider() -> String {
    "gemini".to_string()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_bytes() -> usize {
    3500
}
fn default_max_speakers() -> usize {
    2
}
fn default_pause_ms() -> u32 {
    300
}
fn default_chapter_pause_ms() -> u32 {
    2000
}
fn default_crossfade_ms() -> u32 {
    20
}
fn default_state_save_interval() -> usize {
    10
}

impl Config {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("{:?} not found, using default configuration", path);
            return Ok(Self::default());
        }

        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }
}
