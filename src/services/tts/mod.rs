use crate::core::config::Config;
use crate::core::error::{RunError, SynthesisError};
use crate::utils::audio::{self, AudioBuffer, PcmFormat};
use async_trait::async_trait;
use log::info;

pub mod elevenlabs;
pub mod gemini;

/// Audio as returned by a provider, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAudio {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per sample.
    pub sample_width: u16,
}

impl RawAudio {
    pub fn pcm16(data: Vec<u8>, sample_rate: u32) -> Self {
        Self {
            data,
            sample_rate,
            channels: 1,
            sample_width: 2,
        }
    }

    pub fn normalize(&self) -> Result<AudioBuffer, SynthesisError> {
        let format = PcmFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_width: self.sample_width,
        };
        audio::normalize(&self.data, format)
            .map_err(|e| SynthesisError::MalformedResponse(format!("{:#}", e)))
    }
}

/// One line of a multi-speaker request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerTurn {
    pub speaker: String,
    pub voice: String,
    pub text: String,
}

/// Renders turns as the `Speaker: text` transcript sent to multi-speaker endpoints.
pub fn transcript(turns: &[SpeakerTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("{}: {}", t.speaker, t.text))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize_one(
        &self,
        text: &str,
        voice: &str,
        style: Option<&str>,
    ) -> Result<RawAudio, SynthesisError>;

    async fn synthesize_many(
        &self,
        turns: &[SpeakerTurn],
        style: Option<&str>,
    ) -> Result<RawAudio, SynthesisError>;

    fn max_speakers_per_call(&self) -> usize;

    /// Maximum UTF-8 byte length of one request's text.
    fn max_text_length(&self) -> usize;
}

fn api_key(configured: Option<&str>, env_var: &str) -> Result<String, RunError> {
    configured
        .filter(|k| !k.trim().is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.trim().is_empty()))
        .ok_or_else(|| {
            RunError::Input(format!(
                "no API key configured; set it in the config file or via {}",
                env_var
            ))
        })
}

pub fn create_tts_provider(config: &Config) -> Result<Box<dyn TtsProvider>, RunError> {
    match config.tts.provider.as_str() {
        "gemini" => {
            let cfg = config.tts.gemini.clone().unwrap_or_default();
            let key = api_key(cfg.api_key.as_deref(), gemini::API_KEY_ENV)?;
            info!("Using Gemini TTS ({})", cfg.model);
            Ok(Box::new(gemini::GeminiTtsProvider::new(key, &cfg)?))
        }
        "elevenlabs" => {
            let cfg = config.tts.elevenlabs.clone().unwrap_or_default();
            let key = api_key(cfg.api_key.as_deref(), elevenlabs::API_KEY_ENV)?;
            info!("Using ElevenLabs TTS ({})", cfg.model_id);
            Ok(Box::new(elevenlabs::ElevenLabsProvider::new(key, &cfg)?))
        }
        other => Err(RunError::Input(format!("Unknown TTS provider: {}", other))),
    }
}
