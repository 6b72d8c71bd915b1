use super::{RawAudio, SpeakerTurn, TtsProvider};
use crate::core::error::{RunError, SynthesisError};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const API_KEY_ENV: &str = "ELEVENLABS_API_KEY";

const MAX_SPEAKERS_PER_CALL: usize = 1;
const MAX_TEXT_LENGTH: usize = 5000;
const OUTPUT_FORMAT: &str = "pcm_44100";
const OUTPUT_SAMPLE_RATE: u32 = 44_100;

/// Default ElevenLabs voices standing in for Gemini voice names.
const VOICE_MAP: &[(&str, &str)] = &[
    ("Kore", "21m00Tcm4TlvDq8ikWAM"),    // Rachel
    ("Charon", "29vD33N1CtxCmqQRPOHJ"),  // Drew
    ("Sulafat", "EXAVITQu4vr4xnSDxMaL"), // Bella
    ("Puck", "ErXwobaYiN019PkySvjV"),    // Antoni
    ("Aoede", "MF3mGyEYCl7XYWbV9V6O"),   // Elli
    ("Achird", "TxGEqnHWrfWFTfGW9XjX"),  // Josh
    ("Gacrux", "pNInz6obpgDQGcFmaJgB"),  // Adam
    ("Iapetus", "yoZ06aMxZJJ28mfd3POQ"), // Sam
];

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElevenLabsConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model_id: default_model_id(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_model_id() -> String {
    "eleven_multilingual_v2".to_string()
}
fn default_base_url() -> String {
    "https://api.elevenlabs.io".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}

/// Resolves a voice name to an ElevenLabs voice id. Unknown names are passed through as ids.
pub fn voice_id(voice: &str) -> &str {
    VOICE_MAP
        .iter()
        .find(|(name, _)| *name == voice)
        .map(|(_, id)| *id)
        .unwrap_or(voice)
}

#[derive(Serialize, Debug)]
struct SpeechRequest<'a> {
    text: String,
    model_id: &'a str,
}

pub struct ElevenLabsProvider {
    api_key: String,
    model_id: String,
    base_url: Url,
    client: reqwest::Client,
}

impl ElevenLabsProvider {
    pub fn new(api_key: String, config: &ElevenLabsConfig) -> Result<Self, RunError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            RunError::Input(format!("invalid ElevenLabs base_url {:?}: {}", config.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(RunError::Input(format!(
                "ElevenLabs base_url cannot be a base: {}",
                config.base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RunError::Io(e.into()))?;
        Ok(Self {
            api_key,
            model_id: config.model_id.clone(),
            base_url,
            client,
        })
    }

    fn speech_url(&self, voice: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v1", "text-to-speech", voice_id(voice)]);
        }
        url.query_pairs_mut().append_pair("output_format", OUTPUT_FORMAT);
        url
    }

    async fn speak(&self, text: &str, voice: &str) -> Result<Vec<u8>, SynthesisError> {
        let url = self.speech_url(voice);
        debug!("POST {} ({} bytes)", url, text.len());

        let resp = self
            .client
            .post(url)
            .header("xi-api-key", &self.api_key)
            .json(&SpeechRequest {
                text: text.to_string(),
                model_id: &self.model_id,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SynthesisError::from_status(status.as_u16(), body));
        }

        let mut data = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(item) = stream.next().await {
            data.extend_from_slice(&item?);
        }
        debug!("received {} bytes of PCM", data.len());
        Ok(data)
    }
}

fn styled(text: &str, style: Option<&str>) -> String {
    match style {
        Some(s) if !s.trim().is_empty() => format!("[{}] {}", s.trim(), text),
        _ => text.to_string(),
    }
}

#[async_trait]
impl TtsProvider for ElevenLabsProvider {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize_one(
        &self,
        text: &str,
        voice: &str,
        style: Option<&str>,
    ) -> Result<RawAudio, SynthesisError> {
        let data = self.speak(&styled(text, style), voice).await?;
        Ok(RawAudio::pcm16(data, OUTPUT_SAMPLE_RATE))
    }

    /// No native dialogue endpoint: each turn is spoken separately and the PCM concatenated.
    async fn synthesize_many(
        &self,
        turns: &[SpeakerTurn],
        style: Option<&str>,
    ) -> Result<RawAudio, SynthesisError> {
        let mut data = Vec::new();
        for turn in turns {
            data.extend(self.speak(&styled(&turn.text, style), &turn.voice).await?);
        }
        Ok(RawAudio::pcm16(data, OUTPUT_SAMPLE_RATE))
    }

    fn max_speakers_per_call(&self) -> usize {
        MAX_SPEAKERS_PER_CALL
    }

    fn max_text_length(&self) -> usize {
        MAX_TEXT_LENGTH
    }
}
