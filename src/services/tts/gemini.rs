use super::{transcript, RawAudio, SpeakerTurn, TtsProvider};
use crate::core::error::{RunError, SynthesisError};
use async_trait::async_trait;
use base64::Engine;
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const API_KEY_ENV: &str = "GOOGLE_API_KEY";

const MAX_SPEAKERS_PER_CALL: usize = 2;
const MAX_TEXT_LENGTH: usize = 4000;
const DEFAULT_SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_model() -> String {
    "gemini-2.5-flash-preview-tts".to_string()
}
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}

pub struct GeminiTtsProvider {
    api_key: String,
    endpoint: Url,
    client: reqwest::Client,
}

impl GeminiTtsProvider {
    pub fn new(api_key: String, config: &GeminiConfig) -> Result<Self, RunError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RunError::Io(e.into()))?;
        Ok(Self {
            api_key,
            endpoint: endpoint(&config.base_url, &config.model)?,
            client,
        })
    }

    async fn generate(&self, request: &GeminiRequest) -> Result<RawAudio, SynthesisError> {
        debug!("POST {}", self.endpoint);
        let resp = self
            .client
            .post(self.endpoint.clone())
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(SynthesisError::from_status(status.as_u16(), body));
        }

        extract_audio(&body)
    }
}

fn endpoint(base_url: &str, model: &str) -> Result<Url, RunError> {
    let method = format!("{}:generateContent", model);
    let mut url = Url::parse(base_url)
        .map_err(|e| RunError::Input(format!("invalid Gemini base_url {:?}: {}", base_url, e)))?;
    url.path_segments_mut()
        .map_err(|_| RunError::Input(format!("Gemini base_url cannot be a base: {}", base_url)))?
        .pop_if_empty()
        .extend(["v1beta", "models", method.as_str()]);
    Ok(url)
}

// --- Wire types ---

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Debug)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Debug)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    voice_config: Option<VoiceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    multi_speaker_voice_config: Option<MultiSpeakerVoiceConfig>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct MultiSpeakerVoiceConfig {
    speaker_voice_configs: Vec<SpeakerVoiceConfig>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SpeakerVoiceConfig {
    speaker: String,
    voice_config: VoiceConfig,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPartResponse {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

fn voice_config(voice: &str) -> VoiceConfig {
    VoiceConfig {
        prebuilt_voice_config: PrebuiltVoiceConfig {
            voice_name: voice.to_string(),
        },
    }
}

fn with_style(prompt: String, style: Option<&str>) -> String {
    match style {
        Some(s) if !s.trim().is_empty() => format!("{}\n\n{}", s.trim(), prompt),
        _ => prompt,
    }
}

fn request(prompt: String, speech_config: SpeechConfig) -> GeminiRequest {
    GeminiRequest {
        contents: vec![GeminiContent {
            parts: vec![GeminiPart { text: prompt }],
        }],
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config,
        },
    }
}

fn single_speaker_request(text: &str, voice: &str, style: Option<&str>) -> GeminiRequest {
    request(
        with_style(format!("TTS this: {}", text), style),
        SpeechConfig {
            voice_config: Some(voice_config(voice)),
            multi_speaker_voice_config: None,
        },
    )
}

fn multi_speaker_request(turns: &[SpeakerTurn], style: Option<&str>) -> GeminiRequest {
    // One entry per distinct speaker, in order of first appearance
    let mut configs: Vec<SpeakerVoiceConfig> = Vec::new();
    for turn in turns {
        if !configs.iter().any(|c| c.speaker == turn.speaker) {
            configs.push(SpeakerVoiceConfig {
                speaker: turn.speaker.clone(),
                voice_config: voice_config(&turn.voice),
            });
        }
    }

    request(
        with_style(
            format!("TTS the following conversation:\n{}", transcript(turns)),
            style,
        ),
        SpeechConfig {
            voice_config: None,
            multi_speaker_voice_config: Some(MultiSpeakerVoiceConfig {
                speaker_voice_configs: configs,
            }),
        },
    )
}

/// Parses `rate=NNNN` out of a mime type such as `audio/L16;codec=pcm;rate=24000`.
fn sample_rate_from_mime(mime: &str) -> u32 {
    mime.split(';')
        .filter_map(|p| p.trim().strip_prefix("rate="))
        .find_map(|r| r.parse().ok())
        .unwrap_or(DEFAULT_SAMPLE_RATE)
}

fn extract_audio(body: &str) -> Result<RawAudio, SynthesisError> {
    let result: GeminiResponse = serde_json::from_str(body).map_err(|e| {
        SynthesisError::MalformedResponse(format!("Failed to parse Gemini response: {}", e))
    })?;

    if let Some(err) = result.error {
        return Err(SynthesisError::MalformedResponse(format!(
            "Gemini API returned error: {}",
            err.message
        )));
    }

    let first = result
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| SynthesisError::MalformedResponse("no candidates in response".into()))?;

    let reason = first.finish_reason.unwrap_or_else(|| "UNKNOWN".to_string());
    let parts = first.content.map(|c| c.parts).unwrap_or_default();

    let mut data = Vec::new();
    let mut sample_rate = DEFAULT_SAMPLE_RATE;
    for inline in parts.into_iter().filter_map(|p| p.inline_data) {
        sample_rate = sample_rate_from_mime(&inline.mime_type);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(inline.data.trim())
            .map_err(|e| SynthesisError::MalformedResponse(format!("invalid base64 audio: {}", e)))?;
        data.extend_from_slice(&bytes);
    }

    if data.is_empty() {
        return Err(SynthesisError::MalformedResponse(format!(
            "Gemini response has no audio. Finish reason: {}",
            reason
        )));
    }

    Ok(RawAudio::pcm16(data, sample_rate))
}

#[async_trait]
impl TtsProvider for GeminiTtsProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn synthesize_one(
        &self,
        text: &str,
        voice: &str,
        style: Option<&str>,
    ) -> Result<RawAudio, SynthesisError> {
        self.generate(&single_speaker_request(text, voice, style)).await
    }

    async fn synthesize_many(
        &self,
        turns: &[SpeakerTurn],
        style: Option<&str>,
    ) -> Result<RawAudio, SynthesisError> {
        self.generate(&multi_speaker_request(turns, style)).await
    }

    fn max_speakers_per_call(&self) -> usize {
        MAX_SPEAKERS_PER_CALL
    }

    fn max_text_length(&self) -> usize {
        MAX_TEXT_LENGTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn turn(speaker: &str, voice: &str, text: &str) -> SpeakerTurn {
        SpeakerTurn {
            speaker: speaker.to_string(),
            voice: voice.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_endpoint() {
        let url = endpoint("https://generativelanguage.googleapis.com", "gemini-2.5-flash-preview-tts")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-preview-tts:generateContent"
        );

        let url = endpoint("http://localhost:8080/proxy/", "m").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/proxy/v1beta/models/m:generateContent");

        assert!(endpoint("not a url", "m").is_err());
    }

    #[test]
    fn test_single_speaker_request_json() {
        let req = single_speaker_request("Hello", "Kore", Some("Read calmly"));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({
                "contents": [{"parts": [{"text": "Read calmly\n\nTTS this: Hello"}]}],
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                    "speechConfig": {
                        "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": "Kore"}}
                    }
                }
            })
        );
    }

    #[test]
    fn test_multi_speaker_request_json() {
        let turns = vec![
            turn("Alice", "Kore", "Hi"),
            turn("Bob", "Puck", "Hey"),
            turn("Alice", "Kore", "Bye"),
        ];
        let value = serde_json::to_value(multi_speaker_request(&turns, None)).unwrap();

        assert_eq!(
            value["contents"][0]["parts"][0]["text"],
            "TTS the following conversation:\nAlice: Hi\nBob: Hey\nAlice: Bye"
        );
        let configs = &value["generationConfig"]["speechConfig"]["multiSpeakerVoiceConfig"]
            ["speakerVoiceConfigs"];
        assert_eq!(configs.as_array().map(Vec::len), Some(2));
        assert_eq!(configs[1]["speaker"], "Bob");
        assert_eq!(configs[1]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"], "Puck");
        assert!(value["generationConfig"]["speechConfig"].get("voiceConfig").is_none());
    }

    #[test]
    fn test_extract_audio() {
        let pcm: Vec<u8> = vec![1, 0, 2, 0];
        let body = json!({
            "candidates": [{
                "content": {"parts": [{"inlineData": {
                    "mimeType": "audio/L16;codec=pcm;rate=16000",
                    "data": base64::engine::general_purpose::STANDARD.encode(&pcm)
                }}]},
                "finishReason": "STOP"
            }]
        })
        .to_string();

        let audio = extract_audio(&body).unwrap();
        assert_eq!(audio.data, pcm);
        assert_eq!(audio.sample_rate, 16_000);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.sample_width, 2);
    }

    #[test]
    fn test_extract_audio_failures_are_malformed() {
        for body in [
            "not json".to_string(),
            json!({"candidates": []}).to_string(),
            json!({"candidates": [{"finishReason": "SAFETY"}]}).to_string(),
            json!({"error": {"message": "quota"}}).to_string(),
            json!({"candidates": [{"content": {"parts": [{"inlineData": {"data": "!!!"}}]}}]})
                .to_string(),
        ] {
            assert!(
                matches!(extract_audio(&body), Err(SynthesisError::MalformedResponse(_))),
                "body {} should be malformed",
                body
            );
        }
    }

    #[test]
    fn test_sample_rate_from_mime() {
        assert_eq!(sample_rate_from_mime("audio/L16;codec=pcm;rate=24000"), 24_000);
        assert_eq!(sample_rate_from_mime("audio/L16; rate=44100"), 44_100);
        assert_eq!(sample_rate_from_mime("audio/pcm"), DEFAULT_SAMPLE_RATE);
    }
}
