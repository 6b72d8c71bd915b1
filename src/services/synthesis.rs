use crate::core::config::{ChunkingConfig, RetryConfig};
use crate::core::error::{RunError, SynthesisError};
use crate::services::segmenter::Segment;
use crate::services::tts::{transcript, SpeakerTurn, TtsProvider};
use crate::services::voices::VoiceManager;
use crate::utils::audio::AudioBuffer;
use log::{debug, warn};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay after the `attempt`-th failure (1-based), with up to 10% jitter, never above `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let capped = self.base_delay.saturating_mul(factor).min(self.max_delay);

        let jitter_ms = capped.as_millis() as u64 / 10;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (capped + jitter).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, SynthesisError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SynthesisError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(SynthesisError::RetriesExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    })
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Effective segmentation limits after reconciling configuration with the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub max_bytes: usize,
    pub max_speakers: usize,
}

/// The single call site that crosses into the TTS provider.
pub struct SynthesisAdapter {
    provider: Box<dyn TtsProvider>,
    retry: RetryPolicy,
    style: Option<String>,
}

impl SynthesisAdapter {
    pub fn new(provider: Box<dyn TtsProvider>, retry: RetryPolicy, style: Option<String>) -> Self {
        Self {
            provider,
            retry,
            style: style.filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn provider(&self) -> &dyn TtsProvider {
        self.provider.as_ref()
    }

    /// Validates chunking settings and clamps them to what the provider accepts.
    pub fn chunk_limits(&self, config: &ChunkingConfig) -> Result<ChunkLimits, RunError> {
        if config.max_bytes == 0 {
            return Err(RunError::Input("max_bytes must be positive".into()));
        }
        if config.max_speakers == 0 {
            return Err(RunError::Input("max_speakers must be positive".into()));
        }

        let mut limits = ChunkLimits {
            max_bytes: config.max_bytes,
            max_speakers: config.max_speakers,
        };

        let text_limit = self.provider.max_text_length();
        if limits.max_bytes > text_limit {
            warn!(
                "max_bytes {} exceeds the {} limit of {}; clamping",
                limits.max_bytes,
                self.provider.name(),
                text_limit
            );
            limits.max_bytes = text_limit;
        }

        let speaker_limit = self.provider.max_speakers_per_call().max(1);
        if limits.max_speakers > speaker_limit {
            warn!(
                "max_speakers {} exceeds the {} limit of {}; clamping",
                limits.max_speakers,
                self.provider.name(),
                speaker_limit
            );
            limits.max_speakers = speaker_limit;
        }

        Ok(limits)
    }

    fn check_payload(&self, payload: &str) -> Result<(), SynthesisError> {
        let limit = self.provider.max_text_length();
        if payload.len() > limit {
            return Err(SynthesisError::PayloadTooLarge {
                bytes: payload.len(),
                limit,
            });
        }
        Ok(())
    }

    /// Synthesizes one segment and returns it in the canonical audio layout.
    pub async fn synthesize(
        &self,
        segment: &Segment,
        voices: &mut VoiceManager,
    ) -> Result<AudioBuffer, SynthesisError> {
        let style = self.style.as_deref();

        let raw = if segment.is_single_speaker() {
            let speaker = &segment.speakers[0];
            let voice = voices.get_voice(speaker);
            let text = segment
                .lines
                .iter()
                .map(|l| l.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            self.check_payload(&text)?;

            debug!(
                "Segment {}: single speaker {} ({}), {} bytes",
                segment.index,
                speaker,
                voice,
                text.len()
            );
            self.retry
                .run(|| self.provider.synthesize_one(&text, &voice, style))
                .await?
        } else {
            let turns: Vec<SpeakerTurn> = segment
                .lines
                .iter()
                .map(|l| SpeakerTurn {
                    speaker: l.speaker.clone(),
                    voice: voices.get_voice(&l.speaker),
                    text: l.text.clone(),
                })
                .collect();
            self.check_payload(&transcript(&turns))?;

            debug!(
                "Segment {}: {} speakers, {} lines",
                segment.index,
                segment.speakers.len(),
                turns.len()
            );
            self.retry
                .run(|| self.provider.synthesize_many(&turns, style))
                .await?
        };

        raw.normalize()
    }
}
