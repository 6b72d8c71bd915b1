use crate::core::config::AssemblyConfig;
use crate::core::error::RunError;
use crate::core::io::Storage;
use crate::core::state::{AssemblyState, ErrorEntry, GenerationStats};
use crate::services::assembler::{Assembler, TransitionKind};
use crate::services::checkpoint::{CheckpointStats, CheckpointStore, RunLock};
use crate::services::segmenter::Segment;
use crate::services::synthesis::SynthesisAdapter;
use crate::services::voices::VoiceManager;
use crate::utils::audio;
use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Result of a run that reached the last segment.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub path: PathBuf,
    pub stats: GenerationStats,
    /// Segment index the run resumed from, if it continued a checkpoint.
    pub resumed_from: Option<usize>,
}

/// Drives segments through synthesis and assembly one at a time, checkpointing as it goes.
pub struct StreamingGenerator {
    adapter: SynthesisAdapter,
    voices: VoiceManager,
    output_path: PathBuf,
    settings: AssemblyConfig,
    checkpoints: CheckpointStore,
    cancel: Arc<AtomicBool>,
}

/// Mutable accumulator for one run.
struct RunProgress {
    assembler: Option<Assembler>,
    completed: usize,
    /// Frames known to hold exactly `completed` segments.
    committed_frames: u64,
    error_log: Vec<ErrorEntry>,
}

impl RunProgress {
    fn new() -> Self {
        Self {
            assembler: None,
            completed: 0,
            committed_frames: 0,
            error_log: Vec::new(),
        }
    }

    fn duration_ms(&self) -> u64 {
        audio::frames_to_ms(self.committed_frames)
    }
}

impl StreamingGenerator {
    pub fn new(
        adapter: SynthesisAdapter,
        voices: VoiceManager,
        output_path: &Path,
        settings: AssemblyConfig,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            adapter,
            voices,
            output_path: output_path.to_path_buf(),
            settings,
            checkpoints: CheckpointStore::new(output_path, storage),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between segments. Setting it stops the run at the next boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn checkpoint_path(&self) -> &Path {
        self.checkpoints.path()
    }

    pub async fn generate<F>(
        &mut self,
        segments: &[Segment],
        resume: bool,
        mut progress: F,
    ) -> Result<GenerationOutcome, RunError>
    where
        F: FnMut(&GenerationStats),
    {
        if segments.is_empty() {
            return Err(RunError::Input("no segments to synthesize".into()));
        }
        if self.settings.state_save_interval == 0 {
            return Err(RunError::Input("state_save_interval must be positive".into()));
        }

        let _lock = RunLock::acquire(&self.output_path)?;
        let total = segments.len();

        let mut run = RunProgress::new();
        let mut resumed_from = None;

        let state = if resume {
            self.checkpoints.load().await.map_err(RunError::Io)?
        } else {
            None
        };
        match state {
            Some(state) => {
                self.restore(&state, total, &mut run).await?;
                info!("Resuming from segment {}/{}", run.completed, total);
                resumed_from = Some(run.completed);
            }
            None => {
                if resume {
                    info!("No checkpoint found for {:?}, starting fresh", self.output_path);
                }
                self.discard_previous().await?;
            }
        }

        // First-appearance order keeps auto assignment independent of where the run starts
        for segment in segments {
            for speaker in &segment.speakers {
                self.voices.get_voice(speaker);
            }
        }

        let started = Instant::now();
        let interval = self.settings.state_save_interval;

        for segment in &segments[run.completed..] {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Cancelled before segment {}", segment.index);
                self.checkpoint(&mut run, total).await.map_err(RunError::Io)?;
                return Err(RunError::Interrupted {
                    completed: run.completed,
                });
            }

            if let Err(e) = self.process(segment, &mut run).await {
                error!("Segment {} failed: {:#}", segment.index, e);
                run.error_log.push(ErrorEntry {
                    segment_index: segment.index,
                    message: format!("{:#}", e),
                    timestamp: Utc::now(),
                });
                if let Err(ce) = self.checkpoint(&mut run, total).await {
                    error!("Failed to write checkpoint after failure: {:#}", ce);
                }
                return Err(RunError::Segment {
                    index: segment.index,
                    source: e,
                });
            }

            progress(&GenerationStats {
                completed: run.completed,
                total,
                cumulative_duration_ms: run.duration_ms(),
                elapsed: started.elapsed(),
            });

            if run.completed % interval == 0 || run.completed == total {
                self.checkpoint(&mut run, total).await.map_err(RunError::Io)?;
            }
        }

        self.checkpoints.clear().await.map_err(RunError::Io)?;
        info!(
            "Generated {} segments ({} ms) into {:?}",
            total,
            run.duration_ms(),
            self.output_path
        );

        Ok(GenerationOutcome {
            path: self.output_path.clone(),
            stats: GenerationStats {
                completed: run.completed,
                total,
                cumulative_duration_ms: run.duration_ms(),
                elapsed: started.elapsed(),
            },
            resumed_from,
        })
    }

    async fn process(&mut self, segment: &Segment, run: &mut RunProgress) -> Result<()> {
        let buffer = self.adapter.synthesize(segment, &mut self.voices).await?;

        let frames = match run.assembler.as_mut() {
            Some(assembler) => assembler.append(&buffer, TransitionKind::for_segment(segment))?,
            None => {
                let assembler = Assembler::create(&self.output_path, self.settings.clone(), &buffer)?;
                let frames = assembler.frames();
                run.assembler = Some(assembler);
                frames
            }
        };

        run.completed = segment.index + 1;
        run.committed_frames = frames;
        Ok(())
    }

    /// Flushes audio, then records progress. The checkpoint never counts audio that is not durable.
    async fn checkpoint(&self, run: &mut RunProgress, total: usize) -> Result<AssemblyState> {
        if let Some(assembler) = run.assembler.as_mut() {
            assembler.flush()?;
        }
        self.checkpoints
            .save(
                run.completed,
                total,
                &self.voices.assignments(),
                CheckpointStats {
                    cumulative_duration_ms: run.duration_ms(),
                    committed_frames: run.committed_frames,
                    error_log: &run.error_log,
                },
            )
            .await
    }

    async fn restore(
        &mut self,
        state: &AssemblyState,
        total: usize,
        run: &mut RunProgress,
    ) -> Result<(), RunError> {
        let expected = self.output_path.to_string_lossy();
        if state.output_path != expected {
            return Err(RunError::Input(format!(
                "checkpoint belongs to {:?}, not {:?}",
                state.output_path, expected
            )));
        }
        if state.total_segment_count != total {
            return Err(RunError::Input(format!(
                "checkpoint was written for {} segments but the input now has {}; \
                 the script or chunking settings changed",
                state.total_segment_count, total
            )));
        }
        if state.completed_segment_count > total {
            return Err(RunError::Input(format!(
                "checkpoint claims {} of {} segments completed",
                state.completed_segment_count, total
            )));
        }

        if state.completed_segment_count == 0 {
            self.remove_output().await?;
        } else {
            let mut assembler = Assembler::open(&self.output_path, self.settings.clone())
                .map_err(|e| RunError::Input(format!("cannot resume: {:#}", e)))?;
            if assembler.frames() < state.committed_frames {
                return Err(RunError::Input(format!(
                    "{:?} holds {} frames but the checkpoint committed {}",
                    self.output_path,
                    assembler.frames(),
                    state.committed_frames
                )));
            }
            if assembler.frames() > state.committed_frames {
                warn!(
                    "Discarding {} frames written after the last checkpoint",
                    assembler.frames() - state.committed_frames
                );
            }
            assembler
                .truncate(state.committed_frames)
                .map_err(RunError::Io)?;
            run.assembler = Some(assembler);
        }

        self.voices.set_manual_assignments(&state.voice_assignments);
        run.completed = state.completed_segment_count;
        run.committed_frames = state.committed_frames;
        run.error_log = state.error_log.clone();
        Ok(())
    }

    /// A partial output without a checkpoint cannot be trusted, so both go.
    async fn discard_previous(&self) -> Result<(), RunError> {
        self.remove_output().await?;
        self.checkpoints.clear().await.map_err(RunError::Io)
    }

    async fn remove_output(&self) -> Result<(), RunError> {
        match tokio::fs::remove_file(&self.output_path).await {
            Ok(()) => {
                info!("Removed stale output {:?}", self.output_path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RunError::Io(
                anyhow!(e).context(format!("Failed to remove {:?}", self.output_path)),
            )),
        }
    }
}
