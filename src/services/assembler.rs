//! Incremental WAV assembly.
//!
//! The output file grows in place: each append reads back only the crossfade
//! tail, writes the new frames, and patches the two RIFF size fields. Nothing
//! larger than one segment's audio is ever held in memory.

use crate::core::config::AssemblyConfig;
use crate::services::segmenter::Segment;
use crate::utils::audio::{self, AudioBuffer, BYTES_PER_FRAME};
use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Pause,
    ChapterPause,
}

impl TransitionKind {
    pub fn for_segment(segment: &Segment) -> Self {
        if segment.is_chapter_start {
            TransitionKind::ChapterPause
        } else {
            TransitionKind::Pause
        }
    }

    fn silence_ms(self, settings: &AssemblyConfig) -> u32 {
        match self {
            TransitionKind::Pause => settings.pause_ms,
            TransitionKind::ChapterPause => settings.chapter_pause_ms,
        }
    }
}

pub struct Assembler {
    path: PathBuf,
    file: File,
    data_offset: u64,
    frames: u64,
    settings: AssemblyConfig,
}

impl Assembler {
    /// Creates (or replaces) `path` with `first` as its entire content.
    pub fn create(path: &Path, settings: AssemblyConfig, first: &AudioBuffer) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut writer = hound::WavWriter::create(path, audio::wav_spec())
            .with_context(|| format!("Failed to create {:?}", path))?;
        for &s in first.samples() {
            writer.write_sample(s)?;
        }
        writer.finalize()?;

        debug!("Created {:?} with {} frames", path, first.frames());
        Self::open(path, settings)
    }

    /// Opens an existing output for appending. The file must be in the canonical format.
    pub fn open(path: &Path, settings: AssemblyConfig) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {:?}", path))?;

        let layout =
            audio::scan_wav(&mut file).with_context(|| format!("Failed to read WAV header of {:?}", path))?;
        if !layout.is_canonical() {
            return Err(anyhow!(
                "{:?} is {} Hz, {} channel(s), {}-bit; expected {} Hz mono 16-bit",
                path,
                layout.sample_rate,
                layout.channels,
                layout.bits_per_sample,
                audio::SAMPLE_RATE
            ));
        }

        // Frames on disk may run past the header after a crash mid-append
        let len = file.metadata()?.len();
        let frames = len.saturating_sub(layout.data_offset) / BYTES_PER_FRAME;
        if frames * BYTES_PER_FRAME != layout.data_size as u64 {
            warn!(
                "{:?}: header declares {} data bytes but {} are on disk",
                path,
                layout.data_size,
                frames * BYTES_PER_FRAME
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            data_offset: layout.data_offset,
            frames,
            settings,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn duration_ms(&self) -> u64 {
        audio::frames_to_ms(self.frames)
    }

    /// Appends `buffer` after a transition of silence, crossfading the seam.
    ///
    /// Returns the total frame count afterwards.
    pub fn append(&mut self, buffer: &AudioBuffer, kind: TransitionKind) -> Result<u64> {
        let mut transition = AudioBuffer::silence(kind.silence_ms(&self.settings));
        let silence = transition.frames();
        transition.extend(buffer);
        let incoming = transition.samples();

        let overlap = audio::ms_to_frames(self.settings.crossfade_ms)
            .min(self.frames as usize)
            .min(incoming.len());
        let new_frames = self.frames + (incoming.len() - overlap) as u64;
        self.check_size(new_frames)?;

        let start = self.frames - overlap as u64;
        let pos = self.data_offset + start * BYTES_PER_FRAME;

        let mut tail = vec![0u8; overlap * BYTES_PER_FRAME as usize];
        if overlap > 0 {
            self.file.seek(SeekFrom::Start(pos))?;
            self.file.read_exact(&mut tail)?;
        }
        let tail: Vec<i16> = tail
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        let blended = audio::crossfade(&tail, &incoming[..overlap]);

        self.file.seek(SeekFrom::Start(pos))?;
        {
            let mut w = BufWriter::new(&mut self.file);
            for s in blended.iter().chain(&incoming[overlap..]) {
                w.write_all(&s.to_le_bytes())?;
            }
            w.flush()?;
        }

        self.frames = new_frames;
        // Drops anything left past the new end by an earlier crash
        self.file.set_len(self.data_offset + self.frames * BYTES_PER_FRAME)?;
        self.patch_header()?;

        debug!(
            "Appended {} frames ({} silence, {} overlap) to {:?}",
            buffer.frames(),
            silence,
            overlap,
            self.path
        );
        Ok(self.frames)
    }

    /// Cuts the audio back to `frames`.
    pub fn truncate(&mut self, frames: u64) -> Result<()> {
        if frames > self.frames {
            return Err(anyhow!(
                "cannot truncate {:?} to {} frames, it only has {}",
                self.path,
                frames,
                self.frames
            ));
        }
        self.file.set_len(self.data_offset + frames * BYTES_PER_FRAME)?;
        self.frames = frames;
        self.patch_header()
    }

    /// Makes everything written so far durable.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn check_size(&self, frames: u64) -> Result<()> {
        let riff_size = self.data_offset + frames * BYTES_PER_FRAME - 8;
        if riff_size > u32::MAX as u64 {
            return Err(anyhow!(
                "{:?} would exceed the 4 GiB WAV size limit",
                self.path
            ));
        }
        Ok(())
    }

    fn patch_header(&mut self) -> Result<()> {
        self.check_size(self.frames)?;
        let data_size = self.frames * BYTES_PER_FRAME;
        let riff_size = self.data_offset + data_size - 8;

        self.file.seek(SeekFrom::Start(4))?;
        self.file.write_all(&(riff_size as u32).to_le_bytes())?;
        self.file.seek(SeekFrom::Start(self.data_offset - 4))?;
        self.file.write_all(&(data_size as u32).to_le_bytes())?;
        Ok(())
    }
}

/// Appends one segment's audio to `output_path`, creating the file for the first segment.
///
/// Returns the total frame count of the output afterwards.
pub fn append(
    output_path: &Path,
    buffer: &AudioBuffer,
    is_first: bool,
    kind: TransitionKind,
    settings: &AssemblyConfig,
) -> Result<u64> {
    let mut assembler = if is_first {
        Assembler::create(output_path, settings.clone(), buffer)?
    } else {
        let mut a = Assembler::open(output_path, settings.clone())?;
        a.append(buffer, kind)?;
        a
    };
    assembler.flush()?;
    Ok(assembler.frames())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pause_ms: u32, chapter_pause_ms: u32, crossfade_ms: u32) -> AssemblyConfig {
        AssemblyConfig {
            pause_ms,
            chapter_pause_ms,
            crossfade_ms,
            ..AssemblyConfig::default()
        }
    }

    fn tone(ms: u32, value: i16) -> AudioBuffer {
        AudioBuffer::from_samples(vec![value; audio::ms_to_frames(ms)])
    }

    fn read_samples(path: &Path) -> Result<Vec<i16>> {
        let reader = hound::WavReader::open(path)?;
        assert_eq!(reader.spec(), audio::wav_spec());
        Ok(reader.into_samples::<i16>().collect::<Result<_, _>>()?)
    }

    #[test]
    fn test_append_inserts_pause_and_crossfades() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("book.wav");

        let mut asm = Assembler::create(&path, settings(300, 2000, 20), &tone(100, 1000))?;
        let total = asm.append(&tone(100, 2000), TransitionKind::Pause)?;
        asm.flush()?;

        // 2400 + 7200 silence + 2400 - 480 overlap
        assert_eq!(total, 11_520);
        let samples = read_samples(&path)?;
        assert_eq!(samples.len(), 11_520);

        assert!(samples[..1920].iter().all(|&s| s == 1000));
        let fade = &samples[1920..2400];
        assert!(fade.windows(2).all(|w| w[0] >= w[1]));
        assert!(fade[0] < 1000 && fade[479] > 0);
        assert!(samples[2400..9120].iter().all(|&s| s == 0));
        assert!(samples[9120..].iter().all(|&s| s == 2000));
        Ok(())
    }

    #[test]
    fn test_chapter_transition_uses_longer_pause() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("book.wav");

        let mut asm = Assembler::create(&path, settings(300, 2000, 0), &tone(100, 1))?;
        asm.append(&tone(100, 1), TransitionKind::ChapterPause)?;
        assert_eq!(asm.frames(), 2400 + 48_000 + 2400);
        assert_eq!(asm.duration_ms(), 2200);
        Ok(())
    }

    #[test]
    fn test_overlap_is_clamped_to_existing_audio() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("book.wav");

        let first = AudioBuffer::from_samples(vec![500; 100]);
        let mut asm = Assembler::create(&path, settings(0, 0, 20), &first)?;
        asm.append(&tone(100, 500), TransitionKind::Pause)?;

        // 480-frame crossfade limited by the 100 existing frames
        assert_eq!(asm.frames(), 100 + 2400 - 100);
        let samples = read_samples(&path)?;
        assert!(samples.iter().all(|&s| s == 500));
        Ok(())
    }

    #[test]
    fn test_reopen_and_truncate() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("book.wav");
        let cfg = settings(10, 10, 0);

        let f1 = append(&path, &tone(50, 7), true, TransitionKind::Pause, &cfg)?;
        let f2 = append(&path, &tone(50, 7), false, TransitionKind::Pause, &cfg)?;
        let f3 = append(&path, &tone(50, 7), false, TransitionKind::Pause, &cfg)?;
        assert_eq!(f1, 1200);
        assert_eq!(f2, 1200 + 240 + 1200);
        assert_eq!(f3, f2 + 240 + 1200);
        assert_eq!(read_samples(&path)?.len() as u64, f3);

        let mut asm = Assembler::open(&path, cfg.clone())?;
        assert_eq!(asm.frames(), f3);
        asm.truncate(f2)?;
        assert!(asm.truncate(f3).is_err());
        drop(asm);
        assert_eq!(read_samples(&path)?.len() as u64, f2);
        Ok(())
    }

    #[test]
    fn test_open_recovers_unpatched_tail() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("book.wav");
        Assembler::create(&path, settings(0, 0, 0), &tone(10, 3))?;

        // Simulate frames written before the header was patched
        let mut f = OpenOptions::new().append(true).open(&path)?;
        f.write_all(&[1, 0, 1, 0])?;
        drop(f);

        let mut asm = Assembler::open(&path, settings(0, 0, 0))?;
        assert_eq!(asm.frames(), 242);
        asm.truncate(240)?;
        assert_eq!(read_samples(&path)?.len(), 240);
        Ok(())
    }

    #[test]
    fn test_open_rejects_foreign_format() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("other.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(&path, spec)?;
        w.write_sample(0i16)?;
        w.write_sample(0i16)?;
        w.finalize()?;

        assert!(Assembler::open(&path, AssemblyConfig::default()).is_err());
        assert!(Assembler::open(&temp_dir.path().join("missing.wav"), AssemblyConfig::default()).is_err());
        Ok(())
    }
}
