use anyhow::{anyhow, Context, Result};
use rubato::{FftFixedIn, Resampler};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};

/// Canonical layout every synthesized segment is converted to before assembly.
pub const SAMPLE_RATE: u32 = 24_000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;
pub const BYTES_PER_FRAME: u64 = (BITS_PER_SAMPLE / 8) as u64 * CHANNELS as u64;

const RESAMPLE_CHUNK: usize = 1024;
const RESAMPLE_SUB_CHUNKS: usize = 2;

pub fn wav_spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    }
}

pub fn ms_to_frames(ms: u32) -> usize {
    (ms as u64 * SAMPLE_RATE as u64 / 1000) as usize
}

pub fn frames_to_ms(frames: u64) -> u64 {
    frames * 1000 / SAMPLE_RATE as u64
}

/// Mono 16-bit PCM at [`SAMPLE_RATE`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioBuffer {
    samples: Vec<i16>,
}

impl AudioBuffer {
    pub fn from_samples(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn silence(ms: u32) -> Self {
        Self {
            samples: vec![0; ms_to_frames(ms)],
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn frames(&self) -> usize {
        self.samples.len()
    }

    pub fn duration_ms(&self) -> u64 {
        frames_to_ms(self.samples.len() as u64)
    }

    /// Concatenates without any transition.
    pub fn extend(&mut self, other: &AudioBuffer) {
        self.samples.extend_from_slice(&other.samples);
    }
}

/// Sample layout declared by a provider for raw PCM bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per sample: 1 (unsigned), 2, 3 or 4 (signed, little-endian).
    pub sample_width: u16,
}

/// Converts provider audio to the canonical layout.
///
/// RIFF/WAVE payloads are decoded with their own header; anything else is
/// interpreted as headerless PCM in `declared` format.
pub fn normalize(data: &[u8], declared: PcmFormat) -> Result<AudioBuffer> {
    if data.is_empty() {
        return Err(anyhow!("no audio data"));
    }

    let (interleaved, format) = if data.starts_with(b"RIFF") {
        decode_wav(data)?
    } else {
        (decode_pcm(data, declared)?, declared)
    };

    if format.channels == 0 || format.sample_rate == 0 {
        return Err(anyhow!("invalid audio format {:?}", format));
    }

    let mono = downmix(&interleaved, format.channels);
    Ok(AudioBuffer::from_samples(resample(&mono, format.sample_rate, SAMPLE_RATE)?))
}

fn decode_pcm(data: &[u8], format: PcmFormat) -> Result<Vec<i16>> {
    let width = format.sample_width as usize;
    let frame = width * format.channels as usize;
    if frame == 0 {
        return Err(anyhow!("invalid audio format {:?}", format));
    }
    if data.len() % frame != 0 {
        return Err(anyhow!(
            "{} bytes is not a whole number of {}-byte frames",
            data.len(),
            frame
        ));
    }

    let samples = match width {
        1 => data.iter().map(|&b| ((b as i16) - 128) << 8).collect(),
        2 => data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect(),
        3 => data
            .chunks_exact(3)
            .map(|c| (i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 16) as i16)
            .collect(),
        4 => data
            .chunks_exact(4)
            .map(|c| (i32::from_le_bytes([c[0], c[1], c[2], c[3]]) >> 16) as i16)
            .collect(),
        w => return Err(anyhow!("unsupported sample width: {} bytes", w)),
    };
    Ok(samples)
}

fn decode_wav(data: &[u8]) -> Result<(Vec<i16>, PcmFormat)> {
    let reader = hound::WavReader::new(Cursor::new(data)).context("invalid WAV payload")?;
    let spec = reader.spec();

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, _) => reader
            .into_samples::<f32>()
            .map(|s| s.map(|f| (f.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<Result<_, _>>()?,
        (hound::SampleFormat::Int, bits) if bits <= 16 => {
            let shift = 16 - bits as i32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| (v << shift) as i16))
                .collect::<Result<_, _>>()?
        }
        (hound::SampleFormat::Int, bits) => {
            let shift = bits as i32 - 16;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as i16))
                .collect::<Result<_, _>>()?
        }
    };

    let format = PcmFormat {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        sample_width: spec.bits_per_sample.div_ceil(8),
    };
    Ok((samples, format))
}

fn downmix(interleaved: &[i16], channels: u16) -> Vec<i16> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Band-limited resampling through rubato's FFT resampler.
///
/// Output is trimmed of the filter delay and cut to `len * to / from` frames.
fn resample(samples: &[i16], from: u32, to: u32) -> Result<Vec<i16>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let expected = ((samples.len() as u64 * to as u64) / from as u64).max(1) as usize;

    let mut resampler =
        FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, RESAMPLE_SUB_CHUNKS, 1)
            .context("Failed to create resampler")?;
    let delay = resampler.output_delay();

    let input: Vec<f32> = samples.iter().map(|&s| s as f32 / 32_768.0).collect();
    let mut out: Vec<f32> = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut pos = 0;
    loop {
        let needed = resampler.input_frames_next();
        if input.len() - pos < needed {
            break;
        }
        let chunk = [&input[pos..pos + needed]];
        let block = resampler.process(&chunk[..], None)?;
        out.extend_from_slice(&block[0]);
        pos += needed;
    }
    if pos < input.len() {
        let tail = [&input[pos..]];
        let block = resampler.process_partial(Some(&tail[..]), None)?;
        out.extend_from_slice(&block[0]);
    }
    // Flush the delay line with silence
    while out.len() < expected + delay {
        let block = resampler.process_partial::<&[f32]>(None, None)?;
        if block[0].is_empty() {
            break;
        }
        out.extend_from_slice(&block[0]);
    }

    Ok(out
        .iter()
        .skip(delay)
        .take(expected)
        .map(|&v| (v * 32_768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect())
}

/// Blends `tail` into `head` over their common length with a linear ramp.
///
/// Frame `i` of the result is `tail[i] * (1 - t) + head[i] * t` with
/// `t = (i + 1) / (n + 1)`, so neither endpoint is a hard cut.
pub fn crossfade(tail: &[i16], head: &[i16]) -> Vec<i16> {
    let n = tail.len().min(head.len());
    (0..n)
        .map(|i| {
            let t = (i + 1) as f64 / (n + 1) as f64;
            let v = tail[i] as f64 * (1.0 - t) + head[i] as f64 * t;
            v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
        })
        .collect()
}

/// Location of the PCM payload inside a WAV file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavLayout {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub data_offset: u64,
    pub data_size: u32,
}

impl WavLayout {
    pub fn is_canonical(&self) -> bool {
        // 0xFFFE is WAVE_FORMAT_EXTENSIBLE
        (self.format_tag == 1 || self.format_tag == 0xFFFE)
            && self.channels == CHANNELS
            && self.sample_rate == SAMPLE_RATE
            && self.bits_per_sample == BITS_PER_SAMPLE
    }
}

/// Walks the RIFF chunk list up to the `data` chunk.
pub fn scan_wav(f: &mut File) -> Result<WavLayout> {
    f.seek(SeekFrom::Start(0))?;

    let mut id = [0u8; 4];
    f.read_exact(&mut id)?;
    if &id != b"RIFF" {
        return Err(anyhow!("Not a RIFF file"));
    }

    // Skip file size
    f.seek(SeekFrom::Current(4))?;

    f.read_exact(&mut id)?;
    if &id != b"WAVE" {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut fmt: Option<(u16, u16, u32, u16)> = None;

    loop {
        let mut chunk_id = [0u8; 4];
        let n = f.read(&mut chunk_id)?;
        if n == 0 {
            break;
        }
        if n < 4 {
            return Err(anyhow!("Unexpected EOF reading chunk ID"));
        }

        let mut size_buf = [0u8; 4];
        f.read_exact(&mut size_buf)?;
        let chunk_size = u32::from_le_bytes(size_buf);

        if &chunk_id == b"fmt " {
            if chunk_size < 16 {
                return Err(anyhow!("fmt chunk too short: {} bytes", chunk_size));
            }
            let mut buf = vec![0u8; chunk_size as usize];
            f.read_exact(&mut buf)?;
            fmt = Some((
                u16::from_le_bytes([buf[0], buf[1]]),
                u16::from_le_bytes([buf[2], buf[3]]),
                u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
                u16::from_le_bytes([buf[14], buf[15]]),
            ));
            if chunk_size % 2 == 1 {
                f.seek(SeekFrom::Current(1))?;
            }
        } else if &chunk_id == b"data" {
            let (format_tag, channels, sample_rate, bits_per_sample) =
                fmt.ok_or_else(|| anyhow!("data chunk before fmt chunk"))?;
            return Ok(WavLayout {
                format_tag,
                channels,
                sample_rate,
                bits_per_sample,
                data_offset: f.stream_position()?,
                data_size: chunk_size,
            });
        } else {
            // Skip unknown chunk (word aligned)
            let skip = chunk_size as i64 + (chunk_size % 2) as i64;
            f.seek(SeekFrom::Current(skip))?;
        }
    }

    Err(anyhow!("Missing data chunk"))
}
