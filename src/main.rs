use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use script2audiobook::core::config::{Config, DEFAULT_CONFIG_PATH};
use script2audiobook::core::error::RunError;
use script2audiobook::core::io::NativeStorage;
use script2audiobook::core::state::GenerationStats;
use script2audiobook::services::checkpoint::checkpoint_path_for;
use script2audiobook::services::script::{self, unique_speakers};
use script2audiobook::services::segmenter::{self, chunk_stats, format_duration};
use script2audiobook::services::synthesis::{RetryPolicy, SynthesisAdapter};
use script2audiobook::services::tts::{self, elevenlabs::ElevenLabsConfig, gemini::GeminiConfig};
use script2audiobook::services::voices::{self, parse_voice_mapping, VoiceManager};
use script2audiobook::services::workflow::StreamingGenerator;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, Stdio};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const WORDS_PER_MINUTE: u32 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Wav,
    Mp3,
}

#[derive(Debug, Parser)]
#[command(name = "script2audiobook")]
#[command(about = "Turn speaker-labelled scripts into multi-voice audiobooks")]
struct Cli {
    /// Script file: `Speaker: text` lines, or a JSON array of {speaker, text}
    #[arg(required_unless_present = "list_voices")]
    input: Option<PathBuf>,

    #[arg(short, long, default_value = "output.wav")]
    output: PathBuf,

    /// Defaults to the output file extension
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Manual voices, e.g. "Narrator:Charon,Alice:Kore"
    #[arg(long)]
    voices: Option<String>,

    /// Pause between segments in ms
    #[arg(long)]
    pause: Option<u32>,

    /// Pause before a chapter in ms
    #[arg(long)]
    chapter_pause: Option<u32>,

    /// Crossfade length in ms
    #[arg(long)]
    crossfade: Option<u32>,

    /// Delivery hint passed to the provider, e.g. "Read warmly and slowly"
    #[arg(long)]
    style: Option<String>,

    /// Continue from the checkpoint next to the output
    #[arg(long)]
    resume: bool,

    /// Overwrite without asking
    #[arg(short = 'y', long)]
    yes: bool,

    #[arg(long)]
    list_voices: bool,

    #[arg(long)]
    show_assignments: bool,

    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// gemini or elevenlabs
    #[arg(long)]
    provider: Option<String>,

    #[arg(long)]
    api_key: Option<String>,

    #[arg(long)]
    max_bytes: Option<usize>,

    #[arg(long)]
    max_speakers: Option<usize>,

    /// Write a checkpoint every N segments
    #[arg(long)]
    save_interval: Option<usize>,

    #[arg(long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

fn detect_format(output: &Path, flag: Option<OutputFormat>) -> OutputFormat {
    flag.unwrap_or_else(|| {
        let is_mp3 = output
            .extension()
            .map(|e| e.eq_ignore_ascii_case("mp3"))
            .unwrap_or(false);
        if is_mp3 {
            OutputFormat::Mp3
        } else {
            OutputFormat::Wav
        }
    })
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(p) = &cli.provider {
        config.tts.provider = p.clone();
    }
    if let Some(key) = &cli.api_key {
        match config.tts.provider.as_str() {
            "elevenlabs" => {
                config
                    .tts
                    .elevenlabs
                    .get_or_insert_with(ElevenLabsConfig::default)
                    .api_key = Some(key.clone())
            }
            _ => {
                config
                    .tts
                    .gemini
                    .get_or_insert_with(GeminiConfig::default)
                    .api_key = Some(key.clone())
            }
        }
    }
    if let Some(style) = &cli.style {
        config.tts.style = Some(style.clone());
    }
    if let Some(v) = cli.max_bytes {
        config.chunking.max_bytes = v;
    }
    if let Some(v) = cli.max_speakers {
        config.chunking.max_speakers = v;
    }
    if let Some(v) = cli.pause {
        config.assembly.pause_ms = v;
    }
    if let Some(v) = cli.chapter_pause {
        config.assembly.chapter_pause_ms = v;
    }
    if let Some(v) = cli.crossfade {
        config.assembly.crossfade_ms = v;
    }
    if let Some(v) = cli.save_interval {
        config.assembly.state_save_interval = v;
    }
    if let Some(mapping) = &cli.voices {
        config.voices.extend(parse_voice_mapping(mapping));
    }
}

fn list_available_voices() {
    println!("{:<16} {:<16} {}", "Voice", "Style", "Gender");
    for v in voices::CATALOGUE {
        println!("{:<16} {:<16} {}", v.name, v.characteristic, v.gender);
    }
}

fn print_assignments(manager: &VoiceManager) {
    println!("Voice assignments:");
    for (speaker, voice) in manager.assignments() {
        match voices::voice_info(&voice) {
            Some(info) => println!("  {:<20} {} ({}, {})", speaker, voice, info.characteristic, info.gender),
            None => println!("  {:<20} {}", speaker, voice),
        }
    }
}

fn confirm_overwrite(path: &Path) -> Result<bool> {
    inquire::Confirm::new(&format!("{} already exists. Overwrite?", path.display()))
        .with_default(false)
        .prompt()
        .context("Confirmation prompt failed (use --yes to skip it)")
}

async fn convert_to_mp3(wav: &Path, mp3: &Path) -> Result<()> {
    info!("Converting {:?} to MP3", wav);
    let output = tokio::process::Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(wav)
        .args(["-codec:a", "libmp3lame", "-qscale:a", "2"])
        .arg(mp3)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                anyhow!("ffmpeg not found; install it or write WAV output instead")
            }
            _ => anyhow!(e).context("Failed to run ffmpeg"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        bail!(
            "ffmpeg exited with {}: {}",
            output.status,
            tail.into_iter().rev().collect::<Vec<_>>().join("\n")
        );
    }
    Ok(())
}

/// `Chunk 3/10 (30.0%) | 12s generated | ETA 21 seconds`
fn progress_message(stats: &GenerationStats, processed_this_run: usize) -> String {
    let mut msg = format!(
        "Chunk {}/{} ({:.1}%) | {}s generated",
        stats.completed,
        stats.total,
        stats.percent(),
        stats.cumulative_duration_ms / 1000
    );
    if let Some(eta) = stats.eta(processed_this_run) {
        msg.push_str(&format!(" | ETA {}", format_duration(eta.as_secs_f64())));
    }
    msg
}

/// 1: failed, nothing to resume. 2: failed, resumable. 130: interrupted, resumable.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<RunError>() {
        Some(RunError::Interrupted { .. }) => 130,
        Some(e) if e.resume_from().is_some() => 2,
        _ => 1,
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    if cli.list_voices {
        list_available_voices();
        return Ok(ExitCode::SUCCESS);
    }

    let input = cli.input.clone().context("Input file required")?;
    let format = detect_format(&cli.output, cli.format);
    let wav_path = match format {
        OutputFormat::Wav => cli.output.clone(),
        OutputFormat::Mp3 => cli.output.with_extension("wav"),
    };

    if cli.output.exists() && !cli.resume && !cli.yes && !confirm_overwrite(&cli.output)? {
        println!("Cancelled.");
        return Ok(ExitCode::SUCCESS);
    }
    if !cli.resume && checkpoint_path_for(&wav_path).exists() {
        warn!(
            "Found a checkpoint for {:?} but --resume was not given; starting fresh",
            wav_path
        );
    }

    let mut config = Config::load(&cli.config)?;
    apply_overrides(&mut config, &cli);

    println!("Parsing: {}", input.display());
    let lines = script::parse_file(&input)?;
    if lines.is_empty() {
        eprintln!("Expected 'Speaker: dialogue' lines or a JSON array of {{speaker, text}}");
        return Err(RunError::Input(format!("no dialogue found in {:?}", input)).into());
    }

    let speakers = unique_speakers(&lines);
    println!("Found: {} dialogue lines, {} speakers", lines.len(), speakers.len());
    println!("Speakers: {}", speakers.join(", "));

    let mut voices = VoiceManager::new();
    voices.set_manual_assignments(&config.voices);
    for speaker in &speakers {
        voices.get_voice(speaker);
    }
    if cli.show_assignments {
        print_assignments(&voices);
    }

    let adapter = SynthesisAdapter::new(
        tts::create_tts_provider(&config)?,
        RetryPolicy::from_config(&config.tts.retry),
        config.tts.style.clone(),
    );
    println!("Provider: {}", adapter.provider().name());

    let limits = adapter.chunk_limits(&config.chunking)?;
    let segments = segmenter::segment(&lines, limits.max_bytes, limits.max_speakers);
    let stats = chunk_stats(&segments);
    println!(
        "Chunks: {} from {} lines, {} bytes of text (max {} bytes, {} speakers each)",
        stats.chunks, stats.lines, stats.total_bytes, limits.max_bytes, limits.max_speakers
    );
    println!(
        "Estimated duration: {}",
        format_duration(segmenter::estimate_duration(&segments, WORDS_PER_MINUTE))
    );
    println!("Output: {} ({:?})", cli.output.display(), format);

    let mut generator = StreamingGenerator::new(
        adapter,
        voices,
        &wav_path,
        config.assembly.clone(),
        Arc::new(NativeStorage::new()),
    );

    let cancel = generator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received, stopping after the current chunk...");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let pb = ProgressBar::new(segments.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {msg}")?
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(200));

    let mut first_completed = None;
    let result = generator
        .generate(&segments, cli.resume, |s| {
            let start = *first_completed.get_or_insert(s.completed - 1);
            pb.set_position(s.completed as u64);
            pb.set_message(progress_message(s, s.completed - start));
        })
        .await;
    pb.finish_and_clear();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(index) = e.resume_from() {
                eprintln!(
                    "Stopped at chunk {}/{}. Progress is saved in {}; run again with --resume to continue.",
                    index + 1,
                    segments.len(),
                    generator.checkpoint_path().display()
                );
            }
            return Err(e.into());
        }
    };

    if let Some(from) = outcome.resumed_from {
        println!("Resumed from chunk {}", from + 1);
    }

    if format == OutputFormat::Mp3 {
        convert_to_mp3(&outcome.path, &cli.output).await?;
        tokio::fs::remove_file(&outcome.path)
            .await
            .with_context(|| format!("Failed to remove {:?}", outcome.path))?;
    }

    println!(
        "Done: {} ({}, {} chunks in {:.1?})",
        cli.output.display(),
        format_duration(outcome.stats.cumulative_duration_ms as f64 / 1000.0),
        outcome.stats.total,
        outcome.stats.elapsed
    );
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}
