//! narrate - Convert EPUB files to speech with Kyutai TTS, one resumable chunk at a time

mod audio;
mod checkpoint;
mod config;
mod convert;
mod epub;
mod error;
mod selection;
mod text;
mod tts;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::NarrateConfig;
use convert::{Cancellation, ConvertOptions, Converter, RunOutcome};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use selection::{ChapterSelector, FixedSelector, InteractiveSelector};
use std::path::{Path, PathBuf};
use tts::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "narrate")]
#[command(about = "Convert EPUB files to speech using Kyutai TTS", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the EPUB file
    input: Option<PathBuf>,

    /// Output WAV file (default: <epub-name>.wav)
    output: Option<PathBuf>,

    /// Voice to use for TTS
    #[arg(long)]
    voice: Option<String>,

    /// Maximum words per chunk (default: 500)
    #[arg(long)]
    max_chunk_words: Option<usize>,

    /// Force chapter selection even if a previous selection exists
    #[arg(long, default_value_t = false)]
    reselect_chapters: bool,

    /// Device to use (cuda/cpu, default: auto-detect)
    #[arg(long)]
    device: Option<String>,

    /// HuggingFace repository for models
    #[arg(long)]
    hf_repo: Option<String>,

    /// HuggingFace repository for voices
    #[arg(long)]
    voice_repo: Option<String>,

    /// Quantization bits (e.g., 8 for 8-bit)
    #[arg(long)]
    quantize: Option<u32>,

    /// Chapters to convert without prompting, 0-based (e.g., "0-3,7")
    #[arg(long)]
    chapters: Option<String>,

    /// Target loudness per chunk in dB (default: -20)
    #[arg(long, allow_negative_numbers = true)]
    level_db: Option<f32>,

    /// Stop when a checkpoint cannot be saved
    #[arg(long, default_value_t = false)]
    strict_checkpoints: bool,

    /// Enable debug output
    #[arg(short, long, default_value_t = false)]
    debug: bool,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Set default voice
    SetVoice {
        /// Voice path within the voice repository
        voice: String,
    },
    /// Set default device
    SetDevice {
        /// Device (cuda, cpu, auto)
        device: String,
    },
    /// Set default maximum words per chunk
    SetChunkWords {
        /// Words (at least 1)
        value: usize,
    },
    /// Set default loudness target
    SetLevel {
        /// Level in dB (e.g., -20)
        #[arg(allow_negative_numbers = true)]
        value: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();

    if let Some(Commands::Config { action }) = &args.command {
        return handle_config_command(action);
    }

    let input = args
        .input
        .clone()
        .ok_or_else(|| anyhow::anyhow!("EPUB file path is required. Run 'narrate --help' for usage."))?;
    validate_input(&input)?;

    let config = NarrateConfig::load().context("Failed to load configuration")?;

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| input.with_extension("wav"));

    let mut options = ConvertOptions::new(&output_path);
    options.voice = args.voice.clone().unwrap_or(config.voice.clone());
    options.max_chunk_words = args.max_chunk_words.unwrap_or(config.max_chunk_words);
    options.level_db = args.level_db.unwrap_or(config.level_db);
    options.reselect = args.reselect_chapters;
    options.strict_checkpoints = args.strict_checkpoints;

    let engine_config = EngineConfig {
        hf_repo: args.hf_repo.clone().or(config.hf_repo.clone()),
        voice_repo: args.voice_repo.clone().or(config.voice_repo.clone()),
        quantize: args.quantize.or(config.quantize),
        device: args
            .device
            .clone()
            .or(config.device.clone())
            .unwrap_or_else(|| "auto".to_string()),
    };

    debug!("EPUB: {}", input.display());
    debug!("Output: {}", output_path.display());
    debug!("Options: {:?}", options);
    debug!("Engine: {:?}", engine_config);

    info!("Parsing EPUB: {}", input.display());
    let book = epub::extract_chapters(&input).context("Failed to parse EPUB")?;
    info!(
        "Book: \"{}\" by {}",
        book.title,
        book.author.as_deref().unwrap_or("Unknown")
    );
    info!(
        "Chapters: {}, Words: ~{}",
        book.chapters.len(),
        book.total_words()
    );

    if book.chapters.is_empty() {
        anyhow::bail!("No chapters found in EPUB");
    }
    for chapter in &book.chapters {
        debug!(
            "  {:>3}. {} ({} words)",
            chapter.order + 1,
            chapter.title,
            chapter.word_count()
        );
    }

    let engine = tts::create_backend(engine_config).context("Failed to initialize TTS engine")?;
    info!("TTS engine: {}", engine.describe());

    let cancellation = Cancellation::new();
    spawn_interrupt_handler(cancellation.clone());

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);

    let mut selector: Box<dyn ChapterSelector> = match &args.chapters {
        Some(expr) => Box::new(FixedSelector::new(expr.clone())),
        None => Box::new(InteractiveSelector::new(
            std::io::stdin().lock(),
            std::io::stderr(),
        )),
    };

    let mut converter = Converter::new(engine.as_ref(), selector.as_mut(), options)
        .with_cancellation(cancellation)
        .with_progress(spinner);

    let report = match converter.run(&book.chapters).await {
        Ok(report) => report,
        Err(e) if e.is_cancelled() => {
            info!("Selection cancelled. Exiting...");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    for failure in &report.failures {
        warn!(
            "Failed: chapter {} '{}' chunk {}: {}",
            failure.chapter_index + 1,
            failure.chapter_title,
            failure.chunk_index + 1,
            failure.error
        );
    }
    debug!("Selected chapters: {:?}", report.selected_chapters);
    info!("{}", report.summary());

    if report.outcome == RunOutcome::Cancelled {
        info!(
            "Run the same command again to resume from {}",
            checkpoint::checkpoint_path_for(&output_path).display()
        );
    }

    Ok(())
}

/// Check that `input` is an existing EPUB file.
fn validate_input(input: &Path) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input file {} does not exist", input.display());
    }

    let is_epub = input
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("epub"));
    if !is_epub {
        anyhow::bail!("Only EPUB files are supported: {}", input.display());
    }
    Ok(())
}

/// First Ctrl+C stops after the current chunk; a second one exits immediately.
fn spawn_interrupt_handler(cancellation: Cancellation) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Ctrl+C detected, stopping after the current chunk (press again to exit now)");
        cancellation.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nExiting");
            std::process::exit(130);
        }
    });
}

fn handle_config_command(action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = NarrateConfig::load()?;
            println!("Configuration file: {:?}", NarrateConfig::config_path());
            println!();
            println!("voice = \"{}\"", config.voice);
            if let Some(device) = &config.device {
                println!("device = \"{}\"", device);
            } else {
                println!("device = (auto-detect)");
            }
            println!("max_chunk_words = {}", config.max_chunk_words);
            println!("level_db = {}", config.level_db);
            println!(
                "hf_repo = {}",
                config.hf_repo.as_deref().unwrap_or("(engine default)")
            );
            println!(
                "voice_repo = {}",
                config.voice_repo.as_deref().unwrap_or("(engine default)")
            );
            match config.quantize {
                Some(bits) => println!("quantize = {}", bits),
                None => println!("quantize = (none)"),
            }
        }
        ConfigAction::SetVoice { voice } => {
            let mut config = NarrateConfig::load()?;
            config.voice = voice.clone();
            config.save()?;
            println!("Default voice set to: {}", voice);
        }
        ConfigAction::SetDevice { device } => {
            let mut config = NarrateConfig::load()?;
            config.device = if device == "auto" {
                None
            } else {
                Some(device.clone())
            };
            config.save()?;
            println!("Default device set to: {}", device);
        }
        ConfigAction::SetChunkWords { value } => {
            let mut config = NarrateConfig::load()?;
            config.max_chunk_words = (*value).max(1);
            config.save()?;
            println!("Default max chunk words set to: {}", config.max_chunk_words);
        }
        ConfigAction::SetLevel { value } => {
            let mut config = NarrateConfig::load()?;
            config.level_db = value.clamp(-60.0, 0.0);
            config.save()?;
            println!("Default level set to: {} dB", config.level_db);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_input() {
        let temp_dir = TempDir::new().unwrap();
        let epub = temp_dir.path().join("book.EPUB");
        let txt = temp_dir.path().join("book.txt");
        std::fs::write(&epub, b"").unwrap();
        std::fs::write(&txt, b"").unwrap();

        assert!(validate_input(&epub).is_ok());
        assert!(validate_input(&txt).is_err());
        assert!(validate_input(&temp_dir.path().join("missing.epub")).is_err());
    }

    #[test]
    fn test_parse_args() {
        let args = Args::try_parse_from([
            "narrate",
            "book.epub",
            "out.wav",
            "--max-chunk-words",
            "750",
            "--level-db",
            "-18",
            "--chapters",
            "0-2",
        ])
        .unwrap();

        assert_eq!(args.input, Some(PathBuf::from("book.epub")));
        assert_eq!(args.output, Some(PathBuf::from("out.wav")));
        assert_eq!(args.max_chunk_words, Some(750));
        assert_eq!(args.level_db, Some(-18.0));
        assert_eq!(args.chapters.as_deref(), Some("0-2"));
        assert!(!args.reselect_chapters);
    }

    #[test]
    fn test_parse_config_subcommand() {
        let args = Args::try_parse_from(["narrate", "config", "set-level", "-18"]).unwrap();
        assert!(matches!(
            args.command,
            Some(Commands::Config {
                action: ConfigAction::SetLevel { value }
            }) if value == -18.0
        ));
    }
}
