use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use subforge::cancel::CancellationToken;
use subforge::config::{Config, OutputMode};
use subforge::overlay::{RenderMode, StylePreset};
use subforge::pipeline::{
    extract_subtitles_from_media, render_overlay, translate_srt, ExtractOptions, RenderOverlayOptions,
    TranslateSrtOptions,
};
use subforge::progress::ProgressEvent;
use subforge::registry::OperationRegistry;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "subforge")]
#[command(version, about = "Media-to-subtitle pipeline: transcribe, translate, and burn in captions")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Transcribe (and optionally translate) a media file into an SRT
    Subtitle {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        language: Option<String>,
        #[arg(long, default_value = "original")]
        translate_to: String,
        #[arg(long, default_value = "original")]
        output_mode: String,
    },
    /// Translate an existing SRT file into a target language
    Translate {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        target_language: String,
    },
    /// Burn finalized subtitles into a video
    Overlay {
        input: PathBuf,
        srt: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        vertical: bool,
        #[arg(long)]
        png_mode: bool,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

fn install_ctrlc_handler(signal: CancellationToken) {
    ctrlc::set_handler(move || {
        if signal.is_cancelled() {
            std::process::exit(2);
        }
        eprintln!("\nReceived Ctrl+C, cancelling... (press again to force quit)");
        signal.cancel();
    })
    .ok();
}

struct IndicatifSink {
    bar: indicatif::ProgressBar,
}

impl subforge::progress::ProgressSink for IndicatifSink {
    fn publish(&self, event: ProgressEvent) {
        self.bar.set_position(event.percent.round() as u64);
        self.bar.set_message(event.stage.tag());
        if matches!(event.stage, subforge::progress::Stage::Cancelled | subforge::progress::Stage::Error) {
            self.bar.finish_and_clear();
        }
    }
}

/// Checks free space on the output's filesystem before writing, then maps
/// any ENOSPC hit mid-write to the same error instead of a generic I/O one.
async fn write_output(path: &std::path::Path, contents: &[u8]) -> Result<(), subforge::error::CoreError> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
    subforge::diskspace::ensure_space_available(dir, contents.len() as u64)?;
    tokio::fs::write(path, contents).await.map_err(subforge::diskspace::map_io_error)
}

fn progress_sink() -> Arc<dyn subforge::progress::ProgressSink> {
    let bar = indicatif::ProgressBar::new(100);
    bar.set_style(
        indicatif::ProgressStyle::with_template("{msg:>12} [{bar:40}] {pos}/{len}%")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    Arc::new(IndicatifSink { bar })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            if let Some(core_err) = e.downcast_ref::<subforge::error::CoreError>() {
                error!("{}", core_err);
                core_err.exit_code()
            } else {
                error!("{}", e);
                1
            }
        }
    };
    std::process::exit(exit_code);
}

/// Registers an operation, wiring its cancellation token to Ctrl+C and its
/// progress sink into the registry's heartbeat rebroadcast, and returns the
/// bits each subcommand needs. The CLI only ever runs one operation per
/// invocation, but routing it through the registry keeps the bookkeeping
/// path exercised for the library's multi-operation desktop callers.
async fn begin_operation(
    registry: &Arc<OperationRegistry>,
    op_id: &str,
    temp_dir: PathBuf,
) -> (CancellationToken, Arc<dyn subforge::progress::ProgressSink>) {
    let signal = registry.register(op_id.to_string(), temp_dir).await;
    install_ctrlc_handler(signal.clone());
    let sink = progress_sink();
    registry.subscribe(op_id, sink.clone()).await;
    (signal, sink)
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let registry = Arc::new(OperationRegistry::new());
    registry.spawn_heartbeat();

    match cli.command {
        Command::Subtitle { input, output, language, translate_to, output_mode } => {
            config.validate().context("configuration validation failed")?;
            if !input.exists() {
                anyhow::bail!("input file not found: {}", input.display());
            }
            let output_mode: OutputMode = output_mode.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let op_id = format!("subtitle-{}", std::process::id());
            let temp_dir = std::env::temp_dir().join(format!("subforge-{op_id}"));
            let (signal, sink) = begin_operation(&registry, &op_id, temp_dir).await;

            let result = extract_subtitles_from_media(
                &config,
                ExtractOptions {
                    op_id: op_id.clone(),
                    input_path: input.clone(),
                    language: if translate_to.eq_ignore_ascii_case("original") {
                        language
                    } else {
                        Some(translate_to)
                    },
                    output_mode,
                    signal,
                    sink,
                },
            )
            .await;
            registry.complete(&op_id).await;
            let srt = result?;

            let output_path = output.unwrap_or_else(|| input.with_extension("srt"));
            write_output(&output_path, srt.as_bytes()).await.context("failed to write SRT output")?;
            info!("wrote {}", output_path.display());
            Ok(())
        }
        Command::Translate { input, output, target_language } => {
            let srt_text = tokio::fs::read_to_string(&input).await.context("failed to read input SRT")?;
            let op_id = format!("translate-{}", std::process::id());
            let temp_dir = std::env::temp_dir().join(format!("subforge-{op_id}"));
            let (signal, sink) = begin_operation(&registry, &op_id, temp_dir).await;

            let result = translate_srt(
                &srt_text,
                &config,
                TranslateSrtOptions { op_id: op_id.clone(), target_language, signal, sink },
            )
            .await;
            registry.complete(&op_id).await;
            let translated = result?;

            let output_path = output.unwrap_or_else(|| input.with_extension("translated.srt"));
            write_output(&output_path, translated.as_bytes()).await.context("failed to write translated SRT")?;
            info!("wrote {}", output_path.display());
            Ok(())
        }
        Command::Overlay { input, srt, output, vertical, png_mode } => {
            let srt_text = tokio::fs::read_to_string(&srt).await.context("failed to read SRT")?;
            let op_id = format!("overlay-{}", std::process::id());
            let temp_dir = std::env::temp_dir().join(format!("subforge-render-{op_id}"));
            let (signal, _sink) = begin_operation(&registry, &op_id, temp_dir).await;
            let mode = if png_mode { RenderMode::PngOverlay } else { RenderMode::AssBurnIn };
            let renderer = subforge::overlay::StubPngRenderer;
            let png_renderer: Option<&dyn subforge::overlay::PngRenderer> =
                if png_mode { Some(&renderer) } else { None };

            let result = render_overlay(
                &config,
                RenderOverlayOptions {
                    op_id: op_id.clone(),
                    input_path: input,
                    srt: srt_text,
                    output_path: output,
                    mode,
                    style: StylePreset::default(),
                    vertical_9x16: vertical,
                    signal,
                },
                png_renderer,
            )
            .await;
            registry.complete(&op_id).await;
            let output_path = result?;
            info!("wrote {}", output_path.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_subtitle_subcommand() {
        let cli = Cli::parse_from(["subforge", "subtitle", "video.mp4"]);
        match cli.command {
            Command::Subtitle { input, .. } => assert_eq!(input, PathBuf::from("video.mp4")),
            _ => panic!("expected subtitle subcommand"),
        }
    }
}
