use crate::audio::AudioMetadata;
use crate::cancel::CancellationToken;
use crate::error::{CoreError, Result};
use crate::ffmpeg::{self, FfmpegRunner, RunOptions};
use std::path::Path;
use tracing::info;

/// Extracts a single mono 16kHz PCM WAV from an arbitrary media file into
/// the operation's own temp directory. Guarantees the returned path exists
/// and has non-zero duration.
pub async fn prepare_audio(
    runner: &FfmpegRunner,
    input: &Path,
    output: &Path,
    op_id: &str,
    signal: CancellationToken,
) -> Result<AudioMetadata> {
    if !input.exists() {
        return Err(CoreError::FileNotFound(input.display().to_string()));
    }

    info!(op_id, input = %input.display(), "preparing audio");

    let duration_sec = runner.probe_duration(input).await?;
    if duration_sec <= 0.0 {
        return Err(CoreError::MediaMalformed(
            "probed duration is zero or negative".to_string(),
        ));
    }

    let args = vec![
        "-i".to_string(),
        input.display().to_string(),
        "-vn".to_string(),
        "-acodec".to_string(),
        "pcm_s16le".to_string(),
        "-ar".to_string(),
        "16000".to_string(),
        "-ac".to_string(),
        "1".to_string(),
        output.display().to_string(),
    ];

    runner
        .run(
            &args,
            RunOptions {
                op_id: op_id.to_string(),
                total_duration_sec: Some(duration_sec),
                progress_cb: None,
                signal,
            },
        )
        .await?;

    if !output.exists() {
        return Err(CoreError::MediaMalformed(
            "ffmpeg did not produce an audio output file".to_string(),
        ));
    }

    Ok(AudioMetadata {
        duration_sec,
        sample_rate: 16000,
        channels: 1,
    })
}

pub async fn check_dependencies(ffmpeg_path: &str, ffprobe_path: &str) -> Result<()> {
    ffmpeg::check_binary(ffmpeg_path).await?;
    ffmpeg::check_binary(ffprobe_path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepare_audio_rejects_missing_input() {
        let runner = FfmpegRunner::new("ffmpeg", "ffprobe");
        let result = prepare_audio(
            &runner,
            Path::new("/nonexistent/input.mp4"),
            Path::new("/tmp/never.wav"),
            "op1",
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(CoreError::FileNotFound(_))));
    }
}
