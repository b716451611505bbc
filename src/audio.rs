//! External media tool plumbing.
//!
//! Everything here shells out to yt-dlp, ffmpeg, and ffprobe; no media is
//! decoded in-process. Tool failures are classified into the retry
//! taxonomy here, so stage workers only see `InvalidInput` (the caller's
//! URL or file is bad), retriable `Network` trouble, or tool errors.

use crate::error::{HarkError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, instrument};

/// Probed properties of an audio file.
#[derive(Debug, Clone, Copy)]
pub struct AudioProbe {
    pub duration_secs: f64,
    pub sample_rate: Option<u32>,
}

/// Run an external tool to completion. A missing binary maps to
/// `ToolNotFound`; spawn failures map to `ToolFailed`. Exit status is left
/// for the caller to interpret against its own taxonomy.
async fn run_tool(tool: &str, args: &[&str]) -> Result<std::process::Output> {
    debug!("Running {} with {} args", tool, args.len());

    match Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(output) => Ok(output),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(HarkError::ToolNotFound(tool.into()))
        }
        Err(e) => Err(HarkError::ToolFailed(format!("{tool} failed to spawn: {e}"))),
    }
}

/// Stderr trimmed to one log-friendly line.
fn stderr_summary(output: &std::process::Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let line = text.lines().last().unwrap_or("").trim();
    let mut summary: String = line.chars().take(300).collect();
    if summary.is_empty() {
        summary = format!("exit status {}", output.status);
    }
    summary
}

/// Downloader output that means the URL itself is unusable. Anything not
/// matched is treated as transient and retried.
const FATAL_FETCH_MARKERS: &[&str] = &[
    "is not a valid URL",
    "Unsupported URL",
    "HTTP Error 404",
    "HTTP Error 410",
    "Video unavailable",
    "Private video",
    "This video is not available",
];

fn classify_fetch_failure(url: &str, stderr: &str) -> HarkError {
    if FATAL_FETCH_MARKERS.iter().any(|m| stderr.contains(m)) {
        HarkError::InvalidInput(format!("source rejected: {url} ({stderr})"))
    } else {
        HarkError::Network(format!("media fetch failed for {url}: {stderr}"))
    }
}

/// Fetch best-audio from a remote URL as MP3 at the target path.
///
/// The downloader is asked to print the path it actually wrote
/// (`--print after_move:filepath`), so no guessing at extensions is
/// needed; whatever lands outside the target is moved into place.
#[instrument(skip(target), fields(url = %url))]
pub async fn fetch_remote_audio(url: &str, target: &Path) -> Result<PathBuf> {
    let dir = target
        .parent()
        .ok_or_else(|| HarkError::InvalidInput(format!("no parent directory for {:?}", target)))?;
    std::fs::create_dir_all(dir)?;

    if target.exists() {
        info!("Audio already fetched, reusing");
        return Ok(target.to_path_buf());
    }

    let stem = target
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("audio");
    let template = dir.join(format!("{stem}.%(ext)s"));
    let template = template.to_string_lossy();

    let args = [
        "--no-playlist",
        "--no-warnings",
        "--no-progress",
        "-f",
        "bestaudio/best",
        "-x",
        "--audio-format",
        "mp3",
        "-o",
        &template,
        "--no-simulate",
        "--print",
        "after_move:filepath",
        url,
    ];

    info!("Fetching audio");
    let output = run_tool("yt-dlp", &args).await?;

    if !output.status.success() {
        return Err(classify_fetch_failure(url, &stderr_summary(&output)));
    }

    // The reported path is authoritative; fall back to the expected target
    // if the tool printed nothing (old versions).
    let reported = String::from_utf8_lossy(&output.stdout);
    let produced = reported
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.exists())
        .unwrap_or_else(|| target.to_path_buf());

    if !produced.exists() {
        return Err(HarkError::Network(format!(
            "downloader reported success but produced no file for {url}"
        )));
    }

    if produced != target {
        if produced.extension().and_then(|e| e.to_str()) == Some("mp3") {
            std::fs::rename(&produced, target)?;
        } else {
            transcode_to_mp3(&produced, target).await?;
            let _ = std::fs::remove_file(&produced);
        }
    }

    Ok(target.to_path_buf())
}

/// Re-encode any audio container to MP3.
pub async fn transcode_to_mp3(source: &Path, dest: &Path) -> Result<()> {
    debug!("Transcoding {:?} to MP3", source);

    let source_str = source.to_string_lossy();
    let dest_str = dest.to_string_lossy();
    let args = [
        "-y",
        "-nostdin",
        "-loglevel",
        "error",
        "-i",
        &source_str,
        "-vn",
        "-acodec",
        "libmp3lame",
        "-q:a",
        "3",
        &dest_str,
    ];

    let output = run_tool("ffmpeg", &args).await?;
    if !output.status.success() {
        return Err(HarkError::AudioDownload(format!(
            "transcode of {:?} failed: {}",
            source,
            stderr_summary(&output)
        )));
    }
    Ok(())
}

#[derive(Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    sample_rate: Option<String>,
}

/// Query duration and the audio stream's sample rate.
#[instrument(skip_all)]
pub async fn probe_audio(path: &Path) -> Result<AudioProbe> {
    let path_str = path.to_string_lossy();
    let args = [
        "-v",
        "error",
        "-of",
        "json",
        "-show_entries",
        "format=duration:stream=codec_type,sample_rate",
        &path_str,
    ];

    let output = run_tool("ffprobe", &args).await?;
    if !output.status.success() {
        return Err(HarkError::CorruptArtifact {
            stage: "downloading".into(),
            message: format!("unreadable audio file: {}", stderr_summary(&output)),
        });
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| HarkError::ToolFailed(format!("ffprobe output unparsable: {e}")))?;

    let duration_secs = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| HarkError::CorruptArtifact {
            stage: "downloading".into(),
            message: "audio file has no readable duration".into(),
        })?;

    let sample_rate = parsed
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("audio"))
        .find_map(|s| s.sample_rate.as_deref().and_then(|r| r.parse().ok()));

    Ok(AudioProbe {
        duration_secs,
        sample_rate,
    })
}

/// Split a long audio file into pieces of roughly `segment_secs` each,
/// using ffmpeg's segment muxer in a single pass. Returns
/// (piece_path, offset_seconds) pairs ordered by offset; audio at or under
/// the threshold comes back as one entry pointing at the original.
#[instrument(skip_all)]
pub async fn split_audio(
    source: &Path,
    output_dir: &Path,
    segment_secs: u32,
) -> Result<Vec<(PathBuf, f64)>> {
    std::fs::create_dir_all(output_dir)?;

    let piece_len = segment_secs.max(1) as f64;
    let total = probe_audio(source).await?.duration_secs;
    if total <= piece_len {
        return Ok(vec![(source.to_path_buf(), 0.0)]);
    }

    let pattern = output_dir.join("piece_%05d.mp3");
    let source_str = source.to_string_lossy();
    let pattern_str = pattern.to_string_lossy();
    let segment_time = segment_secs.max(1).to_string();
    let args = [
        "-y",
        "-nostdin",
        "-loglevel",
        "error",
        "-i",
        &source_str,
        "-vn",
        "-acodec",
        "libmp3lame",
        "-q:a",
        "3",
        "-f",
        "segment",
        "-segment_time",
        &segment_time,
        "-reset_timestamps",
        "1",
        &pattern_str,
    ];

    let output = run_tool("ffmpeg", &args).await?;
    if !output.status.success() {
        return Err(HarkError::AudioDownload(format!(
            "segmenting {:?} failed: {}",
            source,
            stderr_summary(&output)
        )));
    }

    // Collect the pieces the muxer wrote; their index encodes the offset.
    let mut pieces: Vec<(u32, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(output_dir)?.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(index) = name
            .strip_prefix("piece_")
            .and_then(|rest| rest.strip_suffix(".mp3"))
            .and_then(|digits| digits.parse::<u32>().ok())
        {
            pieces.push((index, path));
        }
    }
    pieces.sort_by_key(|(index, _)| *index);

    if pieces.is_empty() {
        return Err(HarkError::AudioDownload(format!(
            "segmenting {:?} produced no output",
            source
        )));
    }

    info!("Split audio into {} pieces", pieces.len());
    Ok(pieces
        .into_iter()
        .map(|(index, path)| (path, index as f64 * piece_len))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_fetch_markers_map_to_invalid_input() {
        let err = classify_fetch_failure("https://example/x", "ERROR: Video unavailable");
        assert!(matches!(err, HarkError::InvalidInput(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_unrecognized_fetch_failures_are_retriable() {
        let err = classify_fetch_failure("https://example/x", "Connection reset by peer");
        assert!(matches!(err, HarkError::Network(_)));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_probe_output_parsing() {
        let json = br#"{
            "format": { "duration": "12.500000" },
            "streams": [
                { "codec_type": "video" },
                { "codec_type": "audio", "sample_rate": "44100" }
            ]
        }"#;
        let parsed: ProbeOutput = serde_json::from_slice(json).unwrap();
        let duration: f64 = parsed.format.unwrap().duration.unwrap().parse().unwrap();
        assert_eq!(duration, 12.5);
        let rate: u32 = parsed
            .streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some("audio"))
            .find_map(|s| s.sample_rate.as_deref().and_then(|r| r.parse().ok()))
            .unwrap();
        assert_eq!(rate, 44100);
    }
}
