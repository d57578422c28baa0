#![forbid(unsafe_code)]

//! Per-recording-type job handlers. Each handler runs inside one worker
//! task: it downloads the raw artifact into a scoped temp directory, drives
//! the external tracker/classifier, fuses the output into tags, and posts
//! the results back to the service.

mod audio;
mod thermal;
mod trailcam;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Value, json};

use faunaproc_core::config::Config;
use faunaproc_core::types::{Job, Recording, TrackInfo};

/// The processing workflows a processor can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    /// Thermal/IR tracking and retracking.
    ThermalTracking,
    /// Thermal/IR classification over existing tracks.
    ThermalClassify,
    /// Audio analysis for analyse/reprocess states.
    AudioAnalysis,
    /// Audio re-tagging of finished recordings with untagged tracks.
    AudioTrackAnalysis,
    /// Trailcam image detection.
    TrailcamImage,
}

impl Pipeline {
    /// Short name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Pipeline::ThermalTracking => "tracking",
            Pipeline::ThermalClassify => "classify",
            Pipeline::AudioAnalysis => "audio.analysis",
            Pipeline::AudioTrackAnalysis => "audio.tracks",
            Pipeline::TrailcamImage => "trail.analysis",
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Run one job to completion. Called from a worker task; any error is
/// reported back to the service as a job failure by the processor.
pub async fn run(pipeline: Pipeline, job: Job, config: Arc<Config>) -> anyhow::Result<()> {
    match pipeline {
        Pipeline::ThermalTracking => thermal::tracking(job, config).await,
        Pipeline::ThermalClassify => thermal::classify(job, config).await,
        Pipeline::AudioAnalysis => audio::analyse(job, config).await,
        Pipeline::AudioTrackAnalysis => audio::reanalyse_tracks(job, config).await,
        Pipeline::TrailcamImage => trailcam::analyse(job, config).await,
    }
}

pub(crate) const DOWNLOAD_STEM: &str = "recording";

/// Substitute `{key}` placeholders in a command template.
pub(crate) fn render(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Write the recording (and any existing tracks) as the sidecar JSON the
/// classifier reads from beside the input file. Returns the sidecar path,
/// which is also where the classifier writes its result.
pub(crate) async fn write_recording_sidecar(
    recording: &Recording,
    tracks: &[TrackInfo],
    source: &Path,
) -> anyhow::Result<PathBuf> {
    let mut doc = serde_json::to_value(recording)?;
    doc["filename"] = json!(source.display().to_string());
    doc["tracks"] = Value::Array(tracks.iter().map(TrackInfo::sidecar_json).collect());
    let sidecar = source.with_extension("txt");
    tokio::fs::write(&sidecar, serde_json::to_vec(&doc)?).await?;
    Ok(sidecar)
}

/// File extension for the audio MIME types the analysis container accepts.
pub(crate) fn audio_extension(mime: &str) -> Option<&'static str> {
    match mime {
        "audio/mp4" | "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "video/3gpp" | "audio/3gpp" => Some("3gpp"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/x-flac" | "audio/flac" => Some("flac"),
        "audio/ogg" => Some("ogg"),
        _ => None,
    }
}

/// File extension for supported trailcam image MIME types.
pub(crate) fn image_extension(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_every_placeholder() {
        let command = render(
            "classify {source} --cache {cache} --image {classify_image}",
            &[
                ("source", "/tmp/recording.cptv".to_string()),
                ("cache", "false".to_string()),
                ("classify_image", "classifier:latest".to_string()),
            ],
        );
        assert_eq!(
            command,
            "classify /tmp/recording.cptv --cache false --image classifier:latest"
        );
    }

    #[test]
    fn unknown_mime_types_are_unsupported() {
        assert_eq!(audio_extension("audio/mp4"), Some("mp3"));
        assert_eq!(audio_extension("application/pdf"), None);
        assert_eq!(image_extension("image/jpeg"), Some("jpg"));
        assert_eq!(image_extension("video/mp4"), None);
    }
}
