//! Audio pipelines: full analysis of new recordings, and re-tagging of
//! finished recordings whose tracks carry no automatic tag.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use faunaproc_core::api::ApiClient;
use faunaproc_core::command;
use faunaproc_core::config::Config;
use faunaproc_core::types::{Job, Recording};

use crate::{DOWNLOAD_STEM, audio_extension, render, write_recording_sidecar};

/// Recordings are analysed at 48 kHz; frequency bounds normalise against
/// the Nyquist frequency.
const NYQUIST_HZ: f64 = 24_000.0;

#[derive(Debug, Deserialize)]
struct AudioOutput {
    analysis_result: AudioAnalysis,
}

#[derive(Debug, Deserialize)]
struct AudioAnalysis {
    #[serde(default)]
    species_identify: Vec<Segment>,
    #[serde(default)]
    cacophony_index: Option<Value>,
    #[serde(default)]
    cacophony_index_version: Option<Value>,
    #[serde(default)]
    species_identify_version: Option<Value>,
    #[serde(default)]
    region_code: Option<Value>,
    #[serde(default)]
    chirps: Option<Value>,
}

/// One detected segment of the recording.
#[derive(Debug, Deserialize)]
struct Segment {
    /// Set when re-analysing existing tracks.
    #[serde(default)]
    track_id: Option<u64>,
    #[serde(default)]
    begin_s: f64,
    #[serde(default)]
    end_s: f64,
    #[serde(default)]
    freq_start: Option<f64>,
    #[serde(default)]
    freq_end: Option<f64>,
    #[serde(default)]
    predictions: Vec<SegmentPrediction>,
}

#[derive(Debug, Deserialize)]
struct SegmentPrediction {
    #[serde(default)]
    species: Vec<String>,
    #[serde(default)]
    likelihood: Vec<f64>,
    #[serde(default)]
    raw_tag: Option<String>,
    #[serde(default)]
    raw_confidence: Option<f64>,
    #[serde(default)]
    model: Option<String>,
}

impl SegmentPrediction {
    /// The most likely species, with its likelihood. Ties keep the first.
    fn best_species(&self) -> Option<(&str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for (species, &likelihood) in self.species.iter().zip(&self.likelihood) {
            match best {
                Some((_, top)) if likelihood <= top => {}
                _ => best = Some((species, likelihood)),
            }
        }
        best
    }
}

/// Analyse an audio recording: create a track per detected segment, tag it
/// per model, elect a master tag, and surface the analysis summary into the
/// recording metadata.
pub(crate) async fn analyse(job: Job, config: Arc<Config>) -> anyhow::Result<()> {
    let mut api =
        ApiClient::connect(&config.api_url, &config.api_user, &config.api_password).await?;
    let Job {
        recording,
        raw_jwt,
        job_key,
    } = job;

    let Some(extension) = recording
        .raw_mime_type
        .as_deref()
        .and_then(audio_extension)
    else {
        return pass_through_unsupported(&mut api, &recording, &job_key).await;
    };

    let workdir = tempfile::tempdir_in(&config.temp_dir).context("creating work directory")?;
    let source = workdir
        .path()
        .join(DOWNLOAD_STEM)
        .with_extension(extension);
    debug!("downloading recording");
    api.download_file(&raw_jwt, &source).await?;
    write_recording_sidecar(&recording, &[], &source).await?;

    let analysis = run_analysis(&config, &source, false).await?;
    let algorithm_id = api
        .get_algorithm_id(&json!({ "algorithm": config.audio.analysis_tag }))
        .await?;

    for segment in &analysis.species_identify {
        let position = segment_position(segment, recording.duration);
        let track = json!({
            "start_s": segment.begin_s,
            "end_s": segment.end_s,
            "positions": [position],
        });
        let track_id = api.add_track(recording.id, &track, algorithm_id).await?;
        tag_segment(&mut api, &config, recording.id, track_id, segment).await?;
    }

    let metadata = analysis_metadata(&analysis);
    api.report_done(recording.id, &job_key, None, None, Some(metadata))
        .await?;
    info!("finished audio analysis");
    Ok(())
}

/// Re-analyse a finished recording, tagging only the tracks that have no
/// automatic tag yet.
pub(crate) async fn reanalyse_tracks(job: Job, config: Arc<Config>) -> anyhow::Result<()> {
    let mut api =
        ApiClient::connect(&config.api_url, &config.api_user, &config.api_password).await?;
    let Job {
        recording,
        raw_jwt,
        job_key,
    } = job;

    let Some(extension) = recording
        .raw_mime_type
        .as_deref()
        .and_then(audio_extension)
    else {
        return pass_through_unsupported(&mut api, &recording, &job_key).await;
    };

    let track_info = api.get_track_info(recording.id).await?;
    let untagged: Vec<_> = track_info
        .iter()
        .filter(|t| !t.has_automatic_tag())
        .cloned()
        .collect();
    if untagged.is_empty() {
        info!("every track already has an automatic tag");
        api.report_done(recording.id, &job_key, None, None, None)
            .await?;
        return Ok(());
    }
    let wanted: HashSet<u64> = untagged.iter().map(|t| t.id).collect();

    let workdir = tempfile::tempdir_in(&config.temp_dir).context("creating work directory")?;
    let source = workdir
        .path()
        .join(DOWNLOAD_STEM)
        .with_extension(extension);
    debug!("downloading recording");
    api.download_file(&raw_jwt, &source).await?;
    write_recording_sidecar(&recording, &untagged, &source).await?;

    let analysis = run_analysis(&config, &source, true).await?;
    for segment in &analysis.species_identify {
        let Some(track_id) = segment.track_id else {
            continue;
        };
        if !wanted.contains(&track_id) {
            continue;
        }
        tag_segment(&mut api, &config, recording.id, track_id, segment).await?;
    }

    api.report_done(recording.id, &job_key, None, None, None)
        .await?;
    info!(tracks = wanted.len(), "finished re-tagging tracks");
    Ok(())
}

async fn run_analysis(
    config: &Config,
    source: &Path,
    analyse_tracks: bool,
) -> anyhow::Result<AudioAnalysis> {
    let folder = source
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let basename = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let command_line = render(
        &config.audio.analysis_command,
        &[
            ("folder", folder),
            ("basename", basename),
            ("tag", config.audio.analysis_tag.clone()),
            ("analyse_tracks", analyse_tracks.to_string()),
        ],
    );
    info!(command = %command_line, "analysing audio");
    let output: AudioOutput = command::run_for_json(
        &command_line,
        &source.with_extension("txt"),
        config.subprocess_timeout(),
    )
    .await
    .context("audio analysis failed")?;
    Ok(output.analysis_result)
}

/// Post one tag per model prediction, then the master tag for the
/// highest-confidence one.
async fn tag_segment(
    api: &mut ApiClient,
    config: &Config,
    recording_id: u64,
    track_id: u64,
    segment: &Segment,
) -> anyhow::Result<()> {
    let mut best: Option<(&str, f64, &SegmentPrediction)> = None;
    for prediction in &segment.predictions {
        let Some((species, likelihood)) = prediction.best_species() else {
            continue;
        };
        let mut data = Map::new();
        data.insert("name".to_string(), json!(prediction.model));
        if let Some(raw_tag) = &prediction.raw_tag {
            data.insert("raw_tag".to_string(), json!(raw_tag));
        }
        if let Some(raw_confidence) = prediction.raw_confidence {
            data.insert("raw_confidence".to_string(), json!(raw_confidence));
        }
        api.add_track_tag(
            recording_id,
            track_id,
            species,
            likelihood,
            &Value::Object(data),
        )
        .await?;

        match best {
            Some((_, top, _)) if likelihood <= top => {}
            _ => best = Some((species, likelihood, prediction)),
        }
    }

    if let Some((species, likelihood, prediction)) = best {
        let data = json!({
            "name": config.thermal.master_tag,
            "model_used": prediction.model,
        });
        api.add_track_tag(recording_id, track_id, species, likelihood, &data)
            .await?;
    }
    Ok(())
}

/// Normalised position rectangle for a detected segment: time maps onto x
/// and frequency onto y, both in [0, 1] and rounded to two decimals.
fn segment_position(segment: &Segment, duration: Option<f64>) -> Value {
    let duration = duration.unwrap_or(0.0);
    let (x, width) = if duration > 0.0 {
        (
            round2(segment.begin_s / duration),
            round2((segment.end_s - segment.begin_s) / duration),
        )
    } else {
        (0.0, 1.0)
    };
    let freq_start = segment.freq_start.unwrap_or(0.0);
    let freq_end = segment.freq_end.unwrap_or(NYQUIST_HZ);
    let y = round2(freq_start / NYQUIST_HZ);
    let height = round2((freq_end - freq_start) / NYQUIST_HZ);

    let mut position = json!({
        "x": x,
        "y": y,
        "width": width,
        "height": height,
        "scale": "linear",
    });
    if let Some(freq) = segment.freq_start {
        position["min_freq"] = json!(freq);
    }
    if let Some(freq) = segment.freq_end {
        position["max_freq"] = json!(freq);
    }
    position
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn analysis_metadata(analysis: &AudioAnalysis) -> Value {
    let mut summary = Map::new();
    let fields = [
        ("cacophony_index", &analysis.cacophony_index),
        ("cacophony_index_version", &analysis.cacophony_index_version),
        ("species_identify_version", &analysis.species_identify_version),
        ("region_code", &analysis.region_code),
        ("chirps", &analysis.chirps),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            summary.insert(key.to_string(), value.clone());
        }
    }
    json!({ "additionalMetadata": { "analysis": summary } })
}

/// Unsupported MIME type: report success with the raw file key unchanged so
/// the recording leaves the queue.
async fn pass_through_unsupported(
    api: &mut ApiClient,
    recording: &Recording,
    job_key: &str,
) -> anyhow::Result<()> {
    warn!(mime = ?recording.raw_mime_type, "unsupported mime type, not processing");
    api.report_done(
        recording.id,
        job_key,
        recording.raw_file_key.as_deref(),
        recording.raw_mime_type.as_deref(),
        None,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(begin_s: f64, end_s: f64, freq: Option<(f64, f64)>) -> Segment {
        Segment {
            track_id: None,
            begin_s,
            end_s,
            freq_start: freq.map(|(start, _)| start),
            freq_end: freq.map(|(_, end)| end),
            predictions: Vec::new(),
        }
    }

    #[test]
    fn position_normalises_time_and_frequency() {
        let position = segment_position(&segment(15.0, 30.0, Some((600.0, 1200.0))), Some(60.0));
        assert_eq!(position["x"], 0.25);
        assert_eq!(position["width"], 0.25);
        assert_eq!(position["y"], 0.03);
        assert_eq!(position["height"], 0.03);
        assert_eq!(position["scale"], "linear");
        assert_eq!(position["min_freq"], 600.0);
        assert_eq!(position["max_freq"], 1200.0);
    }

    #[test]
    fn position_covers_everything_without_duration() {
        let position = segment_position(&segment(0.0, 10.0, None), None);
        assert_eq!(position["x"], 0.0);
        assert_eq!(position["width"], 1.0);
        assert_eq!(position["y"], 0.0);
        assert_eq!(position["height"], 1.0);
        assert!(position.get("min_freq").is_none());
    }

    #[test]
    fn best_species_keeps_first_on_ties() {
        let prediction = SegmentPrediction {
            species: vec!["morepork".to_string(), "kiwi".to_string()],
            likelihood: vec![0.8, 0.8],
            raw_tag: None,
            raw_confidence: None,
            model: Some("bird-model".to_string()),
        };
        assert_eq!(prediction.best_species(), Some(("morepork", 0.8)));
    }

    #[test]
    fn mismatched_likelihoods_are_truncated() {
        let prediction = SegmentPrediction {
            species: vec!["morepork".to_string(), "kiwi".to_string()],
            likelihood: vec![0.4],
            raw_tag: None,
            raw_confidence: None,
            model: None,
        };
        assert_eq!(prediction.best_species(), Some(("morepork", 0.4)));
    }
}
