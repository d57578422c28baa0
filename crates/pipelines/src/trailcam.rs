//! Trailcam image pipeline: run the external detector over a still image
//! and post one track per detection.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use faunaproc_core::api::ApiClient;
use faunaproc_core::command;
use faunaproc_core::config::Config;
use faunaproc_core::types::Job;

use crate::{image_extension, render};

#[derive(Debug, Deserialize)]
struct DetectorOutput {
    #[serde(default)]
    images: Vec<DetectorImage>,
    #[serde(default)]
    detection_categories: HashMap<String, String>,
    info: DetectorInfo,
}

#[derive(Debug, Deserialize)]
struct DetectorImage {
    #[serde(default)]
    detections: Vec<Detection>,
}

#[derive(Debug, Deserialize)]
struct Detection {
    /// Normalised `[x, top, width, height]` with a top-left origin.
    bbox: Vec<f64>,
    category: String,
    conf: f64,
}

#[derive(Debug, Deserialize)]
struct DetectorInfo {
    detector_metadata: Value,
}

pub(crate) async fn analyse(job: Job, config: Arc<Config>) -> anyhow::Result<()> {
    let Some(trail) = &config.trailcam else {
        anyhow::bail!("trailcam pipeline is not configured");
    };
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
        .and_then(image_extension)
    else {
        warn!(mime = ?recording.raw_mime_type, "unsupported mime type, not processing");
        api.report_done(
            recording.id,
            &job_key,
            recording.raw_file_key.as_deref(),
            recording.raw_mime_type.as_deref(),
            None,
        )
        .await?;
        return Ok(());
    };

    let workdir = tempfile::tempdir_in(&config.temp_dir).context("creating work directory")?;
    let source = workdir
        .path()
        .join(format!("recording-{}", recording.id))
        .with_extension(extension);
    debug!("downloading trail image");
    api.download_file(&raw_jwt, &source).await?;

    let outfile = source.with_extension("json");
    let command_line = render(
        &trail.run_cmd,
        &[
            (
                "folder",
                source
                    .parent()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            (
                "basename",
                source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ),
            (
                "outfile",
                outfile
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ),
        ],
    );
    info!(command = %command_line, "detecting");
    let output: DetectorOutput =
        command::run_for_json(&command_line, &outfile, config.subprocess_timeout())
            .await
            .context("trail detector failed")?;

    let image = output
        .images
        .first()
        .context("detector returned no image results")?;
    let algorithm_id = api
        .get_algorithm_id(&json!({ "algorithm": output.info.detector_metadata }))
        .await?;

    for detection in &image.detections {
        let &[x, top, width, height] = detection.bbox.as_slice() else {
            warn!(bbox = ?detection.bbox, "detection with a malformed bbox");
            continue;
        };
        // Detector boxes are top-left origin; tracks are bottom-left.
        let y = 1.0 - (top + height);
        let track = json!({
            "start_s": 0,
            "end_s": 0,
            "positions": [{ "x": x, "y": y, "width": width, "height": height }],
        });
        let track_id = api.add_track(recording.id, &track, algorithm_id).await?;

        let Some(tag) = output.detection_categories.get(&detection.category) else {
            warn!(category = %detection.category, "detection with an unknown category");
            continue;
        };
        api.add_track_tag(
            recording.id,
            track_id,
            tag,
            detection.conf,
            &json!({ "name": config.thermal.master_tag }),
        )
        .await?;
    }

    api.report_done(recording.id, &job_key, None, None, None)
        .await?;
    info!(detections = image.detections.len(), "finished trail image");
    Ok(())
}
