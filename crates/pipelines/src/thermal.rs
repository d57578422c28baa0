//! Thermal and IR video pipelines: tracking/retracking and classification.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context as _;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use faunaproc_core::api::ApiClient;
use faunaproc_core::command;
use faunaproc_core::config::Config;
use faunaproc_core::types::{
    ClassifyResult, Job, Prediction, ProcessingState, Recording, RecordingType, Track,
};
use faunaproc_fusion::{
    ALL_TRACKS_FILTERED, MULTIPLE_ANIMALS, MasterTag, RODENT, TRACKS_LIMITED, filter, master,
    rodent, tagger,
};

use crate::{DOWNLOAD_STEM, render, write_recording_sidecar};

fn raw_extension(kind: RecordingType) -> &'static str {
    match kind {
        RecordingType::IrRaw => "mp4",
        _ => "cptv",
    }
}

fn should_cache(config: &Config, duration: Option<f64>) -> bool {
    match (duration, config.thermal.cache_clips_bigger_than) {
        (Some(duration), Some(threshold)) => duration > threshold,
        _ => false,
    }
}

fn is_wallaby_device(wallaby_devices: &[u64], recording: &Recording) -> bool {
    recording
        .device_id
        .is_some_and(|id| wallaby_devices.contains(&id))
}

/// Track (or retrack) a thermal/IR recording and post the tracks.
pub(crate) async fn tracking(job: Job, config: Arc<Config>) -> anyhow::Result<()> {
    let mut api =
        ApiClient::connect(&config.api_url, &config.api_user, &config.api_password).await?;
    let Job {
        recording,
        raw_jwt,
        job_key,
    } = job;
    let retrack = recording.processing_state == ProcessingState::Retrack;

    let workdir = tempfile::tempdir_in(&config.temp_dir).context("creating work directory")?;
    let source = workdir
        .path()
        .join(DOWNLOAD_STEM)
        .with_extension(raw_extension(recording.kind));
    debug!("downloading recording");
    api.download_file(&raw_jwt, &source).await?;

    if retrack {
        let track_info = api.get_track_info(recording.id).await?;
        write_recording_sidecar(&recording, &track_info, &source).await?;
    }

    let command_line = render(
        &config.thermal.track_cmd,
        &[
            ("source", source.display().to_string()),
            ("cache", should_cache(&config, recording.duration).to_string()),
            ("retrack", retrack.to_string()),
            ("classify_image", config.thermal.classify_image.clone()),
            ("temp_dir", config.temp_dir.display().to_string()),
        ],
    );
    info!(command = %command_line, "tracking");
    let mut result: ClassifyResult = command::run_for_json(
        &command_line,
        &source.with_extension("txt"),
        config.subprocess_timeout(),
    )
    .await
    .context("tracker failed")?;

    for track in &mut result.tracks {
        track.extra.remove("frame_start");
    }

    let algorithm_id = api.get_algorithm_id(&result.algorithm).await?;

    let mut tracks_limited = false;
    if !retrack {
        let candidates: Vec<(&Track, Option<&MasterTag>)> =
            result.tracks.iter().map(|t| (t, None)).collect();
        let dropped = filter::over_cap(&candidates, config.thermal.max_tracks);
        if !dropped.is_empty() {
            info!(dropped = dropped.len(), "too many tracks, keeping the best");
            let drop_set: HashSet<usize> = dropped.into_iter().collect();
            let mut idx = 0;
            result.tracks.retain(|_| {
                let keep = !drop_set.contains(&idx);
                idx += 1;
                keep
            });
            tracks_limited = true;
        }
    }

    for track in &mut result.tracks {
        if retrack {
            let Some(track_id) = track.id else { continue };
            if track.positions.is_empty() {
                api.archive_track(recording.id, track_id).await?;
            } else {
                api.update_track(recording.id, track_id, &serde_json::to_value(&*track)?)
                    .await?;
            }
        } else {
            let track_id = api
                .add_track(recording.id, &serde_json::to_value(&*track)?, algorithm_id)
                .await?;
            track.id = Some(track_id);
        }
    }

    if tracks_limited {
        api.tag_recording(recording.id, TRACKS_LIMITED, &json!({ "event": TRACKS_LIMITED }))
            .await?;
    }

    let mut additional = Map::new();
    additional.insert("algorithm".to_string(), json!(algorithm_id));
    if let Some(tracking_time) = result.tracking_time {
        additional.insert("tracking_time".to_string(), json!(tracking_time));
    }
    if let Some(region) = &result.thumbnail_region {
        additional.insert("thumbnail_region".to_string(), region.clone());
    }
    api.report_done(
        recording.id,
        &job_key,
        None,
        None,
        Some(json!({ "additionalMetadata": additional })),
    )
    .await?;
    info!("finished tracking");
    Ok(())
}

/// Classify a thermal/IR recording's existing tracks and post per-model and
/// master tags.
pub(crate) async fn classify(job: Job, config: Arc<Config>) -> anyhow::Result<()> {
    let mut api =
        ApiClient::connect(&config.api_url, &config.api_user, &config.api_password).await?;
    let Job {
        recording,
        raw_jwt,
        job_key,
    } = job;

    let workdir = tempfile::tempdir_in(&config.temp_dir).context("creating work directory")?;
    let source = workdir
        .path()
        .join(DOWNLOAD_STEM)
        .with_extension(raw_extension(recording.kind));
    debug!("downloading recording");
    api.download_file(&raw_jwt, &source).await?;

    let track_info = api.get_track_info(recording.id).await?;
    write_recording_sidecar(&recording, &track_info, &source).await?;

    let command_line = render(
        &config.thermal.classify_cmd,
        &[
            ("source", source.display().to_string()),
            ("cache", should_cache(&config, recording.duration).to_string()),
            ("classify_image", config.thermal.classify_image.clone()),
            ("temp_dir", config.temp_dir.display().to_string()),
        ],
    );
    info!(command = %command_line, "classifying");
    let mut result: ClassifyResult = command::run_for_json(
        &command_line,
        &source.with_extension("txt"),
        config.subprocess_timeout(),
    )
    .await
    .context("classifier failed")?;

    for track in &mut result.tracks {
        tagger::assess_track(track, &config.thermal.tagging);
    }

    let models = result.models_by_id();
    let wallaby_device = is_wallaby_device(&config.thermal.wallaby_devices, &recording);
    let rat_thresh = match recording.device_id {
        Some(device_id) => {
            api.get_rat_threshold(device_id, recording.recording_date_time.as_deref())
                .await?
        }
        None => None,
    };

    let mut classified: Vec<MasterTag> = Vec::with_capacity(result.tracks.len());
    for track in &result.tracks {
        for prediction in &track.predictions {
            let Some(model) = prediction.model_id.and_then(|id| models.get(&id)) else {
                continue;
            };
            post_track_tag(&mut api, recording.id, track, prediction, &model.name, None, None)
                .await?;
        }

        let mut master_tag = match master::resolve(&track.predictions, &models, wallaby_device) {
            Some((model, prediction)) => MasterTag {
                prediction: prediction.clone(),
                model_used: Some(model.name.clone()),
                rat_thresh_version: None,
            },
            None => MasterTag::unidentified(),
        };

        if master_tag.prediction.tag.as_deref() == Some(RODENT) {
            if let Some(thresh) = &rat_thresh {
                let species = if rodent::is_rat(&track.positions, thresh) {
                    "rat"
                } else {
                    "mouse"
                };
                master_tag.prediction.tag = Some(species.to_string());
                master_tag.rat_thresh_version = Some(thresh.version);
            }
        }

        post_track_tag(
            &mut api,
            recording.id,
            track,
            &master_tag.prediction,
            &config.thermal.master_tag,
            master_tag.model_used.as_deref(),
            master_tag.rat_thresh_version,
        )
        .await?;
        classified.push(master_tag);
    }

    let mut archived = vec![false; result.tracks.len()];
    if config.thermal.filter_false_positive {
        let pairs: Vec<(&Track, &MasterTag)> = result.tracks.iter().zip(&classified).collect();
        let condemned =
            filter::false_positive_tracks(&pairs, config.thermal.false_positive_min_confidence);
        for &idx in &condemned {
            if let Some(track_id) = result.tracks[idx].id {
                api.archive_track(recording.id, track_id).await?;
            }
            archived[idx] = true;
        }
        if !condemned.is_empty() && condemned.len() == result.tracks.len() {
            let confidence = condemned
                .iter()
                .map(|&idx| classified[idx].prediction.confidence)
                .fold(0.0, f64::max);
            info!(confidence, "all tracks filtered as false positives");
            api.tag_recording(
                recording.id,
                ALL_TRACKS_FILTERED,
                &json!({ "event": ALL_TRACKS_FILTERED, "confidence": confidence }),
            )
            .await?;
        }
    }

    let survivors: Vec<usize> = (0..result.tracks.len()).filter(|&i| !archived[i]).collect();
    if survivors.len() > config.thermal.max_tracks {
        let pairs: Vec<(&Track, Option<&MasterTag>)> = survivors
            .iter()
            .map(|&idx| (&result.tracks[idx], Some(&classified[idx])))
            .collect();
        let dropped = filter::over_cap(&pairs, config.thermal.max_tracks);
        info!(dropped = dropped.len(), "too many tracks, keeping the best");
        for &d in &dropped {
            let idx = survivors[d];
            if let Some(track_id) = result.tracks[idx].id {
                api.archive_track(recording.id, track_id).await?;
            }
            archived[idx] = true;
        }
        api.tag_recording(recording.id, TRACKS_LIMITED, &json!({ "event": TRACKS_LIMITED }))
            .await?;
    }

    let remaining: Vec<(&Track, &MasterTag)> = result
        .tracks
        .iter()
        .zip(&classified)
        .enumerate()
        .filter(|(idx, _)| !archived[*idx])
        .map(|(_, pair)| pair)
        .collect();
    let multiple = tagger::multiple_animal_confidence(&remaining);
    if multiple > config.thermal.tagging.min_confidence {
        debug!(confidence = multiple, "multiple animals detected");
        api.tag_recording(
            recording.id,
            MULTIPLE_ANIMALS,
            &json!({ "event": MULTIPLE_ANIMALS, "confidence": multiple }),
        )
        .await?;
    }

    let mut additional = Map::new();
    if let Some(region) = &result.thumbnail_region {
        additional.insert("thumbnail_region".to_string(), region.clone());
    }
    let mut model_info = Map::new();
    for model in &result.models {
        if let Some(classify_time) = model.classify_time {
            model_info.insert(model.name.clone(), json!({ "classify_time": classify_time }));
        }
    }
    additional.insert("models".to_string(), Value::Object(model_info));
    additional.insert("track_count".to_string(), json!(remaining.len()));
    api.report_done(
        recording.id,
        &job_key,
        None,
        None,
        Some(json!({ "additionalMetadata": additional })),
    )
    .await?;
    info!("finished classifying");
    Ok(())
}

/// Post one prediction as a track tag. Predictions without a tag (and
/// tracks the service has not assigned an id) are skipped.
async fn post_track_tag(
    api: &mut ApiClient,
    recording_id: u64,
    track: &Track,
    prediction: &Prediction,
    name: &str,
    model_used: Option<&str>,
    rat_thresh_version: Option<i64>,
) -> anyhow::Result<bool> {
    let (Some(track_id), Some(tag)) = (track.id, prediction.tag.as_deref()) else {
        return Ok(false);
    };

    let mut data = Map::new();
    data.insert("name".to_string(), json!(name));
    if let Some(model_used) = model_used {
        data.insert("model_used".to_string(), json!(model_used));
    }
    if let Some(classify_time) = prediction.classify_time {
        data.insert("classify_time".to_string(), json!(classify_time));
    }
    data.insert("clarity".to_string(), json!(prediction.clarity));
    if let Some(confidences) = &prediction.all_class_confidences {
        data.insert("all_class_confidences".to_string(), confidences.clone());
    }
    if let Some(predictions) = &prediction.predictions {
        data.insert("predictions".to_string(), predictions.clone());
    }
    if let Some(frames) = &prediction.prediction_frames {
        data.insert("prediction_frames".to_string(), frames.clone());
    }
    if let Some(message) = &prediction.message {
        data.insert("message".to_string(), json!(message));
    }
    if let Some(label) = &prediction.label {
        data.insert("raw_tag".to_string(), json!(label));
    }
    if let Some(version) = rat_thresh_version {
        data.insert("rat_thresh_version".to_string(), json!(version));
    }

    debug!(name, tag, track = track_id, "adding track tag");
    api.add_track_tag(
        recording_id,
        track_id,
        tag,
        prediction.confidence,
        &Value::Object(data),
    )
    .await?;
    Ok(true)
}
