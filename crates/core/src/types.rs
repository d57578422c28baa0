//! Data model shared between the recording service, the classifier
//! subprocess and the pipeline handlers.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// The kinds of recording the service hands out work for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordingType {
    #[serde(rename = "thermalRaw")]
    ThermalRaw,
    #[serde(rename = "irRaw")]
    IrRaw,
    #[serde(rename = "audio")]
    Audio,
    #[serde(rename = "trailcam-image")]
    TrailcamImage,
}

impl RecordingType {
    /// The service's wire name for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordingType::ThermalRaw => "thermalRaw",
            RecordingType::IrRaw => "irRaw",
            RecordingType::Audio => "audio",
            RecordingType::TrailcamImage => "trailcam-image",
        }
    }
}

impl fmt::Display for RecordingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing states a recording moves through on the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingState {
    #[serde(rename = "tracking")]
    Tracking,
    #[serde(rename = "retrack")]
    Retrack,
    #[serde(rename = "analyse")]
    Analyse,
    #[serde(rename = "reprocess")]
    Reprocess,
    #[serde(rename = "toMp3")]
    ToMp3,
    #[serde(rename = "FINISHED")]
    Finished,
}

impl ProcessingState {
    /// The service's wire name for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingState::Tracking => "tracking",
            ProcessingState::Retrack => "retrack",
            ProcessingState::Analyse => "analyse",
            ProcessingState::Reprocess => "reprocess",
            ProcessingState::ToMp3 => "toMp3",
            ProcessingState::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work handed out by the processing queue.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    /// The recording to process.
    pub recording: Recording,
    /// Signed token for downloading the raw artifact.
    #[serde(rename = "rawJWT")]
    pub raw_jwt: String,
    /// Opaque token identifying this dispatch; echoed back on completion so
    /// the service can de-duplicate reports.
    #[serde(rename = "jobKey")]
    pub job_key: String,
}

/// The worker's transient view of a recording, held for the lifetime of one
/// job. Fields the worker does not interpret are preserved in `extra` and
/// round-trip verbatim into the classifier sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: RecordingType,
    #[serde(rename = "processingState")]
    pub processing_state: ProcessingState,
    #[serde(rename = "DeviceId", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<u64>,
    #[serde(rename = "recordingDateTime", skip_serializing_if = "Option::is_none")]
    pub recording_date_time: Option<String>,
    /// Duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(rename = "rawMimeType", skip_serializing_if = "Option::is_none")]
    pub raw_mime_type: Option<String>,
    #[serde(rename = "rawFileKey", skip_serializing_if = "Option::is_none")]
    pub raw_file_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single frame-level bounding box within a track.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub mass: f64,
    #[serde(default)]
    pub blank: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A spatio-temporal segment of a recording, as produced by the tracker.
///
/// `id` is assigned by the service when the track is first posted; tracks
/// parsed back from a retrack/reprocess run carry the service's id already.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Track {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub start_s: f64,
    #[serde(default)]
    pub end_s: f64,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predictions: Vec<Prediction>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One model's opinion about one track.
///
/// `tag` is either absent, `unidentified`, or a species/category label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(default)]
    pub tag: Option<String>,
    /// The model's raw label, before any demotion.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub clarity: f64,
    #[serde(default)]
    pub average_novelty: f64,
    #[serde(default)]
    pub all_class_confidences: Option<Value>,
    /// Per-class confidence rows, forwarded verbatim.
    #[serde(default)]
    pub predictions: Option<Value>,
    #[serde(default)]
    pub prediction_frames: Option<Value>,
    #[serde(default)]
    pub classify_time: Option<f64>,
    /// Why the prediction was demoted, when it was.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub model_id: Option<i64>,
}

/// Static descriptor of one classifier model, reported by the subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: i64,
    pub name: String,
    pub model_file: String,
    /// Only considered for master tags on wallaby devices.
    #[serde(default)]
    pub wallaby: bool,
    /// Submodels never win a master tag on their own; a parent model
    /// delegates to them through `reclassify`.
    #[serde(default)]
    pub submodel: bool,
    /// Label -> submodel id to substitute when the parent emits that label.
    #[serde(default)]
    pub reclassify: Option<HashMap<String, i64>>,
    #[serde(default)]
    pub ignored_tags: Vec<String>,
    /// Per-label master-tag scores; the `default` entry is mandatory.
    #[serde(default)]
    pub tag_scores: HashMap<String, i64>,
    #[serde(default)]
    pub classify_time: Option<f64>,
}

/// Parsed output of one tracker/classifier invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyResult {
    /// Tracking algorithm descriptor, registered with the service to obtain
    /// an algorithm id.
    #[serde(default)]
    pub algorithm: Value,
    #[serde(default)]
    pub tracking_time: Option<f64>,
    #[serde(default)]
    pub thumbnail_region: Option<Value>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub tracks: Vec<Track>,
}

impl ClassifyResult {
    /// Index the reported models by id.
    pub fn models_by_id(&self) -> HashMap<i64, ModelConfig> {
        self.models.iter().map(|m| (m.id, m.clone())).collect()
    }
}

/// Per-device grid of mass thresholds used to split `rodent` into rat/mouse.
#[derive(Debug, Clone, Deserialize)]
pub struct RatThreshold {
    /// Grid cell size in pixels.
    #[serde(rename = "gridSize")]
    pub grid_size: f64,
    pub version: i64,
    /// Row-major per-cell thresholds; `None` means no data for that cell.
    pub thresholds: Vec<Vec<Option<f64>>>,
}

/// A track as returned by the service's track listing.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackInfo {
    pub id: u64,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    #[serde(default)]
    pub positions: Value,
    #[serde(default)]
    pub tags: Vec<TrackTagInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TrackInfo {
    /// Whether any existing tag on this track was applied automatically.
    pub fn has_automatic_tag(&self) -> bool {
        self.tags.iter().any(|t| t.automatic)
    }

    /// The track as the classifier sidecar expects it, with the service's
    /// `start`/`end` field names normalised to `start_s`/`end_s`.
    pub fn sidecar_json(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("id".to_string(), json!(self.id));
        doc.insert("start_s".to_string(), json!(self.start));
        doc.insert("end_s".to_string(), json!(self.end));
        doc.insert("positions".to_string(), self.positions.clone());
        for (key, value) in &self.extra {
            doc.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Value::Object(doc)
    }
}

/// An existing tag on a service-side track.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackTagInfo {
    #[serde(default)]
    pub what: Option<String>,
    #[serde(default)]
    pub automatic: bool,
    #[serde(default)]
    pub data: Option<Value>,
}
