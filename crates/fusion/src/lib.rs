#![forbid(unsafe_code)]

//! Fusion of multi-model classifier output into canonical decisions: the
//! per-prediction tagger, master-tag election, rodent disambiguation and
//! the post-classification track filters.

pub mod filter;
pub mod master;
pub mod rodent;
pub mod tagger;

use faunaproc_core::types::Prediction;

/// Tag emitted when no model can make a confident call.
pub const UNIDENTIFIED: &str = "unidentified";
/// Tag for tracks judged not to contain an animal.
pub const FALSE_POSITIVE: &str = "false-positive";
/// Master tag that the per-device threshold grid refines to rat/mouse.
pub const RODENT: &str = "rodent";

/// Recording-level tag: concurrent animal tracks detected.
pub const MULTIPLE_ANIMALS: &str = "multiple animals";
/// Recording-level tag: every track was archived by the false-positive
/// filter.
pub const ALL_TRACKS_FILTERED: &str = "all tracks filtered";
/// Recording-level tag: the track cap archived the excess.
pub const TRACKS_LIMITED: &str = "tracks limited";

/// The canonical decision elected for one track.
#[derive(Debug, Clone)]
pub struct MasterTag {
    pub prediction: Prediction,
    /// Name of the model whose prediction won, when one did.
    pub model_used: Option<String>,
    /// Version of the rodent threshold grid applied, when one was.
    pub rat_thresh_version: Option<i64>,
}

impl MasterTag {
    /// The synthesized decision for a track no model could label.
    pub fn unidentified() -> Self {
        Self {
            prediction: Prediction {
                tag: Some(UNIDENTIFIED.to_string()),
                ..Prediction::default()
            },
            model_used: None,
            rat_thresh_version: None,
        }
    }
}
