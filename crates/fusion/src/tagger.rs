//! Per-prediction filtering and whole-recording overlap scoring.

use faunaproc_core::config::TaggingConfig;
use faunaproc_core::types::{Prediction, Track};

use crate::{FALSE_POSITIVE, MasterTag, UNIDENTIFIED};

const MSG_LOW_CONFIDENCE: &str = "Low confidence - no tag";
const MSG_LOW_CLARITY: &str = "Confusion between two classes (similar confidence)";
const MSG_HIGH_NOVELTY: &str = "High novelty";

/// How a single model prediction fares against the tagging thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// Confident, unambiguous and in-distribution.
    Clear,
    /// Demoted, with the reason to record on the prediction.
    Unidentified(&'static str),
    /// On the global ignore list; never posted.
    Ignored,
}

/// Assess one prediction. The rules are ordered; the first failure decides.
pub fn assess(prediction: &Prediction, tagging: &TaggingConfig) -> Assessment {
    let Some(tag) = prediction.tag.as_deref() else {
        return Assessment::Ignored;
    };
    let label = prediction.label.as_deref().unwrap_or(tag);
    if tagging.ignore_tags.iter().any(|t| t == label || t == tag) {
        return Assessment::Ignored;
    }
    if prediction.confidence < tagging.min_tag_confidence {
        return Assessment::Unidentified(MSG_LOW_CONFIDENCE);
    }
    if prediction.clarity < tagging.min_tag_clarity {
        return Assessment::Unidentified(MSG_LOW_CLARITY);
    }
    if prediction.average_novelty > tagging.max_tag_novelty {
        return Assessment::Unidentified(MSG_HIGH_NOVELTY);
    }
    Assessment::Clear
}

/// Assess every prediction on a track in place: demoted predictions become
/// `unidentified` with a message, ignored ones lose their tag. Returns true
/// when the track keeps at least one clear prediction.
pub fn assess_track(track: &mut Track, tagging: &TaggingConfig) -> bool {
    let mut clear = false;
    for prediction in &mut track.predictions {
        match assess(prediction, tagging) {
            Assessment::Clear => clear = true,
            Assessment::Unidentified(message) => {
                prediction.message = Some(message.to_string());
                prediction.tag = Some(UNIDENTIFIED.to_string());
            }
            Assessment::Ignored => prediction.tag = None,
        }
    }
    clear
}

/// A track's confidence is its best prediction's confidence.
pub fn track_confidence(track: &Track) -> f64 {
    track
        .predictions
        .iter()
        .map(|p| p.confidence)
        .fold(0.0, f64::max)
}

/// Whole-recording multiple-animal confidence.
///
/// Animal tracks (master tag neither false-positive nor unidentified) are
/// ordered by start time; every pair overlapping by more than one second
/// contributes the pair's lower confidence, and the recording scores the
/// maximum contribution.
pub fn multiple_animal_confidence(tracks: &[(&Track, &MasterTag)]) -> f64 {
    let mut animals: Vec<&Track> = tracks
        .iter()
        .filter(|(_, master)| match master.prediction.tag.as_deref() {
            Some(tag) => tag != FALSE_POSITIVE && tag != UNIDENTIFIED,
            None => false,
        })
        .map(|(track, _)| *track)
        .collect();
    animals.sort_by(|a, b| a.start_s.total_cmp(&b.start_s));

    let mut confidence: f64 = 0.0;
    for i in 0..animals.len() {
        for j in (i + 1)..animals.len() {
            if animals[j].start_s + 1.0 < animals[i].end_s {
                let pair = track_confidence(animals[i]).min(track_confidence(animals[j]));
                confidence = confidence.max(pair);
            }
        }
    }
    confidence
}
