//! Post-classification track filters: the false-positive filter and the
//! track cap.

use faunaproc_core::types::Track;

use crate::{FALSE_POSITIVE, MasterTag, UNIDENTIFIED};

/// Indices of tracks the false-positive filter condemns: a master tag of
/// `false-positive` at or above `min_confidence`, or an `unidentified`
/// master hiding a false-positive prediction at that confidence.
pub fn false_positive_tracks(
    tracks: &[(&Track, &MasterTag)],
    min_confidence: f64,
) -> Vec<usize> {
    let mut condemned = Vec::new();
    for (idx, (track, master)) in tracks.iter().enumerate() {
        let Some(tag) = master.prediction.tag.as_deref() else {
            continue;
        };
        let filtered = (tag == FALSE_POSITIVE && master.prediction.confidence >= min_confidence)
            || (tag == UNIDENTIFIED
                && track.predictions.iter().any(|p| {
                    let fp = p.tag.as_deref() == Some(FALSE_POSITIVE)
                        || p.label.as_deref() == Some(FALSE_POSITIVE);
                    fp && p.confidence >= min_confidence
                }));
        if filtered {
            condemned.push(idx);
        }
    }
    condemned
}

/// Indices of the tracks to drop when more than `max_tracks` survive.
///
/// Tracks are ranked by `(false-positive penalty, tracking score)`
/// descending; the penalty is the negated master confidence for
/// false-positive masters and zero otherwise, so confident false positives
/// are dropped first, then the weakest tracks.
pub fn over_cap(tracks: &[(&Track, Option<&MasterTag>)], max_tracks: usize) -> Vec<usize> {
    if tracks.len() <= max_tracks {
        return Vec::new();
    }

    let key = |idx: usize| -> (f64, f64) {
        let (track, master) = &tracks[idx];
        let penalty = master
            .filter(|m| m.prediction.tag.as_deref() == Some(FALSE_POSITIVE))
            .map(|m| -m.prediction.confidence)
            .unwrap_or(0.0);
        (penalty, track.tracking_score.unwrap_or(0.0))
    };

    let mut order: Vec<usize> = (0..tracks.len()).collect();
    order.sort_by(|&a, &b| {
        let (pa, sa) = key(a);
        let (pb, sb) = key(b);
        pb.total_cmp(&pa)
            .then(sb.total_cmp(&sa))
            .then(a.cmp(&b))
    });

    let mut dropped = order.split_off(max_tracks);
    dropped.sort_unstable();
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    use faunaproc_core::types::Prediction;

    fn master(tag: &str, confidence: f64) -> MasterTag {
        MasterTag {
            prediction: Prediction {
                tag: Some(tag.to_string()),
                confidence,
                ..Prediction::default()
            },
            model_used: None,
            rat_thresh_version: None,
        }
    }

    fn scored_track(tracking_score: f64) -> Track {
        Track {
            tracking_score: Some(tracking_score),
            ..Track::default()
        }
    }

    #[test]
    fn confident_false_positives_are_condemned() {
        let a = Track::default();
        let b = Track::default();
        let a_master = master(FALSE_POSITIVE, 0.9);
        let b_master = master(FALSE_POSITIVE, 0.9);
        let tracks = vec![(&a, &a_master), (&b, &b_master)];
        assert_eq!(false_positive_tracks(&tracks, 0.7), vec![0, 1]);
    }

    #[test]
    fn weak_false_positives_survive() {
        let a = Track::default();
        let a_master = master(FALSE_POSITIVE, 0.5);
        let tracks = vec![(&a, &a_master)];
        assert!(false_positive_tracks(&tracks, 0.7).is_empty());
    }

    #[test]
    fn unidentified_with_a_confident_false_positive_prediction_is_condemned() {
        let track = Track {
            predictions: vec![Prediction {
                tag: Some(FALSE_POSITIVE.to_string()),
                confidence: 0.8,
                ..Prediction::default()
            }],
            ..Track::default()
        };
        let unresolved = master(UNIDENTIFIED, 0.0);
        let tracks = vec![(&track, &unresolved)];
        assert_eq!(false_positive_tracks(&tracks, 0.7), vec![0]);
    }

    #[test]
    fn animal_masters_survive() {
        let a = Track::default();
        let a_master = master("rat", 0.95);
        let tracks = vec![(&a, &a_master)];
        assert!(false_positive_tracks(&tracks, 0.7).is_empty());
    }

    #[test]
    fn cap_drops_the_lowest_scores() {
        let tracks: Vec<Track> = (0..12).map(|i| scored_track(i as f64)).collect();
        let with_masters: Vec<(&Track, Option<&MasterTag>)> =
            tracks.iter().map(|t| (t, None)).collect();
        // Scores 0 and 1 are the weakest of the twelve.
        assert_eq!(over_cap(&with_masters, 10), vec![0, 1]);
        assert!(over_cap(&with_masters[..10], 10).is_empty());
    }

    #[test]
    fn confident_false_positives_are_dropped_before_low_scores() {
        let tracks: Vec<Track> = (0..4).map(|i| scored_track(i as f64)).collect();
        // The best-scored track is also a confident false positive.
        let fp = master(FALSE_POSITIVE, 0.9);
        let masters: Vec<Option<&MasterTag>> = vec![None, None, None, Some(&fp)];
        let with_masters: Vec<(&Track, Option<&MasterTag>)> = tracks
            .iter()
            .zip(masters)
            .map(|(track, master)| (track, master))
            .collect();
        assert_eq!(over_cap(&with_masters, 2), vec![0, 3]);
    }
}
