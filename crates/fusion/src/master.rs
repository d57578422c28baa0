//! Master-tag election: one canonical (model, prediction) pair per track.

use std::collections::HashMap;

use faunaproc_core::types::{ModelConfig, Prediction};

use crate::UNIDENTIFIED;

fn usable(model: &ModelConfig, prediction: &Prediction, wallaby_device: bool) -> bool {
    let Some(tag) = prediction.tag.as_deref() else {
        return false;
    };
    if model.ignored_tags.iter().any(|t| t == tag) {
        return false;
    }
    if model.wallaby && !wallaby_device {
        return false;
    }
    true
}

fn score(model: &ModelConfig, tag: &str) -> Option<i64> {
    model
        .tag_scores
        .get(tag)
        .or_else(|| model.tag_scores.get("default"))
        .copied()
}

/// Elect the master prediction for a track.
///
/// Predictions with no tag, an ignored tag, or from a wallaby-only model on
/// a non-wallaby device are dropped. A parent model whose `reclassify` map
/// names a surviving submodel for its tag is substituted by that submodel;
/// submodels never stand on their own. Among the remainder, the tagged
/// prediction with the highest tag score wins (tag-specific score when the
/// model defines one, its `default` score otherwise); ties keep the
/// earliest. When nothing is scoreable the first survivor is returned, and
/// when nothing survives at all, `None`.
pub fn resolve<'a>(
    predictions: &'a [Prediction],
    models: &'a HashMap<i64, ModelConfig>,
    wallaby_device: bool,
) -> Option<(&'a ModelConfig, &'a Prediction)> {
    let mut survivors: Vec<(&ModelConfig, &Prediction)> = Vec::new();
    let mut by_model: HashMap<i64, usize> = HashMap::new();
    for prediction in predictions {
        let Some(model) = prediction.model_id.and_then(|id| models.get(&id)) else {
            continue;
        };
        if usable(model, prediction, wallaby_device) {
            by_model.insert(model.id, survivors.len());
            survivors.push((model, prediction));
        }
    }

    let mut candidates: Vec<(&ModelConfig, &Prediction)> = Vec::new();
    for &(model, prediction) in &survivors {
        if model.submodel {
            continue;
        }
        let substituted = model
            .reclassify
            .as_ref()
            .zip(prediction.tag.as_deref())
            .and_then(|(map, tag)| map.get(tag))
            .and_then(|sub_id| by_model.get(sub_id))
            .map(|&idx| survivors[idx]);
        candidates.push(substituted.unwrap_or((model, prediction)));
    }

    let mut best: Option<(i64, (&ModelConfig, &Prediction))> = None;
    for &(model, prediction) in &candidates {
        let Some(tag) = prediction.tag.as_deref() else {
            continue;
        };
        if tag == UNIDENTIFIED {
            continue;
        }
        let Some(rank) = score(model, tag) else {
            continue;
        };
        match best {
            Some((top, _)) if rank <= top => {}
            _ => best = Some((rank, (model, prediction))),
        }
    }
    best.map(|(_, winner)| winner)
        .or_else(|| candidates.first().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(id: i64, name: &str, scores: &[(&str, i64)], wallaby: bool) -> ModelConfig {
        ModelConfig {
            id,
            name: name.to_string(),
            model_file: format!("{name}.sav"),
            wallaby,
            submodel: false,
            reclassify: None,
            ignored_tags: Vec::new(),
            tag_scores: scores
                .iter()
                .map(|(tag, score)| (tag.to_string(), *score))
                .collect(),
            classify_time: None,
        }
    }

    fn test_models() -> HashMap<i64, ModelConfig> {
        let mut original = model(1, "original", &[("bird", 4), ("default", 1)], false);
        original.ignored_tags = vec!["mustelid".to_string()];
        let retrained = model(2, "retrained", &[("default", 2)], false);
        let resnet = model(3, "resnet", &[("default", 3)], false);
        let wallaby = model(4, "wallaby", &[("default", 2), ("wallaby", 6)], true);
        let wallaby_old = model(5, "wallaby-old", &[("default", 1), ("wallaby", 5)], true);
        [original, retrained, resnet, wallaby, wallaby_old]
            .into_iter()
            .map(|m| (m.id, m))
            .collect()
    }

    fn prediction(model_id: i64, tag: Option<&str>) -> Prediction {
        Prediction {
            tag: tag.map(str::to_string),
            model_id: Some(model_id),
            ..Prediction::default()
        }
    }

    #[test]
    fn bird_bias_beats_higher_default_scores() {
        let models = test_models();
        let mut predictions = vec![
            prediction(1, Some("bird")),
            prediction(2, Some("cat")),
            prediction(3, Some("possum")),
        ];
        let (winner, tag) = resolve(&predictions, &models, false).unwrap();
        assert_eq!(winner.name, "original");
        assert_eq!(tag.tag.as_deref(), Some("bird"));

        // Without the bird bonus the original model drops to its default
        // score and resnet takes over.
        predictions[0].tag = Some("cat".to_string());
        let (winner, tag) = resolve(&predictions, &models, false).unwrap();
        assert_eq!(winner.name, "resnet");
        assert_eq!(tag.tag.as_deref(), Some("possum"));
    }

    #[test]
    fn unidentified_and_untagged_models_defer() {
        let models = test_models();
        let mut predictions = vec![
            prediction(1, Some("cat")),
            prediction(2, Some("cat")),
            prediction(3, None),
        ];
        let (winner, _) = resolve(&predictions, &models, false).unwrap();
        assert_eq!(winner.name, "retrained");

        predictions[2].tag = Some(UNIDENTIFIED.to_string());
        let (winner, _) = resolve(&predictions, &models, false).unwrap();
        assert_eq!(winner.name, "retrained");

        // Everything unidentified: fall back to the first survivor.
        for p in &mut predictions {
            p.tag = Some(UNIDENTIFIED.to_string());
        }
        let (_, tag) = resolve(&predictions, &models, false).unwrap();
        assert_eq!(tag.tag.as_deref(), Some(UNIDENTIFIED));
    }

    #[test]
    fn nothing_usable_yields_none() {
        let models = test_models();
        let predictions = vec![
            prediction(1, Some("mustelid")),
            prediction(2, None),
            prediction(3, None),
        ];
        assert!(resolve(&predictions, &models, false).is_none());
    }

    #[test]
    fn wallaby_models_need_a_wallaby_device() {
        let models = test_models();
        let mut predictions = vec![
            prediction(1, Some("wallaby")),
            prediction(3, Some("wallaby")),
            prediction(4, None),
            prediction(5, Some("wallaby")),
        ];

        let (winner, _) = resolve(&predictions, &models, true).unwrap();
        assert_eq!(winner.name, "wallaby-old");

        // The newer wallaby model wins once it commits to a tag.
        predictions[2].tag = Some("wallaby".to_string());
        let (winner, _) = resolve(&predictions, &models, true).unwrap();
        assert_eq!(winner.name, "wallaby");

        // Off a wallaby device both wallaby models are excluded.
        let (winner, _) = resolve(&predictions, &models, false).unwrap();
        assert_eq!(winner.name, "resnet");
    }

    #[test]
    fn parent_defers_to_its_submodel() {
        let mut models = test_models();
        let mut rodent_specialist = model(6, "rodent-specialist", &[("default", 9)], false);
        rodent_specialist.submodel = true;
        models.insert(6, rodent_specialist);
        models
            .get_mut(&3)
            .unwrap()
            .reclassify = Some([("rodent".to_string(), 6)].into_iter().collect());

        let predictions = vec![
            prediction(3, Some("rodent")),
            prediction(6, Some("rat")),
        ];
        let (winner, tag) = resolve(&predictions, &models, false).unwrap();
        assert_eq!(winner.name, "rodent-specialist");
        assert_eq!(tag.tag.as_deref(), Some("rat"));

        // With the submodel absent the parent keeps its own prediction, and
        // a submodel alone elects nothing.
        let parent_only = vec![prediction(3, Some("rodent"))];
        let (winner, _) = resolve(&parent_only, &models, false).unwrap();
        assert_eq!(winner.name, "resnet");

        let submodel_only = vec![prediction(6, Some("rat"))];
        assert!(resolve(&submodel_only, &models, false).is_none());
    }
}
