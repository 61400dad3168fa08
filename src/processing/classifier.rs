use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::events::{keys_from_channels, ChannelDict, Label, UnitKey};
use super::psth::ResponseMap;

/// Averaged PSTH for one unit.
pub type TemplateVector = Vec<f64>;

/// Per-unit templates for one class.
pub type LabelTemplate = BTreeMap<UnitKey, TemplateVector>;

/// Templates for every class, iterated in ascending label order.
pub type Templates = BTreeMap<Label, LabelTemplate>;

// DISTANCES -------------------------------------------------------------------

pub fn euclidean_distance(live: &[u32], template: &[f64]) -> f64 {
    live.iter()
        .zip(template)
        .map(|(&count, &mean)| (count as f64 - mean).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Mean per-unit distance of the live responses to each label's template.
///
/// Units in a template without live data are skipped. A label with no
/// matching units scores `0.0`.
pub fn label_distances(live: &ResponseMap, templates: &Templates) -> Vec<(Label, f64)> {
    templates
        .iter()
        .map(|(&label, template)| {
            let distances: Vec<f64> = template
                .iter()
                .filter_map(|(key, mean)| live.get(key).map(|r| euclidean_distance(r, mean)))
                .collect();
            let average = if distances.is_empty() {
                0.0
            } else {
                distances.iter().sum::<f64>() / distances.len() as f64
            };
            (label, average)
        })
        .collect()
}

/// Label whose template is nearest to `live`; ties go to the lowest label.
pub fn classify(live: &ResponseMap, templates: &Templates) -> Option<Label> {
    nearest(&label_distances(live, templates))
}

/// Label with the smallest distance; the first one wins ties.
pub fn nearest(distances: &[(Label, f64)]) -> Option<Label> {
    let mut best: Option<(Label, f64)> = None;
    for &(label, distance) in distances {
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((label, distance)),
        }
    }
    best.map(|(label, _)| label)
}

// CLASSIFIER ------------------------------------------------------------------

/// Loaded templates plus the set of units the online binner listens to.
#[derive(Debug, Clone)]
pub struct Classifier {
    templates: Templates,
    keys: BTreeSet<UnitKey>,
}

impl Classifier {
    pub fn new(channels: &ChannelDict) -> Self {
        Self {
            templates: Templates::new(),
            keys: keys_from_channels(channels),
        }
    }

    /// Every unit the trial accumulator must bin, live channels and template units alike.
    pub fn keys(&self) -> &BTreeSet<UnitKey> {
        &self.keys
    }

    pub fn has_templates(&self) -> bool {
        !self.templates.is_empty()
    }

    /// Merges templates into the running set; later entries replace earlier ones per unit.
    pub fn merge_templates(&mut self, templates: Templates) {
        for (label, template) in templates {
            let entry = self.templates.entry(label).or_default();
            for (key, vector) in template {
                self.keys.insert(key);
                entry.insert(key, vector);
            }
        }
        debug!(
            labels = self.templates.len(),
            units = self.keys.len(),
            "templates merged"
        );
    }

    pub fn distances(&self, live: &ResponseMap) -> Vec<(Label, f64)> {
        label_distances(live, &self.templates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(c: u32, u: u32) -> UnitKey {
        UnitKey::new(c, u)
    }

    fn templates() -> Templates {
        let mut t = Templates::new();
        t.insert(1, [(key(5, 1), vec![0.0, 2.0, 0.0])].into_iter().collect());
        t.insert(2, [(key(5, 1), vec![2.0, 0.0, 0.0])].into_iter().collect());
        t
    }

    #[test]
    fn nearest_template_wins() {
        let live: ResponseMap = [(key(5, 1), vec![0, 2, 0])].into_iter().collect();
        assert_eq!(classify(&live, &templates()), Some(1));
        let live: ResponseMap = [(key(5, 1), vec![3, 0, 0])].into_iter().collect();
        assert_eq!(classify(&live, &templates()), Some(2));
    }

    #[test]
    fn classify_is_repeatable() {
        let live: ResponseMap = [(key(5, 1), vec![1, 1, 0])].into_iter().collect();
        let t = templates();
        assert_eq!(classify(&live, &t), classify(&live, &t));
        // Equidistant: lowest label wins.
        assert_eq!(classify(&live, &t), Some(1));
    }

    #[test]
    fn label_without_matching_units_scores_zero_and_wins() {
        let mut t = templates();
        t.insert(3, [(key(9, 9), vec![5.0, 5.0, 5.0])].into_iter().collect());
        t.insert(4, LabelTemplate::new());
        let live: ResponseMap = [(key(5, 1), vec![0, 0, 7])].into_iter().collect();

        let distances = label_distances(&live, &t);
        assert_eq!(distances[2], (3, 0.0));
        assert_eq!(distances[3], (4, 0.0));
        assert_eq!(classify(&live, &t), Some(3));
    }

    #[test]
    fn averages_over_matching_units_only() {
        let mut t = Templates::new();
        t.insert(
            1,
            [(key(1, 1), vec![0.0, 0.0]), (key(2, 1), vec![3.0, 4.0])]
                .into_iter()
                .collect(),
        );
        let live: ResponseMap = [(key(1, 1), vec![0, 0]), (key(2, 1), vec![0, 0])]
            .into_iter()
            .collect();
        assert_eq!(label_distances(&live, &t), vec![(1, 2.5)]);

        let live: ResponseMap = [(key(2, 1), vec![0, 0])].into_iter().collect();
        assert_eq!(label_distances(&live, &t), vec![(1, 5.0)]);
    }

    #[test]
    fn empty_templates_classify_to_none() {
        let live = ResponseMap::new();
        assert_eq!(classify(&live, &Templates::new()), None);
    }

    #[test]
    fn merging_extends_the_monitored_units() {
        let mut channels = ChannelDict::new();
        channels.insert(5, vec![1]);
        let mut classifier = Classifier::new(&channels);
        assert_eq!(classifier.keys().len(), 1);

        let mut t = templates();
        t.get_mut(&2).unwrap().insert(key(8, 2), vec![0.0; 3]);
        classifier.merge_templates(t);
        assert!(classifier.keys().contains(&key(8, 2)));
        assert!(classifier.has_templates());
    }
}
