use std::path::Path;

use crate::{ClassScore, Classification, ClassifyError};

/// Default label table, in model output order.
pub const PLANT_DISEASE_CLASSES: [&str; 15] = [
    "Pepper_bell_healthy",
    "Pepper_bell_bacterial_spot",
    "Tomato_Early_blight",
    "Potato_Early_blight",
    "Potato_Late_blight",
    "Tomato_Bacterial_spot",
    "Tomato_Leaf_Mold",
    "Tomato_Septoria_leaf_spot",
    "Tomato_healthy",
    "Tomato_Late_blight",
    "Potato_healthy",
    "Tomato_Target_Spot",
    "Tomato_Spider_mites",
    "Tomato_Yellow_Leaf_Curl_Virus",
    "Tomato_mosaic_virus",
];

/// Maps model output positions to class names.
#[derive(Debug, Clone, PartialEq)]
pub struct Labels {
    names: Vec<String>,
}

impl Default for Labels {
    fn default() -> Self {
        Self::plant_disease()
    }
}

impl Labels {
    /// The built-in plant disease table.
    pub fn plant_disease() -> Self {
        Self {
            names: PLANT_DISEASE_CLASSES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Reads a JSON array of class names.
    pub fn load(path: &Path) -> Result<Self, ClassifyError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClassifyError::Labels(format!("{}: {e}", path.display())))?;
        let names: Vec<String> = serde_json::from_str(&content)
            .map_err(|e| ClassifyError::Labels(format!("{}: {e}", path.display())))?;
        if names.is_empty() {
            return Err(ClassifyError::Labels(format!(
                "{}: empty label list",
                path.display()
            )));
        }
        Ok(Self { names })
    }

    /// Loads `path` if it exists, otherwise falls back to the built-in table.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ClassifyError> {
        match path {
            Some(p) if p.exists() => {
                let labels = Self::load(p)?;
                tracing::info!(path = %p.display(), count = labels.len(), "labels loaded");
                Ok(labels)
            }
            Some(p) => {
                tracing::info!(path = %p.display(), "labels file not found, using default classes");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Turns a probability vector into a [`Classification`].
    ///
    /// The winning class is the first maximum. Scores past the end of the
    /// table are reported as `class_<n>`, but a winner outside the table is
    /// rejected.
    pub fn classify(&self, scores: &[f32]) -> Result<Classification, ClassifyError> {
        if scores.is_empty() {
            return Err(ClassifyError::InvalidOutput("empty score vector".into()));
        }
        if let Some(pos) = scores.iter().position(|s| s.is_nan()) {
            return Err(ClassifyError::InvalidOutput(format!(
                "score {pos} is not a number"
            )));
        }

        let mut best = 0;
        for (i, score) in scores.iter().enumerate().skip(1) {
            if *score > scores[best] {
                best = i;
            }
        }

        let label = self.get(best).ok_or_else(|| {
            ClassifyError::InvalidOutput(format!(
                "class index {best} outside label table of {}",
                self.len()
            ))
        })?;

        let per_class_scores = scores
            .iter()
            .enumerate()
            .map(|(i, p)| ClassScore {
                label: self
                    .get(i)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("class_{i}")),
                probability: *p,
            })
            .collect();

        Ok(Classification {
            label: label.to_string(),
            class_index: best,
            confidence: scores[best],
            per_class_scores,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_has_fifteen_classes() {
        let labels = Labels::default();
        assert_eq!(labels.len(), 15);
        assert_eq!(labels.get(8), Some("Tomato_healthy"));
    }

    #[test]
    fn classify_picks_argmax() {
        let labels = Labels::new(vec!["a".into(), "b".into(), "c".into()]);
        let c = labels.classify(&[0.1, 0.7, 0.2]).unwrap();
        assert_eq!(c.label, "b");
        assert_eq!(c.class_index, 1);
        assert_eq!(c.confidence, 0.7);
        assert_eq!(c.per_class_scores.len(), 3);
        assert_eq!(c.per_class_scores[2].label, "c");
    }

    #[test]
    fn classify_ties_pick_first() {
        let labels = Labels::new(vec!["a".into(), "b".into()]);
        let c = labels.classify(&[0.5, 0.5]).unwrap();
        assert_eq!(c.class_index, 0);
    }

    #[test]
    fn classify_rejects_empty_scores() {
        let err = Labels::default().classify(&[]).unwrap_err();
        assert!(matches!(err, ClassifyError::InvalidOutput(_)));
    }

    #[test]
    fn classify_rejects_nan() {
        let err = Labels::default().classify(&[0.1, f32::NAN]).unwrap_err();
        assert!(matches!(err, ClassifyError::InvalidOutput(_)));
    }

    #[test]
    fn classify_rejects_winner_outside_table() {
        let labels = Labels::new(vec!["a".into()]);
        let err = labels.classify(&[0.1, 0.9]).unwrap_err();
        assert!(err.to_string().contains("class index 1"));
    }

    #[test]
    fn classify_names_extra_scores() {
        let labels = Labels::new(vec!["a".into()]);
        let c = labels.classify(&[0.9, 0.1]).unwrap();
        assert_eq!(c.per_class_scores[1].label, "class_1");
    }

    #[test]
    fn load_reads_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.json");
        std::fs::write(&path, r#"["healthy", "blight"]"#).unwrap();
        let labels = Labels::load(&path).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get(1), Some("blight"));
    }

    #[test]
    fn load_rejects_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(matches!(Labels::load(&path), Err(ClassifyError::Labels(_))));
    }

    #[test]
    fn load_or_default_falls_back_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let labels = Labels::load_or_default(Some(dir.path().join("nope.json").as_path())).unwrap();
        assert_eq!(labels, Labels::plant_disease());
    }
}
