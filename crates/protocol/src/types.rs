use serde::{Deserialize, Serialize};

/// Probability assigned to one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassScore {
    pub label: String,
    pub probability: f32,
}

/// Result returned by the image classifier for an assembled upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    /// Label of the highest scoring class.
    pub label: String,
    /// Index of the highest scoring class in the label table.
    pub class_index: usize,
    /// Probability of the highest scoring class.
    pub confidence: f32,
    /// Every class with its probability, in label-table order.
    pub per_class_scores: Vec<ClassScore>,
}
