//! Image classification collaborator.
//!
//! The upload core hands a finished file path to a [`Classifier`] and
//! passes whatever it returns (or fails with) straight to the client.
//! Model loading and tensor work live behind this interface; the
//! [`CommandClassifier`] adapter runs an external inference program.

mod command;
mod labels;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

pub use command::CommandClassifier;
pub use cropscan_protocol::types::{ClassScore, Classification};
pub use labels::{Labels, PLANT_DISEASE_CLASSES};

/// A boxed future returned by [`Classifier::classify`].
pub type ClassifyFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Classification, ClassifyError>> + Send + 'a>>;

/// Errors produced by a classifier.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid model output: {0}")]
    InvalidOutput(String),

    #[error("invalid labels file: {0}")]
    Labels(String),

    #[error("classification timed out after {0:?}")]
    Timeout(Duration),

    #[error("classification failed: {0}")]
    Failed(String),
}

/// Classifies a completed upload.
///
/// Treated as synchronous by the upload core: completion waits for the
/// result before replying.
pub trait Classifier: Send + Sync + 'static {
    fn classify<'a>(&'a self, path: &'a Path) -> ClassifyFuture<'a>;
}

/// Placeholder used when no inference program is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredClassifier;

impl Classifier for UnconfiguredClassifier {
    fn classify<'a>(&'a self, _path: &'a Path) -> ClassifyFuture<'a> {
        Box::pin(async {
            Err(ClassifyError::ModelUnavailable(
                "no classifier program configured".into(),
            ))
        })
    }
}
