//! CropScan upload service: configuration and component wiring.

pub mod app;
pub mod config;

pub use app::{UploadHandler, build_classifier, build_service, error_message};
pub use config::{ClassifierConfig, Config};
