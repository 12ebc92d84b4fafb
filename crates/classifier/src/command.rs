//! Classifier backed by an external inference program.
//!
//! The program receives the image path as its last argument and prints a
//! JSON array of class probabilities on stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use crate::{Classifier, ClassifyError, ClassifyFuture, Labels};

/// Default time allowed for one inference run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs `program [args..] <path>` and maps its scores through [`Labels`].
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
    labels: Labels,
    timeout: Duration,
}

impl CommandClassifier {
    pub fn new(program: impl Into<String>, args: Vec<String>, labels: Labels) -> Self {
        Self {
            program: program.into(),
            args,
            labels,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns where the program resolves to, if it can be found.
    ///
    /// Names without a path separator are looked up in `PATH`.
    pub fn resolve_program(&self) -> Option<PathBuf> {
        let program = Path::new(&self.program);
        if program.components().count() > 1 || program.is_absolute() {
            return program.is_file().then(|| program.to_path_buf());
        }

        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }

    async fn run(&self, path: &Path) -> Result<Vec<f32>, ClassifyError> {
        match tokio::fs::try_exists(path).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(ClassifyError::InvalidInput(format!(
                    "file not found: {}",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(ClassifyError::InvalidInput(format!(
                    "cannot access {}: {e}",
                    path.display()
                )));
            }
        }

        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ClassifyError::ModelUnavailable(format!(
                    "classifier program not found: {}",
                    self.program
                )),
                _ => ClassifyError::Failed(format!("failed to start {}: {e}", self.program)),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ClassifyError::Timeout(self.timeout))?
            .map_err(|e| ClassifyError::Failed(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClassifyError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| ClassifyError::InvalidOutput(format!("expected JSON score array: {e}")))
    }
}

impl Classifier for CommandClassifier {
    fn classify<'a>(&'a self, path: &'a Path) -> ClassifyFuture<'a> {
        Box::pin(async move {
            let scores = self.run(path).await?;
            let result = self.labels.classify(&scores)?;
            tracing::info!(
                path = %path.display(),
                label = %result.label,
                confidence = result.confidence,
                "classification complete"
            );
            Ok(result)
        })
    }
}
