use super::{DetectionResult, FaceRecognizer};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::{debug, instrument};

/// Runs an external face recognition program once per batch.
///
/// Each detection result is passed as one JSON argument. The program prints
/// the enriched results as a JSON array on stdout. Anything written to
/// stderr fails the batch.
pub struct SubprocessFaceRecognizer {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl SubprocessFaceRecognizer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the serialized results, e.g. a script path
    /// when `program` is an interpreter.
    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }
}

#[async_trait]
impl FaceRecognizer for SubprocessFaceRecognizer {
    #[instrument(skip(self, results), fields(count = results.len()), err)]
    async fn recognize(
        &self,
        results: Vec<DetectionResult>,
    ) -> Result<Vec<DetectionResult>> {
        let args = results
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to serialize detection results")?;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("Running face recognition: {:?}", self.program);

        let output = command.output().await.map_err(|e| {
            anyhow!("Failed to run {}: {}", self.program.display(), e)
        })?;

        if !output.stderr.is_empty() {
            return Err(anyhow!(
                "face recognition wrote to stderr: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "face recognition exited with {}",
                output.status
            ));
        }

        serde_json::from_slice(&output.stdout)
            .context("Failed to parse face recognition output")
    }
}
