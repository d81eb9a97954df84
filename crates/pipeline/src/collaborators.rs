//! Contracts for the work the pipeline delegates.
//!
//! Each collaborator is one async call taking JSON in and returning JSON or
//! a [`StageError`]. Every call receives the job's [`CancellationToken`] and
//! should return [`StageError::Cancelled`] promptly once it fires.
//!
//! [`CommandStage`] implements every contract by running an external
//! program; [`PassThrough`] stands in for optional steps.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use turbo_core::error::CoreError;
use turbo_core::request::SimulationRequestValidator;

use crate::error::StageError;

#[async_trait]
pub trait Validator: Send + Sync {
    /// Check the request payload and return its normalised form.
    async fn validate(
        &self,
        payload: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError>;
}

#[async_trait]
pub trait ZoneResolver: Send + Sync {
    /// Turn zone definitions into concrete link sets.
    async fn resolve_zones(
        &self,
        request: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError>;
}

#[async_trait]
pub trait PopulationPipeline: Send + Sync {
    /// Filter, reconstruct and sample agent plans for the resolved zones.
    async fn prepare_population(
        &self,
        request: &serde_json::Value,
        zones: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError>;
}

#[async_trait]
pub trait VehicleAssigner: Send + Sync {
    /// Assign vehicle categories to the population by distribution.
    async fn assign_vehicles(
        &self,
        request: &serde_json::Value,
        population: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError>;
}

/// Which of the two simulation passes is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationPass {
    Baseline,
    Policy,
}

/// Everything the preparation steps produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedInputs {
    pub request: serde_json::Value,
    pub zones: serde_json::Value,
    pub population: serde_json::Value,
    pub vehicles: serde_json::Value,
}

#[async_trait]
pub trait SimulationRunner: Send + Sync {
    async fn run(
        &self,
        pass: SimulationPass,
        inputs: &PreparedInputs,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError>;
}

#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Compare the two passes and produce the result summary.
    async fn postprocess(
        &self,
        inputs: &PreparedInputs,
        baseline: &serde_json::Value,
        policy: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError>;
}

/// The full set of collaborators one executor drives.
#[derive(Clone)]
pub struct Collaborators {
    pub validator: Arc<dyn Validator>,
    pub zones: Arc<dyn ZoneResolver>,
    pub population: Arc<dyn PopulationPipeline>,
    pub vehicles: Arc<dyn VehicleAssigner>,
    pub simulation: Arc<dyn SimulationRunner>,
    pub postprocess: Arc<dyn PostProcessor>,
}

impl Collaborators {
    /// Request validation plus pass-through preparation around `simulation`.
    pub fn with_runner(simulation: Arc<dyn SimulationRunner>) -> Self {
        Self {
            validator: Arc::new(RequestValidator::default()),
            zones: Arc::new(PassThrough),
            population: Arc::new(PassThrough),
            vehicles: Arc::new(PassThrough),
            simulation,
            postprocess: Arc::new(PassThrough),
        }
    }
}

// ---------------------------------------------------------------------------
// Request validator
// ---------------------------------------------------------------------------

/// [`Validator`] backed by the structural request checks.
#[derive(Debug, Default)]
pub struct RequestValidator {
    inner: SimulationRequestValidator,
}

#[async_trait]
impl Validator for RequestValidator {
    async fn validate(
        &self,
        payload: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        match self.inner.validate(payload) {
            Ok(_) => Ok(payload.clone()),
            Err(CoreError::Validation(msg)) => Err(StageError::Validation(msg)),
            Err(other) => Err(StageError::Internal(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Pass-through
// ---------------------------------------------------------------------------

/// Returns its primary input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

#[async_trait]
impl ZoneResolver for PassThrough {
    async fn resolve_zones(
        &self,
        request: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        Ok(request.get("zones").cloned().unwrap_or_default())
    }
}

#[async_trait]
impl PopulationPipeline for PassThrough {
    async fn prepare_population(
        &self,
        _request: &serde_json::Value,
        zones: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        Ok(zones.clone())
    }
}

#[async_trait]
impl VehicleAssigner for PassThrough {
    async fn assign_vehicles(
        &self,
        _request: &serde_json::Value,
        population: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        Ok(population.clone())
    }
}

#[async_trait]
impl PostProcessor for PassThrough {
    async fn postprocess(
        &self,
        _inputs: &PreparedInputs,
        baseline: &serde_json::Value,
        policy: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        Ok(json!({ "baseline": baseline, "policy": policy }))
    }
}

// ---------------------------------------------------------------------------
// External command
// ---------------------------------------------------------------------------

/// Maximum stdout or stderr captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Runs an external program for one stage.
///
/// The stage input is written to stdin as a JSON object with an `"action"`
/// field naming the call; stdout must be a single JSON document. The child
/// is killed when the token fires or the call is dropped.
#[derive(Debug, Clone)]
pub struct CommandStage {
    stage: &'static str,
    program: String,
    args: Vec<String>,
}

impl CommandStage {
    pub fn new(stage: &'static str, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            stage,
            program: program.into(),
            args,
        }
    }

    /// Split a command line on whitespace into program and arguments.
    pub fn from_command_line(stage: &'static str, line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(stage, program, parts.collect()))
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    fn failed(&self, message: impl Into<String>) -> StageError {
        StageError::Failed {
            stage: self.stage,
            message: message.into(),
        }
    }

    async fn invoke(
        &self,
        input: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| self.failed(format!("failed to start '{}': {e}", self.program)))?;

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        if let Some(mut stdin) = child.stdin.take() {
            let bytes = serde_json::to_vec(&input)
                .map_err(|e| StageError::Internal(format!("encode stage input: {e}")))?;
            // The program may exit without reading its input.
            let _ = stdin.write_all(&bytes).await;
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let Some(status) = waited else {
            let _ = child.kill().await;
            tracing::info!(stage = self.stage, "Stage process killed on cancellation");
            return Err(StageError::Cancelled);
        };
        let status = status.map_err(|e| self.failed(e.to_string()))?;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            let code = status.code().unwrap_or(-1);
            return Err(self.failed(if stderr.is_empty() {
                format!("exited with code {code}")
            } else {
                stderr
            }));
        }

        serde_json::from_slice(&stdout)
            .map_err(|e| self.failed(format!("invalid JSON on stdout: {e}")))
    }
}

async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
        // Discard anything past the cap so the child never blocks on a full pipe.
        let _ = tokio::io::copy(&mut h, &mut tokio::io::sink()).await;
    }
    buf
}

#[async_trait]
impl ZoneResolver for CommandStage {
    async fn resolve_zones(
        &self,
        request: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        self.invoke(json!({ "action": "resolve_zones", "request": request }), cancel)
            .await
    }
}

#[async_trait]
impl PopulationPipeline for CommandStage {
    async fn prepare_population(
        &self,
        request: &serde_json::Value,
        zones: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        self.invoke(
            json!({ "action": "prepare_population", "request": request, "zones": zones }),
            cancel,
        )
        .await
    }
}

#[async_trait]
impl VehicleAssigner for CommandStage {
    async fn assign_vehicles(
        &self,
        request: &serde_json::Value,
        population: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        self.invoke(
            json!({ "action": "assign_vehicles", "request": request, "population": population }),
            cancel,
        )
        .await
    }
}

#[async_trait]
impl SimulationRunner for CommandStage {
    async fn run(
        &self,
        pass: SimulationPass,
        inputs: &PreparedInputs,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        self.invoke(
            json!({ "action": "simulate", "pass": pass, "inputs": inputs }),
            cancel,
        )
        .await
    }
}

#[async_trait]
impl PostProcessor for CommandStage {
    async fn postprocess(
        &self,
        inputs: &PreparedInputs,
        baseline: &serde_json::Value,
        policy: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        self.invoke(
            json!({
                "action": "postprocess",
                "inputs": inputs,
                "baseline": baseline,
                "policy": policy,
            }),
            cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::*;
    use assert_matches::assert_matches;

    /// Write a bash script to a temp file; it is run as `bash <path>`.
    fn script(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".sh").tempfile().unwrap();
        writeln!(file, "{body}").unwrap();
        file
    }

    fn stage(file: &tempfile::NamedTempFile) -> CommandStage {
        CommandStage::new("zones", "bash", vec![file.path().display().to_string()])
    }

    #[tokio::test]
    async fn parses_json_from_stdout() {
        let file = script(r#"cat > /dev/null; echo '{"links": [1, 2, 3]}'"#);
        let out = stage(&file)
            .resolve_zones(&json!({ "zones": [] }), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["links"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn receives_input_on_stdin() {
        let file = script(r#"input=$(cat); echo "{\"echo\": $input}""#);
        let out = stage(&file)
            .resolve_zones(&json!({ "zones": ["a"] }), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["echo"]["action"], "resolve_zones");
        assert_eq!(out["echo"]["request"]["zones"], json!(["a"]));
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let file = script("cat > /dev/null; echo 'network file missing' >&2; exit 3");
        let err = stage(&file)
            .resolve_zones(&json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(
            err,
            StageError::Failed { stage: "zones", message } if message == "network file missing"
        );
    }

    #[tokio::test]
    async fn output_past_the_cap_is_drained() {
        let file = script("cat > /dev/null; head -c 12000000 /dev/zero >&2; echo '{\"ok\": true}'");
        let out = tokio::time::timeout(
            Duration::from_secs(20),
            stage(&file).resolve_zones(&json!({}), &CancellationToken::new()),
        )
        .await
        .expect("child blocked on a full stderr pipe")
        .unwrap();
        assert_eq!(out["ok"], true);
    }

    #[tokio::test]
    async fn invalid_stdout_is_a_failure() {
        let file = script("cat > /dev/null; echo 'not json'");
        let err = stage(&file)
            .resolve_zones(&json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, StageError::Failed { message, .. } if message.contains("invalid JSON"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let file = script("sleep 30; echo '{}'");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = stage(&file)
            .resolve_zones(&json!({}), &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, StageError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_program_is_a_failure() {
        let stage = CommandStage::new("simulation", "/nonexistent/turbo-sim", vec![]);
        let inputs = PreparedInputs {
            request: json!({}),
            zones: json!({}),
            population: json!({}),
            vehicles: json!({}),
        };
        let err = stage
            .run(SimulationPass::Baseline, &inputs, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, StageError::Failed { stage: "simulation", .. });
    }

    #[test]
    fn command_line_is_split_on_whitespace() {
        let stage = CommandStage::from_command_line("population", "python3 -m sampler --fast").unwrap();
        assert_eq!(stage.program, "python3");
        assert_eq!(stage.args, vec!["-m", "sampler", "--fast"]);
        assert!(CommandStage::from_command_line("population", "   ").is_none());
    }

    #[tokio::test]
    async fn request_validator_maps_errors() {
        let err = RequestValidator::default()
            .validate(&json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, StageError::Validation(msg) if msg.contains("zones is required"));
    }

    #[tokio::test]
    async fn pass_through_forwards_inputs() {
        let token = CancellationToken::new();
        let zones = PassThrough
            .resolve_zones(&json!({ "zones": [1] }), &token)
            .await
            .unwrap();
        assert_eq!(zones, json!([1]));
        let vehicles = PassThrough
            .assign_vehicles(&json!({}), &json!({ "agents": 3 }), &token)
            .await
            .unwrap();
        assert_eq!(vehicles, json!({ "agents": 3 }));
    }
}
