//! Network emulator seam for behavioural checks of device configurations

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::policy::{LowLevelConfig, Topology};

/// One behavioural check the emulator runs against a configured network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Emulator-specific parameters (hosts to ping, expected path, ...)
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioVerdict {
    pub scenario: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The emulated network could not be brought up; says nothing about the
/// configuration under test
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmulationSetupError {
    #[error("Failed to start emulator: {0}")]
    Spawn(String),

    #[error("Emulator timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Emulator protocol error: {0}")]
    Protocol(String),

    #[error("Emulator reported setup failure: {0}")]
    Setup(String),
}

#[async_trait]
pub trait NetworkEmulator: Send + Sync {
    fn name(&self) -> &str;

    /// Deploy `configs` onto `topology` and run every scenario
    async fn evaluate(
        &self,
        configs: &LowLevelConfig,
        topology: &Topology,
        scenarios: &[Scenario],
    ) -> Result<Vec<ScenarioVerdict>, EmulationSetupError>;
}

#[derive(Serialize)]
struct EmulatorRequest<'a> {
    configs: &'a LowLevelConfig,
    topology: &'a Topology,
    scenarios: &'a [Scenario],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmulatorReply {
    SetupError { setup_error: String },
    Report { scenarios: Vec<ScenarioVerdict> },
    Bare(Vec<ScenarioVerdict>),
}

/// Drives an external emulator command
///
/// The request goes to stdin as one JSON document; the command answers on
/// stdout with `{"scenarios": [...]}`, a bare verdict array, or
/// `{"setup_error": "..."}`.
pub struct CommandEmulator {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandEmulator {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl NetworkEmulator for CommandEmulator {
    fn name(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("emulator")
    }

    async fn evaluate(
        &self,
        configs: &LowLevelConfig,
        topology: &Topology,
        scenarios: &[Scenario],
    ) -> Result<Vec<ScenarioVerdict>, EmulationSetupError> {
        let (exe, args) = self
            .command
            .split_first()
            .ok_or_else(|| EmulationSetupError::Spawn("empty emulator command".to_string()))?;

        let request = serde_json::to_vec(&EmulatorRequest {
            configs,
            topology,
            scenarios,
        })
        .map_err(|e| EmulationSetupError::Protocol(e.to_string()))?;

        let mut child = Command::new(exe)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EmulationSetupError::Spawn(format!("{}: {}", exe, e)))?;

        tracing::debug!(emulator = %exe, scenarios = scenarios.len(), "Starting emulation");

        let timeout_ms = self.timeout.as_millis() as u64;
        let run = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&request).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| EmulationSetupError::Timeout { timeout_ms })?
            .map_err(|e| EmulationSetupError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EmulationSetupError::Setup(format!(
                "exit status {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let reply: EmulatorReply = serde_json::from_slice(&output.stdout)
            .map_err(|e| EmulationSetupError::Protocol(format!("invalid emulator reply: {}", e)))?;
        match reply {
            EmulatorReply::SetupError { setup_error } => Err(EmulationSetupError::Setup(setup_error)),
            EmulatorReply::Report { scenarios } | EmulatorReply::Bare(scenarios) => Ok(scenarios),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandEmulator {
        CommandEmulator::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
    }

    fn scenario(name: &str) -> Scenario {
        Scenario {
            name: name.to_string(),
            description: None,
            params: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_reads_scenario_report() {
        let emulator = sh(r#"cat > /dev/null; echo '{"scenarios": [{"scenario": "ping", "passed": true}]}'"#);
        let verdicts = emulator
            .evaluate(&LowLevelConfig::new(), &Topology::new(), &[scenario("ping")])
            .await
            .unwrap();
        assert_eq!(verdicts.len(), 1);
        assert!(verdicts[0].passed);
    }

    #[tokio::test]
    async fn test_setup_error_reply() {
        let emulator = sh(r#"cat > /dev/null; echo '{"setup_error": "docker unavailable"}'"#);
        let err = emulator
            .evaluate(&LowLevelConfig::new(), &Topology::new(), &[])
            .await
            .unwrap_err();
        assert_eq!(err, EmulationSetupError::Setup("docker unavailable".to_string()));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_setup_error() {
        let emulator = sh("cat > /dev/null; echo boom >&2; exit 3");
        let err = emulator
            .evaluate(&LowLevelConfig::new(), &Topology::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EmulationSetupError::Setup(_)));
    }

    #[tokio::test]
    async fn test_hung_emulator_times_out() {
        let emulator = CommandEmulator::new(
            vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
            Duration::from_millis(200),
        );
        let err = emulator
            .evaluate(&LowLevelConfig::new(), &Topology::new(), &[])
            .await
            .unwrap_err();
        assert_eq!(err, EmulationSetupError::Timeout { timeout_ms: 200 });
    }
}
