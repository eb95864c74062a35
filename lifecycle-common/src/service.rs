use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::client::{ServiceController, ServiceError};

/// Controls a systemd unit through `systemctl`.
///
/// `systemctl start` and `systemctl stop` block until the queued job has finished,
/// so a successful return means the unit reached its target state.
pub struct SystemdService {
    unit: String,
    systemctl: String,
}

impl SystemdService {
    pub fn new(unit: &str) -> Self {
        Self::with_systemctl(unit, "systemctl")
    }

    /// Use an alternative `systemctl` binary, e.g. a wrapper script.
    pub fn with_systemctl(unit: &str, systemctl: &str) -> Self {
        Self {
            unit: unit.to_owned(),
            systemctl: systemctl.to_owned(),
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    async fn systemctl(&self, args: &[&str]) -> Result<Output, ServiceError> {
        Command::new(&self.systemctl)
            .args(args)
            .arg(&self.unit)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ServiceError::Spawn {
                unit: self.unit.clone(),
                message: e.to_string(),
            })
    }

    async fn ensure_loaded(&self) -> Result<(), ServiceError> {
        let output = self.systemctl(&["show", "--property=LoadState"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(unit = %self.unit, load_state = %stdout.trim(), "checked systemd unit");

        if !output.status.success() || is_not_found(&stdout) {
            return Err(ServiceError::UnitNotFound(self.unit.clone()));
        }
        Ok(())
    }

    async fn run_job(&self, action: &str) -> Result<(), ServiceError> {
        self.ensure_loaded().await?;

        info!(unit = %self.unit, action, "running systemd job");
        let output = self.systemctl(&[action]).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        Err(ServiceError::Failed {
            unit: self.unit.clone(),
            action: action.to_owned(),
            message: failure_message(output.status.code(), &stderr),
        })
    }
}

fn is_not_found(load_state: &str) -> bool {
    load_state
        .lines()
        .any(|line| line.trim() == "LoadState=not-found")
}

fn failure_message(code: Option<i32>, stderr: &str) -> String {
    let status = match code {
        Some(code) => format!("systemctl exited with status {code}"),
        None => "systemctl was terminated by a signal".to_owned(),
    };
    if stderr.is_empty() {
        status
    } else {
        format!("{status}: {stderr}")
    }
}

#[async_trait]
impl ServiceController for SystemdService {
    async fn start(&self) -> Result<(), ServiceError> {
        self.run_job("start").await
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.run_job("stop").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_found() {
        assert!(is_not_found("LoadState=not-found\n"));
        assert!(!is_not_found("LoadState=loaded\n"));
        assert!(!is_not_found(""));
    }

    #[test]
    fn test_failure_message() {
        assert_eq!(
            failure_message(Some(1), "Job for web.service failed."),
            "systemctl exited with status 1: Job for web.service failed."
        );
        assert_eq!(
            failure_message(None, ""),
            "systemctl was terminated by a signal"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_systemctl_is_a_spawn_error() {
        let service = SystemdService::with_systemctl("web.service", "/nonexistent/systemctl");

        let result = service.start().await;
        assert!(matches!(
            result,
            Err(ServiceError::Spawn { unit, .. }) if unit == "web.service"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_systemctl_is_a_failure() {
        // `false` ignores its arguments and exits 1, so the unit check fails first.
        let service = SystemdService::with_systemctl("web.service", "false");

        let result = service.stop().await;
        assert_eq!(
            result,
            Err(ServiceError::UnitNotFound("web.service".to_owned()))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_succeeding_systemctl() {
        // `true` prints nothing and exits 0, which reads as a loaded unit and a finished job.
        let service = SystemdService::with_systemctl("web.service", "true");

        assert_eq!(service.start().await, Ok(()));
        assert_eq!(service.stop().await, Ok(()));
    }
}
