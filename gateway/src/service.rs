//! Local service-manager commands.

use anyhow::{bail, Context};

use crate::config::GatewayConfig;

/// Run a shell command, capturing combined output.
pub async fn run_command(command: &str) -> anyhow::Result<()> {
    let output = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .with_context(|| format!("spawn {command:?}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "command {command:?} failed ({}): {}",
            output.status,
            stderr.trim()
        );
    }

    tracing::debug!(
        event = "gateway.service.command",
        command,
        stdout = %String::from_utf8_lossy(&output.stdout).trim(),
        "command succeeded"
    );
    Ok(())
}

/// Restart the local compute engine process group.
pub async fn restart_engine(cfg: &GatewayConfig) -> anyhow::Result<()> {
    run_command(&cfg.engine_restart_cmd).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_is_ok() -> anyhow::Result<()> {
        run_command("true").await
    }

    #[tokio::test]
    async fn failing_command_reports_status_and_stderr() -> anyhow::Result<()> {
        let err = run_command("echo boom >&2; exit 3")
            .await
            .expect_err("command must fail");
        let text = err.to_string();
        anyhow::ensure!(text.contains("boom"), "stderr missing: {text}");
        Ok(())
    }
}
