use std::process::Stdio;

use async_trait::async_trait;
use certkeeper_common::views::CommandAction;
use tokio::process::Command;
use tracing::debug;

use super::{DeployContext, DeployTarget, Deployer, summarize};
use crate::error::{EngineError, EngineResult};

#[async_trait]
impl DeployTarget for CommandAction {
    async fn deploy(&self, ctx: &DeployContext, _: &Deployer) -> EngineResult<String> {
        let script = ctx.expand(&self.command);
        debug!(command = %script, "Running deploy command");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .envs(ctx.env_vars())
            .envs(self.env.iter().map(|(k, v)| (k, ctx.expand(v))));
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|e| EngineError::deploy("command", format!("failed to start: {e}")))?;

        let stdout = summarize(&output.stdout);
        let stderr = summarize(&output.stderr);

        if output.status.success() {
            return Ok(if stdout.is_empty() {
                "Command exited with status 0".to_string()
            } else {
                format!("Command exited with status 0: {stdout}")
            });
        }

        let detail = if stderr.is_empty() { stdout } else { stderr };
        Err(EngineError::deploy(
            "command",
            match output.status.code() {
                Some(code) if detail.is_empty() => format!("exited with status {code}"),
                Some(code) => format!("exited with status {code}: {detail}"),
                None => format!("terminated by signal: {detail}"),
            },
        ))
    }
}
