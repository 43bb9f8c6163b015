use std::{
    process::Stdio,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use certkeeper_common::views::DockerRestartAction;
use tokio::process::Command;

use super::{DeployContext, DeployTarget, Deployer, summarize};
use crate::error::{EngineError, EngineResult};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Global `docker` flags selecting the daemon and its TLS material.
fn daemon_args(action: &DockerRestartAction) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(host) = &action.docker_host {
        args.extend(["-H".to_string(), host.clone()]);
    }

    let tls = [
        ("--tlscacert", &action.tls_ca),
        ("--tlscert", &action.tls_cert),
        ("--tlskey", &action.tls_key),
    ];
    if tls.iter().any(|(_, path)| path.is_some()) {
        args.push("--tlsverify".to_string());
        for (flag, path) in tls {
            if let Some(path) = path {
                args.extend([flag.to_string(), path.display().to_string()]);
            }
        }
    }
    args
}

async fn docker(daemon: &[String], args: &[&str]) -> EngineResult<std::process::Output> {
    Command::new("docker")
        .args(daemon)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| EngineError::deploy("docker-restart", format!("failed to run docker: {e}")))
}

#[async_trait]
impl DeployTarget for DockerRestartAction {
    async fn deploy(&self, ctx: &DeployContext, _: &Deployer) -> EngineResult<String> {
        let container = ctx.expand(&self.container);
        let daemon = daemon_args(self);

        let restart = docker(&daemon, &["restart", &container]).await?;
        if !restart.status.success() {
            return Err(EngineError::deploy(
                "docker-restart",
                format!("docker restart {container}: {}", summarize(&restart.stderr)),
            ));
        }

        let deadline = Instant::now() + Duration::from_secs(self.wait_secs);
        loop {
            let inspect = docker(
                &daemon,
                &["inspect", "--format", "{{.State.Running}}", &container],
            )
            .await?;
            if inspect.status.success() && summarize(&inspect.stdout) == "true" {
                return Ok(format!("Container {container} restarted and running"));
            }
            if Instant::now() >= deadline {
                return Err(EngineError::deploy(
                    "docker-restart",
                    format!(
                        "container {container} not running after {}s",
                        self.wait_secs
                    ),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_daemon_args() {
        let mut action = DockerRestartAction {
            container: "web".into(),
            docker_host: None,
            tls_ca: None,
            tls_cert: None,
            tls_key: None,
            wait_secs: 30,
        };
        assert!(daemon_args(&action).is_empty());

        action.docker_host = Some("tcp://docker:2376".into());
        action.tls_ca = Some(PathBuf::from("/tls/ca.pem"));
        assert_eq!(
            daemon_args(&action),
            vec!["-H", "tcp://docker:2376", "--tlsverify", "--tlscacert", "/tls/ca.pem"]
        );
    }
}
