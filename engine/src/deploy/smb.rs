use std::process::Stdio;

use async_trait::async_trait;
use certkeeper_common::views::SmbCopyAction;
use tokio::process::Command;

use super::{DeployContext, DeployTarget, Deployer, source_label, summarize};
use crate::error::{EngineError, EngineResult};

fn smb_path(path: &str) -> String {
    path.trim_matches('/').replace('/', "\\")
}

fn quote(arg: &str) -> String {
    format!("\"{}\"", arg.replace('"', ""))
}

/// The `smbclient -c` script: optional `mkdir` for every parent, then `put`.
fn script(local: &str, remote: &str, mkdir: bool) -> String {
    let remote = smb_path(remote);
    let mut commands = Vec::new();

    if mkdir {
        let parts: Vec<&str> = remote.split('\\').collect();
        for depth in 1..parts.len() {
            commands.push(format!("mkdir {}", quote(&parts[..depth].join("\\"))));
        }
    }
    commands.push(format!("put {} {}", quote(local), quote(&remote)));
    commands.join("; ")
}

/// NT status lines other than "already exists", which `mkdir` of an existing
/// directory produces.
fn errors(output: &str) -> Vec<&str> {
    output
        .lines()
        .filter(|l| l.contains("NT_STATUS_") && !l.contains("NT_STATUS_OBJECT_NAME_COLLISION"))
        .collect()
}

#[async_trait]
impl DeployTarget for SmbCopyAction {
    async fn deploy(&self, ctx: &DeployContext, _: &Deployer) -> EngineResult<String> {
        let local = ctx.source_path(self.source)?.display().to_string();
        let remote = ctx.expand(&self.remote_path);
        let service = format!("//{}/{}", self.host, self.share.trim_matches('/'));

        let mut command = Command::new("smbclient");
        command
            .arg(&service)
            .arg("-U")
            .arg(&self.username)
            .arg("-c")
            .arg(script(&local, &remote, self.mkdir))
            .env("PASSWD", &self.password)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(domain) = &self.domain {
            command.arg("-W").arg(domain);
        }
        if let Some(port) = self.port {
            command.arg("-p").arg(port.to_string());
        }

        let output = command
            .output()
            .await
            .map_err(|e| EngineError::deploy("smb-copy", format!("failed to run smbclient: {e}")))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let failures = errors(&combined);

        if failures.is_empty() && (output.status.success() || self.mkdir) {
            Ok(format!(
                "Uploaded {} to {service}/{}",
                source_label(self.source),
                remote.trim_start_matches('/')
            ))
        } else if !failures.is_empty() {
            Err(EngineError::deploy("smb-copy", failures.join("; ")))
        } else {
            Err(EngineError::deploy("smb-copy", summarize(combined.as_bytes())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_creates_parents() {
        assert_eq!(
            script("/tmp/c.pem", "/ssl/web/c.pem", true),
            r#"mkdir "ssl"; mkdir "ssl\web"; put "/tmp/c.pem" "ssl\web\c.pem""#
        );
        assert_eq!(script("/tmp/c.pem", "c.pem", false), r#"put "/tmp/c.pem" "c.pem""#);
    }

    #[test]
    fn test_collisions_are_not_errors() {
        let out = "NT_STATUS_OBJECT_NAME_COLLISION making remote directory \\ssl\nputting file";
        assert!(errors(out).is_empty());
        assert_eq!(errors("NT_STATUS_ACCESS_DENIED opening remote file").len(), 1);
    }
}
