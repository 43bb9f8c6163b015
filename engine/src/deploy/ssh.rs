use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use certkeeper_common::views::{HostKeyPolicy, SshCopyAction};
use ssh2::{CheckResult, FileStat, KnownHostFileKind, RenameFlags, Session};
use tracing::{debug, info, warn};

use super::{DeployContext, DeployTarget, Deployer, parse_mode, source_label};
use crate::error::{EngineError, EngineResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

fn ssh_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::deploy("ssh-copy", e.to_string())
}

fn known_hosts_path(action: &SshCopyAction) -> Option<PathBuf> {
    action.known_hosts_path.clone().or_else(|| {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh/known_hosts"))
    })
}

/// Name under which the host is recorded in `known_hosts`.
fn known_hosts_entry(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

fn verify_host_key(session: &Session, action: &SshCopyAction) -> EngineResult<()> {
    if action.host_key_policy == HostKeyPolicy::Insecure {
        warn!(host = %action.host, "Skipping SSH host key verification");
        return Ok(());
    }

    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| ssh_err("server sent no host key"))?;
    let path = known_hosts_path(action)
        .ok_or_else(|| ssh_err("no known_hosts file configured and $HOME is unset"))?;

    let mut known = session.known_hosts().map_err(ssh_err)?;
    if path.exists() {
        known
            .read_file(&path, KnownHostFileKind::OpenSSH)
            .map_err(|e| ssh_err(format!("reading {}: {e}", path.display())))?;
    }

    match known.check_port(&action.host, action.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(ssh_err(format!(
            "host key for {} does not match {}",
            action.host,
            path.display()
        ))),
        CheckResult::NotFound if action.host_key_policy == HostKeyPolicy::AcceptNew => {
            let entry = known_hosts_entry(&action.host, action.port);
            known
                .add(&entry, key, "added by certkeeper", key_type.into())
                .map_err(ssh_err)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
            }
            known
                .write_file(&path, KnownHostFileKind::OpenSSH)
                .map_err(|e| ssh_err(format!("writing {}: {e}", path.display())))?;
            info!(host = %entry, "Recorded new SSH host key");
            Ok(())
        }
        CheckResult::NotFound => Err(ssh_err(format!(
            "host {} is not in {}",
            action.host,
            path.display()
        ))),
        CheckResult::Failure => Err(ssh_err("host key check failed")),
    }
}

fn connect(action: &SshCopyAction) -> EngineResult<Session> {
    let addr = (action.host.as_str(), action.port)
        .to_socket_addrs()
        .map_err(|e| ssh_err(format!("resolving {}: {e}", action.host)))?
        .next()
        .ok_or_else(|| ssh_err(format!("{} has no address", action.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(ssh_err)?;

    let mut session = Session::new().map_err(ssh_err)?;
    session.set_tcp_stream(tcp);
    session.set_timeout(CONNECT_TIMEOUT.as_millis() as u32);
    session.handshake().map_err(ssh_err)?;

    verify_host_key(&session, action)?;

    match (&action.private_key_path, &action.password) {
        (Some(key), _) => session
            .userauth_pubkey_file(
                &action.username,
                None,
                key,
                action.private_key_passphrase.as_deref(),
            )
            .map_err(ssh_err)?,
        (None, Some(password)) => session
            .userauth_password(&action.username, password)
            .map_err(ssh_err)?,
        (None, None) => session.userauth_agent(&action.username).map_err(ssh_err)?,
    }

    if !session.authenticated() {
        return Err(ssh_err(format!("authentication as {} failed", action.username)));
    }
    Ok(session)
}

fn exec(session: &Session, command: &str) -> EngineResult<()> {
    let mut channel = session.channel_session().map_err(ssh_err)?;
    channel.exec(command).map_err(ssh_err)?;
    let mut stderr = String::new();
    if let Err(e) = channel.stderr().read_to_string(&mut stderr) {
        debug!(error = %e, command, "Could not read remote stderr");
    }
    channel.wait_close().map_err(ssh_err)?;

    match channel.exit_status().map_err(ssh_err)? {
        0 => Ok(()),
        code => Err(ssh_err(format!("`{command}` exited with {code}: {}", stderr.trim()))),
    }
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn upload(action: &SshCopyAction, remote: &str, bytes: &[u8]) -> EngineResult<()> {
    let session = connect(action)?;
    let sftp = session.sftp().map_err(ssh_err)?;
    let remote = Path::new(remote);

    if action.mkdir {
        let mut current = PathBuf::new();
        if let Some(parent) = remote.parent() {
            for part in parent.components() {
                current.push(part);
                if sftp.stat(&current).is_err() {
                    sftp.mkdir(&current, 0o755).map_err(|e| {
                        ssh_err(format!("mkdir {}: {e}", current.display()))
                    })?;
                }
            }
        }
    }

    let mut temp = remote.as_os_str().to_owned();
    temp.push(".certkeeper-tmp");
    let temp = PathBuf::from(temp);

    let mut file = sftp
        .create(&temp)
        .map_err(|e| ssh_err(format!("create {}: {e}", temp.display())))?;
    file.write_all(bytes).map_err(ssh_err)?;
    drop(file);

    if let Some(mode) = &action.mode {
        let perm = parse_mode(mode)?;
        sftp.setstat(
            &temp,
            FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(perm),
                atime: None,
                mtime: None,
            },
        )
        .map_err(|e| ssh_err(format!("chmod {mode}: {e}")))?;
    }

    sftp.rename(
        &temp,
        remote,
        Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
    )
    .map_err(|e| ssh_err(format!("rename into {}: {e}", remote.display())))?;

    if let Some(owner) = &action.owner {
        exec(
            &session,
            &format!(
                "chown {} {}",
                shell_quote(owner),
                shell_quote(&remote.display().to_string())
            ),
        )?;
    }
    Ok(())
}

#[async_trait]
impl DeployTarget for SshCopyAction {
    async fn deploy(&self, ctx: &DeployContext, _: &Deployer) -> EngineResult<String> {
        let bytes = ctx.read_source(self.source).await?;
        let remote = ctx.expand(&self.remote_path);

        let action = self.clone();
        let target = remote.clone();
        tokio::task::spawn_blocking(move || upload(&action, &target, &bytes))
            .await
            .map_err(ssh_err)??;

        Ok(format!(
            "Uploaded {} to {}@{}:{}",
            source_label(self.source),
            self.username,
            self.host,
            remote
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_hosts_entry_brackets_custom_ports() {
        assert_eq!(known_hosts_entry("web1", 22), "web1");
        assert_eq!(known_hosts_entry("web1", 2222), "[web1]:2222");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("www-data:www-data"), "'www-data:www-data'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
