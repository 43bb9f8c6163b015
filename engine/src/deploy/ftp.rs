use std::io::Cursor;

use async_trait::async_trait;
use certkeeper_common::views::FtpCopyAction;
use suppaftp::{FtpStream, types::FileType};

use super::{DeployContext, DeployTarget, Deployer, source_label};
use crate::error::{EngineError, EngineResult};

fn ftp_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::deploy("ftp-copy", e.to_string())
}

/// Every parent directory of `remote`, shallowest first.
fn parents(remote: &str) -> Vec<String> {
    let absolute = remote.starts_with('/');
    let parts: Vec<&str> = remote.split('/').filter(|p| !p.is_empty()).collect();
    (1..parts.len())
        .map(|depth| {
            let joined = parts[..depth].join("/");
            if absolute { format!("/{joined}") } else { joined }
        })
        .collect()
}

fn upload(action: &FtpCopyAction, remote: &str, bytes: Vec<u8>) -> EngineResult<()> {
    let mut ftp = FtpStream::connect((action.host.as_str(), action.port)).map_err(ftp_err)?;
    ftp.login(&action.username, &action.password).map_err(ftp_err)?;
    ftp.transfer_type(FileType::Binary).map_err(ftp_err)?;

    if action.mkdir {
        for dir in parents(remote) {
            // Existing directories answer 550.
            let _ = ftp.mkdir(&dir);
        }
    }

    ftp.put_file(remote, &mut Cursor::new(bytes)).map_err(ftp_err)?;
    let _ = ftp.quit();
    Ok(())
}

#[async_trait]
impl DeployTarget for FtpCopyAction {
    async fn deploy(&self, ctx: &DeployContext, _: &Deployer) -> EngineResult<String> {
        let bytes = ctx.read_source(self.source).await?;
        let remote = ctx.expand(&self.remote_path);

        let action = self.clone();
        let target = remote.clone();
        tokio::task::spawn_blocking(move || upload(&action, &target, bytes))
            .await
            .map_err(ftp_err)??;

        Ok(format!(
            "Uploaded {} to ftp://{}:{}{}",
            source_label(self.source),
            self.host,
            self.port,
            if remote.starts_with('/') { remote } else { format!("/{remote}") }
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parents() {
        assert_eq!(parents("/a/b/c.pem"), vec!["/a", "/a/b"]);
        assert_eq!(parents("a/c.pem"), vec!["a"]);
        assert!(parents("c.pem").is_empty());
    }
}
