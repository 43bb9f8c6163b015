use std::path::{Path, PathBuf};

use async_trait::async_trait;
use certkeeper_common::views::CopyAction;
use nix::unistd::{Gid, Group, Uid, User, chown};

use super::{DeployContext, DeployTarget, Deployer, default_mode, parse_mode, source_label};
use crate::{
    error::{EngineError, EngineResult},
    files,
};

/// Resolve `user` or `user:group`, by name or numeric id.
fn resolve_owner(owner: &str) -> EngineResult<(Option<Uid>, Option<Gid>)> {
    let (user, group) = match owner.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (owner, None),
    };

    let uid = match user.trim() {
        "" => None,
        name => Some(match name.parse::<u32>() {
            Ok(id) => Uid::from_raw(id),
            Err(_) => User::from_name(name)
                .map_err(|e| EngineError::deploy("copy", format!("user lookup {name:?}: {e}")))?
                .ok_or_else(|| EngineError::deploy("copy", format!("unknown user {name:?}")))?
                .uid,
        }),
    };

    let gid = match group.map(str::trim) {
        None | Some("") => None,
        Some(name) => Some(match name.parse::<u32>() {
            Ok(id) => Gid::from_raw(id),
            Err(_) => Group::from_name(name)
                .map_err(|e| EngineError::deploy("copy", format!("group lookup {name:?}: {e}")))?
                .ok_or_else(|| EngineError::deploy("copy", format!("unknown group {name:?}")))?
                .gid,
        }),
    };

    Ok((uid, gid))
}

fn set_owner(path: &Path, owner: &str) -> EngineResult<()> {
    let (uid, gid) = resolve_owner(owner)?;
    chown(path, uid, gid)
        .map_err(|e| EngineError::deploy("copy", format!("chown {owner} {}: {e}", path.display())))
}

#[async_trait]
impl DeployTarget for CopyAction {
    async fn deploy(&self, ctx: &DeployContext, _: &Deployer) -> EngineResult<String> {
        let bytes = ctx.read_source(self.source).await?;
        let destination = PathBuf::from(ctx.expand(&self.destination.to_string_lossy()));
        let mode = match &self.mode {
            Some(mode) => parse_mode(mode)?,
            None => default_mode(self.source),
        };
        let owner = self.owner.clone();

        let target = destination.clone();
        tokio::task::spawn_blocking(move || {
            files::write_atomic(&target, &bytes, mode)?;
            if let Some(owner) = owner {
                set_owner(&target, &owner)?;
            }
            Ok::<_, EngineError>(())
        })
        .await
        .map_err(|e| EngineError::deploy("copy", e.to_string()))??;

        Ok(format!(
            "Copied {} to {}",
            source_label(self.source),
            destination.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_numeric_owner() {
        let (uid, gid) = resolve_owner("1000:1001").unwrap();
        assert_eq!(uid, Some(Uid::from_raw(1000)));
        assert_eq!(gid, Some(Gid::from_raw(1001)));

        let (uid, gid) = resolve_owner(":0").unwrap();
        assert_eq!(uid, None);
        assert_eq!(gid, Some(Gid::from_raw(0)));
    }

    #[test]
    fn test_unknown_user_is_an_error() {
        assert!(resolve_owner("no-such-user-certkeeper").is_err());
    }
}
