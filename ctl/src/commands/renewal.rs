use std::path::PathBuf;

use anyhow::Context;
use certkeeper_common::{Fingerprint, params::DeployActionParams};
use certkeeper_engine::Engine;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use super::{Target, print};

pub async fn renew(engine: &Engine, Target { fingerprint }: Target) -> anyhow::Result<()> {
    let renewed = engine.renew(&fingerprint).await?;
    println!(
        "Renewed {} -> {}, valid until {}",
        renewed.old_fingerprint.short(),
        renewed.new_fingerprint,
        renewed.valid_to
    );
    if let Some(outcome) = &renewed.deploy {
        print(outcome)?;
    }
    Ok(())
}

pub async fn check_renewals(engine: &Engine) -> anyhow::Result<()> {
    print(&engine.check_renewals().await?)
}

pub async fn deploy(engine: &Engine, Target { fingerprint }: Target) -> anyhow::Result<()> {
    let outcome = engine.deploy(&fingerprint).await?;
    print(&outcome)?;
    if !outcome.all_succeeded() {
        anyhow::bail!(
            "{} of {} deploy action(s) failed",
            outcome.executed - outcome.succeeded,
            outcome.executed
        );
    }
    Ok(())
}

/// Deploy action definitions are read as JSON, in the same shape they are
/// stored in.
#[derive(Clone, Parser)]
pub struct ActionSource {
    /// File holding the action, or `-` for stdin.
    #[clap(long, short = 'f')]
    pub file: PathBuf,
}

impl ActionSource {
    fn read(&self) -> anyhow::Result<DeployActionParams> {
        let raw = if self.file.as_os_str() == "-" {
            std::io::read_to_string(std::io::stdin())?
        } else {
            std::fs::read_to_string(&self.file)
                .with_context(|| format!("reading {}", self.file.display()))?
        };
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Clone, Subcommand)]
pub enum ActionParams {
    #[command(name = "add")]
    Add {
        fingerprint: Fingerprint,
        #[clap(flatten)]
        source: ActionSource,
    },

    #[command(name = "update")]
    Update {
        fingerprint: Fingerprint,
        id: Uuid,
        #[clap(flatten)]
        source: ActionSource,
    },

    #[command(name = "remove")]
    Remove { fingerprint: Fingerprint, id: Uuid },

    /// Enable or disable an action. Flips it without `--enabled`.
    #[command(name = "toggle")]
    Toggle {
        fingerprint: Fingerprint,
        id: Uuid,
        #[clap(long)]
        enabled: Option<bool>,
    },

    /// New order as old positions, e.g. `2 0 1`.
    #[command(name = "reorder")]
    Reorder {
        fingerprint: Fingerprint,
        #[clap(required = true)]
        order: Vec<usize>,
    },
}

pub async fn action(engine: &Engine, params: ActionParams) -> anyhow::Result<()> {
    match params {
        ActionParams::Add {
            fingerprint,
            source,
        } => print(&engine.add_deploy_action(&fingerprint, source.read()?).await?),
        ActionParams::Update {
            fingerprint,
            id,
            source,
        } => print(
            &engine
                .update_deploy_action(&fingerprint, id, source.read()?)
                .await?,
        ),
        ActionParams::Remove { fingerprint, id } => {
            engine.delete_deploy_action(&fingerprint, id).await?;
            println!("Removed action {id}");
            Ok(())
        }
        ActionParams::Toggle {
            fingerprint,
            id,
            enabled,
        } => print(
            &engine
                .toggle_deploy_action(&fingerprint, id, enabled)
                .await?,
        ),
        ActionParams::Reorder { fingerprint, order } => {
            print(&engine.reorder_deploy_actions(&fingerprint, &order).await?)
        }
    }
}
