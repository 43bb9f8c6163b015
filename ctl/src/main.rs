use std::sync::Arc;

use certkeeper_engine::{Engine, EngineConfig, clock::SystemClock};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{
    ActionParams, ActivitiesParams, CreateCaParams, CreateCertParams, DefaultsParams,
    DeleteParams, ExportParams, ImportParams, ListParams, PassphraseParams, SignCsrParams,
    Target, UpdateParams,
};

mod commands;

#[derive(Parser)]
#[clap(version, about = "Manage certificates tracked by certkeeper")]
pub struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    engine: EngineConfig,
}

#[derive(Clone, Subcommand)]
pub enum Command {
    /// List tracked certificates.
    #[command(name = "list")]
    List(ListParams),

    #[command(name = "show")]
    Show(Target),

    #[command(name = "create-ca")]
    CreateCa(CreateCaParams),

    #[command(name = "create-cert")]
    CreateCert(CreateCertParams),

    #[command(name = "sign-csr")]
    SignCsr(SignCsrParams),

    /// Track a certificate file, or copy PEM, PKCS#12 or PKCS#7 material in.
    #[command(name = "import")]
    Import(ImportParams),

    #[command(name = "export")]
    Export(ExportParams),

    #[command(name = "update")]
    Update(UpdateParams),

    #[command(name = "delete")]
    Delete(DeleteParams),

    /// Renew one certificate now.
    #[command(name = "renew")]
    Renew(Target),

    /// Run one pass of the renewal job.
    #[command(name = "check-renewals")]
    CheckRenewals,

    /// Run the deploy actions of a certificate.
    #[command(name = "deploy")]
    Deploy(Target),

    #[command(name = "action", subcommand)]
    Action(ActionParams),

    #[command(name = "set-passphrase")]
    SetPassphrase(PassphraseParams),

    #[command(name = "clear-passphrase")]
    ClearPassphrase(Target),

    #[command(name = "defaults")]
    Defaults(DefaultsParams),

    #[command(name = "activities")]
    Activities(ActivitiesParams),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();
    args.engine.disable_watcher = true;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or("certkeeper_engine=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let engine = Engine::open(args.engine, Arc::new(SystemClock)).await?;

    match args.command {
        Command::List(params) => commands::list(&engine, params).await,
        Command::Show(target) => commands::show(&engine, target).await,
        Command::CreateCa(params) => commands::create_ca(&engine, params).await,
        Command::CreateCert(params) => commands::create_cert(&engine, params).await,
        Command::SignCsr(params) => commands::sign_csr(&engine, params).await,
        Command::Import(params) => commands::import(&engine, params).await,
        Command::Export(params) => commands::export(&engine, params).await,
        Command::Update(params) => commands::update(&engine, params).await,
        Command::Delete(params) => commands::delete(&engine, params).await,
        Command::Renew(target) => commands::renew(&engine, target).await,
        Command::CheckRenewals => commands::check_renewals(&engine).await,
        Command::Deploy(target) => commands::deploy(&engine, target).await,
        Command::Action(params) => commands::action(&engine, params).await,
        Command::SetPassphrase(params) => commands::set_passphrase(&engine, params).await,
        Command::ClearPassphrase(target) => commands::clear_passphrase(&engine, target).await,
        Command::Defaults(params) => commands::defaults(&engine, params).await,
        Command::Activities(params) => commands::activities(&engine, params).await,
    }
}
