use certkeeper_common::{params::ActivityFilter, views::ActivityKind};
use certkeeper_engine::Engine;
use clap::{Parser, ValueEnum};

use super::print;

/// Show the global defaults, or change the ones given.
#[derive(Clone, Parser)]
pub struct DefaultsParams {
    /// Cron expression, five or six fields.
    #[clap(long)]
    pub renewal_schedule: Option<String>,

    #[clap(long)]
    pub renew_days_before_expiry: Option<i64>,

    #[clap(long)]
    pub auto_renewal_job: Option<bool>,

    #[clap(long)]
    pub root_ca_days: Option<u32>,

    #[clap(long)]
    pub intermediate_ca_days: Option<u32>,

    #[clap(long)]
    pub standard_days: Option<u32>,
}

pub async fn defaults(engine: &Engine, params: DefaultsParams) -> anyhow::Result<()> {
    let mut defaults = engine.global_defaults().await;
    let before = defaults.clone();

    if let Some(schedule) = params.renewal_schedule {
        defaults.renewal_schedule = schedule;
    }
    if let Some(days) = params.renew_days_before_expiry {
        defaults.renew_days_before_expiry = days;
    }
    if let Some(enabled) = params.auto_renewal_job {
        defaults.enable_auto_renewal_job = enabled;
    }
    if let Some(days) = params.root_ca_days {
        defaults.ca_validity_period.root_ca = days;
    }
    if let Some(days) = params.intermediate_ca_days {
        defaults.ca_validity_period.intermediate_ca = days;
    }
    if let Some(days) = params.standard_days {
        defaults.ca_validity_period.standard = days;
    }

    if defaults != before {
        defaults = engine.set_global_defaults(defaults).await?;
    }
    print(&defaults)
}

#[derive(Clone, Copy, ValueEnum)]
pub enum KindArg {
    Certificate,
    User,
    System,
}

impl From<KindArg> for ActivityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Certificate => ActivityKind::Certificate,
            KindArg::User => ActivityKind::User,
            KindArg::System => ActivityKind::System,
        }
    }
}

#[derive(Clone, Parser)]
pub struct ActivitiesParams {
    #[clap(long = "type", value_enum)]
    pub kind: Option<KindArg>,

    #[clap(short, long)]
    pub search: Option<String>,

    #[clap(short = 'n', long, default_value_t = 50)]
    pub limit: usize,
}

pub async fn activities(engine: &Engine, params: ActivitiesParams) -> anyhow::Result<()> {
    let records = engine
        .activities(ActivityFilter {
            kind: params.kind.map(Into::into),
            search: params.search,
            limit: Some(params.limit),
        })
        .await?;

    for record in records {
        println!(
            "{}  {:<11}  {:<16}  {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.kind.to_string(),
            record.action.as_deref().unwrap_or("-"),
            record.message
        );
    }
    Ok(())
}
