use certkeeper_common::Fingerprint;
use clap::Parser;
use serde::Serialize;

mod certificate;
pub use certificate::*;

mod renewal;
pub use renewal::*;

mod settings;
pub use settings::*;

/// A single certificate, by fingerprint. Colons and a `sha256:` prefix are
/// accepted.
#[derive(Clone, Parser)]
pub struct Target {
    pub fingerprint: Fingerprint,
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
