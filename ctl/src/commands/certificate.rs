use std::path::PathBuf;

use anyhow::{Context, bail};
use certkeeper_common::{
    Fingerprint,
    params::{
        self as api, DeleteOptions, ImportPemParams, KeySpec, ListFilter, P12Cipher,
        UpdateCertificateParams,
    },
};
use certkeeper_engine::Engine;
use clap::{Parser, ValueEnum};

use super::{Target, print};

#[derive(Clone, Parser)]
pub struct ListParams {
    #[clap(long)]
    pub ca_only: bool,

    /// Only certificates expiring within this many days.
    #[clap(long)]
    pub expiring_within: Option<i64>,
}

pub async fn list(engine: &Engine, params: ListParams) -> anyhow::Result<()> {
    let certs = engine
        .list_certificates(ListFilter {
            ca_only: params.ca_only,
            expiring_within_days: params.expiring_within,
        })
        .await?;

    let now = engine.now();
    for cert in &certs {
        println!(
            "{}  {:>5}d  {}{}",
            cert.fingerprint.short(),
            cert.days_remaining(now),
            cert.display_name(),
            if cert.is_ca { "  [CA]" } else { "" }
        );
    }
    Ok(())
}

pub async fn show(engine: &Engine, Target { fingerprint }: Target) -> anyhow::Result<()> {
    print(&engine.get_certificate(&fingerprint).await?)
}

#[derive(Clone, Parser)]
pub struct CreateCaParams {
    /// Distinguished name, e.g. `CN=Acme Root,O=Acme`
    #[clap(short, long)]
    pub subject: String,

    #[clap(short, long, default_value = "rsa-2048")]
    pub key: KeySpec,

    #[clap(short, long)]
    pub days: Option<u32>,

    /// Fingerprint of the CA that signs this one. Omit for a root.
    #[clap(short, long)]
    pub issuer: Option<Fingerprint>,

    #[clap(long)]
    pub path_len: Option<u32>,

    #[clap(long, env = "CERTKEEPER_KEY_PASSPHRASE")]
    pub passphrase: Option<String>,

    /// Keep the passphrase so the CA can be used unattended.
    #[clap(long, requires = "passphrase")]
    pub store_passphrase: bool,

    #[clap(long)]
    pub auto_renew: bool,
}

pub async fn create_ca(engine: &Engine, params: CreateCaParams) -> anyhow::Result<()> {
    let cert = engine
        .create_ca(api::CreateCaParams {
            subject: params.subject,
            key: params.key,
            days: params.days,
            issuer: params.issuer,
            path_len: params.path_len,
            passphrase: params.passphrase,
            store_passphrase: params.store_passphrase,
            auto_renew: params.auto_renew,
            renew_days_before_expiry: None,
        })
        .await?;

    println!("Created {} at {}", cert.fingerprint, cert.cert_path.display());
    Ok(())
}

#[derive(Clone, Parser)]
pub struct CreateCertParams {
    #[clap(short, long)]
    pub subject: String,

    /// DNS name or IP address. Repeat for more.
    #[clap(long = "san")]
    pub sans: Vec<String>,

    #[clap(short, long)]
    pub issuer: Fingerprint,

    #[clap(short, long, default_value = "rsa-2048")]
    pub key: KeySpec,

    #[clap(short, long)]
    pub days: Option<u32>,

    #[clap(long)]
    pub auto_renew: bool,

    #[clap(long)]
    pub renew_days_before_expiry: Option<i64>,

    #[clap(long, env = "CERTKEEPER_KEY_PASSPHRASE")]
    pub key_passphrase: Option<String>,
}

pub async fn create_cert(engine: &Engine, params: CreateCertParams) -> anyhow::Result<()> {
    let cert = engine
        .create_certificate(api::CreateCertificateParams {
            subject: params.subject,
            sans: params.sans,
            key: params.key,
            days: params.days,
            issuer: params.issuer,
            auto_renew: params.auto_renew,
            renew_days_before_expiry: params.renew_days_before_expiry,
            key_passphrase: params.key_passphrase,
        })
        .await?;

    println!("Issued {} at {}", cert.fingerprint, cert.cert_path.display());
    Ok(())
}

#[derive(Clone, Parser)]
pub struct SignCsrParams {
    pub csr: PathBuf,

    #[clap(short, long)]
    pub issuer: Fingerprint,

    #[clap(short, long)]
    pub days: Option<u32>,

    #[clap(short, long)]
    pub name: Option<String>,
}

pub async fn sign_csr(engine: &Engine, params: SignCsrParams) -> anyhow::Result<()> {
    let csr_pem = std::fs::read_to_string(&params.csr)
        .with_context(|| format!("reading {}", params.csr.display()))?;

    let cert = engine
        .sign_csr(api::SignCsrParams {
            csr_pem,
            issuer: params.issuer,
            days: params.days,
            name: params.name,
        })
        .await?;

    println!("Signed {} at {}", cert.fingerprint, cert.cert_path.display());
    Ok(())
}

#[derive(Clone, Parser)]
pub struct ImportParams {
    pub path: PathBuf,

    /// Private key to copy in alongside the certificate.
    #[clap(long)]
    pub key: Option<PathBuf>,

    /// Passphrase of `--key`, or of a PKCS#12 file.
    #[clap(long, env = "CERTKEEPER_IMPORT_PASSPHRASE")]
    pub passphrase: Option<String>,

    /// Base file name for the copied material.
    #[clap(long)]
    pub name: Option<String>,

    /// Copy the certificate into the certificate directory instead of
    /// tracking it where it is.
    #[clap(long)]
    pub copy: bool,
}

pub async fn import(engine: &Engine, params: ImportParams) -> anyhow::Result<()> {
    let extension = params
        .path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let read = |path: &PathBuf| {
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))
    };

    let imported = match extension.as_str() {
        "p12" | "pfx" => {
            let passphrase = params.passphrase.unwrap_or_default();
            vec![
                engine
                    .import_p12(&read(&params.path)?, &passphrase, params.name.as_deref())
                    .await?,
            ]
        }
        "p7b" | "p7c" => engine.import_p7b(&read(&params.path)?).await?,
        _ if params.copy || params.key.is_some() => {
            let key = params.key.as_ref().map(read).transpose()?;
            vec![
                engine
                    .import_pem(ImportPemParams {
                        cert: read(&params.path)?,
                        key,
                        key_passphrase: params.passphrase,
                        name: params.name,
                    })
                    .await?,
            ]
        }
        _ => vec![engine.import_file(&params.path).await?],
    };

    for cert in imported {
        println!("Imported {} ({})", cert.fingerprint, cert.display_name());
    }
    Ok(())
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ExportFormat {
    P12,
    P7b,
}

#[derive(Clone, Parser)]
pub struct ExportParams {
    pub fingerprint: Fingerprint,

    #[clap(short, long, value_enum)]
    pub format: ExportFormat,

    #[clap(short, long)]
    pub out: PathBuf,

    #[clap(long, env = "CERTKEEPER_EXPORT_PASSPHRASE")]
    pub passphrase: Option<String>,

    /// Protect a PKCS#12 archive with 3DES for older consumers.
    #[clap(long)]
    pub legacy_cipher: bool,
}

pub async fn export(engine: &Engine, params: ExportParams) -> anyhow::Result<()> {
    let bytes = match params.format {
        ExportFormat::P12 => {
            let Some(passphrase) = &params.passphrase else {
                bail!("a PKCS#12 export needs --passphrase");
            };
            let cipher = if params.legacy_cipher {
                P12Cipher::TripleDes
            } else {
                P12Cipher::Aes256
            };
            engine
                .export_p12(&params.fingerprint, passphrase, cipher)
                .await?
        }
        ExportFormat::P7b => engine.export_p7b(&params.fingerprint).await?,
    };

    std::fs::write(&params.out, bytes)
        .with_context(|| format!("writing {}", params.out.display()))?;
    println!("Wrote {}", params.out.display());
    Ok(())
}

#[derive(Clone, Parser)]
pub struct UpdateParams {
    pub fingerprint: Fingerprint,

    #[clap(long)]
    pub auto_renew: Option<bool>,

    #[clap(long)]
    pub renew_days_before_expiry: Option<i64>,

    #[clap(long)]
    pub key_path: Option<PathBuf>,

    #[clap(long)]
    pub chain_path: Option<PathBuf>,

    #[clap(long)]
    pub p12_path: Option<PathBuf>,
}

pub async fn update(engine: &Engine, params: UpdateParams) -> anyhow::Result<()> {
    let cert = engine
        .update_certificate(
            &params.fingerprint,
            UpdateCertificateParams {
                auto_renew: params.auto_renew,
                renew_days_before_expiry: params.renew_days_before_expiry,
                key_path: params.key_path,
                chain_path: params.chain_path,
                p12_path: params.p12_path,
            },
        )
        .await?;
    print(&cert)
}

#[derive(Clone, Parser)]
pub struct DeleteParams {
    pub fingerprint: Fingerprint,

    /// Also delete every certificate this one issued.
    #[clap(long)]
    pub cascade: bool,

    /// Remove certificate and key files from disk.
    #[clap(long)]
    pub delete_files: bool,
}

pub async fn delete(engine: &Engine, params: DeleteParams) -> anyhow::Result<()> {
    let removed = engine
        .delete_certificate(
            &params.fingerprint,
            DeleteOptions {
                cascade: params.cascade,
                delete_files: params.delete_files,
            },
        )
        .await?;

    for fingerprint in removed {
        println!("Deleted {fingerprint}");
    }
    Ok(())
}

#[derive(Clone, Parser)]
pub struct PassphraseParams {
    pub fingerprint: Fingerprint,

    #[clap(long, env = "CERTKEEPER_KEY_PASSPHRASE")]
    pub passphrase: String,
}

pub async fn set_passphrase(engine: &Engine, params: PassphraseParams) -> anyhow::Result<()> {
    engine
        .set_ca_passphrase(&params.fingerprint, &params.passphrase)
        .await?;
    println!("Stored passphrase for {}", params.fingerprint);
    Ok(())
}

pub async fn clear_passphrase(engine: &Engine, Target { fingerprint }: Target) -> anyhow::Result<()> {
    engine.clear_ca_passphrase(&fingerprint).await?;
    println!("Cleared passphrase for {fingerprint}");
    Ok(())
}
