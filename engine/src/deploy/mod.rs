//! Post-renewal deployment pipeline.
//!
//! Actions run one after the other for a certificate. A failing action is
//! recorded and the pipeline moves on; nothing here escalates past the
//! aggregate [`DeployOutcome`].

use std::{
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use certkeeper_common::views::{
    ActionResult, Certificate, CopySource, DeployAction, DeployActionKind, DeployOutcome,
};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    crypto::convert_der_to_pem,
    error::{EngineError, EngineResult},
};

mod command;
mod copy;
mod docker;
mod email;
mod ftp;
mod http;
mod npm;
mod smb;
mod ssh;

pub use npm::TokenCache;

/// One deployable transport. Implemented by every action type; returns a
/// short human readable summary on success.
#[async_trait]
pub trait DeployTarget: Send + Sync {
    async fn deploy(&self, ctx: &DeployContext, deployer: &Deployer) -> EngineResult<String>;
}

pub fn source_label(source: CopySource) -> &'static str {
    match source {
        CopySource::Cert => "certificate",
        CopySource::Key => "private key",
        CopySource::Chain => "chain",
        CopySource::Fullchain => "full chain",
        CopySource::P12 => "PKCS#12 bundle",
    }
}

/// Parse an octal mode such as `"0640"`, `"640"` or `"0o640"`.
pub fn parse_mode(mode: &str) -> EngineResult<u32> {
    let digits = mode.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| EngineError::invalid(format!("{mode:?} is not an octal file mode")))
}

/// Keys stay private unless told otherwise.
pub fn default_mode(source: CopySource) -> u32 {
    match source {
        CopySource::Key | CopySource::P12 => 0o600,
        _ => 0o644,
    }
}

/// Clip command output and response bodies for result messages.
pub(crate) fn summarize(raw: &[u8]) -> String {
    const LIMIT: usize = 512;
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.len() <= LIMIT {
        return text.to_string();
    }
    let mut end = LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Everything an action may need to know about the certificate it ships.
///
/// Chain and full-chain files that do not exist on disk are materialized in
/// a private scratch directory for the lifetime of the context.
#[derive(Debug)]
pub struct DeployContext {
    pub fingerprint: String,
    pub common_name: String,
    pub valid_to: DateTime<Utc>,
    pub cert: PathBuf,
    pub key: Option<PathBuf>,
    pub chain: Option<PathBuf>,
    pub fullchain: Option<PathBuf>,
    pub p12: Option<PathBuf>,
    scratch: Option<PathBuf>,
}

impl DeployContext {
    /// Build the context for `cert`. `issuer_chain_pem` is the PEM chain
    /// assembled from the registry, used when the certificate has no chain
    /// file of its own.
    pub async fn prepare(cert: &Certificate, issuer_chain_pem: Option<Vec<u8>>) -> EngineResult<Self> {
        let scratch = std::env::temp_dir().join(format!("certkeeper-deploy-{}", Uuid::new_v4()));
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&scratch)
            .map_err(|e| EngineError::io(&scratch, e))?;

        let mut ctx = Self {
            fingerprint: cert.fingerprint.to_string(),
            common_name: cert.display_name().to_string(),
            valid_to: cert.valid_to,
            cert: cert.cert_path.clone(),
            key: cert.key_path.clone(),
            chain: cert.chain_path.clone(),
            fullchain: None,
            p12: cert.p12_path.clone(),
            scratch: Some(scratch.clone()),
        };

        if ctx.chain.is_none() {
            if let Some(pem) = issuer_chain_pem.filter(|p| !p.is_empty()) {
                let path = scratch.join("chain.pem");
                tokio::fs::write(&path, &pem)
                    .await
                    .map_err(|e| EngineError::io(&path, e))?;
                ctx.chain = Some(path);
            }
        }

        let mut fullchain = ctx.cert_pem().await?;
        if !fullchain.ends_with(b"\n") {
            fullchain.push(b'\n');
        }
        if let Some(chain) = &ctx.chain {
            let chain_bytes = tokio::fs::read(chain)
                .await
                .map_err(|e| EngineError::io(chain, e))?;
            fullchain.extend_from_slice(&chain_bytes);
        }
        let path = scratch.join("fullchain.pem");
        tokio::fs::write(&path, &fullchain)
            .await
            .map_err(|e| EngineError::io(&path, e))?;
        ctx.fullchain = Some(path);

        Ok(ctx)
    }

    /// The certificate as PEM regardless of its on-disk encoding.
    pub async fn cert_pem(&self) -> EngineResult<Vec<u8>> {
        let bytes = tokio::fs::read(&self.cert)
            .await
            .map_err(|e| EngineError::io(&self.cert, e))?;
        if bytes.starts_with(b"-----") || bytes.windows(11).any(|w| w == b"-----BEGIN ") {
            return Ok(bytes);
        }
        Ok(convert_der_to_pem(&bytes)?.into_bytes())
    }

    /// Path of the file backing `source`.
    pub fn source_path(&self, source: CopySource) -> EngineResult<&Path> {
        let path = match source {
            CopySource::Cert => Some(self.cert.as_path()),
            CopySource::Key => self.key.as_deref(),
            CopySource::Chain => self.chain.as_deref(),
            CopySource::Fullchain => self.fullchain.as_deref(),
            CopySource::P12 => self.p12.as_deref(),
        };
        path.ok_or_else(|| {
            EngineError::invalid(format!(
                "certificate {} has no {} file",
                self.common_name,
                source_label(source)
            ))
        })
    }

    pub async fn read_source(&self, source: CopySource) -> EngineResult<Vec<u8>> {
        let path = self.source_path(source)?;
        tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::io(path, e))
    }

    fn placeholder(&self, name: &str) -> Option<String> {
        let path = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };
        let value = match name {
            "cert" => self.cert.display().to_string(),
            "key" => path(&self.key),
            "chain" => path(&self.chain),
            "fullchain" => path(&self.fullchain),
            "p12" => path(&self.p12),
            "fingerprint" => self.fingerprint.clone(),
            "commonName" => self.common_name.clone(),
            "validTo" => self.valid_to.to_rfc3339_opts(SecondsFormat::Secs, true),
            _ => return None,
        };
        Some(value)
    }

    /// Replace `{{name}}` placeholders. Unknown placeholders are left as is.
    pub fn expand(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let name = after[..end].trim();
                    match self.placeholder(name) {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(&rest[start..start + 2 + end + 2]),
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Environment handed to local commands.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        [
            ("CERTKEEPER_CERT", "cert"),
            ("CERTKEEPER_KEY", "key"),
            ("CERTKEEPER_CHAIN", "chain"),
            ("CERTKEEPER_FULLCHAIN", "fullchain"),
            ("CERTKEEPER_P12", "p12"),
            ("CERTKEEPER_FINGERPRINT", "fingerprint"),
            ("CERTKEEPER_COMMON_NAME", "commonName"),
            ("CERTKEEPER_VALID_TO", "validTo"),
        ]
        .into_iter()
        .filter_map(|(var, name)| self.placeholder(name).map(|v| (var, v)))
        .collect()
    }

    /// JSON event posted by webhooks that carry no body template.
    pub fn event(&self, event: &str) -> serde_json::Value {
        serde_json::json!({
            "event": event,
            "fingerprint": self.fingerprint,
            "commonName": self.common_name,
            "validTo": self.valid_to,
            "certPath": self.cert,
            "timestamp": Utc::now(),
        })
    }
}

impl Drop for DeployContext {
    fn drop(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            if let Err(e) = std::fs::remove_dir_all(&scratch) {
                debug!(dir = %scratch.display(), error = %e, "Failed to remove deploy scratch directory");
            }
        }
    }
}

/// Shared clients for the pipeline: one HTTP client and the Nginx Proxy
/// Manager token cache.
#[derive(Debug, Clone)]
pub struct Deployer {
    pub(crate) http: reqwest::Client,
    pub(crate) npm_tokens: TokenCache,
}

impl Deployer {
    pub fn new() -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("certkeeper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::deploy("http", e.to_string()))?;

        Ok(Self {
            http,
            npm_tokens: TokenCache::new(),
        })
    }

    async fn execute(&self, kind: &DeployActionKind, ctx: &DeployContext) -> EngineResult<String> {
        match kind {
            DeployActionKind::Copy(action) => action.deploy(ctx, self).await,
            DeployActionKind::SshCopy(action) => action.deploy(ctx, self).await,
            DeployActionKind::SmbCopy(action) => action.deploy(ctx, self).await,
            DeployActionKind::FtpCopy(action) => action.deploy(ctx, self).await,
            DeployActionKind::Command(action) => action.deploy(ctx, self).await,
            DeployActionKind::DockerRestart(action) => action.deploy(ctx, self).await,
            DeployActionKind::NginxProxyManager(action) => action.deploy(ctx, self).await,
            DeployActionKind::ApiCall(action) => action.deploy(ctx, self).await,
            DeployActionKind::Webhook(action) => http::Webhook(action).deploy(ctx, self).await,
            DeployActionKind::Email(action) => action.deploy(ctx, self).await,
        }
    }

    async fn run_one(
        &self,
        index: usize,
        action: &DeployAction,
        ctx: &DeployContext,
        cancel: &CancellationToken,
    ) -> ActionResult {
        let kind = action.kind.type_name();
        let timeout = Duration::from_secs(action.timeout_secs());
        let started = Instant::now();

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Canceled),
            r = tokio::time::timeout(timeout, self.execute(&action.kind, ctx)) => match r {
                Ok(result) => result,
                Err(_) => Err(EngineError::deploy(kind, format!("timed out after {}s", timeout.as_secs()))),
            },
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let (success, message) = match result {
            Ok(message) => {
                debug!(action = %action.name, kind, duration_ms, "Deploy action succeeded");
                (true, message)
            }
            Err(e) => {
                warn!(action = %action.name, kind, duration_ms, error = %e, "Deploy action failed");
                (false, e.to_string())
            }
        };

        ActionResult {
            index,
            id: action.id,
            kind: kind.to_string(),
            name: action.name.clone(),
            success,
            message,
            duration_ms,
        }
    }

    /// Run every enabled action in order. Stops early only on cancellation.
    #[instrument(skip_all, fields(fingerprint = %ctx.fingerprint))]
    pub async fn run(
        &self,
        actions: &[DeployAction],
        ctx: &DeployContext,
        cancel: &CancellationToken,
    ) -> DeployOutcome {
        let mut outcome = DeployOutcome::default();

        for (index, action) in actions.iter().enumerate() {
            if !action.enabled {
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }

            let result = self.run_one(index, action, ctx, cancel).await;
            outcome.executed += 1;
            if result.success {
                outcome.succeeded += 1;
            }
            outcome.results.push(result);
        }

        info!(
            executed = outcome.executed,
            succeeded = outcome.succeeded,
            "Deployment finished"
        );
        outcome
    }
}

/// Rearrange `actions` so that position `i` holds the action previously at
/// `order[i]`. `order` must be a permutation of the current indices.
pub fn reorder(actions: &mut Vec<DeployAction>, order: &[usize]) -> EngineResult<()> {
    if order.len() != actions.len() {
        return Err(EngineError::invalid(format!(
            "expected {} indices, got {}",
            actions.len(),
            order.len()
        )));
    }

    let mut seen = vec![false; actions.len()];
    for &i in order {
        match seen.get_mut(i) {
            Some(slot) if !*slot => *slot = true,
            Some(_) => return Err(EngineError::invalid(format!("index {i} appears twice"))),
            None => return Err(EngineError::invalid(format!("index {i} is out of range"))),
        }
    }

    let mut slots: Vec<Option<DeployAction>> = actions.drain(..).map(Some).collect();
    for &i in order {
        if let Some(action) = slots[i].take() {
            actions.push(action);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use certkeeper_common::views::{CommandAction, CopyAction};

    fn command(name: &str, cmd: &str) -> DeployAction {
        DeployAction::new(
            name,
            DeployActionKind::Command(CommandAction {
                command: cmd.into(),
                working_dir: None,
                env: Default::default(),
            }),
        )
    }

    fn context(dir: &Path) -> DeployContext {
        let cert = dir.join("web.crt");
        std::fs::write(&cert, b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n")
            .unwrap();
        DeployContext {
            fingerprint: "ABCD".into(),
            common_name: "web.example.com".into(),
            valid_to: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            cert,
            key: Some(dir.join("web.key")),
            chain: None,
            fullchain: None,
            p12: None,
            scratch: None,
        }
    }

    #[test]
    fn test_expand_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let out = ctx.expand("cp {{cert}} {{ key }} # {{fingerprint}} {{validTo}} {{p12}}|{{nope}} {{");
        assert_eq!(
            out,
            format!(
                "cp {} {} # ABCD 2023-11-14T22:13:20Z |{{{{nope}}}} {{{{",
                ctx.cert.display(),
                dir.path().join("web.key").display()
            )
        );
    }

    #[test]
    fn test_reorder_is_a_permutation() {
        let mut actions = vec![command("a", "true"), command("b", "true"), command("c", "true")];
        let ids: Vec<Uuid> = actions.iter().map(|a| a.id).collect();

        reorder(&mut actions, &[2, 0, 1]).unwrap();
        let names: Vec<_> = actions.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(actions[0].id, ids[2]);
        assert_eq!(actions[1].id, ids[0]);

        assert!(reorder(&mut actions, &[0, 0, 1]).is_err());
        assert!(reorder(&mut actions, &[0, 1]).is_err());
        assert!(reorder(&mut actions, &[0, 1, 3]).is_err());
        // Failed reorders leave the list alone.
        let names: Vec<_> = actions.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("0640").unwrap(), 0o640);
        assert_eq!(parse_mode("600").unwrap(), 0o600);
        assert_eq!(parse_mode("0o755").unwrap(), 0o755);
        assert!(parse_mode("rw-r--r--").is_err());
        assert!(parse_mode("99").is_err());
    }

    #[tokio::test]
    async fn test_pipeline_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let out = dir.path().join("out/web.pem");

        let mut disabled = command("skipped", "false");
        disabled.enabled = false;

        let actions = vec![
            command("fails", "exit 3"),
            disabled,
            DeployAction::new(
                "copy",
                DeployActionKind::Copy(CopyAction {
                    source: CopySource::Cert,
                    destination: out.clone(),
                    mode: None,
                    owner: None,
                }),
            ),
        ];

        let deployer = Deployer::new().unwrap();
        let outcome = deployer.run(&actions, &ctx, &CancellationToken::new()).await;

        assert_eq!(outcome.executed, 2);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.results[0].index, 0);
        assert!(!outcome.results[0].success);
        assert_eq!(outcome.results[1].index, 2);
        assert!(outcome.results[1].success);
        assert_eq!(std::fs::read(&out).unwrap(), std::fs::read(&ctx.cert).unwrap());
    }

    #[tokio::test]
    async fn test_action_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut slow = command("slow", "sleep 5");
        slow.timeout_secs = Some(1);

        let deployer = Deployer::new().unwrap();
        let outcome = deployer.run(&[slow], &ctx, &CancellationToken::new()).await;

        assert_eq!(outcome.succeeded, 0);
        assert!(outcome.results[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_prepare_materializes_chain() {
        let dir = tempfile::tempdir().unwrap();
        let base = context(dir.path());

        let cert = Certificate {
            fingerprint: "ABCD".parse().unwrap(),
            common_name: Some("web.example.com".into()),
            subject: "CN=web.example.com".into(),
            issuer: "CN=Root".into(),
            issuer_cn: Some("Root".into()),
            serial_number: "01".into(),
            signature_algorithm: "ecdsa-with-SHA256".into(),
            subject_key_identifier: None,
            authority_key_identifier: None,
            key_type: None,
            key_size: None,
            valid_from: base.valid_to,
            valid_to: base.valid_to,
            sans: Default::default(),
            is_ca: false,
            path_len_constraint: None,
            is_self_signed: false,
            is_root_ca: false,
            key_cert_sign: false,
            original_encoding: Default::default(),
            cert_path: base.cert.clone(),
            key_path: None,
            chain_path: None,
            p12_path: None,
            auto_renew: false,
            renew_days_before_expiry: None,
            deploy_actions: Vec::new(),
            has_stored_passphrase: false,
            signed_by: None,
            signs: Default::default(),
        };

        let chain = b"-----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----\n".to_vec();
        let ctx = DeployContext::prepare(&cert, Some(chain.clone())).await.unwrap();

        let scratch = ctx.scratch.clone().unwrap();
        assert_eq!(std::fs::read(ctx.chain.as_ref().unwrap()).unwrap(), chain);
        let full = std::fs::read(ctx.fullchain.as_ref().unwrap()).unwrap();
        assert!(full.starts_with(&std::fs::read(&ctx.cert).unwrap()));
        assert!(full.ends_with(&chain));
        assert!(ctx.source_path(CopySource::Key).is_err());

        drop(ctx);
        assert!(!scratch.exists());
    }
}
