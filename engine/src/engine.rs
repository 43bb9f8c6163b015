//! The engine value: owns every component and exposes the caller-facing
//! operations. Constructed once by the daemon (or the CLI, or a test) and
//! passed around by reference.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use certkeeper_common::{
    Fingerprint,
    params::{
        ActivityFilter, CreateCaParams, CreateCertificateParams, DeleteOptions, DeployActionParams,
        ImportPemParams, KeySpec, ListFilter, P12Cipher, SignCsrParams, UpdateCertificateParams,
    },
    views::{
        Activity, ActivityKind, Certificate, DeployAction, DeployOutcome, Encoding,
        GlobalDefaults, RenewalFailure, RenewalReport, RenewedCertificate,
    },
};
use chrono::{DateTime, Utc};
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use serde_json::json;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    activity::{ActivityLog, activity},
    clock::Clock,
    config::EngineConfig,
    crypto::{
        CertInfo, CertProfile, SanList, bundle, dn, fingerprint_der, issue, keys, load_x509,
        parse::parse_der, parse_certificate,
    },
    deploy::{self, DeployContext, Deployer},
    error::{EngineError, EngineResult},
    files,
    registry::{PathChange, Registry, build_certificate},
    scheduler::{self, RenewalLocks},
    store::{CertConfig, ConfigStore},
    vault::PassphraseVault,
    watcher::{self, IgnoreList},
};

/// Extensions a new certificate or key may land under; used to pick a free
/// file name.
const MATERIAL_EXTENSIONS: &[&str] = &["crt", "der", "key"];

fn join_err(e: tokio::task::JoinError) -> EngineError {
    EngineError::Crypto(format!("background task failed: {e}"))
}

async fn generate_key(spec: KeySpec) -> EngineResult<PKey<Private>> {
    tokio::task::spawn_blocking(move || keys::generate_key(spec))
        .await
        .map_err(join_err)?
}

fn read(path: &Path) -> EngineResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| EngineError::io(path, e))
}

fn summary(cert: &Certificate) -> serde_json::Value {
    json!({
        "fingerprint": cert.fingerprint,
        "commonName": cert.common_name,
        "path": cert.cert_path,
        "validTo": cert.valid_to,
    })
}

pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: ConfigStore,
    vault: PassphraseVault,
    activities: ActivityLog,
    registry: RwLock<Registry>,
    ignore: Arc<IgnoreList>,
    locks: RenewalLocks,
    deployer: Deployer,
    rearm: Notify,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Load configuration, credentials and the activity log, then scan the
    /// certificate directory.
    #[instrument(skip_all, fields(certs_dir = %config.certs_dir.display()))]
    pub async fn open(config: EngineConfig, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        for dir in [&config.config_dir, &config.certs_dir] {
            std::fs::create_dir_all(dir).map_err(|e| EngineError::io(dir, e))?;
        }

        let store = ConfigStore::load(config.cert_config_path())?;
        let vault = PassphraseVault::open(config.encryption_key_path())?;
        let activities = ActivityLog::load(config.activities_path(), config.activity_log_max)?;

        let doc = store.snapshot().await;
        let registry = Registry::scan(&config.certs_dir, &doc);
        let count = registry.len();

        let engine = Self {
            ignore: Arc::new(IgnoreList::new(Duration::from_millis(config.ignore_window_ms))),
            deployer: Deployer::new()?,
            registry: RwLock::new(registry),
            locks: RenewalLocks::default(),
            rearm: Notify::new(),
            config,
            clock,
            store,
            vault,
            activities,
        };

        engine
            .record(
                ActivityKind::System,
                "registry-ready",
                format!("Loaded {count} certificate(s)"),
                json!({ "count": count, "certsDir": engine.config.certs_dir }),
            )
            .await;
        Ok(engine)
    }

    /// Watch the certificate directory and run the renewal job until
    /// `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> EngineResult<()> {
        let watch = if self.config.disable_watcher {
            None
        } else {
            Some(watcher::watch(&self.config.certs_dir)?)
        };

        let watching = async {
            match watch {
                Some((_watcher, events)) => {
                    watcher::dispatch(
                        events,
                        Duration::from_millis(self.config.watch_debounce_ms),
                        Arc::clone(&self.ignore),
                        cancel.clone(),
                        |path| self.on_file_event(path),
                    )
                    .await
                }
                None => cancel.cancelled().await,
            }
        };

        tokio::join!(watching, scheduler::run(self, cancel.clone()));
        info!("Engine stopped");
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn rearm_signal(&self) -> &Notify {
        &self.rearm
    }

    async fn record(
        &self,
        kind: ActivityKind,
        action: &str,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        self.activities
            .record(activity(self.now(), kind, action, message, data))
            .await;
    }

    /// Write certificate material, keeping the watcher quiet about it.
    fn write_material(&self, path: &Path, bytes: &[u8], mode: u32) -> EngineResult<()> {
        self.ignore.ignore([path]);
        if self.config.enable_certificate_backups {
            if let Some(backup) = files::backup(path, self.now())? {
                debug!(path = %path.display(), backup = %backup.display(), "Backed up certificate file");
            }
        }
        files::write_atomic(path, bytes, mode)
    }

    fn new_stem(&self, name: &str) -> String {
        files::unique_stem(&self.config.certs_dir, &files::slug(name), MATERIAL_EXTENSIONS)
    }

    /// Persist policy for a certificate and put it in the registry. The
    /// config entry always remembers where the certificate lives.
    async fn track(
        &self,
        registry: &mut Registry,
        info: CertInfo,
        cert_path: PathBuf,
        edit: impl FnOnce(&mut CertConfig) -> EngineResult<()>,
    ) -> EngineResult<Certificate> {
        let fingerprint = info.fingerprint.clone();
        let config = self
            .store
            .update(|doc| {
                let entry = doc.entry(fingerprint.as_str());
                entry.cert_path = Some(cert_path.clone());
                edit(entry)?;
                Ok(entry.clone())
            })
            .await?;

        registry.insert(build_certificate(info, cert_path, Some(&config)));
        registry.require(&fingerprint).cloned()
    }

    /// Re-read stored policy into the registry after a config edit.
    async fn refresh_policy(&self, registry: &mut Registry, fingerprint: &Fingerprint) {
        let config = self.store.get(fingerprint.as_str()).await;
        registry.apply_config(fingerprint, config.as_ref());
    }

    /// Private key of a tracked certificate, opened with the vault's
    /// passphrase when it is encrypted.
    async fn load_key(&self, cert: &Certificate) -> EngineResult<PKey<Private>> {
        let path = cert.key_path.as_ref().ok_or_else(|| {
            EngineError::invalid(format!("no private key is known for {}", cert.display_name()))
        })?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::io(path, e))?;

        let passphrase = if keys::is_encrypted(&bytes) {
            let config = self.store.get(cert.fingerprint.as_str()).await;
            self.vault
                .passphrase(cert.fingerprint.as_str(), config.as_ref())?
        } else {
            None
        };

        keys::load_private_key(&bytes, passphrase.as_deref()).map_err(|e| match e {
            EngineError::PassphraseRequired(_) => EngineError::PassphraseRequired(format!(
                "the private key of {} is encrypted and no passphrase is stored",
                cert.display_name()
            )),
            other => other,
        })
    }

    /// A tracked CA together with its certificate and key, ready to sign.
    async fn issuer(&self, fingerprint: &Fingerprint) -> EngineResult<(Certificate, X509, PKey<Private>)> {
        let ca = self.registry.read().await.require(fingerprint)?.clone();
        if !ca.is_ca {
            return Err(EngineError::invalid(format!(
                "{} is not a CA certificate",
                ca.display_name()
            )));
        }

        let cert = load_x509(&read(&ca.cert_path)?)?;
        let key = self.load_key(&ca).await?;
        Ok((ca, cert, key))
    }

    /// Issuer certificates of `cert`, nearest first: its chain file when it
    /// has one, otherwise the tracked issuers.
    fn chain_certs(&self, registry: &Registry, cert: &Certificate) -> EngineResult<Vec<X509>> {
        if let Some(chain) = &cert.chain_path {
            return bundle::load_certificates(&read(chain)?);
        }

        registry
            .issuer_chain(&cert.fingerprint)
            .iter()
            .filter_map(|fp| registry.get(fp))
            .map(|issuer| load_x509(&read(&issuer.cert_path)?))
            .collect()
    }

    pub async fn global_defaults(&self) -> GlobalDefaults {
        self.store.global_defaults().await
    }

    /// Replace the global defaults and re-arm the renewal job. The time of
    /// the last renewal check is owned by the engine and kept.
    pub async fn set_global_defaults(&self, defaults: GlobalDefaults) -> EngineResult<GlobalDefaults> {
        scheduler::parse_schedule(&defaults.renewal_schedule)?;
        if defaults.renew_days_before_expiry < 0 {
            return Err(EngineError::invalid("renewDaysBeforeExpiry must not be negative"));
        }
        let periods = &defaults.ca_validity_period;
        if periods.root_ca == 0 || periods.intermediate_ca == 0 || periods.standard == 0 {
            return Err(EngineError::invalid("validity periods must be at least one day"));
        }

        let saved = self
            .store
            .update(|doc| {
                let last = doc.global_defaults.last_renewal_check;
                doc.global_defaults = GlobalDefaults {
                    last_renewal_check: last,
                    ..defaults
                };
                Ok(doc.global_defaults.clone())
            })
            .await?;

        self.rearm.notify_one();
        self.record(
            ActivityKind::System,
            "settings-update",
            "Updated global defaults",
            serde_json::to_value(&saved)?,
        )
        .await;
        Ok(saved)
    }

    pub async fn list_certificates(&self, filter: ListFilter) -> EngineResult<Vec<Certificate>> {
        Ok(self.registry.read().await.list(&filter, self.now()))
    }

    pub async fn get_certificate(&self, fingerprint: &Fingerprint) -> EngineResult<Certificate> {
        self.registry.read().await.require(fingerprint).cloned()
    }

    /// Create a self-signed root CA, or an intermediate when `issuer` is set.
    #[instrument(skip_all, fields(subject = %params.subject))]
    pub async fn create_ca(&self, params: CreateCaParams) -> EngineResult<Certificate> {
        let pairs = dn::parse(&params.subject)?;
        let name = dn::to_x509_name(&pairs)?;
        let common_name = dn::common_name(&pairs).unwrap_or("ca").to_string();
        let validity = self.global_defaults().await.ca_validity_period;
        let key = generate_key(params.key).await?;
        let now = self.now();

        let cert = match &params.issuer {
            Some(issuer) => {
                let (ca, ca_cert, ca_key) = self.issuer(issuer).await?;
                if ca.path_len_constraint == Some(0) {
                    return Err(EngineError::invalid(format!(
                        "{} has pathLen 0 and cannot sign another CA",
                        ca.display_name()
                    )));
                }
                let days = params.days.unwrap_or(validity.intermediate_ca);
                let csr = issue::create_csr(&name, &key, &SanList::default())?;
                issue::sign_with_ca(now, &csr, &ca_cert, &ca_key, days, &CertProfile::ca(params.path_len))?
            }
            None => {
                let days = params.days.unwrap_or(validity.root_ca);
                issue::create_self_signed(now, &name, &key, days, &CertProfile::ca(params.path_len))?
            }
        };

        let stem = self.new_stem(&common_name);
        let cert_path = self.config.certs_dir.join(format!("{stem}.crt"));
        let key_path = self.config.certs_dir.join(format!("{stem}.key"));
        let pem = cert.to_pem()?;

        self.write_material(
            &key_path,
            &keys::private_key_to_pem(&key, params.passphrase.as_deref())?,
            files::SECRET_MODE,
        )?;
        self.write_material(&cert_path, &pem, files::PUBLIC_MODE)?;

        let info = parse_certificate(&pem)?;
        let fingerprint = info.fingerprint.clone();
        let mut registry = self.registry.write().await;
        let created = self
            .track(&mut registry, info, cert_path, |entry| {
                entry.key_path = Some(key_path.clone());
                entry.auto_renew = params.auto_renew;
                entry.renew_days_before_expiry = params.renew_days_before_expiry;
                match &params.passphrase {
                    Some(pass) if params.store_passphrase => self.vault.seal_into(entry, pass),
                    _ => Ok(()),
                }
            })
            .await?;
        drop(registry);

        if let Some(pass) = &params.passphrase {
            self.vault.remember(fingerprint.as_str(), pass);
        }

        let kind = if params.issuer.is_some() { "intermediate" } else { "root" };
        self.record(
            ActivityKind::Certificate,
            "create",
            format!("Created {kind} CA {}", created.display_name()),
            summary(&created),
        )
        .await;
        Ok(created)
    }

    /// Issue an end-entity certificate under a fresh key.
    #[instrument(skip_all, fields(subject = %params.subject, issuer = %params.issuer))]
    pub async fn create_certificate(&self, params: CreateCertificateParams) -> EngineResult<Certificate> {
        let pairs = dn::parse(&params.subject)?;
        let name = dn::to_x509_name(&pairs)?;
        let common_name = dn::common_name(&pairs).map(str::to_string);
        let sans = SanList::parse(&params.sans)?.with_common_name(common_name.as_deref());
        let days = match params.days {
            Some(days) => days,
            None => self.global_defaults().await.ca_validity_period.standard,
        };

        let (_, ca_cert, ca_key) = self.issuer(&params.issuer).await?;
        let key = generate_key(params.key).await?;
        let csr = issue::create_csr(&name, &key, &sans)?;
        let cert = issue::sign_with_ca(self.now(), &csr, &ca_cert, &ca_key, days, &CertProfile::Leaf)?;

        let stem = self.new_stem(common_name.as_deref().unwrap_or("certificate"));
        let cert_path = self.config.certs_dir.join(format!("{stem}.crt"));
        let key_path = self.config.certs_dir.join(format!("{stem}.key"));
        let pem = cert.to_pem()?;

        self.write_material(
            &key_path,
            &keys::private_key_to_pem(&key, params.key_passphrase.as_deref())?,
            files::SECRET_MODE,
        )?;
        self.write_material(&cert_path, &pem, files::PUBLIC_MODE)?;

        let info = parse_certificate(&pem)?;
        let mut registry = self.registry.write().await;
        let created = self
            .track(&mut registry, info, cert_path, |entry| {
                entry.key_path = Some(key_path.clone());
                entry.auto_renew = params.auto_renew;
                entry.renew_days_before_expiry = params.renew_days_before_expiry;
                Ok(())
            })
            .await?;
        drop(registry);

        self.record(
            ActivityKind::Certificate,
            "create",
            format!("Issued {}", created.display_name()),
            summary(&created),
        )
        .await;
        Ok(created)
    }

    /// Sign an externally generated CSR. Only the certificate is written;
    /// the key stays with whoever made the request.
    #[instrument(skip_all, fields(issuer = %params.issuer))]
    pub async fn sign_csr(&self, params: SignCsrParams) -> EngineResult<Certificate> {
        let csr = issue::load_csr(params.csr_pem.as_bytes())?;
        let days = match params.days {
            Some(days) => days,
            None => self.global_defaults().await.ca_validity_period.standard,
        };

        let (_, ca_cert, ca_key) = self.issuer(&params.issuer).await?;
        let cert = issue::sign_with_ca(self.now(), &csr, &ca_cert, &ca_key, days, &CertProfile::Leaf)?;
        let pem = cert.to_pem()?;
        let info = parse_certificate(&pem)?;

        let name = params
            .name
            .clone()
            .or_else(|| info.common_name.clone())
            .unwrap_or_else(|| "certificate".to_string());
        let cert_path = self
            .config
            .certs_dir
            .join(format!("{}.crt", self.new_stem(&name)));
        self.write_material(&cert_path, &pem, files::PUBLIC_MODE)?;

        let mut registry = self.registry.write().await;
        let created = self.track(&mut registry, info, cert_path, |_| Ok(())).await?;
        drop(registry);

        self.record(
            ActivityKind::Certificate,
            "create",
            format!("Signed CSR for {}", created.display_name()),
            summary(&created),
        )
        .await;
        Ok(created)
    }

    /// Start tracking a certificate file where it lies. Importing a file that
    /// is already tracked returns the existing entry.
    #[instrument(skip(self))]
    pub async fn import_file(&self, path: &Path) -> EngineResult<Certificate> {
        let path = path
            .canonicalize()
            .map_err(|e| EngineError::io(path, e))?;

        let doc = self.store.snapshot().await;
        let mut registry = self.registry.write().await;
        let fingerprint = registry.add_from_file(&path, &doc)?;
        let tracked_at = registry.require(&fingerprint)?.cert_path.clone();

        let config = self
            .store
            .update(|doc| {
                let entry = doc.entry(fingerprint.as_str());
                entry.cert_path = Some(tracked_at.clone());
                Ok(entry.clone())
            })
            .await?;
        registry.apply_config(&fingerprint, Some(&config));
        let cert = registry.require(&fingerprint)?.clone();
        drop(registry);

        self.record(
            ActivityKind::Certificate,
            "import",
            format!("Tracking {}", cert.display_name()),
            summary(&cert),
        )
        .await;
        Ok(cert)
    }

    /// Copy a certificate, and optionally its key, into the certificate
    /// directory. Any further certificates in the input are tracked as its
    /// chain.
    pub async fn import_pem(&self, params: ImportPemParams) -> EngineResult<Certificate> {
        let (_, encoding) = crate::crypto::parse::decode_certificates(&params.cert)?;
        let mut certs = bundle::order_leaf_first(bundle::load_certificates(&params.cert)?);
        let leaf = certs.remove(0);

        let key = match &params.key {
            Some(bytes) => Some((
                keys::load_private_key(bytes, params.key_passphrase.as_deref())?,
                params.key_passphrase.clone(),
            )),
            None => None,
        };

        self.install(leaf, encoding, key, certs, params.name.as_deref(), "PEM")
            .await
    }

    /// Unpack a PKCS#12 archive into the certificate directory.
    pub async fn import_p12(
        &self,
        der: &[u8],
        passphrase: &str,
        name: Option<&str>,
    ) -> EngineResult<Certificate> {
        let bundle = bundle::import_p12(der, passphrase)?;
        let key = bundle.key.map(|k| (k, None));
        self.install(bundle.cert, Encoding::Pem, key, bundle.chain, name, "PKCS#12")
            .await
    }

    /// Track every certificate of a PKCS#7 bundle. Certificates that are
    /// already tracked are returned as they are.
    pub async fn import_p7b(&self, bytes: &[u8]) -> EngineResult<Vec<Certificate>> {
        let certs = bundle::order_leaf_first(bundle::import_p7(bytes)?);
        let mut out = Vec::with_capacity(certs.len());
        for cert in certs.into_iter().rev() {
            out.push(self.install_one(cert, Encoding::Pem, None, None).await?);
        }
        out.reverse();

        self.record(
            ActivityKind::Certificate,
            "import",
            format!("Imported {} certificate(s) from PKCS#7", out.len()),
            json!({ "fingerprints": out.iter().map(|c| &c.fingerprint).collect::<Vec<_>>() }),
        )
        .await;
        Ok(out)
    }

    async fn install(
        &self,
        leaf: X509,
        encoding: Encoding,
        key: Option<(PKey<Private>, Option<String>)>,
        chain: Vec<X509>,
        name: Option<&str>,
        format: &str,
    ) -> EngineResult<Certificate> {
        let fingerprint = fingerprint_der(&leaf.to_der()?);
        if let Some(existing) = self.registry.read().await.get(&fingerprint) {
            return Err(EngineError::Conflict(format!(
                "{} is already tracked at {}",
                existing.display_name(),
                existing.cert_path.display()
            )));
        }
        if let Some((key, _)) = &key {
            if !keys::key_matches(&leaf, key)? {
                return Err(EngineError::KeyMismatch);
            }
        }

        // Issuers first so the leaf links to them as it lands.
        for issuer in chain.into_iter().rev() {
            self.install_one(issuer, Encoding::Pem, None, None).await?;
        }
        let cert = self.install_one(leaf, encoding, key, name).await?;

        self.record(
            ActivityKind::Certificate,
            "import",
            format!("Imported {} from {format}", cert.display_name()),
            summary(&cert),
        )
        .await;
        Ok(cert)
    }

    /// Write one certificate (and key) under a fresh name and track it.
    async fn install_one(
        &self,
        cert: X509,
        encoding: Encoding,
        key: Option<(PKey<Private>, Option<String>)>,
        name: Option<&str>,
    ) -> EngineResult<Certificate> {
        let der = cert.to_der()?;
        let fingerprint = fingerprint_der(&der);
        if let Some(existing) = self.registry.read().await.get(&fingerprint) {
            return Ok(existing.clone());
        }

        let info = parse_der(der, encoding)?;
        let stem = self.new_stem(
            name.or(info.common_name.as_deref())
                .unwrap_or("certificate"),
        );
        let extension = match encoding {
            Encoding::Pem => "crt",
            Encoding::Der => "der",
        };
        let cert_path = self.config.certs_dir.join(format!("{stem}.{extension}"));

        let key_path = match &key {
            Some((key, passphrase)) => {
                let path = self.config.certs_dir.join(format!("{stem}.key"));
                self.write_material(
                    &path,
                    &keys::private_key_to_pem(key, passphrase.as_deref())?,
                    files::SECRET_MODE,
                )?;
                if let Some(pass) = passphrase {
                    self.vault.remember(fingerprint.as_str(), pass);
                }
                Some(path)
            }
            None => None,
        };
        self.write_material(
            &cert_path,
            &bundle::encode_certificate(&cert, encoding)?,
            files::PUBLIC_MODE,
        )?;

        let mut registry = self.registry.write().await;
        self.track(&mut registry, info, cert_path, |entry| {
            if key_path.is_some() {
                entry.key_path = key_path.clone();
            }
            Ok(())
        })
        .await
    }

    /// PKCS#12 archive of the certificate, its key and its issuer chain.
    pub async fn export_p12(
        &self,
        fingerprint: &Fingerprint,
        passphrase: &str,
        cipher: P12Cipher,
    ) -> EngineResult<Vec<u8>> {
        let (cert, chain) = {
            let registry = self.registry.read().await;
            let cert = registry.require(fingerprint)?.clone();
            let chain = self.chain_certs(&registry, &cert)?;
            (cert, chain)
        };

        let x509 = load_x509(&read(&cert.cert_path)?)?;
        let key = self.load_key(&cert).await?;
        let archive =
            bundle::export_p12(&x509, &key, &chain, passphrase, cert.display_name(), cipher)?;

        self.record(
            ActivityKind::Certificate,
            "export",
            format!("Exported {} as PKCS#12", cert.display_name()),
            json!({ "fingerprint": cert.fingerprint, "chain": chain.len() }),
        )
        .await;
        Ok(archive)
    }

    /// Certificates-only PKCS#7 bundle of the certificate and its chain.
    pub async fn export_p7b(&self, fingerprint: &Fingerprint) -> EngineResult<Vec<u8>> {
        let registry = self.registry.read().await;
        let cert = registry.require(fingerprint)?;
        let mut certs = vec![load_x509(&read(&cert.cert_path)?)?];
        certs.extend(self.chain_certs(&registry, cert)?);
        bundle::export_p7(&certs)
    }

    pub async fn update_certificate(
        &self,
        fingerprint: &Fingerprint,
        params: UpdateCertificateParams,
    ) -> EngineResult<Certificate> {
        if params.renew_days_before_expiry.is_some_and(|d| d < 0) {
            return Err(EngineError::invalid("renewDaysBeforeExpiry must not be negative"));
        }

        let mut registry = self.registry.write().await;
        let current = registry.require(fingerprint)?.clone();

        if let Some(key_path) = &params.key_path {
            let bytes = read(key_path)?;
            if !keys::is_encrypted(&bytes) {
                let key = keys::load_private_key(&bytes, None)?;
                if !keys::key_matches(&*load_x509(&read(&current.cert_path)?)?, &key)? {
                    return Err(EngineError::KeyMismatch);
                }
            }
        }
        for path in [&params.chain_path, &params.p12_path].into_iter().flatten() {
            if !path.is_file() {
                return Err(EngineError::invalid(format!("{} is not a file", path.display())));
            }
        }

        let config = self
            .store
            .update(|doc| {
                let entry = doc.entry(fingerprint.as_str());
                entry.cert_path = Some(current.cert_path.clone());
                if let Some(auto_renew) = params.auto_renew {
                    entry.auto_renew = auto_renew;
                }
                if let Some(days) = params.renew_days_before_expiry {
                    entry.renew_days_before_expiry = Some(days);
                }
                if let Some(path) = &params.key_path {
                    entry.key_path = Some(path.clone());
                }
                if let Some(path) = &params.chain_path {
                    entry.chain_path = Some(path.clone());
                }
                if let Some(path) = &params.p12_path {
                    entry.p12_path = Some(path.clone());
                }
                Ok(entry.clone())
            })
            .await?;
        registry.apply_config(fingerprint, Some(&config));
        let updated = registry.require(fingerprint)?.clone();
        drop(registry);

        self.record(
            ActivityKind::Certificate,
            "update",
            format!("Updated {}", updated.display_name()),
            json!({ "fingerprint": fingerprint, "changes": params }),
        )
        .await;
        Ok(updated)
    }

    /// Stop tracking a certificate. A CA that still has issued certificates
    /// is only removed together with them (`cascade`). Files stay on disk
    /// unless `delete_files` is set.
    pub async fn delete_certificate(
        &self,
        fingerprint: &Fingerprint,
        options: DeleteOptions,
    ) -> EngineResult<Vec<Fingerprint>> {
        let mut registry = self.registry.write().await;
        let cert = registry.require(fingerprint)?.clone();

        if !cert.signs.is_empty() && !options.cascade {
            return Err(EngineError::Conflict(format!(
                "{} still signs {} certificate(s)",
                cert.display_name(),
                cert.signs.len()
            )));
        }

        let mut targets = registry.descendants(fingerprint);
        targets.reverse();
        targets.push(fingerprint.clone());

        self.store
            .update(|doc| {
                for fp in &targets {
                    doc.remove(fp.as_str());
                }
                Ok(())
            })
            .await?;

        let removed: Vec<Certificate> = targets.iter().filter_map(|fp| registry.remove(fp)).collect();
        for cert in &removed {
            self.vault.forget(cert.fingerprint.as_str());
        }

        if options.delete_files {
            for cert in &removed {
                let paths: Vec<&Path> = std::iter::once(cert.cert_path.as_path())
                    .chain(cert.key_path.as_deref())
                    .collect();
                self.ignore.ignore(paths.iter().copied());
                for path in paths {
                    if let Err(e) = files::remove_if_exists(path) {
                        warn!(path = %path.display(), error = %e, "Failed to remove certificate material");
                    }
                }
            }
        }
        drop(registry);

        self.record(
            ActivityKind::Certificate,
            "delete",
            format!("Deleted {} certificate(s) starting at {}", removed.len(), cert.display_name()),
            json!({
                "fingerprints": targets,
                "cascade": options.cascade,
                "deleteFiles": options.delete_files,
            }),
        )
        .await;
        Ok(targets)
    }

    /// Apply `edit` to the deploy actions of a certificate, persist, and
    /// refresh the registry.
    async fn edit_actions<R>(
        &self,
        fingerprint: &Fingerprint,
        edit: impl FnOnce(&mut Vec<DeployAction>) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut registry = self.registry.write().await;
        let cert_path = registry.require(fingerprint)?.cert_path.clone();

        let result = self
            .store
            .update(|doc| {
                let entry = doc.entry(fingerprint.as_str());
                entry.cert_path = Some(cert_path);
                edit(&mut entry.deploy_actions)
            })
            .await?;
        self.refresh_policy(&mut registry, fingerprint).await;
        Ok(result)
    }

    fn find_action(actions: &mut [DeployAction], id: Uuid) -> EngineResult<&mut DeployAction> {
        actions
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("deploy action {id}")))
    }

    pub async fn add_deploy_action(
        &self,
        fingerprint: &Fingerprint,
        params: DeployActionParams,
    ) -> EngineResult<DeployAction> {
        let mut action = DeployAction::new(params.name, params.kind);
        action.enabled = params.enabled.unwrap_or(true);
        action.timeout_secs = params.timeout_secs;

        let added = action.clone();
        self.edit_actions(fingerprint, |actions| {
            actions.push(action);
            Ok(())
        })
        .await?;

        self.record(
            ActivityKind::Certificate,
            "deploy-action-add",
            format!("Added {} action {:?}", added.kind.type_name(), added.name),
            json!({ "fingerprint": fingerprint, "id": added.id }),
        )
        .await;
        Ok(added)
    }

    /// Replace an action's settings. Its id and position stay.
    pub async fn update_deploy_action(
        &self,
        fingerprint: &Fingerprint,
        id: Uuid,
        params: DeployActionParams,
    ) -> EngineResult<DeployAction> {
        let updated = self
            .edit_actions(fingerprint, |actions| {
                let action = Self::find_action(actions, id)?;
                action.name = params.name;
                action.kind = params.kind;
                action.timeout_secs = params.timeout_secs;
                if let Some(enabled) = params.enabled {
                    action.enabled = enabled;
                }
                Ok(action.clone())
            })
            .await?;

        self.record(
            ActivityKind::Certificate,
            "deploy-action-update",
            format!("Updated action {:?}", updated.name),
            json!({ "fingerprint": fingerprint, "id": id }),
        )
        .await;
        Ok(updated)
    }

    pub async fn delete_deploy_action(&self, fingerprint: &Fingerprint, id: Uuid) -> EngineResult<()> {
        let removed = self
            .edit_actions(fingerprint, |actions| {
                let index = actions
                    .iter()
                    .position(|a| a.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("deploy action {id}")))?;
                Ok(actions.remove(index))
            })
            .await?;

        self.record(
            ActivityKind::Certificate,
            "deploy-action-delete",
            format!("Removed action {:?}", removed.name),
            json!({ "fingerprint": fingerprint, "id": id }),
        )
        .await;
        Ok(())
    }

    /// Move actions so that position `i` holds the action previously at
    /// `order[i]`.
    pub async fn reorder_deploy_actions(
        &self,
        fingerprint: &Fingerprint,
        order: &[usize],
    ) -> EngineResult<Vec<DeployAction>> {
        self.edit_actions(fingerprint, |actions| {
            deploy::reorder(actions, order)?;
            Ok(actions.clone())
        })
        .await
    }

    /// Set an action's enabled flag, or flip it when `enabled` is `None`.
    pub async fn toggle_deploy_action(
        &self,
        fingerprint: &Fingerprint,
        id: Uuid,
        enabled: Option<bool>,
    ) -> EngineResult<DeployAction> {
        self.edit_actions(fingerprint, |actions| {
            let action = Self::find_action(actions, id)?;
            action.enabled = enabled.unwrap_or(!action.enabled);
            Ok(action.clone())
        })
        .await
    }

    /// Run the deploy pipeline for a certificate.
    pub async fn deploy(&self, fingerprint: &Fingerprint) -> EngineResult<DeployOutcome> {
        let cert = self.get_certificate(fingerprint).await?;
        self.run_deploy(&cert, &CancellationToken::new()).await
    }

    #[instrument(skip_all, fields(fingerprint = %cert.fingerprint))]
    async fn run_deploy(&self, cert: &Certificate, cancel: &CancellationToken) -> EngineResult<DeployOutcome> {
        let chain_pem = if cert.chain_path.is_some() {
            None
        } else {
            let registry = self.registry.read().await;
            let chain = self.chain_certs(&registry, cert)?;
            Some(bundle::chain_to_pem(&chain)?)
        };

        let ctx = DeployContext::prepare(cert, chain_pem).await?;
        let outcome = self.deployer.run(&cert.deploy_actions, &ctx, cancel).await;
        drop(ctx);

        let action = if outcome.all_succeeded() { "deploy" } else { "deploy-failed" };
        self.record(
            ActivityKind::Certificate,
            action,
            format!(
                "Deployed {}: {} of {} action(s) succeeded",
                cert.display_name(),
                outcome.succeeded,
                outcome.executed
            ),
            json!({ "fingerprint": cert.fingerprint, "outcome": outcome }),
        )
        .await;
        Ok(outcome)
    }

    /// Renew a certificate now, regardless of its threshold.
    pub async fn renew(&self, fingerprint: &Fingerprint) -> EngineResult<RenewedCertificate> {
        self.renew_one(fingerprint, &CancellationToken::new()).await
    }

    /// One pass of the renewal job.
    pub async fn check_renewals(&self) -> EngineResult<RenewalReport> {
        self.check_renewals_until(&CancellationToken::new()).await
    }

    /// Renew every due certificate, issuers first. Stops between
    /// certificates once `cancel` fires.
    #[instrument(skip_all)]
    pub(crate) async fn check_renewals_until(
        &self,
        cancel: &CancellationToken,
    ) -> EngineResult<RenewalReport> {
        let now = self.now();
        let defaults = self.global_defaults().await;
        let candidates: Vec<(Fingerprint, Option<String>)> = {
            let registry = self.registry.read().await;
            scheduler::select_candidates(registry.iter(), now, defaults.renew_days_before_expiry, |fp| {
                registry.depth(fp)
            })
            .into_iter()
            .map(|fp| {
                let name = registry.get(&fp).and_then(|c| c.common_name.clone());
                (fp, name)
            })
            .collect()
        };

        let mut report = RenewalReport {
            checked_at: now,
            candidates: candidates.iter().map(|(fp, _)| fp.clone()).collect(),
            renewed: Vec::new(),
            failed: Vec::new(),
            interrupted: false,
        };

        for (fingerprint, common_name) in candidates {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            match self.renew_one(&fingerprint, cancel).await {
                Ok(renewed) => report.renewed.push(renewed),
                Err(e) => report.failed.push(RenewalFailure {
                    fingerprint,
                    common_name,
                    code: e.code().to_string(),
                    message: e.to_string(),
                }),
            }
        }

        self.store
            .update(|doc| {
                doc.global_defaults.last_renewal_check = Some(now);
                Ok(())
            })
            .await?;

        self.record(
            ActivityKind::System,
            "renewal-check",
            format!(
                "Renewal check: {} due, {} renewed, {} failed",
                report.candidates.len(),
                report.renewed.len(),
                report.failed.len()
            ),
            json!({
                "candidates": report.candidates.len(),
                "renewed": report.renewed.len(),
                "failed": report.failed.len(),
                "interrupted": report.interrupted,
            }),
        )
        .await;
        Ok(report)
    }

    /// Renew under the certificate's lock, then deploy. A failed deploy does
    /// not fail the renewal.
    #[instrument(skip_all, fields(fingerprint = %fingerprint))]
    async fn renew_one(
        &self,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> EngineResult<RenewedCertificate> {
        let _lock = self.locks.acquire(fingerprint).await;
        let cert = self.get_certificate(fingerprint).await?;

        let renewed = match self.reissue(&cert).await {
            Ok(renewed) => renewed,
            Err(e) => {
                self.record(
                    ActivityKind::Certificate,
                    "renew-failed",
                    format!("Renewal of {} failed: {e}", cert.display_name()),
                    json!({ "fingerprint": fingerprint, "code": e.code(), "error": e.to_string() }),
                )
                .await;
                return Err(e);
            }
        };

        self.record(
            ActivityKind::Certificate,
            "renew",
            format!(
                "Renewed {}, now valid until {}",
                renewed.display_name(),
                renewed.valid_to.format("%Y-%m-%d")
            ),
            json!({
                "oldFingerprint": fingerprint,
                "newFingerprint": renewed.fingerprint,
                "path": renewed.cert_path,
                "validTo": renewed.valid_to,
            }),
        )
        .await;

        let deploy = if renewed.deploy_actions.iter().any(|a| a.enabled) {
            match self.run_deploy(&renewed, cancel).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(error = %e, "Deployment after renewal could not start");
                    self.record(
                        ActivityKind::Certificate,
                        "deploy-failed",
                        format!("Deployment of {} could not start: {e}", renewed.display_name()),
                        json!({ "fingerprint": renewed.fingerprint, "error": e.to_string() }),
                    )
                    .await;
                    None
                }
            }
        } else {
            None
        };

        Ok(RenewedCertificate {
            old_fingerprint: fingerprint.clone(),
            new_fingerprint: renewed.fingerprint.clone(),
            common_name: renewed.common_name.clone(),
            valid_to: renewed.valid_to,
            deploy,
        })
    }

    /// Re-issue `cert` in place: same key, same subject and extensions, new
    /// serial and validity window of the original length. The file keeps
    /// its path and encoding.
    async fn reissue(&self, cert: &Certificate) -> EngineResult<Certificate> {
        let path = cert.cert_path.clone();
        let _pin = self.ignore.pin([path.as_path()]);

        let bytes = read(&path)?;
        let current = parse_certificate(&bytes)?;
        if current.fingerprint != cert.fingerprint {
            return Err(EngineError::Conflict(format!(
                "{} changed on disk since it was loaded",
                path.display()
            )));
        }
        let existing = load_x509(&bytes)?;

        let (issuer, signing_key) = if cert.is_self_signed {
            (None, self.load_key(cert).await?)
        } else {
            let issuer_fp = cert.signed_by.as_ref().ok_or_else(|| {
                EngineError::invalid(format!(
                    "the issuer of {} ({}) is not tracked",
                    cert.display_name(),
                    cert.issuer
                ))
            })?;
            let (_, issuer_cert, issuer_key) = self.issuer(issuer_fp).await?;
            (Some(issuer_cert), issuer_key)
        };

        let renewed = issue::renew(
            self.now(),
            &existing,
            issuer.as_deref(),
            &signing_key,
            current.validity_days(),
        )?;
        let encoded = bundle::replace_leaf(&bytes, &renewed, cert.original_encoding)?;
        let info = parse_certificate(&encoded)?;
        let old = cert.fingerprint.clone();
        let new = info.fingerprint.clone();

        let mut registry = self.registry.write().await;
        self.write_material(&path, &encoded, files::PUBLIC_MODE)?;
        let saved = self
            .store
            .update(|doc| {
                let mut entry = doc.remove(old.as_str()).unwrap_or_default();
                entry.cert_path = Some(path.clone());
                *doc.entry(new.as_str()) = entry.clone();
                Ok(entry)
            })
            .await;

        // The registry and config still name the old certificate, so the
        // file has to go back to it.
        let config = match saved {
            Ok(config) => config,
            Err(e) => {
                if let Err(restore) = files::write_atomic(&path, &bytes, files::PUBLIC_MODE) {
                    warn!(
                        path = %path.display(),
                        error = %restore,
                        "Could not restore certificate after a failed renewal"
                    );
                }
                return Err(e);
            }
        };

        if let Ok(Some(passphrase)) = self.vault.passphrase(old.as_str(), None) {
            self.vault.remember(new.as_str(), &passphrase);
        }
        self.vault.forget(old.as_str());

        registry.remove(&old);
        registry.insert(build_certificate(info, path, Some(&config)));
        registry.require(&new).cloned()
    }

    /// Passphrase used to open a CA key during unattended renewal. It must
    /// open the key before it is stored.
    pub async fn set_ca_passphrase(&self, fingerprint: &Fingerprint, passphrase: &str) -> EngineResult<()> {
        let cert = self.get_certificate(fingerprint).await?;
        let key_path = cert.key_path.as_ref().ok_or_else(|| {
            EngineError::invalid(format!("no private key is known for {}", cert.display_name()))
        })?;
        let bytes = read(key_path)?;
        if !keys::is_encrypted(&bytes) {
            return Err(EngineError::invalid(format!(
                "the private key of {} is not encrypted",
                cert.display_name()
            )));
        }
        let key = keys::load_private_key(&bytes, Some(passphrase))?;
        if !keys::key_matches(&*load_x509(&read(&cert.cert_path)?)?, &key)? {
            return Err(EngineError::KeyMismatch);
        }

        let mut registry = self.registry.write().await;
        self.store
            .update(|doc| {
                let entry = doc.entry(fingerprint.as_str());
                entry.cert_path = Some(cert.cert_path.clone());
                self.vault.seal_into(entry, passphrase)
            })
            .await?;
        self.vault.remember(fingerprint.as_str(), passphrase);
        self.refresh_policy(&mut registry, fingerprint).await;
        drop(registry);

        self.record(
            ActivityKind::Certificate,
            "passphrase-set",
            format!("Stored passphrase for {}", cert.display_name()),
            json!({ "fingerprint": fingerprint }),
        )
        .await;
        Ok(())
    }

    pub async fn clear_ca_passphrase(&self, fingerprint: &Fingerprint) -> EngineResult<()> {
        let mut registry = self.registry.write().await;
        let name = registry.require(fingerprint)?.display_name().to_string();
        self.store
            .update(|doc| {
                self.vault.clear(fingerprint.as_str(), doc.get_mut(fingerprint.as_str()));
                Ok(())
            })
            .await?;
        self.refresh_policy(&mut registry, fingerprint).await;
        drop(registry);

        self.record(
            ActivityKind::Certificate,
            "passphrase-clear",
            format!("Cleared passphrase for {name}"),
            json!({ "fingerprint": fingerprint }),
        )
        .await;
        Ok(())
    }

    pub async fn activities(&self, filter: ActivityFilter) -> EngineResult<Vec<Activity>> {
        Ok(self.activities.list(&filter).await)
    }

    /// Reconcile the registry with a file that changed on disk.
    async fn on_file_event(&self, path: PathBuf) {
        let doc = self.store.snapshot().await;
        let mut registry = self.registry.write().await;

        match registry.refresh_path(&path, &doc) {
            PathChange::Inserted(fp) => {
                let cert = registry.get(&fp).cloned();
                drop(registry);
                if let Some(cert) = cert {
                    self.record(
                        ActivityKind::Certificate,
                        "discovered",
                        format!("Found {} on disk", cert.display_name()),
                        summary(&cert),
                    )
                    .await;
                }
            }
            PathChange::Replaced { old, new } => {
                // Policy follows the file.
                let moved = self
                    .store
                    .update(|doc| {
                        if doc.get(new.as_str()).is_none() {
                            if let Some(entry) = doc.remove(old.as_str()) {
                                *doc.entry(new.as_str()) = entry;
                            }
                        }
                        Ok(())
                    })
                    .await;
                if let Err(e) = moved {
                    warn!(error = %e, "Failed to move certificate policy to the replaced file");
                }
                self.refresh_policy(&mut registry, &new).await;
                drop(registry);

                self.record(
                    ActivityKind::Certificate,
                    "replaced",
                    format!("{} was replaced on disk", path.display()),
                    json!({ "oldFingerprint": old, "newFingerprint": new, "path": path }),
                )
                .await;
            }
            PathChange::Removed(fp) => {
                drop(registry);
                self.record(
                    ActivityKind::Certificate,
                    "removed",
                    format!("{} was removed from disk", path.display()),
                    json!({ "fingerprint": fp, "path": path }),
                )
                .await;
            }
            PathChange::Retained(_) | PathChange::Unchanged => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use certkeeper_common::views::{CommandAction, DeployActionKind};
    use chrono::Duration as ChronoDuration;

    async fn engine(dir: &Path) -> (Engine, ManualClock) {
        let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let mut config = EngineConfig::new(dir.join("config"), dir.join("certs"));
        config.disable_watcher = true;
        let engine = Engine::open(config, Arc::new(clock.clone())).await.unwrap();
        (engine, clock)
    }

    async fn root(engine: &Engine) -> Certificate {
        engine
            .create_ca(CreateCaParams {
                subject: "CN=Unit Root".into(),
                key: KeySpec::EcP256,
                days: Some(3650),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn leaf(engine: &Engine, issuer: &Certificate, cn: &str) -> Certificate {
        engine
            .create_certificate(CreateCertificateParams {
                subject: format!("CN={cn}"),
                sans: vec![],
                key: KeySpec::EcP256,
                days: Some(90),
                issuer: issuer.fingerprint.clone(),
                auto_renew: false,
                renew_days_before_expiry: None,
                key_passphrase: None,
            })
            .await
            .unwrap()
    }

    fn command(name: &str) -> DeployActionParams {
        DeployActionParams {
            name: name.into(),
            enabled: None,
            timeout_secs: None,
            kind: DeployActionKind::Command(CommandAction {
                command: "true".into(),
                working_dir: None,
                env: Default::default(),
            }),
        }
    }

    #[tokio::test]
    async fn test_deploy_action_ids_survive_edits() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path()).await;
        let ca = root(&engine).await;

        let a = engine.add_deploy_action(&ca.fingerprint, command("a")).await.unwrap();
        let b = engine.add_deploy_action(&ca.fingerprint, command("b")).await.unwrap();
        let c = engine.add_deploy_action(&ca.fingerprint, command("c")).await.unwrap();

        let reordered = engine
            .reorder_deploy_actions(&ca.fingerprint, &[2, 0, 1])
            .await
            .unwrap();
        let ids: Vec<_> = reordered.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![c.id, a.id, b.id]);

        let toggled = engine
            .toggle_deploy_action(&ca.fingerprint, b.id, None)
            .await
            .unwrap();
        assert!(!toggled.enabled);

        let updated = engine
            .update_deploy_action(&ca.fingerprint, a.id, command("renamed"))
            .await
            .unwrap();
        assert_eq!(updated.id, a.id);
        assert_eq!(updated.name, "renamed");

        engine.delete_deploy_action(&ca.fingerprint, c.id).await.unwrap();
        let cert = engine.get_certificate(&ca.fingerprint).await.unwrap();
        let names: Vec<_> = cert.deploy_actions.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["renamed", "b"]);

        assert!(matches!(
            engine.reorder_deploy_actions(&ca.fingerprint, &[0, 0]).await,
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_file_events_follow_the_certs_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path()).await;
        let ca = root(&engine).await;
        let issued = leaf(&engine, &ca, "web.example.com").await;

        let key = keys::generate_key(KeySpec::EcP256).unwrap();
        let name = dn::parse_name("CN=Dropped In").unwrap();
        let stray = issue::create_self_signed(engine.now(), &name, &key, 30, &CertProfile::Leaf)
            .unwrap()
            .to_pem()
            .unwrap();
        let dropped = engine.config().certs_dir.join("dropped.crt");
        std::fs::write(&dropped, &stray).unwrap();
        let dropped_fp = parse_certificate(&stray).unwrap().fingerprint;

        engine.on_file_event(dropped.clone()).await;
        let found = engine.get_certificate(&dropped_fp).await.unwrap();
        assert_eq!(found.cert_path, dropped);
        let latest = engine.activities(ActivityFilter::default()).await.unwrap();
        assert_eq!(latest[0].action.as_deref(), Some("discovered"));

        std::fs::remove_file(&dropped).unwrap();
        engine.on_file_event(dropped.clone()).await;
        assert!(matches!(
            engine.get_certificate(&dropped_fp).await,
            Err(EngineError::NotFound(_))
        ));
        let latest = engine.activities(ActivityFilter::default()).await.unwrap();
        assert_eq!(latest[0].action.as_deref(), Some("removed"));

        // An issuer with live children stays tracked when its file goes away.
        std::fs::remove_file(&ca.cert_path).unwrap();
        engine.on_file_event(ca.cert_path.clone()).await;
        let kept = engine.get_certificate(&ca.fingerprint).await.unwrap();
        assert!(kept.signs.contains(&issued.fingerprint));
        let issued = engine.get_certificate(&issued.fingerprint).await.unwrap();
        assert_eq!(issued.signed_by.as_ref(), Some(&ca.fingerprint));
    }

    #[tokio::test]
    async fn test_renewing_a_ca_keeps_children_linked() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, clock) = engine(dir.path()).await;
        let ca = root(&engine).await;
        let child = leaf(&engine, &ca, "child.example.com").await;

        clock.advance(ChronoDuration::days(1));
        let renewed = engine.renew(&ca.fingerprint).await.unwrap();
        assert_ne!(renewed.new_fingerprint, ca.fingerprint);

        let child = engine.get_certificate(&child.fingerprint).await.unwrap();
        assert_eq!(child.signed_by.as_ref(), Some(&renewed.new_fingerprint));
        assert!(matches!(
            engine.get_certificate(&ca.fingerprint).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_encrypted_ca_needs_passphrase_to_renew() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path()).await;
        let ca = engine
            .create_ca(CreateCaParams {
                subject: "CN=Locked Root".into(),
                key: KeySpec::EcP256,
                passphrase: Some("hunter2".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        // Nothing stored, and a fresh engine has nothing cached.
        drop(engine);
        let (engine, _) = self::engine(dir.path()).await;
        let err = engine.renew(&ca.fingerprint).await.unwrap_err();
        assert!(matches!(err, EngineError::PassphraseRequired(_)));

        let failures = engine
            .activities(ActivityFilter {
                search: Some("renewal of".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failures[0].action.as_deref(), Some("renew-failed"));

        assert!(matches!(
            engine.set_ca_passphrase(&ca.fingerprint, "wrong").await,
            Err(EngineError::PassphraseUnavailable(_))
        ));
        engine.set_ca_passphrase(&ca.fingerprint, "hunter2").await.unwrap();
        assert!(engine.get_certificate(&ca.fingerprint).await.unwrap().has_stored_passphrase);

        // A restart decrypts the stored passphrase from the config.
        drop(engine);
        let (engine, _) = self::engine(dir.path()).await;
        engine.renew(&ca.fingerprint).await.unwrap();
    }

    #[tokio::test]
    async fn test_global_defaults_keep_last_check() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path()).await;

        let report = engine.check_renewals().await.unwrap();
        assert!(report.candidates.is_empty());
        let checked = engine.global_defaults().await.last_renewal_check;
        assert_eq!(checked, Some(report.checked_at));

        let saved = engine
            .set_global_defaults(GlobalDefaults {
                renew_days_before_expiry: 10,
                renewal_schedule: "30 2 * * *".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(saved.last_renewal_check, checked);

        assert!(matches!(
            engine
                .set_global_defaults(GlobalDefaults {
                    renewal_schedule: "whenever".into(),
                    ..Default::default()
                })
                .await,
            Err(EngineError::Schedule { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_policy_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path()).await;
        let ca = root(&engine).await;

        engine
            .update_certificate(
                &ca.fingerprint,
                UpdateCertificateParams {
                    auto_renew: Some(true),
                    renew_days_before_expiry: Some(45),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        drop(engine);
        let (engine, _) = self::engine(dir.path()).await;
        let reloaded = engine.get_certificate(&ca.fingerprint).await.unwrap();
        assert!(reloaded.auto_renew);
        assert_eq!(reloaded.renew_days_before_expiry, Some(45));

        assert!(
            engine
                .update_certificate(
                    &ca.fingerprint,
                    UpdateCertificateParams {
                        renew_days_before_expiry: Some(-1),
                        ..Default::default()
                    },
                )
                .await
                .is_err()
        );
    }
}
