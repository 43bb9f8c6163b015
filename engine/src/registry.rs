//! In-memory view of every tracked certificate, keyed by fingerprint, with
//! the issuer graph resolved between them.
//!
//! Links are fingerprints (`signed_by` / `signs`), never references, so
//! cross-signed or cyclic material cannot tie the map in knots.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
};

use certkeeper_common::{Fingerprint, normalize_fingerprint, params::ListFilter, views::Certificate};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::{
    crypto::{CertInfo, parse_certificate},
    error::{EngineError, EngineResult},
    store::{CertConfig, ConfigDocument},
};

/// File extensions considered certificates during a scan.
pub const CERT_EXTENSIONS: &[&str] = &["pem", "crt", "cer", "der"];

const MAX_SCAN_DEPTH: usize = 16;

pub fn is_certificate_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| CERT_EXTENSIONS.iter().any(|c| e.eq_ignore_ascii_case(c)))
        .unwrap_or(false)
}

/// What a re-read of a single path did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathChange {
    Inserted(Fingerprint),
    /// The file now holds a different certificate.
    Replaced { old: Fingerprint, new: Fingerprint },
    Removed(Fingerprint),
    /// The file is gone but the certificate still has issued children, so it
    /// stays tracked.
    Retained(Fingerprint),
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    certs: BTreeMap<Fingerprint, Certificate>,
    paths: HashMap<PathBuf, Fingerprint>,
}

/// Look for the private key next to a certificate: `<stem>.key`,
/// `<stem>-key.pem`, `<stem>.key.pem`, or `privkey.pem` beside a
/// `cert.pem`/`fullchain.pem` pair.
pub fn discover_key_path(cert_path: &Path) -> Option<PathBuf> {
    let dir = cert_path.parent()?;
    let stem = cert_path.file_stem()?.to_str()?;

    let mut candidates = vec![
        dir.join(format!("{stem}.key")),
        dir.join(format!("{stem}-key.pem")),
        dir.join(format!("{stem}.key.pem")),
    ];
    if matches!(stem, "cert" | "fullchain") {
        candidates.push(dir.join("privkey.pem"));
    }

    candidates.into_iter().find(|p| p.is_file())
}

/// Merge parsed certificate fields with stored policy.
pub fn build_certificate(info: CertInfo, cert_path: PathBuf, config: Option<&CertConfig>) -> Certificate {
    let mut cert = Certificate {
        fingerprint: info.fingerprint,
        common_name: info.common_name,
        subject: info.subject,
        issuer: info.issuer,
        issuer_cn: info.issuer_cn,
        serial_number: info.serial_number,
        signature_algorithm: info.signature_algorithm,
        subject_key_identifier: info.subject_key_identifier,
        authority_key_identifier: info.authority_key_identifier,
        key_type: info.key_type,
        key_size: info.key_size,
        valid_from: info.valid_from,
        valid_to: info.valid_to,
        sans: info.sans,
        is_ca: info.is_ca,
        path_len_constraint: info.path_len_constraint,
        is_self_signed: info.is_self_signed,
        is_root_ca: info.is_root_ca,
        key_cert_sign: info.key_cert_sign,
        original_encoding: info.encoding,
        key_path: None,
        chain_path: None,
        p12_path: None,
        auto_renew: false,
        renew_days_before_expiry: None,
        deploy_actions: Vec::new(),
        has_stored_passphrase: false,
        signed_by: None,
        signs: BTreeSet::new(),
        cert_path,
    };
    apply_config(&mut cert, config);
    cert
}

fn apply_config(cert: &mut Certificate, config: Option<&CertConfig>) {
    let default = CertConfig::default();
    let config = config.unwrap_or(&default);

    cert.auto_renew = config.auto_renew;
    cert.renew_days_before_expiry = config.renew_days_before_expiry;
    cert.deploy_actions = config.deploy_actions.clone();
    cert.has_stored_passphrase = config.has_stored_passphrase;
    cert.chain_path = config.chain_path.clone();
    cert.p12_path = config.p12_path.clone();
    cert.key_path = config
        .key_path
        .clone()
        .or_else(|| discover_key_path(&cert.cert_path));
}

fn collect_files(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) {
    if depth > MAX_SCAN_DEPTH {
        warn!(dir = %dir.display(), "Not descending further into certificate directory");
        return;
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to read certificate directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        if meta.is_dir() {
            collect_files(&path, depth + 1, out);
        } else if meta.is_file() && is_certificate_file(&path) {
            out.push(path);
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from every certificate file under `certs_dir`,
    /// plus certificates tracked in the config outside of it.
    #[instrument(skip(doc), fields(dir = %certs_dir.display()))]
    pub fn scan(certs_dir: &Path, doc: &ConfigDocument) -> Self {
        let mut files = Vec::new();
        collect_files(certs_dir, 0, &mut files);
        files.sort();

        let mut registry = Registry::new();
        for path in files {
            if let Err(e) = registry.load_file(&path, doc) {
                debug!(path = %path.display(), error = %e, "Skipping unreadable certificate file");
            }
        }

        for config in doc.certificates.values() {
            let Some(path) = &config.cert_path else {
                continue;
            };
            if registry.paths.contains_key(path) || path.starts_with(certs_dir) {
                continue;
            }
            if let Err(e) = registry.load_file(path, doc) {
                warn!(path = %path.display(), error = %e, "Tracked certificate could not be loaded");
            }
        }

        registry.rebuild_graph();
        debug!(count = registry.len(), "Certificate scan complete");
        registry
    }

    /// Parse one file and insert it without touching the graph. Idempotent on
    /// fingerprint: a certificate already known under another path is left
    /// where it is.
    fn load_file(&mut self, path: &Path, doc: &ConfigDocument) -> EngineResult<Fingerprint> {
        let bytes = fs::read(path).map_err(|e| EngineError::io(path, e))?;
        let info = parse_certificate(&bytes)?;
        let fingerprint = info.fingerprint.clone();

        if let Some(existing) = self.certs.get(&fingerprint) {
            // Prefer the path the config remembers.
            let remembered = doc
                .get(fingerprint.as_str())
                .and_then(|c| c.cert_path.as_deref());
            if remembered != Some(path) || existing.cert_path == path {
                return Ok(fingerprint);
            }
            let stale = existing.cert_path.clone();
            self.paths.remove(&stale);
        }

        let cert = build_certificate(info, path.to_path_buf(), doc.get(fingerprint.as_str()));
        self.paths.insert(path.to_path_buf(), fingerprint.clone());
        self.certs.insert(fingerprint.clone(), cert);
        Ok(fingerprint)
    }

    /// Parse `path` and track it. Used for imports and watcher create events.
    pub fn add_from_file(&mut self, path: &Path, doc: &ConfigDocument) -> EngineResult<Fingerprint> {
        let fingerprint = self.load_file(path, doc)?;
        self.rebuild_graph();
        Ok(fingerprint)
    }

    pub fn insert(&mut self, cert: Certificate) {
        if let Some(previous) = self.certs.get(&cert.fingerprint) {
            let stale = previous.cert_path.clone();
            self.paths.remove(&stale);
        }
        self.paths
            .insert(cert.cert_path.clone(), cert.fingerprint.clone());
        self.certs.insert(cert.fingerprint.clone(), cert);
        self.rebuild_graph();
    }

    pub fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Certificate> {
        let removed = self.certs.remove(fingerprint)?;
        if self.paths.get(&removed.cert_path) == Some(fingerprint) {
            self.paths.remove(&removed.cert_path);
        }
        self.rebuild_graph();
        Some(removed)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&Certificate> {
        self.certs.get(fingerprint)
    }

    /// Lookup that accepts any spelling of a fingerprint.
    pub fn find(&self, fingerprint: &str) -> Option<&Certificate> {
        let normalized = normalize_fingerprint(fingerprint);
        self.certs
            .iter()
            .find(|(fp, _)| fp.as_str() == normalized)
            .map(|(_, c)| c)
    }

    pub fn require(&self, fingerprint: &Fingerprint) -> EngineResult<&Certificate> {
        self.get(fingerprint)
            .ok_or_else(|| EngineError::not_found(fingerprint))
    }

    pub fn by_path(&self, path: &Path) -> Option<&Fingerprint> {
        self.paths.get(path)
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.certs.values()
    }

    /// Certificates matching `filter`, ordered by name.
    pub fn list(&self, filter: &ListFilter, now: DateTime<Utc>) -> Vec<Certificate> {
        let mut out: Vec<Certificate> = self
            .certs
            .values()
            .filter(|c| !filter.ca_only || c.is_ca)
            .filter(|c| {
                filter
                    .expiring_within_days
                    .map(|days| c.days_remaining(now) <= days)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        out.sort_by(|a, b| {
            a.display_name()
                .to_ascii_lowercase()
                .cmp(&b.display_name().to_ascii_lowercase())
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        out
    }

    /// Re-merge stored policy into a tracked certificate.
    pub fn apply_config(&mut self, fingerprint: &Fingerprint, config: Option<&CertConfig>) {
        if let Some(cert) = self.certs.get_mut(fingerprint) {
            apply_config(cert, config);
        }
    }

    fn find_issuer(&self, cert: &Certificate) -> Option<Fingerprint> {
        if cert.is_self_signed {
            return None;
        }

        let candidates = || {
            self.certs
                .values()
                .filter(|c| c.is_ca && c.fingerprint != cert.fingerprint && c.subject == cert.issuer)
        };

        let by_key = cert.authority_key_identifier.as_ref().and_then(|aki| {
            candidates()
                .filter(|c| c.subject_key_identifier.as_ref() == Some(aki))
                .max_by_key(|c| c.valid_to)
        });

        by_key
            .or_else(|| candidates().max_by_key(|c| c.valid_to))
            .map(|c| c.fingerprint.clone())
    }

    /// Resolve `signed_by` / `signs` for every certificate: by SKI/AKI first,
    /// by issuer DN second.
    pub fn rebuild_graph(&mut self) {
        let links: Vec<(Fingerprint, Option<Fingerprint>)> = self
            .certs
            .values()
            .map(|c| (c.fingerprint.clone(), self.find_issuer(c)))
            .collect();

        for cert in self.certs.values_mut() {
            cert.signed_by = None;
            cert.signs.clear();
        }

        for (child, parent) in links {
            let Some(parent) = parent else {
                continue;
            };
            if let Some(cert) = self.certs.get_mut(&child) {
                cert.signed_by = Some(parent.clone());
            }
            if let Some(issuer) = self.certs.get_mut(&parent) {
                issuer.signs.insert(child);
            }
        }
    }

    /// Everything issued directly or transitively by `fingerprint`, nearest
    /// first.
    pub fn descendants(&self, fingerprint: &Fingerprint) -> Vec<Fingerprint> {
        let mut seen = BTreeSet::from([fingerprint.clone()]);
        let mut queue = VecDeque::from([fingerprint.clone()]);
        let mut out = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(cert) = self.certs.get(&current) else {
                continue;
            };
            for child in &cert.signs {
                if seen.insert(child.clone()) {
                    out.push(child.clone());
                    queue.push_back(child.clone());
                }
            }
        }
        out
    }

    /// Issuers of `fingerprint`, nearest first, ending at a root or at the
    /// first issuer not tracked.
    pub fn issuer_chain(&self, fingerprint: &Fingerprint) -> Vec<Fingerprint> {
        let mut seen = BTreeSet::from([fingerprint.clone()]);
        let mut out = Vec::new();
        let mut current = self.certs.get(fingerprint).and_then(|c| c.signed_by.clone());

        while let Some(next) = current {
            if !seen.insert(next.clone()) {
                break;
            }
            current = self.certs.get(&next).and_then(|c| c.signed_by.clone());
            out.push(next);
        }
        out
    }

    /// Number of tracked issuers above `fingerprint`.
    pub fn depth(&self, fingerprint: &Fingerprint) -> usize {
        self.issuer_chain(fingerprint).len()
    }

    /// Re-read a single path after a file system event and reconcile.
    pub fn refresh_path(&mut self, path: &Path, doc: &ConfigDocument) -> PathChange {
        let tracked = self.paths.get(path).cloned();

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let Some(old) = tracked else {
                    return PathChange::Unchanged;
                };
                let has_children = self
                    .certs
                    .get(&old)
                    .map(|c| !c.signs.is_empty())
                    .unwrap_or(false);
                if has_children {
                    warn!(
                        path = %path.display(),
                        fingerprint = %old,
                        "Issuer file removed from disk but it still has issued certificates, keeping it tracked"
                    );
                    return PathChange::Retained(old);
                }
                self.remove(&old);
                return PathChange::Removed(old);
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Could not read changed file");
                return PathChange::Unchanged;
            }
        };

        let info = match parse_certificate(&bytes) {
            Ok(info) => info,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Changed file is not a certificate");
                return PathChange::Unchanged;
            }
        };

        let new = info.fingerprint.clone();
        match tracked {
            Some(old) if old == new => PathChange::Unchanged,
            Some(old) => {
                // Policy follows the path: look up the old entry if the new
                // fingerprint has none of its own.
                let config = doc.get(new.as_str()).or_else(|| doc.get(old.as_str()));
                let cert = build_certificate(info, path.to_path_buf(), config);
                self.certs.remove(&old);
                self.insert(cert);
                PathChange::Replaced { old, new }
            }
            None if self.certs.contains_key(&new) => PathChange::Unchanged,
            None => {
                let cert = build_certificate(info, path.to_path_buf(), doc.get(new.as_str()));
                self.insert(cert);
                PathChange::Inserted(new)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CertProfile, SanList, dn, issue, keys};
    use certkeeper_common::params::KeySpec;
    use openssl::{
        pkey::{PKey, Private},
        x509::X509,
    };

    struct Issued {
        cert: X509,
        key: PKey<Private>,
    }

    fn root(cn: &str) -> Issued {
        let key = keys::generate_key(KeySpec::EcP256).unwrap();
        let cert = issue::create_self_signed(
            Utc::now(),
            &dn::parse_name(&format!("CN={cn}")).unwrap(),
            &key,
            365,
            &CertProfile::ca(None),
        )
        .unwrap();
        Issued { cert, key }
    }

    fn issue_from(ca: &Issued, cn: &str, profile: CertProfile) -> Issued {
        let key = keys::generate_key(KeySpec::EcP256).unwrap();
        let csr = issue::create_csr(
            &dn::parse_name(&format!("CN={cn}")).unwrap(),
            &key,
            &SanList::default(),
        )
        .unwrap();
        let cert = issue::sign_with_ca(Utc::now(), &csr, &ca.cert, &ca.key, 90, &profile).unwrap();
        Issued { cert, key }
    }

    fn write(dir: &Path, name: &str, cert: &X509) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, cert.to_pem().unwrap()).unwrap();
        path
    }

    fn fp(cert: &X509) -> Fingerprint {
        parse_certificate(&cert.to_der().unwrap()).unwrap().fingerprint
    }

    #[test]
    fn test_scan_resolves_graph_symmetrically() {
        let dir = tempfile::tempdir().unwrap();
        let root = root("Graph Root");
        let intermediate = issue_from(&root, "Graph Intermediate", CertProfile::ca(Some(0)));
        let leaf = issue_from(&intermediate, "leaf.example.com", CertProfile::Leaf);

        write(dir.path(), "root.crt", &root.cert);
        fs::create_dir(dir.path().join("sub")).unwrap();
        write(&dir.path().join("sub"), "intermediate.pem", &intermediate.cert);
        write(dir.path(), "leaf.cer", &leaf.cert);
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        fs::write(dir.path().join("broken.pem"), b"not a cert").unwrap();

        let registry = Registry::scan(dir.path(), &ConfigDocument::default());
        assert_eq!(registry.len(), 3);

        let (root_fp, int_fp, leaf_fp) = (fp(&root.cert), fp(&intermediate.cert), fp(&leaf.cert));

        let leaf_entry = registry.get(&leaf_fp).unwrap();
        assert_eq!(leaf_entry.signed_by.as_ref(), Some(&int_fp));
        assert!(registry.get(&int_fp).unwrap().signs.contains(&leaf_fp));
        assert_eq!(registry.get(&int_fp).unwrap().signed_by.as_ref(), Some(&root_fp));
        assert!(registry.get(&root_fp).unwrap().signed_by.is_none());

        for cert in registry.iter() {
            if let Some(parent) = &cert.signed_by {
                let parent = registry.get(parent).unwrap();
                assert!(parent.is_ca);
                assert_eq!(parent.subject, cert.issuer);
                assert!(parent.signs.contains(&cert.fingerprint));
            }
        }

        assert_eq!(registry.depth(&leaf_fp), 2);
        assert_eq!(registry.issuer_chain(&leaf_fp), vec![int_fp.clone(), root_fp.clone()]);
        assert_eq!(registry.descendants(&root_fp), vec![int_fp, leaf_fp]);
    }

    #[test]
    fn test_scan_merges_stored_policy() {
        let dir = tempfile::tempdir().unwrap();
        let root = root("Policy Root");
        write(dir.path(), "root.crt", &root.cert);
        let root_fp = fp(&root.cert);

        let mut doc = ConfigDocument::default();
        let entry = doc.entry(&root_fp.as_str().to_ascii_lowercase());
        entry.auto_renew = true;
        entry.renew_days_before_expiry = Some(45);

        let registry = Registry::scan(dir.path(), &doc);
        let cert = registry.get(&root_fp).unwrap();
        assert!(cert.auto_renew);
        assert_eq!(cert.renew_days_before_expiry, Some(45));
        assert!(registry.find(&root_fp.as_str().to_ascii_lowercase()).is_some());
    }

    #[test]
    fn test_key_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let root = root("Key Root");
        let path = write(dir.path(), "root.crt", &root.cert);
        fs::write(dir.path().join("root.key"), b"key").unwrap();

        let registry = Registry::scan(dir.path(), &ConfigDocument::default());
        let cert = registry.get(&fp(&root.cert)).unwrap();
        assert_eq!(cert.cert_path, path);
        assert_eq!(cert.key_path.as_deref(), Some(dir.path().join("root.key").as_path()));
    }

    #[test]
    fn test_refresh_path_diffs() {
        let dir = tempfile::tempdir().unwrap();
        let doc = ConfigDocument::default();
        let mut registry = Registry::new();

        let root = root("Diff Root");
        let leaf = issue_from(&root, "diff.example.com", CertProfile::Leaf);
        let root_path = write(dir.path(), "root.crt", &root.cert);

        assert_eq!(
            registry.refresh_path(&root_path, &doc),
            PathChange::Inserted(fp(&root.cert))
        );
        assert_eq!(registry.refresh_path(&root_path, &doc), PathChange::Unchanged);

        let leaf_path = write(dir.path(), "leaf.crt", &leaf.cert);
        registry.refresh_path(&leaf_path, &doc);

        // Issuer removed from disk while the leaf still points at it.
        fs::remove_file(&root_path).unwrap();
        assert_eq!(
            registry.refresh_path(&root_path, &doc),
            PathChange::Retained(fp(&root.cert))
        );

        // Leaf replaced by a different certificate at the same path.
        let other = issue_from(&root, "other.example.com", CertProfile::Leaf);
        write(dir.path(), "leaf.crt", &other.cert);
        assert_eq!(
            registry.refresh_path(&leaf_path, &doc),
            PathChange::Replaced {
                old: fp(&leaf.cert),
                new: fp(&other.cert)
            }
        );

        fs::remove_file(&leaf_path).unwrap();
        assert_eq!(
            registry.refresh_path(&leaf_path, &doc),
            PathChange::Removed(fp(&other.cert))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_filters() {
        let dir = tempfile::tempdir().unwrap();
        let root = root("List Root");
        let leaf = issue_from(&root, "list.example.com", CertProfile::Leaf);
        write(dir.path(), "root.crt", &root.cert);
        write(dir.path(), "leaf.crt", &leaf.cert);

        let registry = Registry::scan(dir.path(), &ConfigDocument::default());
        let now = Utc::now();

        assert_eq!(registry.list(&ListFilter::default(), now).len(), 2);

        let cas = registry.list(
            &ListFilter {
                ca_only: true,
                ..Default::default()
            },
            now,
        );
        assert_eq!(cas.len(), 1);
        assert!(cas[0].is_ca);

        // Leaf has 90 days, root 365.
        let expiring = registry.list(
            &ListFilter {
                expiring_within_days: Some(100),
                ..Default::default()
            },
            now,
        );
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].fingerprint, fp(&leaf.cert));
    }
}
