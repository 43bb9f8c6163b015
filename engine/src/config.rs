use std::path::{Path, PathBuf};

use clap::Parser;

#[derive(Clone, Debug, Parser)]
pub struct EngineConfig {
    /// Directory holding `cert-config.json`, `.encryption-key` and
    /// `activities.json`.
    #[clap(long, env = "CERTKEEPER_CONFIG_DIR", default_value = "/etc/certkeeper")]
    pub config_dir: PathBuf,

    /// Directory scanned and watched for certificates. New material is
    /// written here.
    #[clap(
        long,
        env = "CERTKEEPER_CERTS_DIR",
        default_value = "/var/lib/certkeeper/certs"
    )]
    pub certs_dir: PathBuf,

    /// Copy a certificate to `<path>.bak.<timestamp>` before overwriting it.
    #[clap(long, env = "CERTKEEPER_ENABLE_CERTIFICATE_BACKUPS", default_value_t = false)]
    pub enable_certificate_backups: bool,

    /// Maximum number of activity records kept.
    #[clap(long, env = "CERTKEEPER_ACTIVITY_LOG_MAX", default_value_t = 1000)]
    pub activity_log_max: usize,

    /// Per-path debounce for file system events, in milliseconds.
    #[clap(long, env = "CERTKEEPER_WATCH_DEBOUNCE_MS", default_value_t = 100)]
    pub watch_debounce_ms: u64,

    /// How long the watcher ignores a path after the engine wrote it, in
    /// milliseconds.
    #[clap(long, env = "CERTKEEPER_IGNORE_WINDOW_MS", default_value_t = 5000)]
    pub ignore_window_ms: u64,

    /// Do not watch the certificate directory.
    #[clap(long, env = "CERTKEEPER_DISABLE_WATCHER", default_value_t = false)]
    pub disable_watcher: bool,
}

impl EngineConfig {
    /// A config rooted at the given directories with every other setting at
    /// its default.
    pub fn new(config_dir: impl Into<PathBuf>, certs_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            certs_dir: certs_dir.into(),
            enable_certificate_backups: false,
            activity_log_max: 1000,
            watch_debounce_ms: 100,
            ignore_window_ms: 5000,
            disable_watcher: false,
        }
    }

    pub fn cert_config_path(&self) -> PathBuf {
        self.config_dir.join("cert-config.json")
    }

    pub fn encryption_key_path(&self) -> PathBuf {
        self.config_dir.join(".encryption-key")
    }

    pub fn activities_path(&self) -> PathBuf {
        self.config_dir.join("activities.json")
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_parser() {
        let parsed = EngineConfig::parse_from(["certkeeperd"]);
        let built = EngineConfig::new("/etc/certkeeper", "/var/lib/certkeeper/certs");

        assert_eq!(parsed.config_dir, built.config_dir);
        assert_eq!(parsed.certs_dir, built.certs_dir);
        assert_eq!(parsed.activity_log_max, built.activity_log_max);
        assert_eq!(parsed.watch_debounce_ms, built.watch_debounce_ms);
        assert_eq!(parsed.ignore_window_ms, built.ignore_window_ms);
        assert!(!parsed.enable_certificate_backups);
    }

    #[test]
    fn test_well_known_files() {
        let config = EngineConfig::new("/cfg", "/certs");
        assert_eq!(config.cert_config_path(), PathBuf::from("/cfg/cert-config.json"));
        assert_eq!(config.encryption_key_path(), PathBuf::from("/cfg/.encryption-key"));
        assert_eq!(config.activities_path(), PathBuf::from("/cfg/activities.json"));
    }
}
