use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_true() -> bool {
    true
}

/// One unit of post-renewal work attached to a certificate.
///
/// The `id` is assigned on creation and never changes, even when the action is
/// edited or moved within the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployAction {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the per-type default timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(flatten)]
    pub kind: DeployActionKind,
}

impl DeployAction {
    pub fn new(name: impl Into<String>, kind: DeployActionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            timeout_secs: None,
            kind,
        }
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
            .unwrap_or_else(|| self.kind.default_timeout_secs())
    }
}

/// Which piece of certificate material an action ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CopySource {
    #[default]
    Cert,
    Key,
    Chain,
    Fullchain,
    P12,
}

/// How an SSH target's host key is checked against `known_hosts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Host must already be present with a matching key.
    #[default]
    Strict,
    /// Unknown hosts are added on first contact; mismatches still fail.
    AcceptNew,
    /// No verification at all.
    Insecure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DeployActionKind {
    Copy(CopyAction),
    SshCopy(SshCopyAction),
    SmbCopy(SmbCopyAction),
    FtpCopy(FtpCopyAction),
    Command(CommandAction),
    DockerRestart(DockerRestartAction),
    NginxProxyManager(NginxProxyManagerAction),
    ApiCall(HttpAction),
    Webhook(HttpAction),
    Email(EmailAction),
}

impl DeployActionKind {
    /// The wire name of the action type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Copy(_) => "copy",
            Self::SshCopy(_) => "ssh-copy",
            Self::SmbCopy(_) => "smb-copy",
            Self::FtpCopy(_) => "ftp-copy",
            Self::Command(_) => "command",
            Self::DockerRestart(_) => "docker-restart",
            Self::NginxProxyManager(_) => "nginx-proxy-manager",
            Self::ApiCall(_) => "api-call",
            Self::Webhook(_) => "webhook",
            Self::Email(_) => "email",
        }
    }

    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            Self::ApiCall(_) | Self::Webhook(_) | Self::NginxProxyManager(_) => 30,
            Self::SshCopy(_) | Self::SmbCopy(_) | Self::FtpCopy(_) => 120,
            _ => 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyAction {
    #[serde(default)]
    pub source: CopySource,
    pub destination: PathBuf,
    /// Octal file mode, e.g. `"0640"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// `user` or `user:group`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshCopyAction {
    pub host: String,
    #[serde(default = "SshCopyAction::default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_passphrase: Option<String>,
    #[serde(default)]
    pub source: CopySource,
    pub remote_path: String,
    #[serde(default)]
    pub mkdir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    /// Defaults to `~/.ssh/known_hosts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,
}

impl SshCopyAction {
    fn default_port() -> u16 {
        22
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmbCopyAction {
    pub host: String,
    pub share: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub source: CopySource,
    /// Path inside the share, `/` separated
    pub remote_path: String,
    #[serde(default)]
    pub mkdir: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpCopyAction {
    pub host: String,
    #[serde(default = "FtpCopyAction::default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub source: CopySource,
    pub remote_path: String,
    #[serde(default)]
    pub mkdir: bool,
}

impl FtpCopyAction {
    fn default_port() -> u16 {
        21
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAction {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerRestartAction {
    /// Container name or id
    pub container: String,
    /// `unix:///var/run/docker.sock`, `tcp://host:2376`, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ca: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<PathBuf>,
    /// How long to wait for the container to report `running`.
    #[serde(default = "DockerRestartAction::default_wait_secs")]
    pub wait_secs: u64,
}

impl DockerRestartAction {
    fn default_wait_secs() -> u64 {
        30
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NginxProxyManagerAction {
    pub host: String,
    #[serde(default = "NginxProxyManagerAction::default_port")]
    pub port: u16,
    #[serde(default)]
    pub https: bool,
    pub username: String,
    pub password: String,
    /// Existing custom certificate to replace. A new one is created if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nice_name: Option<String>,
}

impl NginxProxyManagerAction {
    fn default_port() -> u16 {
        81
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpAction {
    pub url: String,
    #[serde(default = "HttpAction::default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Body template; placeholders are expanded before sending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl HttpAction {
    fn default_method() -> String {
        "POST".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "SmtpConfig::default_port")]
    pub port: u16,
    /// Implicit TLS / STARTTLS relay when true, plaintext otherwise.
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub from: String,
}

impl SmtpConfig {
    fn default_port() -> u16 {
        587
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAction {
    pub smtp: SmtpConfig,
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Outcome of a single action within a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub index: usize,
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
}

/// Aggregate outcome of a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutcome {
    pub executed: usize,
    pub succeeded: usize,
    pub results: Vec<ActionResult>,
}

impl DeployOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.executed == self.succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_roundtrips_through_tagged_json() {
        let raw = r#"{
            "id": "6f1c2a34-0d53-4d0b-9d5e-2c1f1f7f7a10",
            "name": "push to web",
            "type": "ssh-copy",
            "host": "web1",
            "username": "deploy",
            "remotePath": "/etc/ssl/web.pem",
            "hostKeyPolicy": "accept-new"
        }"#;

        let action: DeployAction = serde_json::from_str(raw).unwrap();
        assert!(action.enabled);
        assert_eq!(action.kind.type_name(), "ssh-copy");
        let DeployActionKind::SshCopy(ssh) = &action.kind else {
            panic!("wrong variant: {:?}", action.kind);
        };
        assert_eq!(ssh.port, 22);
        assert_eq!(ssh.host_key_policy, HostKeyPolicy::AcceptNew);
        assert_eq!(action.timeout_secs(), 120);

        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "ssh-copy");
        assert_eq!(json["id"], "6f1c2a34-0d53-4d0b-9d5e-2c1f1f7f7a10");
    }

    #[test]
    fn test_webhook_and_api_call_share_shape() {
        let hook: DeployAction = serde_json::from_str(
            r#"{"id":"6f1c2a34-0d53-4d0b-9d5e-2c1f1f7f7a11","name":"n","type":"webhook","url":"http://x"}"#,
        )
        .unwrap();
        let DeployActionKind::Webhook(http) = &hook.kind else {
            panic!("wrong variant");
        };
        assert_eq!(http.method, "POST");
        assert_eq!(hook.timeout_secs(), 30);
    }
}
