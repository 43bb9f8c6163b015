use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{fingerprint::Fingerprint, views::DeployOutcome};

/// A certificate that was re-issued in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewedCertificate {
    pub old_fingerprint: Fingerprint,
    pub new_fingerprint: Fingerprint,
    pub common_name: Option<String>,
    pub valid_to: DateTime<Utc>,
    /// Present when the certificate has enabled deploy actions.
    pub deploy: Option<DeployOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalFailure {
    pub fingerprint: Fingerprint,
    pub common_name: Option<String>,
    /// Machine-readable error kind, e.g. `PassphraseRequired`
    pub code: String,
    pub message: String,
}

/// Outcome of one pass of the renewal job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalReport {
    pub checked_at: DateTime<Utc>,
    /// Every certificate that was due, in the order they were processed.
    pub candidates: Vec<Fingerprint>,
    pub renewed: Vec<RenewedCertificate>,
    pub failed: Vec<RenewalFailure>,
    /// The pass stopped early because the engine is shutting down.
    #[serde(default)]
    pub interrupted: bool,
}
