use serde::{Deserialize, Serialize};

use crate::views::DeployActionKind;

/// Body for adding or replacing a deploy action. The id is never taken from
/// the caller.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployActionParams {
    pub name: String,
    pub enabled: Option<bool>,
    pub timeout_secs: Option<u64>,
    #[serde(flatten)]
    pub kind: DeployActionKind,
}
