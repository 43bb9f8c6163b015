//! Input parameters for the various functions within certkeeper.

use serde::{Deserialize, Serialize};

use crate::views::ActivityKind;

mod certificate;
pub use certificate::*;

mod deploy;
pub use deploy::*;

/// Filter applied when reading the activity log.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityFilter {
    #[serde(rename = "type")]
    pub kind: Option<ActivityKind>,

    /// Case-insensitive substring matched against the message and the
    /// serialized data of each record.
    pub search: Option<String>,

    /// The maximum number of results to return.
    pub limit: Option<usize>,
}
