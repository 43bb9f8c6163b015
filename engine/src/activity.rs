//! Bounded, newest-first audit trail persisted to `activities.json`.

use std::{collections::VecDeque, path::PathBuf};

use certkeeper_common::{
    params::ActivityFilter,
    views::{Activity, ActivityKind},
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{EngineError, EngineResult},
    files,
};

/// Build an activity record stamped at `now`.
pub fn activity(
    now: DateTime<Utc>,
    kind: ActivityKind,
    action: &str,
    message: impl Into<String>,
    data: serde_json::Value,
) -> Activity {
    Activity {
        id: Uuid::new_v4(),
        timestamp: now,
        kind,
        action: Some(action.to_string()),
        message: message.into(),
        data,
        user: None,
    }
}

#[derive(Debug)]
pub struct ActivityLog {
    path: PathBuf,
    max: usize,
    entries: Mutex<VecDeque<Activity>>,
}

impl ActivityLog {
    /// Load the log. An unparsable file is set aside rather than failing
    /// startup: the log is an audit aid, not state.
    pub fn load(path: impl Into<PathBuf>, max: usize) -> EngineResult<Self> {
        let path = path.into();
        let max = max.max(1);

        let mut entries: VecDeque<Activity> = match files::read_optional(&path)? {
            Some(bytes) => match serde_json::from_slice::<Vec<Activity>>(&bytes) {
                Ok(entries) => entries.into(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Activity log is unreadable, starting a new one");
                    VecDeque::new()
                }
            },
            None => VecDeque::new(),
        };
        entries.truncate(max);

        Ok(Self {
            path,
            max,
            entries: Mutex::new(entries),
        })
    }

    /// Prepend `activity`, trim to the cap and persist. Persistence failures
    /// are logged and otherwise ignored.
    pub async fn record(&self, activity: Activity) {
        let action = activity.action.as_deref().unwrap_or_default();
        if action.ends_with("-failed") {
            warn!(kind = %activity.kind, action, data = %activity.data, "{}", activity.message);
        } else {
            info!(kind = %activity.kind, action, "{}", activity.message);
        }

        let mut entries = self.entries.lock().await;
        entries.push_front(activity);
        entries.truncate(self.max);

        let result = serde_json::to_vec_pretty(&*entries)
            .map_err(EngineError::from)
            .and_then(|bytes| files::write_atomic(&self.path, &bytes, files::SECRET_MODE));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Failed to persist activity log");
        }
    }

    /// Records matching `filter`, newest first.
    pub async fn list(&self, filter: &ActivityFilter) -> Vec<Activity> {
        let needle = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|a| filter.kind.is_none_or(|kind| a.kind == kind))
            .filter(|a| match &needle {
                Some(needle) => {
                    a.message.to_lowercase().contains(needle)
                        || a.data.to_string().to_lowercase().contains(needle)
                }
                None => true,
            })
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_newest_first_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activities.json");
        let log = ActivityLog::load(&path, 3).unwrap();

        for i in 0..5 {
            log.record(activity(
                at(i),
                ActivityKind::System,
                "tick",
                format!("tick {i}"),
                json!({}),
            ))
            .await;
        }

        let all = log.list(&ActivityFilter::default()).await;
        let messages: Vec<_> = all.iter().map(|a| a.message.as_str()).collect();
        assert_eq!(messages, vec!["tick 4", "tick 3", "tick 2"]);

        let reloaded = ActivityLog::load(&path, 10).unwrap();
        assert_eq!(reloaded.len().await, 3);
    }

    #[tokio::test]
    async fn test_filter_by_kind_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActivityLog::load(dir.path().join("activities.json"), 100).unwrap();

        log.record(activity(
            at(0),
            ActivityKind::Certificate,
            "renew",
            "Renewed api.example.com",
            json!({ "fingerprint": "AABB" }),
        ))
        .await;
        log.record(activity(
            at(1),
            ActivityKind::System,
            "registry-ready",
            "Registry ready",
            json!({ "count": 1 }),
        ))
        .await;

        let certs = log
            .list(&ActivityFilter {
                kind: Some(ActivityKind::Certificate),
                ..Default::default()
            })
            .await;
        assert_eq!(certs.len(), 1);

        // Search reaches into the data payload too.
        let by_data = log
            .list(&ActivityFilter {
                search: Some("aabb".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(by_data.len(), 1);
        assert_eq!(by_data[0].action.as_deref(), Some("renew"));

        let limited = log
            .list(&ActivityFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await;
        assert_eq!(limited[0].message, "Registry ready");
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activities.json");
        std::fs::write(&path, b"[{ nope").unwrap();

        let log = ActivityLog::load(&path, 10).unwrap();
        assert_eq!(log.len().await, 0);
    }
}
