use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_RENEW_DAYS_BEFORE_EXPIRY: i64 = 30;
pub const DEFAULT_RENEWAL_SCHEDULE: &str = "0 0 * * *";

/// Validity periods, in days, used when issuing new certificates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaValidityPeriod {
    pub root_ca: u32,
    pub intermediate_ca: u32,
    pub standard: u32,
}

impl Default for CaValidityPeriod {
    fn default() -> Self {
        Self {
            root_ca: 3650,
            intermediate_ca: 1825,
            standard: 365,
        }
    }
}

/// Engine-wide defaults, persisted alongside the per-certificate config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalDefaults {
    pub ca_validity_period: CaValidityPeriod,
    pub renew_days_before_expiry: i64,
    pub enable_auto_renewal_job: bool,
    /// Five-field cron expression (minute hour day-of-month month day-of-week)
    pub renewal_schedule: String,
    pub last_renewal_check: Option<DateTime<Utc>>,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            ca_validity_period: CaValidityPeriod::default(),
            renew_days_before_expiry: DEFAULT_RENEW_DAYS_BEFORE_EXPIRY,
            enable_auto_renewal_job: true,
            renewal_schedule: DEFAULT_RENEWAL_SCHEDULE.to_string(),
            last_renewal_check: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let parsed: GlobalDefaults =
            serde_json::from_str(r#"{"renewDaysBeforeExpiry": 14}"#).unwrap();

        assert_eq!(parsed.renew_days_before_expiry, 14);
        assert_eq!(parsed.renewal_schedule, "0 0 * * *");
        assert_eq!(parsed.ca_validity_period.root_ca, 3650);
        assert!(parsed.enable_auto_renewal_job);
    }
}
