//! Cron-driven renewal job.
//!
//! Candidate selection is a pure function of the registry snapshot and the
//! engine clock. The actual renewal work lives on [`Engine`]; this module
//! decides when to run it and in which order.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration as StdDuration,
};

use certkeeper_common::{Fingerprint, views::Certificate};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    engine::Engine,
    error::{EngineError, EngineResult},
};

/// Parse a renewal schedule. Classic five-field expressions are accepted and
/// run at second zero; six and seven field expressions pass through.
pub fn parse_schedule(expr: &str) -> EngineResult<Schedule> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();

    let normalized = match fields {
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_string(),
        _ => {
            return Err(EngineError::Schedule {
                expr: expr.to_string(),
                message: format!("expected 5 to 7 fields, found {fields}"),
            });
        }
    };

    Schedule::from_str(&normalized).map_err(|e| EngineError::Schedule {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

/// True when `cert` is due for renewal at `now`.
pub fn is_due(cert: &Certificate, now: DateTime<Utc>, global_threshold: i64) -> bool {
    cert.auto_renew
        && cert.valid_to - now <= Duration::days(cert.renewal_threshold(global_threshold))
}

/// Certificates due for renewal, issuers before the certificates they
/// signed. Ties are broken by expiry, then fingerprint.
pub fn select_candidates<'a>(
    certs: impl IntoIterator<Item = &'a Certificate>,
    now: DateTime<Utc>,
    global_threshold: i64,
    depth: impl Fn(&Fingerprint) -> usize,
) -> Vec<Fingerprint> {
    let mut due: Vec<(usize, DateTime<Utc>, Fingerprint)> = certs
        .into_iter()
        .filter(|c| is_due(c, now, global_threshold))
        .map(|c| (depth(&c.fingerprint), c.valid_to, c.fingerprint.clone()))
        .collect();

    due.sort();
    due.into_iter().map(|(_, _, fp)| fp).collect()
}

/// One async mutex per fingerprint so a scheduled and a manual renewal of
/// the same certificate run one after the other.
#[derive(Debug, Default)]
pub struct RenewalLocks {
    locks: Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>,
}

impl RenewalLocks {
    pub async fn acquire(&self, fingerprint: &Fingerprint) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|fp, lock| fp == fingerprint || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(fingerprint.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Run the renewal job until `cancel` fires. Re-reads the global defaults
/// every time it wakes, so schedule changes apply without a restart.
pub(crate) async fn run(engine: &Engine, cancel: CancellationToken) {
    loop {
        let defaults = engine.global_defaults().await;

        let next = if defaults.enable_auto_renewal_job {
            match parse_schedule(&defaults.renewal_schedule) {
                Ok(schedule) => schedule.after(&engine.now()).next(),
                Err(e) => {
                    error!(error = %e, "Renewal job disabled until the schedule is fixed");
                    None
                }
            }
        } else {
            debug!("Automatic renewal is disabled");
            None
        };

        let sleep = async {
            match next {
                Some(at) => {
                    let wait = (at - engine.now()).to_std().unwrap_or(StdDuration::ZERO);
                    debug!(next = %at, "Next renewal check scheduled");
                    tokio::time::sleep(wait).await
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = engine.rearm_signal().notified() => {
                debug!("Renewal schedule changed, re-arming");
                continue;
            }
            _ = sleep => {}
        }

        match engine.check_renewals_until(&cancel).await {
            Ok(report) => info!(
                candidates = report.candidates.len(),
                renewed = report.renewed.len(),
                failed = report.failed.len(),
                "Renewal check finished"
            ),
            Err(e) => error!(error = %e, "Renewal check failed"),
        }
    }

    debug!("Renewal job stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use certkeeper_common::views::{Encoding, Sans};
    use std::{collections::BTreeSet, path::PathBuf};

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn cert(fp: &str, days_left: i64, auto_renew: bool, threshold: Option<i64>) -> Certificate {
        Certificate {
            fingerprint: fp.parse().unwrap(),
            common_name: Some(fp.to_string()),
            subject: format!("CN={fp}"),
            issuer: "CN=root".into(),
            issuer_cn: Some("root".into()),
            serial_number: "01".into(),
            signature_algorithm: "ecdsa-with-SHA256".into(),
            subject_key_identifier: None,
            authority_key_identifier: None,
            key_type: None,
            key_size: None,
            valid_from: start() - Duration::days(10),
            valid_to: start() + Duration::days(days_left),
            sans: Sans::default(),
            is_ca: false,
            path_len_constraint: None,
            is_self_signed: false,
            is_root_ca: false,
            key_cert_sign: false,
            original_encoding: Encoding::Pem,
            cert_path: PathBuf::from(format!("/certs/{fp}.crt")),
            key_path: None,
            chain_path: None,
            p12_path: None,
            auto_renew,
            renew_days_before_expiry: threshold,
            deploy_actions: Vec::new(),
            has_stored_passphrase: false,
            signed_by: None,
            signs: BTreeSet::new(),
        }
    }

    #[test]
    fn test_parse_schedule_accepts_five_fields() {
        let schedule = parse_schedule("0 0 * * *").unwrap();
        let next = schedule.after(&start()).next().unwrap();
        assert_eq!(next, DateTime::from_timestamp(1_700_006_400, 0).unwrap());

        assert!(parse_schedule("*/30 * * * * *").is_ok());
        assert!(matches!(
            parse_schedule("every day"),
            Err(EngineError::Schedule { .. })
        ));
        assert!(parse_schedule("0 99 * * *").is_err());
    }

    #[test]
    fn test_selection_follows_threshold() {
        let certs = vec![
            cert("AA", 75, true, Some(80)),
            cert("BB", 75, false, Some(80)),
            cert("CC", 31, true, None),
            cert("DD", 30, true, None),
            cert("EE", -2, true, None),
        ];

        let selected = select_candidates(&certs, start(), 30, |_| 0);
        let names: Vec<_> = selected.iter().map(|f| f.as_str()).collect();
        assert_eq!(names, vec!["EE", "DD", "AA"]);

        // Same inputs, same answer.
        assert_eq!(select_candidates(&certs, start(), 30, |_| 0), selected);
    }

    #[test]
    fn test_issuers_come_first() {
        let certs = vec![
            cert("A1", 1, true, None),
            cert("CA", 20, true, None),
        ];
        let depths: HashMap<&str, usize> = HashMap::from([("A1", 1), ("CA", 0)]);

        let selected = select_candidates(&certs, start(), 30, |fp| depths[fp.as_str()]);
        let names: Vec<_> = selected.iter().map(|f| f.as_str()).collect();
        assert_eq!(names, vec!["CA", "A1"]);
    }

    #[tokio::test]
    async fn test_renewal_locks_serialize_per_fingerprint() {
        let locks = Arc::new(RenewalLocks::default());
        let fp: Fingerprint = "AA".parse().unwrap();

        let held = locks.acquire(&fp).await;
        let waiter = tokio::spawn({
            let locks = Arc::clone(&locks);
            let fp = fp.clone();
            async move {
                let _guard = locks.acquire(&fp).await;
            }
        });

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // A different fingerprint is not blocked.
        let other: Fingerprint = "BB".parse().unwrap();
        drop(locks.acquire(&other).await);

        drop(held);
        waiter.await.unwrap();
    }
}
