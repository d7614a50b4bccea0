//! Retention sweep for revoked and expired devices.
//!
//! One-shot via [`run_cleanup`] (cron, CLI), or in-process via
//! [`run_periodic`] until a shutdown signal resolves.

use crate::auth::TrustedDeviceService;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// Outcome of one sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub success: bool,
    pub count: u64,
    pub ran_at: DateTime<Utc>,
}

/// Run a single sweep. Never fails; a store error gives `success: false`.
pub fn run_cleanup(service: &TrustedDeviceService) -> CleanupReport {
    let ran_at = Utc::now();
    match service.try_cleanup_expired_devices() {
        Ok(count) => CleanupReport {
            success: true,
            count,
            ran_at,
        },
        Err(e) => {
            tracing::error!("Trusted device cleanup job failed: {e}");
            CleanupReport {
                success: false,
                count: 0,
                ran_at,
            }
        }
    }
}

/// Sweep every `every` (first sweep immediately) until `shutdown` resolves.
/// Returns the reports of all completed sweeps.
pub async fn run_periodic<F>(
    service: TrustedDeviceService,
    every: Duration,
    shutdown: F,
) -> Vec<CleanupReport>
where
    F: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut reports = Vec::new();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let sweeper = service.clone();
                let report = match tokio::task::spawn_blocking(move || run_cleanup(&sweeper)).await {
                    Ok(report) => report,
                    Err(e) => {
                        tracing::error!("Cleanup task panicked: {e}");
                        CleanupReport { success: false, count: 0, ran_at: Utc::now() }
                    }
                };
                tracing::debug!(count = report.count, success = report.success, "Cleanup tick");
                reports.push(report);
            }
            () = &mut shutdown => {
                tracing::info!(runs = reports.len(), "Cleanup loop stopped");
                break;
            }
        }
    }
    reports
}
