//! WebSub lease renewal.

use chrono::{DateTime, Utc};

use crate::services::sites::SiteRegistry;
use crate::services::websub::WebSubService;

/// Renew once this share (in percent) of the lease has elapsed.
pub const RENEWAL_PERCENT: i128 = 95;

/// True iff the lease is unknown or at least 95% of it has elapsed.
pub fn needs_renewal(
    lease_date: Option<DateTime<Utc>>,
    lease_seconds: Option<u64>,
    now: DateTime<Utc>,
) -> bool {
    let (Some(lease_date), Some(lease_seconds)) = (lease_date, lease_seconds) else {
        return true;
    };

    let elapsed_ms = (now - lease_date).num_milliseconds() as i128;
    // elapsed >= 0.95 * lease, in integer milliseconds
    elapsed_ms * 100 >= lease_seconds as i128 * 1000 * RENEWAL_PERCENT
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseReport {
    pub checked: usize,
    pub renewed: usize,
    pub pending: usize,
    pub failed: usize,
}

/// Resubscribe every channel whose lease is due. One channel failing does not
/// stop the others.
pub async fn renew_due_leases(
    sites: &SiteRegistry,
    websub: &WebSubService,
    now: DateTime<Utc>,
) -> LeaseReport {
    let mut report = LeaseReport::default();

    for site in sites.all() {
        let streamers = match site.streamers.list().await {
            Ok(streamers) => streamers,
            Err(e) => {
                tracing::warn!("Lease check skipped for site {}: {}", site.slug, e);
                continue;
            }
        };

        for streamer in streamers {
            let Some(yt) = streamer.platforms.youtube.as_ref() else {
                continue;
            };
            report.checked += 1;

            if !needs_renewal(yt.lease_date, yt.lease_seconds, now) {
                continue;
            }

            if websub.expectations.pending_for(&yt.channel_id).await {
                report.pending += 1;
                continue;
            }

            match websub.subscribe(site.streamers.as_ref(), &yt.channel_id).await {
                Ok(()) => {
                    tracing::info!(
                        "Renewing WebSub lease for {} ({})",
                        streamer.alias,
                        yt.channel_id
                    );
                    report.renewed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to renew WebSub lease for {} ({}): {}",
                        streamer.alias,
                        yt.channel_id,
                        e
                    );
                    report.failed += 1;
                }
            }
        }
    }

    report
}
