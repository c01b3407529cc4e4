use crate::db::{self, DbKind};
use crate::error::EngineError;
use crate::types::QuotaStanding;
use chrono::{DateTime, Utc};
use sqlx::AnyPool;

/// Start of the quota day. The window is anchored at UTC midnight: the
/// store keeps UTC timestamps, so every node computes the same boundary
/// without per-tenant timezone data. Tenant-local windows would need a
/// timezone column and are deliberately not supported.
pub fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    match now.date_naive().and_hms_opt(0, 0, 0) {
        Some(midnight) => midnight.and_utc(),
        None => now,
    }
}

/// Rejects a campaign that would push the tenant past its daily limit.
/// Counts successful deliveries since the day started; failed attempts
/// do not consume quota. Callers hold the tenant's dispatch lease, which
/// serializes this check against the campaign that will consume the
/// budget, so check and reserve are the same step.
pub async fn check_and_reserve(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
    quota_limit: i64,
    requested: i64,
) -> Result<QuotaStanding, EngineError> {
    let since = start_of_utc_day(Utc::now());
    let sent_today = db::sent_count_since(pool, kind, tenant_id, since).await?;
    let remaining = (quota_limit - sent_today).max(0);
    if requested > remaining {
        return Err(EngineError::QuotaExceeded {
            sent_today,
            limit: quota_limit,
        });
    }
    Ok(QuotaStanding {
        sent_today,
        limit: quota_limit,
        remaining,
    })
}
