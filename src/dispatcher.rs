use crate::config::PacingConfig;
use crate::db::{self, CampaignRecord, DbKind, DeliveryRecord};
use crate::error::EngineError;
use crate::quota;
use crate::registry::{Acquired, DispatchLease, SessionRegistry};
use crate::template;
use crate::transport::{mime_for_filename, normalize_address, SessionHandle};
use crate::types::{
    CampaignProgress, CampaignStatus, DeliveryOutcome, MediaPayload, MessageKind, Recipient,
    SendPayload,
};
use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use sqlx::AnyPool;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// A campaign-start request after HTTP decoding, before validation.
#[derive(Debug, Clone)]
pub struct CampaignInput {
    pub tenant_id: String,
    pub name: String,
    pub template: String,
    pub contact_ids: Vec<String>,
    pub kind: MessageKind,
    pub media_path: Option<String>,
    pub min_delay_seconds: u64,
    pub max_delay_seconds: u64,
}

/// Everything a detached run needs; built once the campaign is accepted.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub campaign_id: String,
    pub tenant_id: String,
    pub template: String,
    pub kind: MessageKind,
    pub media_path: Option<String>,
    pub recipients: Vec<Recipient>,
    pub min_delay_seconds: u64,
    pub max_delay_seconds: u64,
}

/// Validates and persists a campaign, then hands it to a detached run.
/// Returns the campaign id as soon as the run is spawned; outcomes are
/// observable only through the progress snapshot.
pub async fn start_campaign(
    pool: AnyPool,
    db_kind: DbKind,
    registry: SessionRegistry,
    pacing: &PacingConfig,
    input: CampaignInput,
) -> Result<String, EngineError> {
    let template_body = input.template.trim().to_string();
    if template_body.is_empty() {
        return Err(EngineError::InvalidRequest(
            "template must not be empty".to_string(),
        ));
    }
    let recipient_ids = dedup_preserving_order(&input.contact_ids);
    if recipient_ids.is_empty() {
        return Err(EngineError::InvalidRequest(
            "at least one contact id is required".to_string(),
        ));
    }
    if !input.kind.is_text() && input.media_path.is_none() {
        return Err(EngineError::InvalidRequest(
            "media_path is required for media campaigns".to_string(),
        ));
    }

    let tenant = db::get_tenant(&pool, db_kind, &input.tenant_id)
        .await?
        .ok_or_else(|| EngineError::TenantNotFound(input.tenant_id.clone()))?;

    // The lease serializes everything from the quota check to the end of
    // the run; a concurrent start for the same tenant is rejected here.
    let lease = registry.acquire_dispatch_lease(&input.tenant_id)?;

    let contacts = db::contacts_by_ids(&pool, db_kind, &input.tenant_id, &recipient_ids).await?;
    let recipients: Vec<Recipient> = contacts
        .into_iter()
        .map(|c| Recipient {
            contact_id: c.id,
            name: c.name,
            phone: c.phone,
        })
        .collect();

    quota::check_and_reserve(
        &pool,
        db_kind,
        &input.tenant_id,
        tenant.quota_limit,
        recipients.len() as i64,
    )
    .await?;

    let (min_delay, max_delay) =
        clamp_delays(input.min_delay_seconds, input.max_delay_seconds, pacing);

    let campaign_id = db::new_id();
    let record = CampaignRecord {
        id: campaign_id.clone(),
        tenant_id: input.tenant_id.clone(),
        name: input.name.clone(),
        template: template_body.clone(),
        message_type: input.kind.as_str().to_string(),
        media_path: input.media_path.clone(),
        recipient_ids: recipients.iter().map(|r| r.contact_id.clone()).collect(),
        recipient_count: recipients.len() as i64,
        total_sent: 0,
        total_success: 0,
        total_failed: 0,
        status: CampaignStatus::Running.as_str().to_string(),
        last_error: None,
        created_at: Utc::now(),
    };
    db::insert_campaign(&pool, db_kind, &record).await?;

    info!(
        "campaign {campaign_id} accepted for tenant {}: {} recipients",
        input.tenant_id,
        recipients.len()
    );

    let plan = RunPlan {
        campaign_id: campaign_id.clone(),
        tenant_id: input.tenant_id,
        template: template_body,
        kind: input.kind,
        media_path: input.media_path,
        recipients,
        min_delay_seconds: min_delay,
        max_delay_seconds: max_delay,
    };
    tokio::spawn(run_campaign(pool, db_kind, registry, lease, plan));

    Ok(campaign_id)
}

/// One detached campaign run. Owns the tenant's dispatch lease for its
/// whole lifetime and always leaves the campaign in a terminal status.
pub async fn run_campaign(
    pool: AnyPool,
    db_kind: DbKind,
    registry: SessionRegistry,
    lease: DispatchLease,
    plan: RunPlan,
) {
    let campaign_id = plan.campaign_id.clone();
    match run_inner(&pool, db_kind, &registry, &plan).await {
        Ok(()) => {
            if let Err(err) = db::set_campaign_status(
                &pool,
                db_kind,
                &campaign_id,
                CampaignStatus::Completed.as_str(),
                None,
            )
            .await
            {
                error!("campaign {campaign_id}: persist completed status failed: {err:?}");
            }
            info!("campaign {campaign_id} completed");
        }
        Err(err) => {
            error!("campaign {campaign_id} aborted: {err}");
            if let Err(persist_err) = db::set_campaign_status(
                &pool,
                db_kind,
                &campaign_id,
                CampaignStatus::Aborted.as_str(),
                Some(&err.to_string()),
            )
            .await
            {
                error!("campaign {campaign_id}: persist aborted status failed: {persist_err:?}");
            }
        }
    }
    drop(lease);
}

async fn run_inner(
    pool: &AnyPool,
    db_kind: DbKind,
    registry: &SessionRegistry,
    plan: &RunPlan,
) -> Result<(), EngineError> {
    let handle = acquire_session(registry, &plan.tenant_id).await?;

    // One disk read per campaign; every send shares the same buffer.
    let media = if plan.kind.is_text() {
        None
    } else {
        Some(load_media(plan.media_path.as_deref()).await?)
    };

    info!(
        "starting dispatch for campaign {}: {} recipients",
        plan.campaign_id,
        plan.recipients.len()
    );

    let total = plan.recipients.len();
    for (idx, recipient) in plan.recipients.iter().enumerate() {
        let content = template::render(&plan.template, &recipient.name);
        let address = normalize_address(&recipient.phone);
        let payload = SendPayload {
            kind: plan.kind,
            text: content.clone(),
            media: media.clone(),
        };

        let (outcome, send_error) = match handle.send(&address, &payload).await {
            Ok(()) => {
                debug!("campaign {}: sent to {}", plan.campaign_id, address);
                (DeliveryOutcome::Success, None)
            }
            Err(err) => {
                warn!(
                    "campaign {}: send to {} failed: {}",
                    plan.campaign_id, address, err
                );
                (DeliveryOutcome::Failed, Some(err.to_string()))
            }
        };

        let delivery = DeliveryRecord {
            id: db::new_id(),
            campaign_id: plan.campaign_id.clone(),
            tenant_id: plan.tenant_id.clone(),
            contact_id: recipient.contact_id.clone(),
            seq: idx as i64,
            content,
            message_type: plan.kind.as_str().to_string(),
            status: outcome.as_str().to_string(),
            error: send_error,
            created_at: Utc::now(),
        };
        db::insert_delivery(pool, db_kind, &delivery).await?;
        db::record_attempt(
            pool,
            db_kind,
            &plan.campaign_id,
            matches!(outcome, DeliveryOutcome::Success),
        )
        .await?;

        if idx + 1 < total {
            sleep(pick_delay(plan.min_delay_seconds, plan.max_delay_seconds)).await;
        }
    }
    Ok(())
}

/// Live handle for the tenant, trying one credential restore before
/// giving up. Failure here is fatal to the whole run.
async fn acquire_session(
    registry: &SessionRegistry,
    tenant_id: &str,
) -> Result<Arc<dyn SessionHandle>, EngineError> {
    if let Acquired::Session(handle) = registry.acquire(tenant_id).await {
        return Ok(handle);
    }
    info!("no live session for tenant {tenant_id}, attempting restore");
    registry.restore(tenant_id).await?;
    match registry.acquire(tenant_id).await {
        Acquired::Session(handle) => Ok(handle),
        Acquired::PairingRequired => Err(EngineError::SessionUnavailable(tenant_id.to_string())),
    }
}

async fn load_media(media_path: Option<&str>) -> Result<MediaPayload, EngineError> {
    let path = media_path.ok_or_else(|| {
        EngineError::InvalidRequest("media_path is required for media campaigns".to_string())
    })?;
    let bytes = tokio::fs::read(path).await?;
    let filename = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string());
    let mime_type = mime_for_filename(&filename).to_string();
    info!("media file loaded: {} ({} bytes)", path, bytes.len());
    Ok(MediaPayload {
        bytes: Bytes::from(bytes),
        filename,
        mime_type,
    })
}

/// First occurrence wins; blank ids are dropped.
pub fn dedup_preserving_order(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for id in ids {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Clamps both bounds into the configured safety range and orders them.
pub fn clamp_delays(min_seconds: u64, max_seconds: u64, pacing: &PacingConfig) -> (u64, u64) {
    let floor = pacing
        .min_delay_floor_seconds
        .min(pacing.max_delay_ceiling_seconds);
    let ceiling = pacing
        .min_delay_floor_seconds
        .max(pacing.max_delay_ceiling_seconds);
    let lo = min_seconds.clamp(floor, ceiling);
    let hi = max_seconds.clamp(floor, ceiling);
    if lo <= hi {
        (lo, hi)
    } else {
        (hi, lo)
    }
}

/// Uniform pacing delay in `[min, max]` seconds, millisecond resolution.
pub fn pick_delay(min_seconds: u64, max_seconds: u64) -> Duration {
    let (lo, hi) = if min_seconds <= max_seconds {
        (min_seconds, max_seconds)
    } else {
        (max_seconds, min_seconds)
    };
    let millis = rand::thread_rng().gen_range(lo * 1000..=hi * 1000);
    Duration::from_millis(millis)
}

pub async fn campaign_progress(
    pool: &AnyPool,
    db_kind: DbKind,
    campaign_id: &str,
) -> Result<CampaignProgress, EngineError> {
    let campaign = db::get_campaign(pool, db_kind, campaign_id)
        .await?
        .ok_or_else(|| EngineError::CampaignNotFound(campaign_id.to_string()))?;
    Ok(progress_snapshot(&campaign))
}

/// Aggregate view of a campaign. `total` is the attempts made so far;
/// `pending=1` is the "nothing attempted yet" sentinel pollers key on.
pub fn progress_snapshot(campaign: &CampaignRecord) -> CampaignProgress {
    let total = campaign.total_sent;
    let resolved = campaign.total_success + campaign.total_failed;
    let percentage = if total > 0 {
        ((resolved as f64 / total as f64) * 100.0).round() as i64
    } else {
        0
    };
    CampaignProgress {
        campaign_id: campaign.id.clone(),
        total,
        success: campaign.total_success,
        failed: campaign.total_failed,
        pending: if total > 0 { 0 } else { 1 },
        percentage,
        recipient_count: campaign.recipient_count,
        status: campaign.status.clone(),
    }
}
