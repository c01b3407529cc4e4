use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{AnyPool, Row};
use std::borrow::Cow;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: String,
    pub name: String,
    pub api_key: String,
    pub quota_limit: i64,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub phone: String,
    pub contact_group: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub template: String,
    pub message_type: String,
    pub media_path: Option<String>,
    pub recipient_ids: Vec<String>,
    pub recipient_count: i64,
    pub total_sent: i64,
    pub total_success: i64,
    pub total_failed: i64,
    pub status: String,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

/// Immutable outcome row for one (campaign, recipient) attempt. `seq` is
/// the zero-based position in the campaign's recipient list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub campaign_id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub seq: i64,
    pub content: String,
    pub message_type: String,
    pub status: String,
    pub error: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantStats {
    pub contacts: i64,
    pub deliveries: i64,
    pub success: i64,
    pub failed: i64,
}

fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(ts, 0).earliest().unwrap_or(Utc::now()))
}

fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            api_key TEXT NOT NULL,
            quota_limit INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            phone TEXT NOT NULL,
            contact_group TEXT,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_contacts_tenant ON contacts(tenant_id, created_at)"#,
        r#"CREATE TABLE IF NOT EXISTS campaigns (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            template TEXT NOT NULL,
            message_type TEXT NOT NULL,
            media_path TEXT,
            recipient_ids TEXT NOT NULL,
            recipient_count INTEGER NOT NULL,
            total_sent INTEGER NOT NULL,
            total_success INTEGER NOT NULL,
            total_failed INTEGER NOT NULL,
            status TEXT NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_campaigns_tenant ON campaigns(tenant_id, created_at)"#,
        r#"CREATE TABLE IF NOT EXISTS deliveries (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            contact_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            content TEXT NOT NULL,
            message_type TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_deliveries_campaign ON deliveries(campaign_id, seq)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_deliveries_quota ON deliveries(tenant_id, status, created_at)"#,
        r#"CREATE TABLE IF NOT EXISTS transport_sessions (
            tenant_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

pub async fn insert_tenant(pool: &AnyPool, kind: DbKind, record: &TenantRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO tenants (id, name, api_key, quota_limit, created_at)
           VALUES (?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.api_key)
        .bind(record.quota_limit)
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_tenant(pool: &AnyPool, kind: DbKind, tenant_id: &str) -> Result<Option<TenantRecord>> {
    let sql = rewrite_sql(
        "SELECT id, name, api_key, quota_limit, created_at FROM tenants WHERE id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;

    if let Some(row) = row {
        let created_at: i64 = row.try_get("created_at")?;
        return Ok(Some(TenantRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            api_key: row.try_get("api_key")?,
            quota_limit: row.try_get("quota_limit")?,
            created_at: i64_to_datetime(created_at),
        }));
    }
    Ok(None)
}

/// Replaces the tenant's API credential; the prior value stops matching
/// immediately.
pub async fn rotate_api_key(pool: &AnyPool, kind: DbKind, tenant_id: &str, api_key: &str) -> Result<bool> {
    let sql = rewrite_sql("UPDATE tenants SET api_key = ? WHERE id = ?", kind);
    let result = sqlx::query(sql.as_ref())
        .bind(api_key)
        .bind(tenant_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn insert_contact(pool: &AnyPool, kind: DbKind, record: &ContactRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO contacts (id, tenant_id, name, phone, contact_group, created_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(&record.name)
        .bind(&record.phone)
        .bind(record.contact_group.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

/// Resolves contact ids to records, preserving the order of `ids`.
/// Unknown ids are dropped silently.
pub async fn contacts_by_ids(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
    ids: &[String],
) -> Result<Vec<ContactRecord>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let base_sql = format!(
        "SELECT id, tenant_id, name, phone, contact_group, created_at
         FROM contacts WHERE tenant_id = ? AND id IN ({})",
        placeholders
    );
    let sql = rewrite_sql(&base_sql, kind);
    let mut query = sqlx::query(sql.as_ref()).bind(tenant_id);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;

    let mut by_id = HashMap::new();
    for row in rows {
        let created_at: i64 = row.try_get("created_at")?;
        let record = ContactRecord {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            name: row.try_get("name")?,
            phone: row.try_get("phone")?,
            contact_group: row.try_get("contact_group")?,
            created_at: i64_to_datetime(created_at),
        };
        by_id.insert(record.id.clone(), record);
    }

    // SQL IN gives no ordering; restore the caller's.
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

pub async fn insert_campaign(pool: &AnyPool, kind: DbKind, record: &CampaignRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO campaigns (
            id, tenant_id, name, template, message_type, media_path, recipient_ids,
            recipient_count, total_sent, total_success, total_failed, status, last_error, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(&record.name)
        .bind(&record.template)
        .bind(&record.message_type)
        .bind(record.media_path.as_deref())
        .bind(serde_json::to_string(&record.recipient_ids).unwrap_or_else(|_| "[]".to_string()))
        .bind(record.recipient_count)
        .bind(record.total_sent)
        .bind(record.total_success)
        .bind(record.total_failed)
        .bind(&record.status)
        .bind(record.last_error.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

fn campaign_from_row(row: &sqlx::any::AnyRow) -> Result<CampaignRecord> {
    let recipient_ids: String = row.try_get("recipient_ids")?;
    let created_at: i64 = row.try_get("created_at")?;
    Ok(CampaignRecord {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        template: row.try_get("template")?,
        message_type: row.try_get("message_type")?,
        media_path: row.try_get("media_path")?,
        recipient_ids: serde_json::from_str(&recipient_ids).unwrap_or_default(),
        recipient_count: row.try_get("recipient_count")?,
        total_sent: row.try_get("total_sent")?,
        total_success: row.try_get("total_success")?,
        total_failed: row.try_get("total_failed")?,
        status: row.try_get("status")?,
        last_error: row.try_get("last_error")?,
        created_at: i64_to_datetime(created_at),
    })
}

pub async fn get_campaign(pool: &AnyPool, kind: DbKind, campaign_id: &str) -> Result<Option<CampaignRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, tenant_id, name, template, message_type, media_path, recipient_ids,
                  recipient_count, total_sent, total_success, total_failed, status, last_error, created_at
           FROM campaigns WHERE id = ?"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(campaign_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Some(campaign_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn list_campaigns(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<CampaignRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, tenant_id, name, template, message_type, media_path, recipient_ids,
                  recipient_count, total_sent, total_success, total_failed, status, last_error, created_at
           FROM campaigns WHERE tenant_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(tenant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

    let mut result = Vec::new();
    for row in rows {
        result.push(campaign_from_row(&row)?);
    }
    Ok(result)
}

/// Applies one resolved attempt to the campaign aggregate. A single
/// UPDATE keeps the counters consistent under concurrent progress reads.
pub async fn record_attempt(pool: &AnyPool, kind: DbKind, campaign_id: &str, success: bool) -> Result<()> {
    let stmt = if success {
        "UPDATE campaigns SET total_sent = total_sent + 1, total_success = total_success + 1 WHERE id = ?"
    } else {
        "UPDATE campaigns SET total_sent = total_sent + 1, total_failed = total_failed + 1 WHERE id = ?"
    };
    let sql = rewrite_sql(stmt, kind);
    sqlx::query(sql.as_ref()).bind(campaign_id).execute(pool).await?;
    Ok(())
}

pub async fn set_campaign_status(
    pool: &AnyPool,
    kind: DbKind,
    campaign_id: &str,
    status: &str,
    last_error: Option<&str>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE campaigns SET status = ?, last_error = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(status)
        .bind(last_error)
        .bind(campaign_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn insert_delivery(pool: &AnyPool, kind: DbKind, record: &DeliveryRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO deliveries (
            id, campaign_id, tenant_id, contact_id, seq, content, message_type, status, error, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.campaign_id)
        .bind(&record.tenant_id)
        .bind(&record.contact_id)
        .bind(record.seq)
        .bind(&record.content)
        .bind(&record.message_type)
        .bind(&record.status)
        .bind(record.error.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_deliveries(pool: &AnyPool, kind: DbKind, campaign_id: &str) -> Result<Vec<DeliveryRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, campaign_id, tenant_id, contact_id, seq, content, message_type, status, error, created_at
           FROM deliveries WHERE campaign_id = ? ORDER BY seq ASC"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(campaign_id)
        .fetch_all(pool)
        .await?;

    let mut result = Vec::new();
    for row in rows {
        let created_at: i64 = row.try_get("created_at")?;
        result.push(DeliveryRecord {
            id: row.try_get("id")?,
            campaign_id: row.try_get("campaign_id")?,
            tenant_id: row.try_get("tenant_id")?,
            contact_id: row.try_get("contact_id")?,
            seq: row.try_get("seq")?,
            content: row.try_get("content")?,
            message_type: row.try_get("message_type")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            created_at: i64_to_datetime(created_at),
        });
    }
    Ok(result)
}

/// Successful sends for the tenant at or after `since`. Feeds the daily
/// quota check.
pub async fn sent_count_since(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
    since: DateTime<Utc>,
) -> Result<i64> {
    let sql = rewrite_sql(
        "SELECT COUNT(1) FROM deliveries WHERE tenant_id = ? AND status = 'success' AND created_at >= ?",
        kind,
    );
    let count = sqlx::query_scalar::<_, i64>(sql.as_ref())
        .bind(tenant_id)
        .bind(datetime_to_i64(since))
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn upsert_transport_state(pool: &AnyPool, kind: DbKind, tenant_id: &str, status: &str) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO transport_sessions (tenant_id, status, updated_at)
           VALUES (?, ?, ?)
           ON CONFLICT(tenant_id) DO UPDATE SET
               status=excluded.status,
               updated_at=excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(tenant_id)
        .bind(status)
        .bind(datetime_to_i64(Utc::now()))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_transport_state(pool: &AnyPool, kind: DbKind, tenant_id: &str) -> Result<Option<String>> {
    let sql = rewrite_sql(
        "SELECT status FROM transport_sessions WHERE tenant_id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(Some(row.try_get("status")?)),
        None => Ok(None),
    }
}

pub async fn tenant_stats(pool: &AnyPool, kind: DbKind, tenant_id: &str) -> Result<TenantStats> {
    let contacts_sql = rewrite_sql("SELECT COUNT(1) FROM contacts WHERE tenant_id = ?", kind);
    let contacts = sqlx::query_scalar::<_, i64>(contacts_sql.as_ref())
        .bind(tenant_id)
        .fetch_one(pool)
        .await?;

    let deliveries_sql = rewrite_sql("SELECT COUNT(1) FROM deliveries WHERE tenant_id = ?", kind);
    let deliveries = sqlx::query_scalar::<_, i64>(deliveries_sql.as_ref())
        .bind(tenant_id)
        .fetch_one(pool)
        .await?;

    let success_sql = rewrite_sql(
        "SELECT COUNT(1) FROM deliveries WHERE tenant_id = ? AND status = 'success'",
        kind,
    );
    let success = sqlx::query_scalar::<_, i64>(success_sql.as_ref())
        .bind(tenant_id)
        .fetch_one(pool)
        .await?;

    let failed_sql = rewrite_sql(
        "SELECT COUNT(1) FROM deliveries WHERE tenant_id = ? AND status = 'failed'",
        kind,
    );
    let failed = sqlx::query_scalar::<_, i64>(failed_sql.as_ref())
        .bind(tenant_id)
        .fetch_one(pool)
        .await?;

    Ok(TenantStats {
        contacts,
        deliveries,
        success,
        failed,
    })
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// API keys follow the `be_` + hex-uuid shape so they are visually
/// distinct from record ids.
pub fn new_api_key() -> String {
    format!("be_{}", Uuid::new_v4().simple())
}
