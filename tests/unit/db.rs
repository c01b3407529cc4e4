use blast_engine::db::{
    self, CampaignRecord, ContactRecord, DbKind, DeliveryRecord, TenantRecord,
};
use chrono::{Duration, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

// A single pooled connection keeps one stable in-memory database per test.
async fn create_test_pool() -> (AnyPool, DbKind) {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let kind = DbKind::Sqlite;
    db::init_db(&pool, kind).await.unwrap();
    (pool, kind)
}

fn make_tenant(id: &str) -> TenantRecord {
    TenantRecord {
        id: id.to_string(),
        name: format!("tenant {id}"),
        api_key: db::new_api_key(),
        quota_limit: 300,
        created_at: Utc::now(),
    }
}

fn make_contact(id: &str, tenant_id: &str, name: &str) -> ContactRecord {
    ContactRecord {
        id: id.to_string(),
        tenant_id: tenant_id.to_string(),
        name: name.to_string(),
        phone: "081234567890".to_string(),
        contact_group: None,
        created_at: Utc::now(),
    }
}

fn make_campaign(id: &str, tenant_id: &str) -> CampaignRecord {
    CampaignRecord {
        id: id.to_string(),
        tenant_id: tenant_id.to_string(),
        name: format!("campaign {id}"),
        template: "Hi {{nama}}".to_string(),
        message_type: "text".to_string(),
        media_path: None,
        recipient_ids: vec!["c1".to_string(), "c2".to_string()],
        recipient_count: 2,
        total_sent: 0,
        total_success: 0,
        total_failed: 0,
        status: "running".to_string(),
        last_error: None,
        created_at: Utc::now(),
    }
}

fn make_delivery(id: &str, campaign_id: &str, tenant_id: &str, seq: i64) -> DeliveryRecord {
    DeliveryRecord {
        id: id.to_string(),
        campaign_id: campaign_id.to_string(),
        tenant_id: tenant_id.to_string(),
        contact_id: format!("c{seq}"),
        seq,
        content: format!("message {seq}"),
        message_type: "text".to_string(),
        status: "success".to_string(),
        error: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_init_db_creates_tables() {
    let (pool, kind) = create_test_pool().await;

    for table in ["tenants", "contacts", "campaigns", "deliveries", "transport_sessions"] {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(1) FROM {table}"))
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0, "{table} should start empty");
    }

    // Re-running the DDL must be a no-op.
    db::init_db(&pool, kind).await.unwrap();
}

#[tokio::test]
async fn test_tenant_insert_and_get() {
    let (pool, kind) = create_test_pool().await;

    let record = make_tenant("t1");
    db::insert_tenant(&pool, kind, &record).await.unwrap();

    let fetched = db::get_tenant(&pool, kind, "t1").await.unwrap().unwrap();
    assert_eq!(fetched.id, "t1");
    assert_eq!(fetched.name, record.name);
    assert_eq!(fetched.api_key, record.api_key);
    assert_eq!(fetched.quota_limit, 300);

    let missing = db::get_tenant(&pool, kind, "nope").await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_rotate_api_key() {
    let (pool, kind) = create_test_pool().await;

    let record = make_tenant("t1");
    db::insert_tenant(&pool, kind, &record).await.unwrap();

    let rotated = db::rotate_api_key(&pool, kind, "t1", "be_rotated").await.unwrap();
    assert!(rotated);

    let fetched = db::get_tenant(&pool, kind, "t1").await.unwrap().unwrap();
    assert_eq!(fetched.api_key, "be_rotated");
    assert_ne!(fetched.api_key, record.api_key);

    let missing = db::rotate_api_key(&pool, kind, "ghost", "be_x").await.unwrap();
    assert!(!missing);
}

#[tokio::test]
async fn test_contacts_by_ids_preserves_request_order() {
    let (pool, kind) = create_test_pool().await;

    for (id, name) in [("c1", "Ana"), ("c2", "Budi"), ("c3", "Citra")] {
        db::insert_contact(&pool, kind, &make_contact(id, "t1", name)).await.unwrap();
    }

    let ids = vec!["c3".to_string(), "c1".to_string(), "c2".to_string()];
    let contacts = db::contacts_by_ids(&pool, kind, "t1", &ids).await.unwrap();
    let names: Vec<&str> = contacts.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Citra", "Ana", "Budi"]);
}

#[tokio::test]
async fn test_contacts_by_ids_drops_unknown() {
    let (pool, kind) = create_test_pool().await;

    db::insert_contact(&pool, kind, &make_contact("c1", "t1", "Ana")).await.unwrap();

    let ids = vec!["ghost".to_string(), "c1".to_string()];
    let contacts = db::contacts_by_ids(&pool, kind, "t1", &ids).await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].id, "c1");
}

#[tokio::test]
async fn test_contacts_by_ids_empty_input() {
    let (pool, kind) = create_test_pool().await;
    let contacts = db::contacts_by_ids(&pool, kind, "t1", &[]).await.unwrap();
    assert!(contacts.is_empty());
}

#[tokio::test]
async fn test_contacts_by_ids_scoped_to_tenant() {
    let (pool, kind) = create_test_pool().await;

    db::insert_contact(&pool, kind, &make_contact("c1", "t1", "Ana")).await.unwrap();
    db::insert_contact(&pool, kind, &make_contact("c2", "t2", "Budi")).await.unwrap();

    let ids = vec!["c1".to_string(), "c2".to_string()];
    let contacts = db::contacts_by_ids(&pool, kind, "t1", &ids).await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].id, "c1");
}

#[tokio::test]
async fn test_campaign_insert_and_get() {
    let (pool, kind) = create_test_pool().await;

    let mut record = make_campaign("cmp1", "t1");
    record.message_type = "image".to_string();
    record.media_path = Some("/tmp/banner.jpg".to_string());
    db::insert_campaign(&pool, kind, &record).await.unwrap();

    let fetched = db::get_campaign(&pool, kind, "cmp1").await.unwrap().unwrap();
    assert_eq!(fetched.tenant_id, "t1");
    assert_eq!(fetched.template, "Hi {{nama}}");
    assert_eq!(fetched.message_type, "image");
    assert_eq!(fetched.media_path.as_deref(), Some("/tmp/banner.jpg"));
    assert_eq!(fetched.recipient_ids, vec!["c1".to_string(), "c2".to_string()]);
    assert_eq!(fetched.recipient_count, 2);
    assert_eq!(fetched.status, "running");
    assert!(fetched.last_error.is_none());

    let missing = db::get_campaign(&pool, kind, "ghost").await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_list_campaigns_newest_first_with_pagination() {
    let (pool, kind) = create_test_pool().await;

    let now = Utc::now();
    for (id, age_seconds) in [("old", 20), ("mid", 10), ("new", 0)] {
        let mut record = make_campaign(id, "t1");
        record.created_at = now - Duration::seconds(age_seconds);
        db::insert_campaign(&pool, kind, &record).await.unwrap();
    }
    let mut other = make_campaign("other", "t2");
    other.created_at = now;
    db::insert_campaign(&pool, kind, &other).await.unwrap();

    let page = db::list_campaigns(&pool, kind, "t1", 2, 0).await.unwrap();
    let ids: Vec<&str> = page.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["new", "mid"]);

    let rest = db::list_campaigns(&pool, kind, "t1", 2, 2).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, "old");
}

#[tokio::test]
async fn test_record_attempt_updates_counters() {
    let (pool, kind) = create_test_pool().await;

    db::insert_campaign(&pool, kind, &make_campaign("cmp1", "t1")).await.unwrap();

    db::record_attempt(&pool, kind, "cmp1", true).await.unwrap();
    db::record_attempt(&pool, kind, "cmp1", true).await.unwrap();
    db::record_attempt(&pool, kind, "cmp1", false).await.unwrap();

    let fetched = db::get_campaign(&pool, kind, "cmp1").await.unwrap().unwrap();
    assert_eq!(fetched.total_sent, 3);
    assert_eq!(fetched.total_success, 2);
    assert_eq!(fetched.total_failed, 1);
}

#[tokio::test]
async fn test_set_campaign_status() {
    let (pool, kind) = create_test_pool().await;

    db::insert_campaign(&pool, kind, &make_campaign("cmp1", "t1")).await.unwrap();

    db::set_campaign_status(&pool, kind, "cmp1", "completed", None).await.unwrap();
    let fetched = db::get_campaign(&pool, kind, "cmp1").await.unwrap().unwrap();
    assert_eq!(fetched.status, "completed");
    assert!(fetched.last_error.is_none());

    db::set_campaign_status(&pool, kind, "cmp1", "aborted", Some("no active transport session"))
        .await
        .unwrap();
    let fetched = db::get_campaign(&pool, kind, "cmp1").await.unwrap().unwrap();
    assert_eq!(fetched.status, "aborted");
    assert_eq!(fetched.last_error.as_deref(), Some("no active transport session"));
}

#[tokio::test]
async fn test_deliveries_listed_in_seq_order() {
    let (pool, kind) = create_test_pool().await;

    // Insert out of order; the listing must come back by seq.
    for seq in [2, 0, 1] {
        let record = make_delivery(&format!("d{seq}"), "cmp1", "t1", seq);
        db::insert_delivery(&pool, kind, &record).await.unwrap();
    }

    let deliveries = db::list_deliveries(&pool, kind, "cmp1").await.unwrap();
    let seqs: Vec<i64> = deliveries.iter().map(|d| d.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    assert_eq!(deliveries[1].content, "message 1");

    let none = db::list_deliveries(&pool, kind, "ghost").await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_sent_count_since_counts_recent_successes_only() {
    let (pool, kind) = create_test_pool().await;

    let now = Utc::now();
    let since = now - Duration::seconds(60);

    let mut old_success = make_delivery("d1", "cmp1", "t1", 0);
    old_success.created_at = now - Duration::seconds(120);
    db::insert_delivery(&pool, kind, &old_success).await.unwrap();

    let recent_success = make_delivery("d2", "cmp1", "t1", 1);
    db::insert_delivery(&pool, kind, &recent_success).await.unwrap();

    let mut recent_failed = make_delivery("d3", "cmp1", "t1", 2);
    recent_failed.status = "failed".to_string();
    recent_failed.error = Some("sidecar send failed".to_string());
    db::insert_delivery(&pool, kind, &recent_failed).await.unwrap();

    let other_tenant = make_delivery("d4", "cmp2", "t2", 0);
    db::insert_delivery(&pool, kind, &other_tenant).await.unwrap();

    let count = db::sent_count_since(&pool, kind, "t1", since).await.unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_transport_state_upsert() {
    let (pool, kind) = create_test_pool().await;

    let state = db::get_transport_state(&pool, kind, "t1").await.unwrap();
    assert!(state.is_none());

    db::upsert_transport_state(&pool, kind, "t1", "connected").await.unwrap();
    let state = db::get_transport_state(&pool, kind, "t1").await.unwrap();
    assert_eq!(state.as_deref(), Some("connected"));

    db::upsert_transport_state(&pool, kind, "t1", "disconnected").await.unwrap();
    let state = db::get_transport_state(&pool, kind, "t1").await.unwrap();
    assert_eq!(state.as_deref(), Some("disconnected"));

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM transport_sessions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn test_tenant_stats() {
    let (pool, kind) = create_test_pool().await;

    db::insert_contact(&pool, kind, &make_contact("c1", "t1", "Ana")).await.unwrap();
    db::insert_contact(&pool, kind, &make_contact("c2", "t1", "Budi")).await.unwrap();
    db::insert_contact(&pool, kind, &make_contact("c3", "t2", "Citra")).await.unwrap();

    db::insert_delivery(&pool, kind, &make_delivery("d1", "cmp1", "t1", 0)).await.unwrap();
    db::insert_delivery(&pool, kind, &make_delivery("d2", "cmp1", "t1", 1)).await.unwrap();
    let mut failed = make_delivery("d3", "cmp1", "t1", 2);
    failed.status = "failed".to_string();
    db::insert_delivery(&pool, kind, &failed).await.unwrap();

    let stats = db::tenant_stats(&pool, kind, "t1").await.unwrap();
    assert_eq!(stats.contacts, 2);
    assert_eq!(stats.deliveries, 3);
    assert_eq!(stats.success, 2);
    assert_eq!(stats.failed, 1);
}

#[test]
fn test_new_api_key_format() {
    let a = db::new_api_key();
    let b = db::new_api_key();
    assert!(a.starts_with("be_"));
    assert!(b.starts_with("be_"));
    assert_ne!(a, b);
    assert!(!a.contains('-'));
}

#[test]
fn test_new_id_unique() {
    assert_ne!(db::new_id(), db::new_id());
}
