use crate::config::TransportConfig;
use crate::db::{self, DbKind};
use crate::error::EngineError;
use crate::transport::{CloseReason, SessionHandle, Transport, TransportEvent};
use sqlx::AnyPool;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

const CONNECT_SETTLE_POLL_MS: u64 = 100;

/// Result of asking the registry for a tenant's live session.
pub enum Acquired {
    Session(Arc<dyn SessionHandle>),
    PairingRequired,
}

/// Exclusive right to run one dispatch for a tenant. Released on drop.
pub struct DispatchLease {
    tenant_id: String,
    leases: Arc<StdMutex<HashSet<String>>>,
}

impl DispatchLease {
    pub fn tenant(&self) -> &str {
        &self.tenant_id
    }
}

impl Drop for DispatchLease {
    fn drop(&mut self) {
        let mut set = self.leases.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.tenant_id);
    }
}

#[derive(Default)]
struct Entry {
    handle: Option<Arc<dyn SessionHandle>>,
    connected: bool,
    connecting: bool,
    code: Option<IssuedCode>,
    /// Bumped on every new connection; event pumps from replaced
    /// connections compare against it and go quiet.
    epoch: u64,
}

struct IssuedCode {
    value: String,
    issued_at: Instant,
}

struct Inner {
    transport: Arc<dyn Transport>,
    pool: AnyPool,
    db_kind: DbKind,
    credentials_root: PathBuf,
    reconnect_backoff: Duration,
    code_ttl: Duration,
    settle_wait: Duration,
    sessions: RwLock<HashMap<String, Entry>>,
    leases: Arc<StdMutex<HashSet<String>>>,
}

/// Owns every tenant's transport connection: pairing artifacts, the
/// live handle, reconnect policy, and the persisted connection state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        pool: AnyPool,
        db_kind: DbKind,
        credentials_root: PathBuf,
        cfg: &TransportConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                pool,
                db_kind,
                credentials_root,
                reconnect_backoff: Duration::from_secs(cfg.reconnect_backoff_seconds),
                code_ttl: Duration::from_secs(cfg.code_ttl_seconds),
                settle_wait: Duration::from_secs(cfg.pairing_wait_seconds),
                sessions: RwLock::new(HashMap::new()),
                leases: Arc::new(StdMutex::new(HashSet::new())),
            }),
        }
    }

    pub async fn is_connected(&self, tenant_id: &str) -> bool {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(tenant_id)
            .map(|e| e.connected && e.handle.is_some())
            .unwrap_or(false)
    }

    /// Hands out the live session handle, or reports that the tenant
    /// still needs to pair. Never opens a connection itself.
    pub async fn acquire(&self, tenant_id: &str) -> Acquired {
        let sessions = self.inner.sessions.read().await;
        match sessions.get(tenant_id) {
            Some(entry) if entry.connected => match entry.handle.as_ref() {
                Some(handle) => Acquired::Session(handle.clone()),
                None => Acquired::PairingRequired,
            },
            _ => Acquired::PairingRequired,
        }
    }

    /// Starts a pairing connection so the transport issues a code.
    /// No-op when a connection attempt is already underway.
    pub async fn begin_pairing(&self, tenant_id: &str) -> Result<(), EngineError> {
        if self.is_connected(tenant_id).await {
            return Err(EngineError::AlreadyConnected(tenant_id.to_string()));
        }
        self.open_connection(tenant_id).await
    }

    /// Latest unexpired pairing code for the tenant, if one was issued.
    pub async fn cached_code(&self, tenant_id: &str) -> Option<String> {
        let sessions = self.inner.sessions.read().await;
        sessions.get(tenant_id).and_then(|entry| {
            entry.code.as_ref().and_then(|code| {
                if code.issued_at.elapsed() < self.inner.code_ttl {
                    Some(code.value.clone())
                } else {
                    None
                }
            })
        })
    }

    /// Reopens a previously paired connection from stored credentials and
    /// waits a bounded interval for it to come up. Returns whether the
    /// session is connected afterwards. Tenants whose persisted state is
    /// not `connected` are left alone; they need a fresh pairing.
    pub async fn restore(&self, tenant_id: &str) -> Result<bool, EngineError> {
        if self.is_connected(tenant_id).await {
            return Ok(true);
        }

        let persisted = db::get_transport_state(&self.inner.pool, self.inner.db_kind, tenant_id).await?;
        if persisted.as_deref() != Some("connected") {
            return Ok(false);
        }

        self.open_connection(tenant_id).await?;

        let deadline = Instant::now() + self.inner.settle_wait;
        while Instant::now() < deadline {
            if self.is_connected(tenant_id).await {
                return Ok(true);
            }
            sleep(Duration::from_millis(CONNECT_SETTLE_POLL_MS)).await;
        }
        Ok(self.is_connected(tenant_id).await)
    }

    /// Signs the tenant out and forgets the connection. Idempotent: a
    /// tenant without a live handle just has its persisted state cleared.
    pub async fn logout(&self, tenant_id: &str) -> Result<(), EngineError> {
        let handle = {
            let mut sessions = self.inner.sessions.write().await;
            match sessions.get_mut(tenant_id) {
                Some(entry) => {
                    entry.epoch += 1;
                    entry.connected = false;
                    entry.connecting = false;
                    entry.code = None;
                    entry.handle.take()
                }
                None => None,
            }
        };

        if let Some(handle) = handle {
            if let Err(err) = handle.logout().await {
                warn!("transport logout for tenant {tenant_id} failed: {err}");
            }
        }

        db::upsert_transport_state(&self.inner.pool, self.inner.db_kind, tenant_id, "disconnected")
            .await?;
        Ok(())
    }

    /// `connected` when a live handle exists, otherwise whatever state
    /// survived in the store, defaulting to `disconnected`.
    pub async fn connection_status(&self, tenant_id: &str) -> Result<String, EngineError> {
        if self.is_connected(tenant_id).await {
            return Ok("connected".to_string());
        }
        let persisted = db::get_transport_state(&self.inner.pool, self.inner.db_kind, tenant_id).await?;
        Ok(persisted.unwrap_or_else(|| "disconnected".to_string()))
    }

    /// Claims the tenant's single dispatch slot. A second claim while one
    /// is outstanding is rejected rather than queued.
    pub fn acquire_dispatch_lease(&self, tenant_id: &str) -> Result<DispatchLease, EngineError> {
        let mut set = self.inner.leases.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(tenant_id.to_string()) {
            return Err(EngineError::DispatchInProgress(tenant_id.to_string()));
        }
        Ok(DispatchLease {
            tenant_id: tenant_id.to_string(),
            leases: self.inner.leases.clone(),
        })
    }

    async fn open_connection(&self, tenant_id: &str) -> Result<(), EngineError> {
        {
            let mut sessions = self.inner.sessions.write().await;
            let entry = sessions.entry(tenant_id.to_string()).or_default();
            if entry.connected || entry.connecting || entry.handle.is_some() {
                return Ok(());
            }
            entry.connecting = true;
        }

        let creds_dir = self.inner.credentials_root.join(tenant_id);
        if let Err(err) = tokio::fs::create_dir_all(&creds_dir).await {
            self.clear_connecting(tenant_id).await;
            return Err(EngineError::Transport(format!(
                "credentials dir {}: {}",
                creds_dir.display(),
                err
            )));
        }

        match self.inner.transport.connect(tenant_id, &creds_dir).await {
            Ok((handle, rx)) => {
                let epoch = {
                    let mut sessions = self.inner.sessions.write().await;
                    let entry = sessions.entry(tenant_id.to_string()).or_default();
                    entry.connecting = false;
                    entry.connected = false;
                    entry.handle = Some(handle);
                    entry.epoch += 1;
                    entry.epoch
                };
                tokio::spawn(pump_events(
                    self.inner.clone(),
                    tenant_id.to_string(),
                    epoch,
                    rx,
                ));
                Ok(())
            }
            Err(err) => {
                self.clear_connecting(tenant_id).await;
                Err(err)
            }
        }
    }

    async fn clear_connecting(&self, tenant_id: &str) {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(entry) = sessions.get_mut(tenant_id) {
            entry.connecting = false;
        }
    }
}

/// Drives one connection's event stream into registry state. Ends when
/// the connection closes or the stream is dropped. Boxed because the
/// close path recurses into `open_connection`, which spawns this again.
fn pump_events(
    inner: Arc<Inner>,
    tenant_id: String,
    epoch: u64,
    mut rx: mpsc::Receiver<TransportEvent>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::CodeIssued(code) => {
                    store_code(&inner, &tenant_id, epoch, code).await;
                }
                TransportEvent::Opened => {
                    mark_opened(&inner, &tenant_id, epoch).await;
                }
                TransportEvent::Closed { reason } => {
                    handle_close(inner, tenant_id, epoch, reason).await;
                    return;
                }
            }
        }
        handle_close(
            inner,
            tenant_id,
            epoch,
            CloseReason::Other("event stream ended".to_string()),
        )
        .await;
    })
}

async fn store_code(inner: &Inner, tenant_id: &str, epoch: u64, code: String) {
    let mut sessions = inner.sessions.write().await;
    if let Some(entry) = sessions.get_mut(tenant_id) {
        if entry.epoch == epoch {
            entry.code = Some(IssuedCode {
                value: code,
                issued_at: Instant::now(),
            });
        }
    }
}

async fn mark_opened(inner: &Inner, tenant_id: &str, epoch: u64) {
    {
        let mut sessions = inner.sessions.write().await;
        match sessions.get_mut(tenant_id) {
            Some(entry) if entry.epoch == epoch => {
                entry.connected = true;
                entry.code = None;
            }
            _ => return,
        }
    }
    debug!("transport connected for tenant {tenant_id}");
    if let Err(err) = db::upsert_transport_state(&inner.pool, inner.db_kind, tenant_id, "connected").await
    {
        warn!("persist transport state for tenant {tenant_id} failed: {err:?}");
    }
}

async fn handle_close(inner: Arc<Inner>, tenant_id: String, epoch: u64, reason: CloseReason) {
    {
        let mut sessions = inner.sessions.write().await;
        match sessions.get_mut(&tenant_id) {
            Some(entry) if entry.epoch == epoch => {
                entry.connected = false;
                entry.connecting = false;
                entry.handle = None;
                entry.code = None;
            }
            _ => return,
        }
    }
    debug!("transport closed for tenant {tenant_id}: {reason:?}");
    if let Err(err) =
        db::upsert_transport_state(&inner.pool, inner.db_kind, &tenant_id, "disconnected").await
    {
        warn!("persist transport state for tenant {tenant_id} failed: {err:?}");
    }

    // Signed-out tenants stay down until they pair again. Anything else
    // gets one delayed reconnect attempt; a further close starts its own.
    if reason.is_logged_out() {
        return;
    }

    sleep(inner.reconnect_backoff).await;

    let stale = {
        let sessions = inner.sessions.read().await;
        match sessions.get(&tenant_id) {
            Some(entry) => entry.epoch != epoch || entry.handle.is_some() || entry.connecting,
            None => true,
        }
    };
    if stale {
        return;
    }

    debug!("reconnecting transport for tenant {tenant_id}");
    let registry = SessionRegistry { inner };
    if let Err(err) = registry.open_connection(&tenant_id).await {
        warn!("reconnect for tenant {tenant_id} failed: {err}");
    }
}
