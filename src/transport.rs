use crate::error::EngineError;
use crate::types::SendPayload;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Lifecycle notifications for one transport connection, in the order the
/// sidecar observed them.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A fresh pairing code was issued; supersedes any earlier one.
    CodeIssued(String),
    Opened,
    Closed { reason: CloseReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The account was signed out remotely; reconnecting is pointless
    /// until the tenant pairs again.
    LoggedOut,
    Other(String),
}

impl CloseReason {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, CloseReason::LoggedOut)
    }
}

#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn send(&self, address: &str, payload: &SendPayload) -> Result<(), EngineError>;
    async fn logout(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens (or resumes, when credentials exist under `credentials_dir`) a
    /// connection for the tenant. The receiver yields events until the
    /// connection closes.
    async fn connect(
        &self,
        tenant_id: &str,
        credentials_dir: &Path,
    ) -> Result<(Arc<dyn SessionHandle>, mpsc::Receiver<TransportEvent>), EngineError>;
}

/// Normalizes a raw phone number into the transport addressing form:
/// digits only, Indonesian country prefix, `@s.whatsapp.net` suffix.
/// Best effort, never fails.
pub fn normalize_address(raw: &str) -> String {
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if let Some(rest) = digits.strip_prefix('0') {
        digits = format!("62{}", rest);
    } else if !digits.starts_with("62") {
        digits = format!("62{}", digits);
    }
    format!("{}@s.whatsapp.net", digits)
}

/// Declared MIME type for document sends, keyed on file extension.
pub fn mime_for_filename(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("doc") => "application/msword",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xls") => "application/vnd.ms-excel",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("txt") => "text/plain",
        Some("zip") => "application/zip",
        Some("rar") => "application/x-rar-compressed",
        _ => "application/octet-stream",
    }
}

/// Production transport: talks to the pairing sidecar daemon over HTTP.
#[derive(Clone)]
pub struct SidecarTransport {
    client: Client,
    base_url: String,
}

impl SidecarTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Transport for SidecarTransport {
    async fn connect(
        &self,
        tenant_id: &str,
        credentials_dir: &Path,
    ) -> Result<(Arc<dyn SessionHandle>, mpsc::Receiver<TransportEvent>), EngineError> {
        let payload = json!({
            "tenant_id": tenant_id,
            "credentials_dir": credentials_dir.to_string_lossy(),
        });
        let resp = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Transport(format!(
                "sidecar connect failed: {}",
                body
            )));
        }

        let (tx, rx) = mpsc::channel(32);
        let client = self.client.clone();
        let events_url = format!("{}/sessions/{}/events", self.base_url, tenant_id);
        tokio::spawn(async move {
            poll_events(client, events_url, tx).await;
        });

        let handle: Arc<dyn SessionHandle> = Arc::new(SidecarHandle {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            tenant_id: tenant_id.to_string(),
        });
        Ok((handle, rx))
    }
}

/// One pump per connection: forwards sidecar events until the connection
/// closes or the receiver is dropped.
async fn poll_events(client: Client, url: String, tx: mpsc::Sender<TransportEvent>) {
    loop {
        let resp = client.get(&url).query(&[("wait", "25")]).send().await;
        if let Ok(resp) = resp {
            if let Ok(value) = resp.json::<Value>().await {
                if let Some(events) = value.as_array() {
                    for event in events {
                        if let Some(parsed) = parse_event(event) {
                            let closed = matches!(parsed, TransportEvent::Closed { .. });
                            if tx.send(parsed).await.is_err() {
                                return;
                            }
                            if closed {
                                return;
                            }
                        }
                    }
                }
            }
        }
        sleep(Duration::from_secs(1)).await;
    }
}

pub fn parse_event(value: &Value) -> Option<TransportEvent> {
    match value.get("event").and_then(|v| v.as_str())? {
        "code" => value
            .get("code")
            .and_then(|v| v.as_str())
            .map(|c| TransportEvent::CodeIssued(c.to_string())),
        "opened" => Some(TransportEvent::Opened),
        "closed" => {
            let logged_out = value
                .get("logged_out")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let reason = if logged_out {
                CloseReason::LoggedOut
            } else {
                CloseReason::Other(
                    value
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("connection closed")
                        .to_string(),
                )
            };
            Some(TransportEvent::Closed { reason })
        }
        _ => None,
    }
}

struct SidecarHandle {
    client: Client,
    base_url: String,
    tenant_id: String,
}

#[async_trait]
impl SessionHandle for SidecarHandle {
    async fn send(&self, address: &str, payload: &SendPayload) -> Result<(), EngineError> {
        let url = format!("{}/sessions/{}/messages", self.base_url, self.tenant_id);
        let resp = match payload.media.as_ref() {
            None => {
                self.client
                    .post(&url)
                    .json(&json!({"to": address, "text": payload.text}))
                    .send()
                    .await?
            }
            Some(media) => {
                let part = reqwest::multipart::Part::bytes(media.bytes.to_vec())
                    .file_name(media.filename.clone())
                    .mime_str(&media.mime_type)?;
                let form = reqwest::multipart::Form::new()
                    .text("to", address.to_string())
                    .text("kind", payload.kind.as_str().to_string())
                    .text("caption", payload.text.clone())
                    .part("media", part);
                self.client.post(&url).multipart(form).send().await?
            }
        };
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Transport(format!(
                "sidecar send failed: {}",
                body
            )));
        }
        Ok(())
    }

    async fn logout(&self) -> Result<(), EngineError> {
        let resp = self
            .client
            .post(format!("{}/sessions/{}/logout", self.base_url, self.tenant_id))
            .send()
            .await?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Transport(format!(
                "sidecar logout failed: {}",
                body
            )));
        }
        Ok(())
    }
}
