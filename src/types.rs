use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Document,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Document => "document",
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, MessageKind::Text)
    }

    pub fn parse(value: &str) -> Option<MessageKind> {
        match value {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "video" => Some(MessageKind::Video),
            "document" => Some(MessageKind::Document),
            _ => None,
        }
    }
}

/// A recipient resolved at campaign-creation time. The dispatcher only
/// ever reads the display name and phone number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub contact_id: String,
    pub name: String,
    pub phone: String,
}

/// Media loaded into memory once per campaign and shared across every
/// send of that run.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub bytes: Bytes,
    pub filename: String,
    pub mime_type: String,
}

/// One rendered, per-recipient send. For non-text kinds `text` doubles
/// as the caption.
#[derive(Debug, Clone)]
pub struct SendPayload {
    pub kind: MessageKind,
    pub text: String,
    pub media: Option<MediaPayload>,
}

impl SendPayload {
    pub fn text(body: String) -> Self {
        Self {
            kind: MessageKind::Text,
            text: body,
            media: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Running,
    Completed,
    Aborted,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Running => "running",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::Failed => "failed",
        }
    }
}

/// Point-in-time aggregate snapshot for a campaign. `total` is the
/// attempted count so far; `pending = 1` until the first attempt lands,
/// which tells pollers to keep waiting.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignProgress {
    pub campaign_id: String,
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub pending: i64,
    pub percentage: i64,
    pub recipient_count: i64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaStanding {
    pub sent_today: i64,
    pub limit: i64,
    pub remaining: i64,
}
