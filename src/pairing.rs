use crate::config::TransportConfig;
use crate::error::EngineError;
use crate::registry::SessionRegistry;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use qrcode::render::svg;
use qrcode::QrCode;
use std::time::Duration;
use tokio::time::sleep;

/// Fetches the tenant's current pairing code as a scannable data URL.
/// When no code is cached yet this starts a pairing connection, waits one
/// bounded interval for the transport to issue a code, and checks once
/// more. `CodeNotReady` tells the caller to poll again shortly.
pub async fn request_pairing_code(
    registry: &SessionRegistry,
    cfg: &TransportConfig,
    tenant_id: &str,
) -> Result<String, EngineError> {
    if registry.is_connected(tenant_id).await {
        return Err(EngineError::AlreadyConnected(tenant_id.to_string()));
    }

    if let Some(code) = registry.cached_code(tenant_id).await {
        return render_code_data_url(&code);
    }

    registry.begin_pairing(tenant_id).await?;
    sleep(Duration::from_secs(cfg.pairing_wait_seconds)).await;

    match registry.cached_code(tenant_id).await {
        Some(code) => render_code_data_url(&code),
        None => Err(EngineError::CodeNotReady),
    }
}

/// Renders a raw pairing code into an inline SVG QR data URL.
pub fn render_code_data_url(code: &str) -> Result<String, EngineError> {
    let qr = QrCode::new(code.as_bytes())
        .map_err(|e| EngineError::Transport(format!("qr encode failed: {}", e)))?;
    let image = qr
        .render::<svg::Color>()
        .min_dimensions(256, 256)
        .build();
    let encoded = utf8_percent_encode(&image, NON_ALPHANUMERIC).to_string();
    Ok(format!("data:image/svg+xml,{}", encoded))
}
