use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::{EventState, IntakeSource, Platform};
use crate::storage::{InsertOutcome, NewIntakeEvent};
use crate::webhook_models::{LeadNotification, MetaVerifyQuery, MetaWebhookEnvelope};

type HmacSha256 = Hmac<Sha256>;

/// GET verification handshake: Meta calls this once when the webhook
/// subscription is created and expects the challenge echoed back.
pub async fn verify_webhook(
    State(state): State<AppState>,
    Query(query): Query<MetaVerifyQuery>,
) -> Result<impl IntoResponse, AppError> {
    let mode_ok = query.mode.as_deref() == Some("subscribe");
    let token_ok = query.verify_token.as_deref() == Some(state.config.meta_verify_token.as_str());

    if mode_ok && token_ok {
        let challenge = query.challenge.unwrap_or_default();
        tracing::info!("Webhook verification handshake accepted");
        return Ok((StatusCode::OK, challenge));
    }

    Err(AppError::Authentication(
        "Webhook verification token mismatch".to_string(),
    ))
}

/// POST lead notifications. The signature is checked over the raw body
/// before any parsing; a bad signature is rejected without persisting
/// anything. Valid notifications are logged and acknowledged immediately,
/// with processing handed to background tasks — the provider retries on
/// slow responses, and a retry would just hit the dedup constraint.
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    verify_signature(&state.config.meta_app_secret, &headers, &body)?;

    let envelope: MetaWebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid webhook payload: {}", e)))?;

    let notifications = envelope.lead_notifications();
    if notifications.is_empty() {
        tracing::debug!("Webhook delivery carried no leadgen changes");
        return Ok((StatusCode::OK, "Lead Logged"));
    }

    for notification in notifications {
        log_notification(&state, notification).await?;
    }

    Ok((StatusCode::OK, "Lead Logged"))
}

async fn log_notification(
    state: &AppState,
    notification: LeadNotification,
) -> Result<(), AppError> {
    let platform = notification
        .platform
        .as_deref()
        .map(Platform::from_provider)
        .unwrap_or(Platform::Facebook);

    let event = NewIntakeEvent {
        provider_event_id: notification.leadgen_id.clone(),
        source: IntakeSource::Webhook,
        platform,
        page_id: notification.page_id.clone(),
        form_id: notification.form_id.clone(),
        ad_id: notification.ad_id.clone(),
        raw_payload: notification.raw.clone(),
        provider_created_time: notification
            .created_time
            .and_then(|epoch| chrono::DateTime::from_timestamp(epoch, 0)),
        state: EventState::Pending,
        error_message: None,
        config_reference: None,
        lead_doctype: None,
        poll_run_reference: None,
    };

    match state.store.insert_event(&event).await? {
        InsertOutcome::Inserted(id) => {
            tracing::info!(
                "Logged lead {} from page {:?} form {:?}",
                notification.leadgen_id,
                notification.page_id,
                notification.form_id
            );
            // Resolve the config before acknowledging so the event row
            // carries its config reference, or an unconfigured
            // diagnostic, even if the background task lags. Non-fatal;
            // processing re-resolves.
            if let Err(e) = state.pipeline.annotate_config(id).await {
                tracing::warn!("Intake-time resolution for event {} failed: {}", id, e);
            }

            let pipeline = state.pipeline.clone();
            tokio::spawn(async move {
                if let Err(e) = pipeline.process_event(id, false).await {
                    tracing::error!("Processing of event {} failed: {}", id, e);
                }
            });
        }
        InsertOutcome::Duplicate => {
            tracing::info!(
                "Duplicate notification for lead {}, skipping",
                notification.leadgen_id
            );
        }
    }

    Ok(())
}

/// Verifies the `X-Hub-Signature-256` header: HMAC-SHA256 of the raw
/// request body keyed with the app secret. The underlying verify is
/// constant-time.
pub fn verify_signature(
    app_secret: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    let header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError::Authentication("Missing X-Hub-Signature-256 header".to_string())
        })?;

    let hex_digest = header.strip_prefix("sha256=").ok_or_else(|| {
        AppError::Authentication("Malformed X-Hub-Signature-256 header".to_string())
    })?;

    let expected = hex::decode(hex_digest)
        .map_err(|_| AppError::Authentication("Signature is not valid hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes())
        .map_err(|e| AppError::InternalError(format!("HMAC key setup failed: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| AppError::Authentication("Signature mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let body = br#"{"object":"page","entry":[]}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            sign("app-secret", body).parse().unwrap(),
        );

        assert!(verify_signature("app-secret", &headers, body).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = br#"{"object":"page","entry":[]}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            sign("other-secret", body).parse().unwrap(),
        );

        assert!(matches!(
            verify_signature("app-secret", &headers, body),
            Err(AppError::Authentication(_))
        ));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let body = br#"{"object":"page","entry":[]}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            sign("app-secret", body).parse().unwrap(),
        );

        let tampered = br#"{"object":"page","entry":[{}]}"#;
        assert!(verify_signature("app-secret", &headers, tampered).is_err());
    }

    #[test]
    fn test_missing_header_rejected() {
        let headers = HeaderMap::new();
        assert!(matches!(
            verify_signature("app-secret", &headers, b"{}"),
            Err(AppError::Authentication(_))
        ));
    }
}
