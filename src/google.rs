use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::{EventState, IntakeSource, Platform};
use crate::resolver::{self, CampaignResolution};
use crate::storage::{InsertOutcome, NewIntakeEvent};
use crate::webhook_models::GoogleLeadPayload;

/// POST handler for Google Ads Lead Form webhooks.
///
/// Google has no transport-level signature; authentication is the shared
/// `google_key` carried in the payload, validated against the campaign's
/// mapping config. A wrong key is rejected without persisting anything.
/// A missing config is a configuration problem, not an auth failure: the
/// event is logged as unconfigured so the lead is not lost, and the 400
/// tells Google's console something is wrong on our side. The same goes
/// for an ambiguous campaign with more than one enabled config.
pub async fn receive_google_lead(
    State(state): State<AppState>,
    Json(payload): Json<GoogleLeadPayload>,
) -> Result<impl IntoResponse, AppError> {
    let campaign = payload.campaign_id.to_string();
    let configs = state
        .store
        .configs_for_scope(Platform::Google, &campaign)
        .await?;

    if payload.is_test {
        tracing::info!("Test lead {} for campaign {}", payload.lead_id, campaign);
    }

    let config = match resolver::resolve_campaign(&configs) {
        CampaignResolution::Matched(config) => config,
        CampaignResolution::NoConfigForCampaign => {
            let message = format!("No mapping configuration for campaign '{}'", campaign);
            tracing::warn!("Google lead {}: {}", payload.lead_id, message);
            log_google_event(&state, &payload, EventState::Unconfigured, Some(&message)).await?;
            return Ok((StatusCode::BAD_REQUEST, message).into_response());
        }
        CampaignResolution::Conflict(ids) => {
            // No single config to authenticate against; the key must
            // match one of the contenders before anything is persisted.
            let key_known = configs
                .iter()
                .filter(|c| c.enabled)
                .any(|c| c.webhook_key.as_deref() == Some(payload.google_key.as_str()));
            if !key_known {
                return Err(AppError::Authentication(format!(
                    "Webhook key mismatch for campaign '{}'",
                    campaign
                )));
            }
            let message = resolver::campaign_conflict_diagnostic(&campaign, &ids);
            tracing::error!("Google lead {}: {}", payload.lead_id, message);
            log_google_event(&state, &payload, EventState::Unconfigured, Some(&message)).await?;
            return Ok((StatusCode::BAD_REQUEST, message).into_response());
        }
    };

    // The key is checked against the config processing will use, not
    // against any config that happens to share the campaign.
    if config.webhook_key.as_deref() != Some(payload.google_key.as_str()) {
        return Err(AppError::Authentication(format!(
            "Webhook key mismatch for campaign '{}'",
            campaign
        )));
    }

    match log_google_event(&state, &payload, EventState::Pending, None).await? {
        Some(id) => {
            // Google payloads are complete; processing is cheap enough to
            // run before acknowledging.
            state.pipeline.process_event(id, false).await?;
        }
        None => {
            tracing::info!("Duplicate Google lead {}, skipping", payload.lead_id);
        }
    }

    Ok(StatusCode::OK.into_response())
}

async fn log_google_event(
    state: &AppState,
    payload: &GoogleLeadPayload,
    event_state: EventState,
    error_message: Option<&str>,
) -> Result<Option<uuid::Uuid>, AppError> {
    let raw_payload = serde_json::to_value(payload)
        .map_err(|e| AppError::InternalError(format!("Serializing Google payload: {}", e)))?;

    let event = NewIntakeEvent {
        provider_event_id: payload.lead_id.clone(),
        source: IntakeSource::Webhook,
        platform: Platform::Google,
        page_id: None,
        form_id: payload.form_id.map(|id| id.to_string()),
        ad_id: None,
        raw_payload,
        provider_created_time: None,
        state: event_state,
        error_message: error_message.map(String::from),
        config_reference: None,
        lead_doctype: None,
        poll_run_reference: None,
    };

    match state.store.insert_event(&event).await? {
        InsertOutcome::Inserted(id) => Ok(Some(id)),
        InsertOutcome::Duplicate => Ok(None),
    }
}
