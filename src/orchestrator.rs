use moka::future::Cache;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::graph_client::{GraphClient, TokenManager};
use crate::mapper::{self, FieldSource};
use crate::models::{EventState, IntakeEvent, MappingConfig, Platform};
use crate::resolver::{self, Resolution};
use crate::storage::IntakeStore;
use crate::webhook_models::{GoogleLeadPayload, GraphLeadDetail};

/// Drives a logged intake event through resolution, enrichment, mapping
/// and lead creation.
///
/// Every stage failure lands in a terminal event state rather than
/// propagating out: the webhook handler has already acknowledged the
/// provider by the time processing runs.
pub struct Pipeline {
    pub store: Arc<IntakeStore>,
    pub graph: GraphClient,
    pub tokens: Arc<TokenManager>,
    /// Region applied to bare national phone numbers when a mapping rule
    /// does not override it.
    pub default_phone_region: String,
    /// In-flight job keys for bulk retry; an id present here already has
    /// a worker on it.
    inflight: Cache<Uuid, ()>,
}

/// How one event left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed(Uuid),
    AlreadyProcessed,
    Unconfigured,
    Disabled,
    Failed(String),
}

impl Pipeline {
    pub fn new(
        store: Arc<IntakeStore>,
        graph: GraphClient,
        tokens: Arc<TokenManager>,
        default_phone_region: String,
    ) -> Self {
        Self {
            store,
            graph,
            tokens,
            default_phone_region,
            inflight: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(600))
                .build(),
        }
    }

    /// Processes one event end to end, recording the outcome on the
    /// event row. Infrastructure failures (the database itself) are the
    /// only errors that escape.
    pub async fn process_event(
        &self,
        id: Uuid,
        force_refresh: bool,
    ) -> Result<ProcessOutcome, AppError> {
        let event = self.store.fetch_event(id).await?;

        // Re-submitting a processed event is a no-op, never a duplicate
        // lead.
        if event.state == EventState::Processed {
            tracing::info!("Event {} already processed, skipping", id);
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        match self.run_stages(&event, force_refresh).await {
            Ok(outcome) => Ok(outcome),
            Err(AppError::DatabaseError(e)) => Err(AppError::DatabaseError(e)),
            Err(e) => {
                let message = e.to_string();
                tracing::error!("Event {} failed: {}", id, message);
                self.store
                    .set_state(id, EventState::Error, Some(&message))
                    .await?;
                Ok(ProcessOutcome::Failed(message))
            }
        }
    }

    async fn run_stages(
        &self,
        event: &IntakeEvent,
        force_refresh: bool,
    ) -> Result<ProcessOutcome, AppError> {
        let config = match self.resolve_config(event).await? {
            Ok(config) => config,
            Err(outcome) => return Ok(outcome),
        };

        self.store
            .set_config_reference(event.id, Some(config.id), Some(&config.destination_doctype))
            .await?;

        if !config.enabled {
            let message = format!("Mapping config {} is disabled", config.id);
            tracing::warn!("Event {}: {}", event.id, message);
            self.store
                .set_state(event.id, EventState::Disabled, Some(&message))
                .await?;
            return Ok(ProcessOutcome::Disabled);
        }

        let raw_fields = self.raw_fields(event, force_refresh).await?;

        let form = match &event.form_id {
            Some(form_id) => self.store.fetch_form(form_id).await?,
            None => None,
        };

        let mut sources: Vec<&dyn FieldSource> = vec![event, &config];
        if let Some(form) = &form {
            sources.push(form);
        }
        let fields = mapper::apply(&raw_fields, &config, &sources, &self.default_phone_region);

        if fields.is_empty() {
            return Err(AppError::Persistence(
                "Mapping produced no destination fields".to_string(),
            ));
        }

        let inserted = self
            .store
            .insert_lead(
                &config.destination_doctype,
                &Value::Object(fields),
                event.id,
            )
            .await
            .context(format!("Creating lead for event {}", event.id))?;

        // A concurrent worker got there first. Make sure the event row
        // points at the existing lead, then stand down.
        let Some(lead_id) = inserted else {
            if let Some(existing) = self.store.lead_for_event(event.id).await? {
                self.store.mark_processed(event.id, existing).await?;
            }
            tracing::info!("Event {} already has a lead record", event.id);
            return Ok(ProcessOutcome::AlreadyProcessed);
        };

        self.store.mark_processed(event.id, lead_id).await?;
        tracing::info!(
            "Event {} processed into {} {}",
            event.id,
            config.destination_doctype,
            lead_id
        );
        Ok(ProcessOutcome::Processed(lead_id))
    }

    /// Resolves the mapping config for an event's scope. A non-match is
    /// an outcome, not an error: the state and diagnostic land on the
    /// event row for the operator.
    async fn resolve_config(
        &self,
        event: &IntakeEvent,
    ) -> Result<Result<MappingConfig, ProcessOutcome>, AppError> {
        let Some(scope_key) = scope_key(event) else {
            let message = "Event carries no page or campaign identifier".to_string();
            self.store
                .set_state(event.id, EventState::Unconfigured, Some(&message))
                .await?;
            return Ok(Err(ProcessOutcome::Unconfigured));
        };

        // Google configs are scoped by campaign alone; Meta configs also
        // require the form to be attached.
        if event.platform == Platform::Google {
            let configs = self
                .store
                .configs_for_scope(Platform::Google, &scope_key)
                .await?;
            return Ok(match resolver::resolve_campaign(&configs) {
                resolver::CampaignResolution::Matched(config) => Ok(config.clone()),
                resolver::CampaignResolution::NoConfigForCampaign => {
                    let message =
                        format!("No mapping configuration for campaign '{}'", scope_key);
                    self.store
                        .set_state(event.id, EventState::Unconfigured, Some(&message))
                        .await?;
                    Err(ProcessOutcome::Unconfigured)
                }
                resolver::CampaignResolution::Conflict(ids) => {
                    let message = resolver::campaign_conflict_diagnostic(&scope_key, &ids);
                    tracing::error!("Event {}: {}", event.id, message);
                    self.store
                        .set_state(event.id, EventState::Unconfigured, Some(&message))
                        .await?;
                    Err(ProcessOutcome::Unconfigured)
                }
            });
        }

        let form_id = event.form_id.clone().unwrap_or_default();
        let candidates = self
            .store
            .config_candidates(event.platform, &scope_key)
            .await?;
        let form_registered = self.store.form_registered(&form_id).await?;

        match resolver::resolve(&candidates, &form_id, form_registered) {
            Resolution::Matched(config) => Ok(Ok(config)),
            resolution @ (Resolution::NoConfigForScope
            | Resolution::FormNotAttached
            | Resolution::FormUnknown) => {
                let message = resolution.diagnostic(&scope_key, &form_id);
                tracing::warn!("Event {}: {}", event.id, message);
                self.store
                    .set_state(event.id, EventState::Unconfigured, Some(&message))
                    .await?;
                Ok(Err(ProcessOutcome::Unconfigured))
            }
            resolution @ Resolution::Conflict(_) => {
                let message = resolution.diagnostic(&scope_key, &form_id);
                tracing::error!("Event {}: {}", event.id, message);
                self.store
                    .set_state(event.id, EventState::Unconfigured, Some(&message))
                    .await?;
                Ok(Err(ProcessOutcome::Unconfigured))
            }
        }
    }

    /// Produces the flat source field map for mapping.
    ///
    /// Meta events need enrichment via the Graph API; the result is
    /// cached on the event so a later retry maps from the stored copy
    /// unless `force_refresh` asks for a fresh fetch. Google payloads
    /// arrive complete and are mapped as-is.
    async fn raw_fields(
        &self,
        event: &IntakeEvent,
        force_refresh: bool,
    ) -> Result<Map<String, Value>, AppError> {
        if event.platform == Platform::Google {
            let payload: GoogleLeadPayload = serde_json::from_value(event.raw_payload.clone())
                .map_err(|e| {
                    AppError::Persistence(format!("Stored payload no longer parses: {}", e))
                })?;
            return Ok(payload.field_map());
        }

        if !force_refresh {
            if let Some(enriched) = &event.enriched_payload {
                let detail: GraphLeadDetail = serde_json::from_value(enriched.clone())
                    .map_err(|e| {
                        AppError::Persistence(format!("Cached enrichment no longer parses: {}", e))
                    })?;
                tracing::debug!("Event {} mapped from cached enrichment", event.id);
                return Ok(detail.field_map());
            }
        }

        let token = self.tokens.current().await;
        let detail = self
            .graph
            .fetch_lead(&event.provider_event_id, &token)
            .await?;
        let payload = serde_json::to_value(&detail)
            .map_err(|e| AppError::InternalError(format!("Serializing enrichment: {}", e)))?;
        self.store
            .store_enriched_payload(event.id, &payload)
            .await?;
        Ok(detail.field_map())
    }

    /// Best-effort config resolution at intake time: records the matched
    /// config reference, or an unconfigured diagnostic, on a freshly
    /// logged event before the provider is acknowledged. Processing
    /// re-resolves and remains the authority.
    pub async fn annotate_config(&self, id: Uuid) -> Result<(), AppError> {
        let event = self.store.fetch_event(id).await?;
        if let Ok(config) = self.resolve_config(&event).await? {
            self.store
                .set_config_reference(event.id, Some(config.id), Some(&config.destination_doctype))
                .await?;
        }
        Ok(())
    }

    /// Manual retry of a terminal event. Re-resolves the config first so
    /// a fix made since the failure (config enabled, form attached) is
    /// picked up, then runs the normal pipeline.
    pub async fn retry_event(
        &self,
        id: Uuid,
        force_refresh: bool,
    ) -> Result<ProcessOutcome, AppError> {
        let event = self.store.fetch_event(id).await?;

        if event.state == EventState::Processed {
            return Ok(ProcessOutcome::AlreadyProcessed);
        }
        if !event.state.is_retryable() && event.state != EventState::Pending {
            return Err(AppError::BadRequest(format!(
                "Event {} is in state '{}' and cannot be retried",
                id,
                event.state.as_str()
            )));
        }

        self.store
            .set_state(id, EventState::Pending, None)
            .await?;
        self.process_event(id, force_refresh).await
    }

    /// Retries every event in a retryable terminal state.
    pub async fn retry_all(self: &Arc<Self>) -> Result<usize, AppError> {
        let ids = self.store.retryable_event_ids().await?;
        self.retry_many(ids).await
    }

    /// Schedules one background task per event id. The in-flight cache
    /// collapses overlapping bulk requests so an event is never worked
    /// twice concurrently.
    pub async fn retry_many(self: &Arc<Self>, ids: Vec<Uuid>) -> Result<usize, AppError> {
        let mut scheduled = 0;

        for id in ids {
            let entry = self.inflight.entry(id).or_insert(()).await;
            if !entry.is_fresh() {
                tracing::debug!("Event {} already has a retry in flight", id);
                continue;
            }
            scheduled += 1;

            let pipeline = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = pipeline.retry_event(id, false).await {
                    tracing::error!("Background retry of event {} failed: {}", id, e);
                }
                pipeline.inflight.invalidate(&id).await;
            });
        }

        tracing::info!("Scheduled {} event retries", scheduled);
        Ok(scheduled)
    }
}

/// The config lookup key for an event: page for Meta platforms, campaign
/// for Google.
fn scope_key(event: &IntakeEvent) -> Option<String> {
    match event.platform {
        Platform::Google => event
            .raw_payload
            .get("campaign_id")
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty()),
        _ => event.page_id.clone().filter(|s| !s.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IntakeSource;
    use chrono::Utc;
    use serde_json::json;

    fn event(platform: Platform, raw: Value) -> IntakeEvent {
        IntakeEvent {
            id: Uuid::new_v4(),
            provider_event_id: "evt_1".to_string(),
            source: IntakeSource::Webhook,
            platform,
            page_id: Some("page_1".to_string()),
            form_id: Some("form_1".to_string()),
            ad_id: None,
            raw_payload: raw,
            enriched_payload: None,
            received_time: Utc::now(),
            provider_created_time: None,
            state: EventState::Pending,
            error_message: None,
            config_reference: None,
            lead_doctype: None,
            lead_reference: None,
            poll_run_reference: None,
        }
    }

    #[test]
    fn test_scope_key_meta_uses_page() {
        let e = event(Platform::Facebook, json!({}));
        assert_eq!(scope_key(&e).as_deref(), Some("page_1"));
    }

    #[test]
    fn test_scope_key_google_uses_campaign() {
        let e = event(Platform::Google, json!({"campaign_id": 100200300}));
        assert_eq!(scope_key(&e).as_deref(), Some("100200300"));
    }

    #[test]
    fn test_scope_key_google_string_campaign() {
        let e = event(Platform::Google, json!({"campaign_id": "100200300"}));
        assert_eq!(scope_key(&e).as_deref(), Some("100200300"));
    }

    #[test]
    fn test_scope_key_missing() {
        let mut e = event(Platform::Facebook, json!({}));
        e.page_id = None;
        assert!(scope_key(&e).is_none());
    }
}
