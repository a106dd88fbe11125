use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    EventState, FormPollStats, IntakeEvent, IntakeSource, LeadForm, MappingConfig, Platform,
    PollRunStats,
};
use crate::resolver::ConfigCandidate;

/// Parameters for logging a new intake event.
#[derive(Debug, Clone)]
pub struct NewIntakeEvent {
    pub provider_event_id: String,
    pub source: IntakeSource,
    pub platform: Platform,
    pub page_id: Option<String>,
    pub form_id: Option<String>,
    pub ad_id: Option<String>,
    pub raw_payload: Value,
    pub provider_created_time: Option<DateTime<Utc>>,
    pub state: EventState,
    pub error_message: Option<String>,
    pub config_reference: Option<Uuid>,
    pub lead_doctype: Option<String>,
    pub poll_run_reference: Option<Uuid>,
}

/// Outcome of an intake insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    /// The unique constraint on `provider_event_id` absorbed a duplicate.
    Duplicate,
}

/// Storage service for the intake pipeline.
///
/// Dedup is enforced by the unique constraint on
/// `intake_events.provider_event_id`, not by application-level locking:
/// concurrent intake attempts for the same id collapse to one row.
pub struct IntakeStore {
    pool: PgPool,
}

impl IntakeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Logs an intake event, skipping (not erroring) on duplicates.
    pub async fn insert_event(&self, event: &NewIntakeEvent) -> Result<InsertOutcome, AppError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO intake_events (
                provider_event_id, source, platform, page_id, form_id, ad_id,
                raw_payload, provider_created_time, state, error_message,
                config_reference, lead_doctype, poll_run_reference
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (provider_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&event.provider_event_id)
        .bind(event.source)
        .bind(event.platform)
        .bind(&event.page_id)
        .bind(&event.form_id)
        .bind(&event.ad_id)
        .bind(&event.raw_payload)
        .bind(event.provider_created_time)
        .bind(event.state)
        .bind(&event.error_message)
        .bind(event.config_reference)
        .bind(&event.lead_doctype)
        .bind(event.poll_run_reference)
        .fetch_optional(&self.pool)
        .await?;

        match id {
            Some(id) => Ok(InsertOutcome::Inserted(id)),
            None => Ok(InsertOutcome::Duplicate),
        }
    }

    pub async fn fetch_event(&self, id: Uuid) -> Result<IntakeEvent, AppError> {
        sqlx::query_as::<_, IntakeEvent>("SELECT * FROM intake_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Intake event {} not found", id)))
    }

    pub async fn event_exists(&self, provider_event_id: &str) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM intake_events WHERE provider_event_id = $1)",
        )
        .bind(provider_event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Ids of every event sitting in a retryable terminal state.
    pub async fn retryable_event_ids(&self) -> Result<Vec<Uuid>, AppError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM intake_events WHERE state IN ('error', 'unconfigured', 'disabled')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Sets a (possibly terminal) state with an optional diagnostic.
    pub async fn set_state(
        &self,
        id: Uuid,
        state: EventState,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE intake_events SET state = $2, error_message = $3 WHERE id = $1")
            .bind(id)
            .bind(state)
            .bind(error_message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records the resolved config and destination doctype on the event.
    /// Called both at first processing and by `reconfigure` during retry.
    pub async fn set_config_reference(
        &self,
        id: Uuid,
        config_reference: Option<Uuid>,
        lead_doctype: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE intake_events SET config_reference = $2, lead_doctype = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(config_reference)
        .bind(lead_doctype)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Caches the enriched payload so retries do not re-hit the provider.
    pub async fn store_enriched_payload(&self, id: Uuid, payload: &Value) -> Result<(), AppError> {
        sqlx::query("UPDATE intake_events SET enriched_payload = $2 WHERE id = $1")
            .bind(id)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks an event processed with its destination record reference.
    pub async fn mark_processed(&self, id: Uuid, lead_reference: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE intake_events
            SET state = 'processed', lead_reference = $2, error_message = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(lead_reference)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetches mapping configs for a scope together with their attached
    /// form ids, ready for resolution.
    pub async fn config_candidates(
        &self,
        platform: Platform,
        scope_key: &str,
    ) -> Result<Vec<ConfigCandidate>, AppError> {
        let configs = sqlx::query_as::<_, MappingConfig>(
            "SELECT * FROM mapping_configs WHERE platform = $1 AND scope_key = $2",
        )
        .bind(platform)
        .bind(scope_key)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(configs.len());
        for config in configs {
            let attached_forms = sqlx::query_scalar::<_, String>(
                "SELECT form_id FROM config_forms WHERE config_id = $1",
            )
            .bind(config.id)
            .fetch_all(&self.pool)
            .await?;
            candidates.push(ConfigCandidate {
                config,
                attached_forms,
            });
        }

        Ok(candidates)
    }

    /// All configs for a scope, enabled first. Used by the Google path,
    /// which matches on campaign id alone.
    pub async fn configs_for_scope(
        &self,
        platform: Platform,
        scope_key: &str,
    ) -> Result<Vec<MappingConfig>, AppError> {
        let configs = sqlx::query_as::<_, MappingConfig>(
            "SELECT * FROM mapping_configs WHERE platform = $1 AND scope_key = $2 ORDER BY enabled DESC",
        )
        .bind(platform)
        .bind(scope_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(configs)
    }

    pub async fn fetch_config(&self, id: Uuid) -> Result<MappingConfig, AppError> {
        sqlx::query_as::<_, MappingConfig>("SELECT * FROM mapping_configs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Mapping config {} not found", id)))
    }

    /// Saves a config and its form attachments. Runs save-time validation
    /// and persists the type-normalized constant values, so processing
    /// never has to re-check or re-coerce anything.
    pub async fn upsert_config(
        &self,
        config: &MappingConfig,
        attached_forms: &[String],
    ) -> Result<(), AppError> {
        config.validate()?;
        let constants = config.normalized_constants()?;

        sqlx::query(
            r#"
            INSERT INTO mapping_configs (
                id, platform, scope_key, destination_doctype, enabled,
                webhook_key, mapping_rules, constant_rules
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                platform = EXCLUDED.platform,
                scope_key = EXCLUDED.scope_key,
                destination_doctype = EXCLUDED.destination_doctype,
                enabled = EXCLUDED.enabled,
                webhook_key = EXCLUDED.webhook_key,
                mapping_rules = EXCLUDED.mapping_rules,
                constant_rules = EXCLUDED.constant_rules
            "#,
        )
        .bind(config.id)
        .bind(config.platform)
        .bind(&config.scope_key)
        .bind(&config.destination_doctype)
        .bind(config.enabled)
        .bind(&config.webhook_key)
        .bind(serde_json::to_value(&config.mapping_rules).unwrap_or_default())
        .bind(serde_json::to_value(&constants).unwrap_or_default())
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM config_forms WHERE config_id = $1")
            .bind(config.id)
            .execute(&self.pool)
            .await?;
        for form_id in attached_forms {
            sqlx::query(
                "INSERT INTO config_forms (config_id, form_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(config.id)
            .bind(form_id)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn form_registered(&self, form_id: &str) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM lead_forms WHERE form_id = $1)",
        )
        .bind(form_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn fetch_form(&self, form_id: &str) -> Result<Option<LeadForm>, AppError> {
        let form = sqlx::query_as::<_, LeadForm>("SELECT * FROM lead_forms WHERE form_id = $1")
            .bind(form_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(form)
    }

    /// Registers or refreshes a discovered form. Forms can be added or
    /// retired between polling runs.
    pub async fn upsert_form(&self, form: &LeadForm) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO lead_forms (form_id, form_name, page_id, status, locale)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (form_id) DO UPDATE SET
                form_name = EXCLUDED.form_name,
                page_id = EXCLUDED.page_id,
                status = EXCLUDED.status,
                locale = EXCLUDED.locale
            "#,
        )
        .bind(&form.form_id)
        .bind(&form.form_name)
        .bind(&form.page_id)
        .bind(&form.status)
        .bind(&form.locale)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn active_forms_for_page(&self, page_id: &str) -> Result<Vec<LeadForm>, AppError> {
        let forms = sqlx::query_as::<_, LeadForm>(
            "SELECT * FROM lead_forms WHERE page_id = $1 AND status = 'ACTIVE'",
        )
        .bind(page_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(forms)
    }

    /// Pages to poll: every distinct scope key with a Meta-side config.
    pub async fn registered_pages(&self) -> Result<Vec<String>, AppError> {
        let pages = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT scope_key FROM mapping_configs WHERE platform IN ('facebook', 'instagram')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(pages)
    }

    /// Creates the destination lead record. At most one lead exists per
    /// intake event; a concurrent duplicate attempt collapses against the
    /// unique constraint and returns `None`.
    pub async fn insert_lead(
        &self,
        doctype: &str,
        fields: &Value,
        intake_event_reference: Uuid,
    ) -> Result<Option<Uuid>, AppError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO leads (doctype, fields, intake_event_reference)
            VALUES ($1, $2, $3)
            ON CONFLICT (intake_event_reference) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(doctype)
        .bind(fields)
        .bind(intake_event_reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Persistence(format!("Failed to insert lead record: {}", e)))?;
        Ok(id)
    }

    /// The lead already created for an event, if processing got that far.
    pub async fn lead_for_event(&self, intake_event_reference: Uuid) -> Result<Option<Uuid>, AppError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM leads WHERE intake_event_reference = $1",
        )
        .bind(intake_event_reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn watermark(&self, platform: Platform) -> Result<Option<DateTime<Utc>>, AppError> {
        let watermark = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT watermark FROM poll_state WHERE platform = $1",
        )
        .bind(platform)
        .fetch_optional(&self.pool)
        .await?;
        Ok(watermark)
    }

    /// Advances the watermark. Only called after a fully successful pass,
    /// so a mid-run failure re-fetches an overlapping window next time.
    pub async fn set_watermark(
        &self,
        platform: Platform,
        watermark: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO poll_state (platform, watermark)
            VALUES ($1, $2)
            ON CONFLICT (platform) DO UPDATE SET watermark = EXCLUDED.watermark
            "#,
        )
        .bind(platform)
        .bind(watermark)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn start_poll_run(&self, trigger_source: &str) -> Result<Uuid, AppError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO poll_runs (trigger_source) VALUES ($1) RETURNING id",
        )
        .bind(trigger_source)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Finalizes the per-run audit record with totals and the per-form
    /// breakdown.
    pub async fn finish_poll_run(&self, id: Uuid, stats: &PollRunStats) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE poll_runs
            SET finished_at = now(), total_fetched = $2, new_events = $3,
                duplicates = $4, failed = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(stats.total_fetched)
        .bind(stats.new_events)
        .bind(stats.duplicates)
        .bind(stats.failed)
        .execute(&self.pool)
        .await?;

        for form in &stats.per_form {
            self.insert_poll_run_form(id, form).await?;
        }
        Ok(())
    }

    async fn insert_poll_run_form(
        &self,
        poll_run_id: Uuid,
        stats: &FormPollStats,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO poll_run_forms (poll_run_id, form_id, fetched, new_events, duplicates, failed)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(poll_run_id)
        .bind(&stats.form_id)
        .bind(stats.fetched)
        .bind(stats.new_events)
        .bind(stats.duplicates)
        .bind(stats.failed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
