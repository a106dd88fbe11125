use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::AppError;
use crate::graph_client::{GraphClient, TokenManager};
use crate::models::{
    EventState, FormPollStats, IntakeSource, LeadForm, Platform, PollRunStats,
};
use crate::orchestrator::Pipeline;
use crate::storage::{InsertOutcome, IntakeStore, NewIntakeEvent};
use crate::webhook_models::GraphLeadDetail;

/// Scheduled safety net behind the webhook path: fetches leads the
/// provider created since the last successful pass and funnels them
/// through the same intake log. Webhook-delivered leads collapse against
/// the dedup constraint.
pub async fn run_polling_loop(pipeline: Arc<Pipeline>, interval_minutes: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_minutes * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match poll_once(&pipeline, "scheduled").await {
            Ok(stats) => {
                tracing::info!(
                    "Polling pass complete: {} fetched, {} new, {} duplicates, {} failed",
                    stats.total_fetched,
                    stats.new_events,
                    stats.duplicates,
                    stats.failed
                );
            }
            Err(e) => {
                tracing::error!("Polling pass failed: {}", e);
            }
        }
    }
}

/// One full polling pass over every registered page.
///
/// The watermark is read at the start and advanced only after a pass in
/// which every lead was fetched and durably logged; any failure leaves
/// it in place so the next pass re-covers the same window. Re-fetched
/// leads are absorbed by dedup, so the overlap costs API calls, not
/// duplicates.
pub async fn poll_once(
    pipeline: &Arc<Pipeline>,
    trigger_source: &str,
) -> Result<PollRunStats, AppError> {
    let store = &pipeline.store;
    let run_id = store.start_poll_run(trigger_source).await?;
    let watermark = store.watermark(Platform::Facebook).await?;
    let pass_start = Utc::now();

    tracing::info!(
        "Polling pass {} started (watermark: {:?})",
        run_id,
        watermark
    );

    let mut stats = PollRunStats {
        total_fetched: 0,
        new_events: 0,
        duplicates: 0,
        failed: 0,
        per_form: Vec::new(),
    };
    let mut fetch_failed = false;

    let pages = store.registered_pages().await?;
    for page_id in &pages {
        if let Err(e) =
            refresh_forms_for_page(store, &pipeline.graph, &pipeline.tokens, page_id).await
        {
            tracing::error!("Form refresh for page {} failed: {}", page_id, e);
            fetch_failed = true;
            continue;
        }

        let forms = store.active_forms_for_page(page_id).await?;
        for form in &forms {
            match poll_form(pipeline, run_id, form, watermark).await {
                Ok(form_stats) => {
                    stats.total_fetched += form_stats.fetched;
                    stats.new_events += form_stats.new_events;
                    stats.duplicates += form_stats.duplicates;
                    stats.failed += form_stats.failed;
                    stats.per_form.push(form_stats);
                }
                Err(e) => {
                    tracing::error!("Polling form {} failed: {}", form.form_id, e);
                    fetch_failed = true;
                }
            }
        }
    }

    if watermark_may_advance(fetch_failed, &stats) {
        store.set_watermark(Platform::Facebook, pass_start).await?;
    } else {
        tracing::warn!(
            "Polling pass {} had failures, watermark not advanced",
            run_id
        );
    }

    store.finish_poll_run(run_id, &stats).await?;
    Ok(stats)
}

/// A pass may advance the watermark only when every fetch succeeded and
/// every fetched lead was durably logged. A lead fetched but not logged
/// would fall out of the next pass's window and be lost for good.
fn watermark_may_advance(fetch_failed: bool, stats: &PollRunStats) -> bool {
    !fetch_failed && stats.failed == 0
}

async fn poll_form(
    pipeline: &Arc<Pipeline>,
    run_id: uuid::Uuid,
    form: &LeadForm,
    watermark: Option<DateTime<Utc>>,
) -> Result<FormPollStats, AppError> {
    let token = pipeline.tokens.current().await;
    let leads = pipeline
        .graph
        .leads_for_form(&form.form_id, &token, watermark)
        .await?;

    let mut form_stats = FormPollStats {
        form_id: form.form_id.clone(),
        fetched: leads.len() as i64,
        new_events: 0,
        duplicates: 0,
        failed: 0,
    };

    for lead in &leads {
        match log_polled_lead(pipeline, run_id, form, lead).await {
            Ok(true) => form_stats.new_events += 1,
            Ok(false) => form_stats.duplicates += 1,
            Err(e) => {
                tracing::error!("Logging polled lead {} failed: {}", lead.id, e);
                form_stats.failed += 1;
            }
        }
    }

    Ok(form_stats)
}

/// Logs one polled lead. The fetched detail doubles as the enrichment
/// cache, so processing maps from the stored copy without another
/// provider call. Returns false for dedup hits.
async fn log_polled_lead(
    pipeline: &Arc<Pipeline>,
    run_id: uuid::Uuid,
    form: &LeadForm,
    lead: &GraphLeadDetail,
) -> Result<bool, AppError> {
    let payload = serde_json::to_value(lead)
        .map_err(|e| AppError::InternalError(format!("Serializing lead detail: {}", e)))?;

    let event = NewIntakeEvent {
        provider_event_id: lead.id.clone(),
        source: IntakeSource::Polling,
        platform: Platform::Facebook,
        page_id: form.page_id.clone(),
        form_id: Some(form.form_id.clone()),
        ad_id: None,
        raw_payload: payload.clone(),
        provider_created_time: lead.created_time.as_deref().and_then(parse_graph_time),
        state: EventState::Pending,
        error_message: None,
        config_reference: None,
        lead_doctype: None,
        poll_run_reference: Some(run_id),
    };

    let id = match pipeline.store.insert_event(&event).await? {
        InsertOutcome::Inserted(id) => id,
        InsertOutcome::Duplicate => return Ok(false),
    };

    pipeline.store.store_enriched_payload(id, &payload).await?;
    if let Err(e) = pipeline.process_event(id, false).await {
        tracing::error!("Processing of polled event {} failed: {}", id, e);
    }
    Ok(true)
}

/// Syncs the form registry for one page from the provider. Returns the
/// number of forms upserted.
pub async fn refresh_forms_for_page(
    store: &IntakeStore,
    graph: &GraphClient,
    tokens: &TokenManager,
    page_id: &str,
) -> Result<usize, AppError> {
    let token = tokens.current().await;
    let forms = graph.forms_for_page(page_id, &token).await?;
    let count = forms.len();

    for info in forms {
        store
            .upsert_form(&LeadForm {
                form_id: info.id,
                form_name: info.name,
                page_id: Some(page_id.to_string()),
                status: info.status,
                locale: info.locale,
            })
            .await?;
    }

    tracing::info!("Refreshed {} forms for page {}", count, page_id);
    Ok(count)
}

/// Digs lead-gen form ids out of an ad's creative JSON and registers
/// each discovered form. Returns the discovered form ids.
pub async fn discover_forms_from_ad(
    store: &IntakeStore,
    graph: &GraphClient,
    tokens: &TokenManager,
    ad_id: &str,
) -> Result<Vec<String>, AppError> {
    let token = tokens.current().await;
    let creatives = graph.ad_creatives(ad_id, &token).await?;

    let mut discovered = Vec::new();
    for form in crate::graph_client::extract_form_ids(&creatives, 16) {
        if discovered.contains(&form.form_id) {
            continue;
        }
        let detail = graph.form_detail(&form.form_id, &token).await?;
        store
            .upsert_form(&LeadForm {
                form_id: detail.id,
                form_name: detail.name,
                page_id: None,
                status: detail.status,
                locale: detail.locale,
            })
            .await?;
        discovered.push(form.form_id);
    }

    tracing::info!(
        "Discovered {} form(s) in creatives of ad {}",
        discovered.len(),
        ad_id
    );
    Ok(discovered)
}

/// Graph timestamps look like `2025-02-10T08:16:28+0000`.
fn parse_graph_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z")
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_graph_time() {
        let parsed = parse_graph_time("2025-02-10T08:16:28+0000").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-02-10T08:16:28+00:00");
    }

    #[test]
    fn test_parse_graph_time_with_offset() {
        let parsed = parse_graph_time("2025-02-10T08:16:28+0530").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-02-10T02:46:28+00:00");
    }

    #[test]
    fn test_parse_graph_time_rejects_garbage() {
        assert!(parse_graph_time("not a time").is_none());
    }

    #[test]
    fn test_watermark_advances_on_clean_pass() {
        let stats = PollRunStats {
            total_fetched: 5,
            new_events: 5,
            ..Default::default()
        };
        assert!(watermark_may_advance(false, &stats));
    }

    #[test]
    fn test_watermark_held_back_on_fetch_failure() {
        assert!(!watermark_may_advance(true, &PollRunStats::default()));
    }

    #[test]
    fn test_watermark_held_back_when_a_lead_failed_to_log() {
        // The fetches all succeeded, but one lead never made it into the
        // intake log; advancing would skip it on the next pass.
        let stats = PollRunStats {
            total_fetched: 3,
            new_events: 2,
            failed: 1,
            ..Default::default()
        };
        assert!(!watermark_may_advance(false, &stats));
    }
}
