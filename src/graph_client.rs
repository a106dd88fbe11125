use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::errors::AppError;
use crate::webhook_models::GraphLeadDetail;

/// Holds the long-lived user access token behind a single-flight refresh
/// path. Token exchange happens on a schedule, never per request, and
/// concurrent refresh attempts serialize on the mutex so two refreshes
/// cannot race to persist different tokens.
pub struct TokenManager {
    app_id: String,
    app_secret: String,
    state: Mutex<TokenState>,
}

struct TokenState {
    access_token: String,
    refreshed_at: DateTime<Utc>,
}

impl TokenManager {
    pub fn new(app_id: String, app_secret: String, access_token: String) -> Self {
        Self {
            app_id,
            app_secret,
            state: Mutex::new(TokenState {
                access_token,
                refreshed_at: Utc::now(),
            }),
        }
    }

    /// Current credentials for an outbound call.
    pub async fn current(&self) -> String {
        self.state.lock().await.access_token.clone()
    }

    /// Exchanges the current token for a fresh long-lived one. The lock
    /// is held across the exchange, so a refresh already in flight makes
    /// later callers wait and then observe the new token instead of
    /// starting their own exchange.
    pub async fn refresh(&self, client: &GraphClient) -> Result<(), AppError> {
        let mut state = self.state.lock().await;

        // Another caller may have refreshed while we waited on the lock.
        if Utc::now() - state.refreshed_at < chrono::Duration::minutes(5) {
            tracing::debug!("Token refreshed recently, skipping exchange");
            return Ok(());
        }

        let response = client
            .exchange_long_lived_token(&self.app_id, &self.app_secret, &state.access_token)
            .await?;
        state.access_token = response.access_token;
        state.refreshed_at = Utc::now();
        tracing::info!("Access token exchanged for a fresh long-lived token");
        Ok(())
    }
}

/// Form metadata returned by the Graph API.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphFormInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub questions: Vec<GraphFormQuestion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphFormQuestion {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

/// A lead-gen form reference discovered inside ad creative JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredForm {
    pub form_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenExchangeResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

/// Client for the Meta Graph API.
#[derive(Clone)]
pub struct GraphClient {
    client: reqwest::Client,
    base_url: String,
    api_version: String,
}

impl GraphClient {
    pub fn new(base_url: String, api_version: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Upstream(format!("Failed to create Graph client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_version,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.api_version, path)
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, AppError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(AppError::from)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::Upstream(format!(
                "Graph API returned {}: {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("Failed to parse Graph response: {}", e)))
    }

    /// Fetches full field data for a lead (enrichment).
    pub async fn fetch_lead(
        &self,
        leadgen_id: &str,
        access_token: &str,
    ) -> Result<GraphLeadDetail, AppError> {
        let url = self.url(leadgen_id);
        tracing::info!("Fetching lead {} from Graph API", leadgen_id);

        let value = self
            .get_json(
                &url,
                &[
                    ("access_token", access_token),
                    ("fields", "id,created_time,ad_id,form_id,field_data"),
                ],
            )
            .await?;

        serde_json::from_value(value)
            .map_err(|e| AppError::Upstream(format!("Malformed lead detail: {}", e)))
    }

    /// Fetches leads for a form created after the given watermark.
    pub async fn leads_for_form(
        &self,
        form_id: &str,
        access_token: &str,
        created_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<GraphLeadDetail>, AppError> {
        let url = self.url(&format!("{}/leads", form_id));
        let since;
        let mut query: Vec<(&str, &str)> = vec![
            ("access_token", access_token),
            ("fields", "id,created_time,field_data"),
        ];
        if let Some(watermark) = created_since {
            since = watermark.timestamp().to_string();
            query.push(("created_since", &since));
        }

        let value = self.get_json(&url, &query).await?;
        let envelope: DataEnvelope<GraphLeadDetail> = serde_json::from_value(value)
            .map_err(|e| AppError::Upstream(format!("Malformed leads response: {}", e)))?;
        Ok(envelope.data)
    }

    /// Lists lead-gen forms owned by a page.
    pub async fn forms_for_page(
        &self,
        page_id: &str,
        access_token: &str,
    ) -> Result<Vec<GraphFormInfo>, AppError> {
        let url = self.url(&format!("{}/leadgen_forms", page_id));
        let value = self
            .get_json(
                &url,
                &[
                    ("access_token", access_token),
                    ("fields", "id,name,status,locale"),
                ],
            )
            .await?;
        let envelope: DataEnvelope<GraphFormInfo> = serde_json::from_value(value)
            .map_err(|e| AppError::Upstream(format!("Malformed forms response: {}", e)))?;
        Ok(envelope.data)
    }

    /// Fetches one form's detail, including its questions (used to seed
    /// mapping rule rows in operator tooling).
    pub async fn form_detail(
        &self,
        form_id: &str,
        access_token: &str,
    ) -> Result<GraphFormInfo, AppError> {
        let url = self.url(form_id);
        let value = self
            .get_json(
                &url,
                &[
                    ("access_token", access_token),
                    ("fields", "id,name,status,locale,questions"),
                ],
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|e| AppError::Upstream(format!("Malformed form detail: {}", e)))
    }

    /// Fetches ad creatives for an ad so lead-gen form ids can be dug out
    /// of the creative JSON.
    pub async fn ad_creatives(
        &self,
        ad_id: &str,
        access_token: &str,
    ) -> Result<Value, AppError> {
        let url = self.url(ad_id);
        self.get_json(
            &url,
            &[
                ("access_token", access_token),
                ("fields", "id,name,adcreatives.limit(10){object_story_spec}"),
            ],
        )
        .await
    }

    /// Exchanges a token for a long-lived one.
    pub async fn exchange_long_lived_token(
        &self,
        app_id: &str,
        app_secret: &str,
        token: &str,
    ) -> Result<TokenExchangeResponse, AppError> {
        let url = self.url("oauth/access_token");
        let value = self
            .get_json(
                &url,
                &[
                    ("grant_type", "fb_exchange_token"),
                    ("client_id", app_id),
                    ("client_secret", app_secret),
                    ("fb_exchange_token", token),
                ],
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|e| AppError::Upstream(format!("Malformed token exchange response: {}", e)))
    }

    /// Inspects a token's validity and scopes.
    pub async fn debug_token(
        &self,
        token: &str,
        app_access_token: &str,
    ) -> Result<Value, AppError> {
        let url = self.url("debug_token");
        self.get_json(
            &url,
            &[("input_token", token), ("access_token", app_access_token)],
        )
        .await
    }
}

/// Walks arbitrary creative JSON collecting `lead_gen_form_id` values.
///
/// Third-party creative payloads are semi-structured, so recursive
/// descent is the right tool — but bounded by `max_depth`, and returning
/// a typed list instead of mutating a shared accumulator.
pub fn extract_form_ids(value: &Value, max_depth: usize) -> Vec<DiscoveredForm> {
    let mut found = Vec::new();
    walk(value, max_depth, &mut found);
    found
}

fn walk(value: &Value, depth_left: usize, found: &mut Vec<DiscoveredForm>) {
    match value {
        Value::Object(map) => {
            if let Some(form_id) = map.get("lead_gen_form_id") {
                let id = match form_id {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                };
                if let Some(form_id) = id {
                    found.push(DiscoveredForm { form_id });
                }
            }
            if depth_left == 0 {
                return;
            }
            for child in map.values() {
                walk(child, depth_left - 1, found);
            }
        }
        Value::Array(items) => {
            if depth_left == 0 {
                return;
            }
            for child in items {
                walk(child, depth_left - 1, found);
            }
        }
        _ => {}
    }
}
