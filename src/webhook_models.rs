use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Query parameters for the Meta webhook verification handshake.
#[derive(Debug, Deserialize)]
pub struct MetaVerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
}

/// Top-level Meta webhook envelope.
///
/// One POST can carry multiple entries, each with multiple changes; only
/// changes with `field == "leadgen"` are lead notifications.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetaWebhookEnvelope {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<MetaEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetaEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub changes: Vec<MetaChange>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetaChange {
    pub field: String,
    pub value: Value,
}

/// One discrete lead notification extracted from the envelope.
#[derive(Debug, Clone)]
pub struct LeadNotification {
    pub leadgen_id: String,
    pub page_id: Option<String>,
    pub form_id: Option<String>,
    pub ad_id: Option<String>,
    /// Provider epoch seconds.
    pub created_time: Option<i64>,
    /// "facebook" / "instagram" as reported by the provider.
    pub platform: Option<String>,
    /// The change value, verbatim.
    pub raw: Value,
}

impl MetaWebhookEnvelope {
    /// Flattens the envelope into discrete leadgen notifications,
    /// skipping non-leadgen changes and changes without a leadgen id.
    pub fn lead_notifications(&self) -> Vec<LeadNotification> {
        let mut notifications = Vec::new();
        for entry in &self.entry {
            for change in &entry.changes {
                if change.field != "leadgen" {
                    continue;
                }
                let value = &change.value;
                let Some(leadgen_id) = value
                    .get("leadgen_id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                else {
                    continue;
                };
                notifications.push(LeadNotification {
                    leadgen_id,
                    page_id: value
                        .get("page_id")
                        .and_then(json_id_to_string)
                        .or_else(|| entry.id.clone()),
                    form_id: value.get("form_id").and_then(json_id_to_string),
                    ad_id: value.get("ad_id").and_then(json_id_to_string),
                    created_time: value.get("created_time").and_then(|v| v.as_i64()),
                    platform: value
                        .get("platform")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    raw: value.clone(),
                });
            }
        }
        notifications
    }
}

/// Meta sends numeric ids as either strings or numbers depending on the
/// API version.
fn json_id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Full lead detail fetched from the Graph API (enrichment).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphLeadDetail {
    pub id: String,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub field_data: Vec<GraphFieldData>,
    /// Any additional fields the Graph API returns.
    #[serde(flatten)]
    pub raw: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphFieldData {
    pub name: String,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl GraphLeadDetail {
    /// Flattens `field_data` into {name -> first value}, the shape the
    /// mapper consumes.
    pub fn field_map(&self) -> Map<String, Value> {
        self.field_data
            .iter()
            .filter_map(|field| {
                field
                    .values
                    .first()
                    .map(|value| (field.name.clone(), value.clone()))
            })
            .collect()
    }
}

/// Google Ads Lead Form webhook payload.
/// Documentation: https://developers.google.com/google-ads/api/docs/leads/webhooks
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GoogleLeadPayload {
    /// Unique lead identifier (used for deduplication).
    pub lead_id: String,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub form_id: Option<i64>,
    pub campaign_id: i64,
    /// Google Click ID for conversion tracking.
    #[serde(default)]
    pub gcl_id: Option<String>,
    /// Per-campaign shared key, validated against the mapping config.
    pub google_key: String,
    #[serde(default)]
    pub is_test: bool,
    /// Dynamic form fields submitted by the user.
    pub user_column_data: Vec<UserColumnData>,
}

/// Individual form field data.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserColumnData {
    /// Column identifier (e.g. "FULL_NAME", "EMAIL", "PHONE_NUMBER").
    pub column_id: String,
    #[serde(default)]
    pub column_name: Option<String>,
    pub string_value: String,
}

impl GoogleLeadPayload {
    /// Flattens `user_column_data` into {column_id -> value} for the
    /// mapper.
    pub fn field_map(&self) -> Map<String, Value> {
        self.user_column_data
            .iter()
            .map(|field| {
                (
                    field.column_id.clone(),
                    Value::String(field.string_value.clone()),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_leadgen_envelope() {
        let json = r#"
        {
            "object": "page",
            "entry": [{
                "id": "1067280970047460",
                "time": 1739177788,
                "changes": [{
                    "field": "leadgen",
                    "value": {
                        "ad_id": "120214But",
                        "form_id": "614325108066479",
                        "leadgen_id": "1234567890",
                        "created_time": 1739177788,
                        "page_id": "1067280970047460",
                        "platform": "instagram"
                    }
                }]
            }]
        }
        "#;

        let envelope: MetaWebhookEnvelope = serde_json::from_str(json).unwrap();
        let notifications = envelope.lead_notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].leadgen_id, "1234567890");
        assert_eq!(notifications[0].form_id.as_deref(), Some("614325108066479"));
        assert_eq!(notifications[0].platform.as_deref(), Some("instagram"));
    }

    #[test]
    fn test_non_leadgen_changes_skipped() {
        let json = r#"
        {
            "entry": [{
                "id": "p1",
                "changes": [
                    {"field": "feed", "value": {"item": "post"}},
                    {"field": "leadgen", "value": {"leadgen_id": "42", "page_id": "p1"}}
                ]
            }]
        }
        "#;

        let envelope: MetaWebhookEnvelope = serde_json::from_str(json).unwrap();
        let notifications = envelope.lead_notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].leadgen_id, "42");
    }

    #[test]
    fn test_numeric_ids_accepted() {
        let json = r#"
        {
            "entry": [{
                "changes": [{
                    "field": "leadgen",
                    "value": {"leadgen_id": "9", "page_id": 1067280970047460, "form_id": 614325108066479}
                }]
            }]
        }
        "#;

        let envelope: MetaWebhookEnvelope = serde_json::from_str(json).unwrap();
        let notifications = envelope.lead_notifications();
        assert_eq!(notifications[0].page_id.as_deref(), Some("1067280970047460"));
        assert_eq!(notifications[0].form_id.as_deref(), Some("614325108066479"));
    }

    #[test]
    fn test_graph_lead_field_map() {
        let json = r#"
        {
            "id": "1234567890",
            "created_time": "2025-02-10T08:16:28+0000",
            "field_data": [
                {"name": "full_name", "values": ["Asha Rao"]},
                {"name": "phone_number", "values": ["+919876543210"]},
                {"name": "empty_field", "values": []}
            ]
        }
        "#;

        let detail: GraphLeadDetail = serde_json::from_str(json).unwrap();
        let map = detail.field_map();
        assert_eq!(map.get("full_name"), Some(&Value::String("Asha Rao".into())));
        assert!(!map.contains_key("empty_field"));
    }

    #[test]
    fn test_parse_google_payload() {
        let json = r#"
        {
            "lead_id": "TeSter123",
            "api_version": "1.0",
            "form_id": 987654,
            "campaign_id": 100200300,
            "google_key": "secret-key",
            "is_test": true,
            "user_column_data": [
                {"column_id": "FULL_NAME", "column_name": "Full Name", "string_value": "Asha Rao"},
                {"column_id": "PHONE_NUMBER", "column_name": "Phone", "string_value": "+91 98765 43210"}
            ]
        }
        "#;

        let payload: GoogleLeadPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.campaign_id, 100200300);
        let map = payload.field_map();
        assert_eq!(
            map.get("FULL_NAME"),
            Some(&Value::String("Asha Rao".into()))
        );
    }
}
