use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::Postgres;
use std::fmt;
use uuid::Uuid;

use crate::errors::AppError;

type EncodeResult = Result<sqlx::encode::IsNull, BoxDynError>;

/// Lifecycle state of an intake event.
///
/// `Pending` is the only non-terminal state. Transitions are monotonic
/// except for explicit manual retry, which moves a terminal error state
/// back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Pending,
    Processed,
    Error,
    Unconfigured,
    Disabled,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Error => "error",
            Self::Unconfigured => "unconfigured",
            Self::Disabled => "disabled",
        }
    }

    /// Whether a manual or bulk retry may re-enter this state at `Pending`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Error | Self::Unconfigured | Self::Disabled)
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<Postgres> for EventState {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<Postgres>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for EventState {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<Postgres>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "error" => Ok(Self::Error),
            "unconfigured" => Ok(Self::Unconfigured),
            "disabled" => Ok(Self::Disabled),
            _ => Err(format!("invalid event state: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, Postgres> for EventState {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// How an event entered the intake log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeSource {
    Webhook,
    Polling,
}

impl IntakeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Polling => "polling",
        }
    }
}

impl sqlx::Type<Postgres> for IntakeSource {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<Postgres>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for IntakeSource {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<Postgres>>::decode(value)?;
        match s {
            "webhook" => Ok(Self::Webhook),
            "polling" => Ok(Self::Polling),
            _ => Err(format!("invalid intake source: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, Postgres> for IntakeSource {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Originating ad platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Facebook,
    Instagram,
    Google,
    Other,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Facebook => "facebook",
            Self::Instagram => "instagram",
            Self::Google => "google",
            Self::Other => "other",
        }
    }

    /// Maps Meta's `platform` field in leadgen change values. Anything
    /// unrecognized lands in `Other` rather than failing intake.
    pub fn from_provider(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "facebook" | "fb" => Self::Facebook,
            "instagram" | "ig" => Self::Instagram,
            "google" => Self::Google,
            _ => Self::Other,
        }
    }
}

impl sqlx::Type<Postgres> for Platform {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<Postgres>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for Platform {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<Postgres>>::decode(value)?;
        match s {
            "facebook" => Ok(Self::Facebook),
            "instagram" => Ok(Self::Instagram),
            "google" => Ok(Self::Google),
            "other" => Ok(Self::Other),
            _ => Err(format!("invalid platform: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, Postgres> for Platform {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// One provider notification or poll result, persisted before processing.
///
/// Rows are append-only from the intake side; only the orchestrator (and
/// the manual retry entry point) mutate state. Never deleted.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IntakeEvent {
    pub id: Uuid,
    /// Unique per source; the dedup key.
    pub provider_event_id: String,
    pub source: IntakeSource,
    pub platform: Platform,
    pub page_id: Option<String>,
    pub form_id: Option<String>,
    pub ad_id: Option<String>,
    /// Provider JSON stored verbatim for replay.
    pub raw_payload: Value,
    /// Full field data fetched from the provider; cached so retries after
    /// a transient downstream failure do not re-hit the provider API.
    pub enriched_payload: Option<Value>,
    pub received_time: DateTime<Utc>,
    pub provider_created_time: Option<DateTime<Utc>>,
    pub state: EventState,
    pub error_message: Option<String>,
    pub config_reference: Option<Uuid>,
    pub lead_doctype: Option<String>,
    pub lead_reference: Option<Uuid>,
    pub poll_run_reference: Option<Uuid>,
}

/// One {source field -> destination field} mapping rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMappingRule {
    /// Provider-side field key, e.g. "full_name" or "PHONE_NUMBER".
    #[serde(default)]
    pub source_field_key: String,
    pub destination_field: String,
    /// Literal fallback, or a `field:<name>` indirection resolved against
    /// the intake event, the mapping config, and the lead form in that
    /// priority order.
    #[serde(default)]
    pub default_value: Option<String>,
    /// Name of a registered transform, e.g. "format_phone_number".
    #[serde(default)]
    pub transform: Option<String>,
    /// Transform arguments: JSON array/object or comma-separated literals.
    #[serde(default)]
    pub transform_params: Option<String>,
}

impl FieldMappingRule {
    /// Field name when `default_value` is a `field:` reference.
    pub fn default_reference(&self) -> Option<&str> {
        self.default_value
            .as_deref()
            .and_then(|v| v.strip_prefix("field:"))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Operator-pinned value applied after all field rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantRule {
    pub destination_field: String,
    /// Already typed at config save time; application is a pure assignment.
    pub value: Value,
    /// Destination field type hint used by save-time validation
    /// (int, float, date, datetime, check).
    #[serde(default)]
    pub field_type: Option<String>,
}

/// Operator-authored mapping configuration for one page/campaign scope.
///
/// Read-only to the pipeline; created and edited through external tooling.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MappingConfig {
    pub id: Uuid,
    pub platform: Platform,
    /// Page id for Meta, campaign id for Google.
    pub scope_key: String,
    pub destination_doctype: String,
    pub enabled: bool,
    /// Shared key for Google-style webhook validation. Meta configs leave
    /// this empty and rely on transport-level signature verification.
    pub webhook_key: Option<String>,
    #[sqlx(json)]
    pub mapping_rules: Vec<FieldMappingRule>,
    #[sqlx(json)]
    pub constant_rules: Vec<ConstantRule>,
}

impl MappingConfig {
    /// Save-time validation: every rule that targets a destination field
    /// must be resolvable at runtime, and constants must carry a typed
    /// value. Processing never re-checks this.
    pub fn validate(&self) -> Result<(), AppError> {
        for rule in &self.mapping_rules {
            if rule.destination_field.trim().is_empty() {
                continue;
            }
            let has_source = !rule.source_field_key.trim().is_empty();
            let has_default = rule
                .default_value
                .as_deref()
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false);
            if !has_source && !has_default {
                return Err(AppError::Configuration(format!(
                    "Mapping rule for '{}' needs a source field key or a default value",
                    rule.destination_field
                )));
            }
        }

        self.normalized_constants()?;

        Ok(())
    }

    /// Constant rules with each value re-typed against its declared
    /// field type. Configs are persisted with these normalized values so
    /// runtime application stays a pure assignment.
    pub fn normalized_constants(&self) -> Result<Vec<ConstantRule>, AppError> {
        self.constant_rules
            .iter()
            .map(|constant| {
                if constant.destination_field.trim().is_empty() {
                    return Err(AppError::Configuration(
                        "Constant rule is missing a destination field".to_string(),
                    ));
                }
                Ok(ConstantRule {
                    destination_field: constant.destination_field.clone(),
                    value: coerce_constant(constant)?,
                    field_type: constant.field_type.clone(),
                })
            })
            .collect()
    }
}

/// Validates (and where needed re-types) a constant value against its
/// declared destination field type.
fn coerce_constant(constant: &ConstantRule) -> Result<Value, AppError> {
    let Some(field_type) = constant.field_type.as_deref() else {
        return Ok(constant.value.clone());
    };

    let type_error = |detail: &str| {
        AppError::Configuration(format!(
            "Invalid constant value '{}' for field '{}' of type '{}': {}",
            constant.value, constant.destination_field, field_type, detail
        ))
    };

    let as_text = || match &constant.value {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    };

    match field_type.to_ascii_lowercase().as_str() {
        "int" => {
            if constant.value.is_i64() {
                return Ok(constant.value.clone());
            }
            let text = as_text().unwrap_or_default();
            text.trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| type_error("expected an integer"))
        }
        "float" | "currency" => {
            if constant.value.is_number() {
                return Ok(constant.value.clone());
            }
            let text = as_text().unwrap_or_default();
            text.trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| type_error("expected a number"))
        }
        "date" => {
            let text = as_text().unwrap_or_default();
            chrono::NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                .map(|d| Value::String(d.to_string()))
                .map_err(|_| type_error("expected YYYY-MM-DD"))
        }
        "datetime" => {
            let text = as_text().unwrap_or_default();
            DateTime::parse_from_rfc3339(text.trim())
                .map(|d| Value::String(d.to_rfc3339()))
                .map_err(|_| type_error("expected an RFC3339 datetime"))
        }
        "check" => {
            if constant.value.is_boolean() {
                return Ok(constant.value.clone());
            }
            let text = as_text().unwrap_or_default().to_ascii_lowercase();
            Ok(Value::Bool(matches!(
                text.trim(),
                "1" | "true" | "yes"
            )))
        }
        // Unknown types pass through; membership/link checks belong to the
        // admin tooling that authored the config.
        _ => Ok(constant.value.clone()),
    }
}

/// A lead-generation form discovered from the provider.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeadForm {
    pub form_id: String,
    pub form_name: Option<String>,
    pub page_id: Option<String>,
    pub status: Option<String>,
    pub locale: Option<String>,
}

impl LeadForm {
    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some("ACTIVE")
    }
}

/// Durable per-run polling summary.
#[derive(Debug, Clone, Default)]
pub struct PollRunStats {
    pub total_fetched: i64,
    pub new_events: i64,
    pub duplicates: i64,
    pub failed: i64,
    pub per_form: Vec<FormPollStats>,
}

/// Per-form breakdown row inside a poll run.
#[derive(Debug, Clone)]
pub struct FormPollStats {
    pub form_id: String,
    pub fetched: i64,
    pub new_events: i64,
    pub duplicates: i64,
    pub failed: i64,
}
