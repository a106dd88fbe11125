use serde_json::{Map, Value};

use crate::formatting::{Transform, TransformParams};
use crate::models::{IntakeEvent, LeadForm, MappingConfig};

/// A candidate source for `field:` default-value references.
///
/// Implementors expose named attributes; `try_get` returns `None` both
/// for missing attributes and for present-but-empty values, so the
/// lookup chain falls through on empties. That "empty-is-absent" rule is
/// a deliberate contract.
///
/// Sources are borrowed across await points in background processing, so
/// the trait carries the thread-safety bounds.
pub trait FieldSource: Send + Sync {
    fn try_get(&self, field: &str) -> Option<Value>;
}

/// True when a value carries usable content. Null and empty strings do
/// not.
pub fn non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn filter_empty(value: Value) -> Option<Value> {
    if non_empty(&value) {
        Some(value)
    } else {
        None
    }
}

impl FieldSource for IntakeEvent {
    fn try_get(&self, field: &str) -> Option<Value> {
        let direct = match field {
            "provider_event_id" => Some(Value::String(self.provider_event_id.clone())),
            "page_id" => self.page_id.clone().map(Value::String),
            "form_id" => self.form_id.clone().map(Value::String),
            "ad_id" => self.ad_id.clone().map(Value::String),
            "platform" => Some(Value::String(self.platform.as_str().to_string())),
            "source" => Some(Value::String(self.source.as_str().to_string())),
            "received_time" => Some(Value::String(self.received_time.to_rfc3339())),
            "provider_created_time" => self
                .provider_created_time
                .map(|t| Value::String(t.to_rfc3339())),
            _ => None,
        };
        if let Some(value) = direct {
            return filter_empty(value);
        }
        // Fall back to top-level keys of the raw provider payload.
        self.raw_payload
            .get(field)
            .cloned()
            .and_then(filter_empty)
    }
}

impl FieldSource for MappingConfig {
    fn try_get(&self, field: &str) -> Option<Value> {
        let value = match field {
            "scope_key" | "page_id" | "campaign_id" => {
                Some(Value::String(self.scope_key.clone()))
            }
            "destination_doctype" | "lead_doctype" => {
                Some(Value::String(self.destination_doctype.clone()))
            }
            "platform" => Some(Value::String(self.platform.as_str().to_string())),
            _ => None,
        };
        value.and_then(filter_empty)
    }
}

impl FieldSource for LeadForm {
    fn try_get(&self, field: &str) -> Option<Value> {
        let value = match field {
            "form_id" => Some(Value::String(self.form_id.clone())),
            "form_name" => self.form_name.clone().map(Value::String),
            "page_id" => self.page_id.clone().map(Value::String),
            "status" => self.status.clone().map(Value::String),
            "locale" => self.locale.clone().map(Value::String),
            _ => None,
        };
        value.and_then(filter_empty)
    }
}

/// Resolves a `field:` reference across the priority chain, returning the
/// first source where the attribute exists and is non-empty.
fn resolve_reference(sources: &[&dyn FieldSource], field: &str) -> Option<Value> {
    sources.iter().find_map(|source| source.try_get(field))
}

/// Applies a config's mapping rules to raw provider fields, producing a
/// flat destination field map ready to instantiate a lead record.
///
/// Per rule, in declared order: the source value if present and
/// non-empty; otherwise the default (literal, or `field:` chain lookup);
/// then the optional transform. A transform that cannot be resolved
/// degrades that one field to its untransformed value — a bad phone
/// number must not block name/email capture. Constants run after all
/// field rules and always overwrite: they represent operator intent and
/// win over provider-sourced ambiguity.
///
/// `default_phone_region` is the deployment-wide fallback for phone
/// rules that do not name a region. Performs no I/O.
pub fn apply(
    raw_fields: &Map<String, Value>,
    config: &MappingConfig,
    sources: &[&dyn FieldSource],
    default_phone_region: &str,
) -> Map<String, Value> {
    let mut destination = Map::new();

    for rule in &config.mapping_rules {
        if rule.destination_field.trim().is_empty() {
            continue;
        }

        let source_value = raw_fields
            .get(&rule.source_field_key)
            .filter(|v| non_empty(v))
            .cloned();

        let resolved = source_value.or_else(|| match rule.default_reference() {
            Some(reference) => resolve_reference(sources, reference),
            None => rule
                .default_value
                .clone()
                .map(Value::String)
                .filter(non_empty),
        });

        let Some(mut value) = resolved else {
            continue;
        };

        if let Some(name) = rule.transform.as_deref() {
            let params = TransformParams::parse(rule.transform_params.as_deref());
            match Transform::resolve(name, &params, default_phone_region) {
                Ok(transform) => value = transform.apply(&value),
                Err(e) => {
                    tracing::warn!(
                        "Formatting function failed for '{}', keeping untransformed value: {}",
                        rule.destination_field,
                        e
                    );
                }
            }
        }

        destination.insert(rule.destination_field.clone(), value);
    }

    for constant in &config.constant_rules {
        if constant.destination_field.trim().is_empty() {
            continue;
        }
        destination.insert(constant.destination_field.clone(), constant.value.clone());
    }

    destination
}
