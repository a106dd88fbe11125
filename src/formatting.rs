use chrono::{Datelike, NaiveDate, Utc};
use phonenumber::country;
use serde_json::Value;

use crate::errors::AppError;

/// Sentinel returned for unparseable phone numbers. Assigned to the
/// destination field as a human-diagnosable breadcrumb instead of
/// aborting the record.
pub const INVALID_NUMBER: &str = "Invalid number";

/// A formatting function selected by name in a mapping rule.
///
/// Closed set resolved at config time: the name plus its parsed
/// parameters becomes a typed variant, so the mapper never dispatches on
/// strings at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Normalize to `+<country>-<national>` canonical form.
    PhoneNumber { default_region: String },
    /// Age in whole years from a date-of-birth string.
    AgeFromDob { format: String },
    /// Last comma-separated segment of an address (country heuristic).
    CountryFromAddress,
    /// Prepend a literal prefix to non-empty values.
    AddPrefix { prefix: String },
    /// Capitalize each whitespace-separated word of a name.
    CapitalizeName,
    /// Current timestamp, ignoring the input value.
    CurrentTimestamp,
}

/// Positional/keyword arguments for a transform, parsed from the rule's
/// parameter string.
#[derive(Debug, Clone, Default)]
pub struct TransformParams {
    positional: Vec<String>,
    named: Vec<(String, String)>,
}

impl TransformParams {
    /// Parses a parameter string that may be a JSON array, a JSON object,
    /// or comma-separated literals. `None`/empty means no arguments.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self::default();
        };

        if let Ok(value) = serde_json::from_str::<Value>(raw) {
            match value {
                Value::Array(items) => {
                    return Self {
                        positional: items.iter().map(value_to_string).collect(),
                        named: Vec::new(),
                    };
                }
                Value::Object(map) => {
                    return Self {
                        positional: Vec::new(),
                        named: map
                            .iter()
                            .map(|(k, v)| (k.clone(), value_to_string(v)))
                            .collect(),
                    };
                }
                // A bare JSON scalar ("IN" is not valid JSON, but 5 is)
                // is treated as a single positional argument.
                other => {
                    return Self {
                        positional: vec![value_to_string(&other)],
                        named: Vec::new(),
                    };
                }
            }
        }

        Self {
            positional: raw.split(',').map(|s| s.trim().to_string()).collect(),
            named: Vec::new(),
        }
    }

    /// Positional index first, then keyword lookup.
    pub fn get(&self, index: usize, key: &str) -> Option<&str> {
        self.positional
            .get(index)
            .map(String::as_str)
            .or_else(|| {
                self.named
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.as_str())
            })
            .filter(|s| !s.is_empty())
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Names accepted in `FieldMappingRule.transform`, for operator tooling.
pub fn list_names() -> &'static [&'static str] {
    &[
        "format_phone_number",
        "calculate_age",
        "extract_country_from_address",
        "add_prefix",
        "capitalize_name",
        "current_date",
    ]
}

impl Transform {
    /// Resolves a configured name + parameter string into a typed
    /// transform. `fallback_region` applies when a phone rule does not
    /// name its own region. Unknown names are a `Transform` error the
    /// mapper logs per-field.
    pub fn resolve(
        name: &str,
        params: &TransformParams,
        fallback_region: &str,
    ) -> Result<Self, AppError> {
        match name {
            "format_phone_number" => Ok(Self::PhoneNumber {
                default_region: params
                    .get(0, "default_region")
                    .unwrap_or(fallback_region)
                    .to_uppercase(),
            }),
            "calculate_age" => Ok(Self::AgeFromDob {
                format: params.get(0, "dob_format").unwrap_or("%Y-%m-%d").to_string(),
            }),
            "extract_country_from_address" => Ok(Self::CountryFromAddress),
            "add_prefix" => Ok(Self::AddPrefix {
                prefix: params.get(0, "prefix").unwrap_or_default().to_string(),
            }),
            "capitalize_name" => Ok(Self::CapitalizeName),
            "current_date" => Ok(Self::CurrentTimestamp),
            other => Err(AppError::Transform(format!(
                "Unknown formatting function '{}'",
                other
            ))),
        }
    }

    /// Applies the transform. Failures are values (sentinel strings or
    /// null), never errors, so one bad field cannot block a record.
    pub fn apply(&self, value: &Value) -> Value {
        match self {
            Self::PhoneNumber { default_region } => {
                let Some(raw) = value_as_text(value) else {
                    return Value::String(INVALID_NUMBER.to_string());
                };
                Value::String(format_phone_number(&raw, default_region))
            }
            Self::AgeFromDob { format } => {
                let Some(raw) = value_as_text(value) else {
                    return Value::Null;
                };
                match calculate_age(&raw, format) {
                    Some(age) => Value::from(age),
                    None => Value::Null,
                }
            }
            Self::CountryFromAddress => {
                let Some(raw) = value_as_text(value) else {
                    return Value::Null;
                };
                match extract_country_from_address(&raw) {
                    Some(country) => Value::String(country),
                    None => Value::Null,
                }
            }
            Self::AddPrefix { prefix } => {
                let Some(raw) = value_as_text(value) else {
                    return value.clone();
                };
                if raw.is_empty() {
                    value.clone()
                } else {
                    Value::String(format!("{}{}", prefix, raw))
                }
            }
            Self::CapitalizeName => {
                let Some(raw) = value_as_text(value) else {
                    return value.clone();
                };
                Value::String(capitalize_name(&raw))
            }
            Self::CurrentTimestamp => {
                Value::String(Utc::now().format("%Y-%m-%d %H:%M:%S").to_string())
            }
        }
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Normalizes a phone number to `+<country>-<national>`.
///
/// Handles three shapes: already-international numbers (leading `+`),
/// bare national numbers parsed against `default_region`, and national
/// numbers that redundantly repeat the country code, which are stripped
/// down and re-parsed before validation.
pub fn format_phone_number(raw: &str, default_region: &str) -> String {
    let trimmed = raw.trim();

    // Keep the leading `+` if present, drop every other non-digit.
    let cleaned: String = if trimmed.starts_with('+') {
        trimmed
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+')
            .collect()
    } else {
        trimmed.chars().filter(|c| c.is_ascii_digit()).collect()
    };

    if cleaned.is_empty() || cleaned == "+" {
        return INVALID_NUMBER.to_string();
    }

    let region: Option<country::Id> = default_region.to_uppercase().parse().ok();

    let parsed = if cleaned.starts_with('+') {
        phonenumber::parse(None, &cleaned)
    } else {
        match phonenumber::parse(region, &cleaned) {
            Ok(first_pass) => {
                let code = first_pass.code().value().to_string();
                // "919876543210" with region IN repeats the country code.
                if !phonenumber::is_valid(&first_pass)
                    && cleaned.starts_with(&code)
                    && cleaned.len() > code.len()
                {
                    phonenumber::parse(region, &cleaned[code.len()..])
                } else {
                    Ok(first_pass)
                }
            }
            Err(e) => Err(e),
        }
    };

    match parsed {
        Ok(number) if phonenumber::is_valid(&number) => {
            format!("+{}-{}", number.code().value(), number.national())
        }
        _ => INVALID_NUMBER.to_string(),
    }
}

/// Age in whole years, or None when the date does not parse.
pub fn calculate_age(dob: &str, format: &str) -> Option<i64> {
    let dob = NaiveDate::parse_from_str(dob.trim(), format).ok()?;
    let today = Utc::now().date_naive();
    let mut age = i64::from(today.year() - dob.year());
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    Some(age)
}

/// Last comma-separated segment, assuming the country is the trailing
/// element of the address. Single-segment addresses yield nothing.
pub fn extract_country_from_address(address: &str) -> Option<String> {
    let parts: Vec<&str> = address.trim().split(',').collect();
    if parts.len() > 1 {
        Some(parts.last()?.trim().to_string())
    } else {
        None
    }
}

/// Capitalizes each whitespace-separated word.
pub fn capitalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phone_international_input() {
        assert_eq!(
            format_phone_number("+91 98765 43210", "IN"),
            "+91-9876543210"
        );
    }

    #[test]
    fn test_phone_national_with_default_region() {
        assert_eq!(format_phone_number("9876543210", "IN"), "+91-9876543210");
    }

    #[test]
    fn test_phone_redundant_country_code() {
        assert_eq!(format_phone_number("919876543210", "IN"), "+91-9876543210");
    }

    #[test]
    fn test_phone_invalid_is_sentinel_not_panic() {
        assert_eq!(format_phone_number("not a phone", "IN"), INVALID_NUMBER);
        assert_eq!(format_phone_number("", "IN"), INVALID_NUMBER);
        assert_eq!(format_phone_number("+", "IN"), INVALID_NUMBER);
    }

    #[test]
    fn test_phone_formatting_punctuation_stripped() {
        assert_eq!(
            format_phone_number("+91-98765-43210", "IN"),
            "+91-9876543210"
        );
    }

    #[test]
    fn test_calculate_age_parses_and_rejects() {
        let age = calculate_age("1990-06-15", "%Y-%m-%d").expect("valid dob");
        assert!(age >= 30);
        assert_eq!(calculate_age("15/06/1990", "%Y-%m-%d"), None);
    }

    #[test]
    fn test_extract_country() {
        assert_eq!(
            extract_country_from_address("12 Baker Street, London, UK"),
            Some("UK".to_string())
        );
        assert_eq!(extract_country_from_address("Just a street"), None);
    }

    #[test]
    fn test_capitalize_name() {
        assert_eq!(capitalize_name("jOHN de souza"), "John De Souza");
    }

    #[test]
    fn test_params_json_array() {
        let params = TransformParams::parse(Some(r#"["IN"]"#));
        assert_eq!(params.get(0, "default_region"), Some("IN"));
    }

    #[test]
    fn test_params_json_object() {
        let params = TransformParams::parse(Some(r#"{"prefix": "Mr. "}"#));
        assert_eq!(params.get(0, "prefix"), Some("Mr. "));
    }

    #[test]
    fn test_params_comma_separated() {
        let params = TransformParams::parse(Some("IN, extra"));
        assert_eq!(params.get(0, "default_region"), Some("IN"));
        assert_eq!(params.get(1, "unused"), Some("extra"));
    }

    #[test]
    fn test_resolve_unknown_name_fails() {
        let params = TransformParams::default();
        assert!(Transform::resolve("reverse_string", &params, "IN").is_err());
    }

    #[test]
    fn test_resolve_phone_with_region_param() {
        let params = TransformParams::parse(Some("US"));
        let transform = Transform::resolve("format_phone_number", &params, "IN").unwrap();
        assert_eq!(
            transform,
            Transform::PhoneNumber {
                default_region: "US".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_phone_without_params_uses_fallback_region() {
        let transform =
            Transform::resolve("format_phone_number", &TransformParams::default(), "br").unwrap();
        assert_eq!(
            transform,
            Transform::PhoneNumber {
                default_region: "BR".to_string()
            }
        );
    }

    #[test]
    fn test_apply_phone_on_non_text_is_sentinel() {
        let transform = Transform::PhoneNumber {
            default_region: "IN".to_string(),
        };
        assert_eq!(
            transform.apply(&json!({"nested": true})),
            json!(INVALID_NUMBER)
        );
    }

    #[test]
    fn test_add_prefix_skips_empty() {
        let transform = Transform::AddPrefix {
            prefix: "Dr. ".to_string(),
        };
        assert_eq!(transform.apply(&json!("Who")), json!("Dr. Who"));
        assert_eq!(transform.apply(&json!("")), json!(""));
    }

    #[test]
    fn test_list_names_covers_registry() {
        for name in list_names() {
            assert!(Transform::resolve(name, &TransformParams::default(), "IN").is_ok());
        }
    }
}
