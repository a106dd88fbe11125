/// Unit tests for the pure pipeline stages: envelope parsing, config
/// resolution, mapping rule application and field formatting.
use serde_json::{json, Map, Value};
use uuid::Uuid;

use lead_intake_api::formatting::{format_phone_number, INVALID_NUMBER};
use lead_intake_api::mapper;
use lead_intake_api::models::{
    ConstantRule, FieldMappingRule, MappingConfig, Platform,
};
use lead_intake_api::resolver::{self, ConfigCandidate, Resolution};
use lead_intake_api::webhook_models::{GoogleLeadPayload, MetaWebhookEnvelope};

fn config_with(
    rules: Vec<FieldMappingRule>,
    constants: Vec<ConstantRule>,
) -> MappingConfig {
    MappingConfig {
        id: Uuid::new_v4(),
        platform: Platform::Facebook,
        scope_key: "1067280970047460".to_string(),
        destination_doctype: "Lead".to_string(),
        enabled: true,
        webhook_key: None,
        mapping_rules: rules,
        constant_rules: constants,
    }
}

fn rule(source: &str, dest: &str) -> FieldMappingRule {
    FieldMappingRule {
        source_field_key: source.to_string(),
        destination_field: dest.to_string(),
        default_value: None,
        transform: None,
        transform_params: None,
    }
}

mod webhook_to_lead_fields {
    use super::*;

    /// A realistic Meta delivery: the envelope parses into one
    /// notification, and a config maps the (separately fetched) field
    /// data into a lead record.
    #[test]
    fn test_meta_delivery_maps_to_lead_fields() {
        let delivery = json!({
            "object": "page",
            "entry": [{
                "id": "1067280970047460",
                "time": 1739177788,
                "changes": [{
                    "field": "leadgen",
                    "value": {
                        "leadgen_id": "1234567890",
                        "page_id": "1067280970047460",
                        "form_id": "614325108066479",
                        "created_time": 1739177788,
                        "platform": "facebook"
                    }
                }]
            }]
        });

        let envelope: MetaWebhookEnvelope = serde_json::from_value(delivery).unwrap();
        let notifications = envelope.lead_notifications();
        assert_eq!(notifications.len(), 1);

        // Field data as fetched from the provider for that leadgen id.
        let mut raw = Map::new();
        raw.insert("full_name".into(), json!("asha rao"));
        raw.insert("phone_number".into(), json!("+91 98765 43210"));
        raw.insert("email".into(), json!("asha@example.com"));

        let mut name_rule = rule("full_name", "lead_name");
        name_rule.transform = Some("capitalize_name".to_string());
        let mut phone_rule = rule("phone_number", "mobile_no");
        phone_rule.transform = Some("format_phone_number".to_string());
        phone_rule.transform_params = Some("IN".to_string());

        let config = config_with(
            vec![name_rule, phone_rule, rule("email", "email_id")],
            vec![ConstantRule {
                destination_field: "source".to_string(),
                value: json!("Meta Ads"),
                field_type: None,
            }],
        );

        let fields = mapper::apply(&raw, &config, &[], "IN");
        assert_eq!(fields.get("lead_name"), Some(&json!("Asha Rao")));
        assert_eq!(fields.get("mobile_no"), Some(&json!("+91-9876543210")));
        assert_eq!(fields.get("email_id"), Some(&json!("asha@example.com")));
        assert_eq!(fields.get("source"), Some(&json!("Meta Ads")));
    }

    #[test]
    fn test_google_payload_maps_by_column_id() {
        let payload: GoogleLeadPayload = serde_json::from_value(json!({
            "lead_id": "gl_001",
            "campaign_id": 100200300,
            "google_key": "shared-key",
            "user_column_data": [
                {"column_id": "FULL_NAME", "string_value": "asha rao"},
                {"column_id": "PHONE_NUMBER", "string_value": "9876543210"},
                {"column_id": "EMAIL", "string_value": "asha@example.com"}
            ]
        }))
        .unwrap();

        let mut name_rule = rule("FULL_NAME", "lead_name");
        name_rule.transform = Some("capitalize_name".to_string());
        let mut phone_rule = rule("PHONE_NUMBER", "mobile_no");
        phone_rule.transform = Some("format_phone_number".to_string());
        phone_rule.transform_params = Some("IN".to_string());
        let config = config_with(
            vec![name_rule, phone_rule, rule("EMAIL", "email_id")],
            vec![],
        );

        let fields = mapper::apply(&payload.field_map(), &config, &[], "IN");
        assert_eq!(fields.get("lead_name"), Some(&json!("Asha Rao")));
        assert_eq!(fields.get("mobile_no"), Some(&json!("+91-9876543210")));
    }

    #[test]
    fn test_one_bad_field_does_not_block_the_record() {
        let mut phone_rule = rule("phone_number", "mobile_no");
        phone_rule.transform = Some("format_phone_number".to_string());
        let config = config_with(
            vec![rule("full_name", "lead_name"), phone_rule],
            vec![],
        );

        let mut raw = Map::new();
        raw.insert("full_name".into(), json!("Asha"));
        raw.insert("phone_number".into(), json!("not a phone"));

        let fields = mapper::apply(&raw, &config, &[], "IN");
        assert_eq!(fields.get("lead_name"), Some(&json!("Asha")));
        assert_eq!(fields.get("mobile_no"), Some(&json!(INVALID_NUMBER)));
    }
}

mod phone_normalization {
    use super::*;

    #[test]
    fn test_international_prefix() {
        assert_eq!(
            format_phone_number("+91 98765 43210", "IN"),
            "+91-9876543210"
        );
    }

    #[test]
    fn test_bare_national_number_uses_region() {
        assert_eq!(format_phone_number("9876543210", "IN"), "+91-9876543210");
    }

    #[test]
    fn test_redundant_country_code_stripped() {
        // Digits already start with the region's country code but carry
        // no `+`; the redundant prefix is dropped and re-applied once.
        assert_eq!(format_phone_number("919876543210", "IN"), "+91-9876543210");
    }

    #[test]
    fn test_unparseable_input_yields_sentinel() {
        assert_eq!(format_phone_number("hello", "IN"), INVALID_NUMBER);
        assert_eq!(format_phone_number("", "IN"), INVALID_NUMBER);
    }

    #[test]
    fn test_other_regions() {
        assert_eq!(format_phone_number("(202) 555-0142", "US"), "+1-2025550142");
    }
}

mod config_resolution {
    use super::*;

    fn candidate(enabled: bool, forms: &[&str]) -> ConfigCandidate {
        let mut config = config_with(vec![], vec![]);
        config.enabled = enabled;
        ConfigCandidate {
            config,
            attached_forms: forms.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_attached_form_resolves() {
        let candidates = vec![candidate(true, &["614325108066479"])];
        assert!(matches!(
            resolver::resolve(&candidates, "614325108066479", true),
            Resolution::Matched(_)
        ));
    }

    #[test]
    fn test_unattached_and_unknown_forms_are_distinct_outcomes() {
        let candidates = vec![candidate(true, &["other_form"])];
        assert!(matches!(
            resolver::resolve(&candidates, "614325108066479", true),
            Resolution::FormNotAttached
        ));
        assert!(matches!(
            resolver::resolve(&candidates, "614325108066479", false),
            Resolution::FormUnknown
        ));
    }

    #[test]
    fn test_ambiguous_configs_reported_not_picked() {
        let candidates = vec![
            candidate(true, &["614325108066479"]),
            candidate(true, &["614325108066479"]),
        ];
        match resolver::resolve(&candidates, "614325108066479", true) {
            Resolution::Conflict(ids) => assert_eq!(ids.len(), 2),
            other => panic!("expected conflict, got {:?}", other),
        }
    }
}

mod config_validation {
    use super::*;

    #[test]
    fn test_rule_without_source_or_default_rejected() {
        let config = config_with(vec![rule("", "lead_name")], vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rule_with_default_only_accepted() {
        let mut r = rule("", "lead_source");
        r.default_value = Some("Website".to_string());
        let config = config_with(vec![r], vec![]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_typed_constant_lands_as_typed_value() {
        // Save-time normalization re-types the constant; a check-typed
        // "yes" must reach the lead as a boolean, not a string.
        let mut config = config_with(
            vec![],
            vec![ConstantRule {
                destination_field: "newsletter_opt_in".to_string(),
                value: json!("yes"),
                field_type: Some("Check".to_string()),
            }],
        );
        config.constant_rules = config.normalized_constants().unwrap();

        let fields = mapper::apply(&Map::new(), &config, &[], "IN");
        assert_eq!(fields.get("newsletter_opt_in"), Some(&json!(true)));
    }

    #[test]
    fn test_constant_type_mismatch_rejected() {
        let config = config_with(
            vec![],
            vec![ConstantRule {
                destination_field: "priority".to_string(),
                value: json!("not-a-number"),
                field_type: Some("int".to_string()),
            }],
        );
        assert!(config.validate().is_err());
    }
}

#[test]
fn test_field_reference_chain_event_config_form() {
    use chrono::Utc;
    use lead_intake_api::models::{EventState, IntakeEvent, IntakeSource, LeadForm};

    let event = IntakeEvent {
        id: Uuid::new_v4(),
        provider_event_id: "1234567890".to_string(),
        source: IntakeSource::Webhook,
        platform: Platform::Facebook,
        page_id: Some("".to_string()), // empty, must fall through
        form_id: Some("614325108066479".to_string()),
        ad_id: None,
        raw_payload: json!({}),
        enriched_payload: None,
        received_time: Utc::now(),
        provider_created_time: None,
        state: EventState::Pending,
        error_message: None,
        config_reference: None,
        lead_doctype: None,
        lead_reference: None,
        poll_run_reference: None,
    };
    let form = LeadForm {
        form_id: "614325108066479".to_string(),
        form_name: Some("Summer Campaign".to_string()),
        page_id: Some("1067280970047460".to_string()),
        status: Some("ACTIVE".to_string()),
        locale: None,
    };

    let mut page_rule = rule("missing", "page");
    page_rule.default_value = Some("field:page_id".to_string());
    let mut form_rule = rule("missing", "origin_form");
    form_rule.default_value = Some("field:form_name".to_string());
    let config = config_with(vec![page_rule, form_rule], vec![]);

    let fields = mapper::apply(&Map::new(), &config, &[&event, &config, &form], "IN");
    // Event page_id is empty, so the config's scope key wins; form_name
    // only exists on the form, so the chain reaches the third source.
    assert_eq!(fields.get("page"), Some(&json!("1067280970047460")));
    assert_eq!(fields.get("origin_form"), Some(&json!("Summer Campaign")));
}

#[test]
fn test_empty_string_value_treated_as_absent() {
    let mut r = rule("city", "city");
    r.default_value = Some("Mumbai".to_string());
    let config = config_with(vec![r], vec![]);

    let mut raw = Map::new();
    raw.insert("city".into(), Value::String("   ".into()));

    let fields = mapper::apply(&raw, &config, &[], "IN");
    assert_eq!(fields.get("city"), Some(&json!("Mumbai")));
}
