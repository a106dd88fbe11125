use uuid::Uuid;

use crate::models::MappingConfig;

/// A mapping config fetched for a scope together with its attached form
/// ids. Configs own a set of forms, not the reverse.
#[derive(Debug, Clone)]
pub struct ConfigCandidate {
    pub config: MappingConfig,
    pub attached_forms: Vec<String>,
}

/// Outcome of config resolution for one (scope_key, form_id) pair.
///
/// The unconfigured variants are distinct on purpose: an operator fixing
/// "no config exists" does different work than one fixing "the form was
/// never attached".
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Exactly one matching config. May still be disabled; the caller
    /// decides what that means.
    Matched(MappingConfig),
    /// No config exists for this scope key at all.
    NoConfigForScope,
    /// Configs exist for the scope, but none has this form attached.
    FormNotAttached,
    /// The form was never registered/discovered.
    FormUnknown,
    /// More than one enabled config claims this form. A configuration
    /// error to surface, never to resolve silently.
    Conflict(Vec<Uuid>),
}

impl Resolution {
    /// Operator-facing diagnostic recorded on the intake event.
    pub fn diagnostic(&self, scope_key: &str, form_id: &str) -> String {
        match self {
            Resolution::Matched(config) => {
                format!("Resolved to config {}", config.id)
            }
            Resolution::NoConfigForScope => {
                format!("No mapping configuration exists for scope '{}'", scope_key)
            }
            Resolution::FormNotAttached => format!(
                "Configuration exists for scope '{}' but form '{}' is not attached to it",
                scope_key, form_id
            ),
            Resolution::FormUnknown => format!(
                "Form '{}' was never registered; run a form refresh for scope '{}'",
                form_id, scope_key
            ),
            Resolution::Conflict(ids) => format!(
                "Ambiguous configuration: {} enabled configs match scope '{}' and form '{}' ({:?})",
                ids.len(),
                scope_key,
                form_id,
                ids
            ),
        }
    }
}

/// Resolves the single mapping config for a form within a scope.
///
/// Pure read over pre-fetched candidates — no side effects, so it is safe
/// to call speculatively at intake time and again during manual retry.
///
/// First enabled config whose attached form set contains `form_id` wins;
/// a second enabled match is a `Conflict`. If only disabled configs
/// match, the first is returned and the caller records the Disabled
/// state.
pub fn resolve(
    candidates: &[ConfigCandidate],
    form_id: &str,
    form_registered: bool,
) -> Resolution {
    if candidates.is_empty() {
        return Resolution::NoConfigForScope;
    }

    let matching: Vec<&ConfigCandidate> = candidates
        .iter()
        .filter(|c| c.attached_forms.iter().any(|f| f == form_id))
        .collect();

    if matching.is_empty() {
        if !form_registered {
            return Resolution::FormUnknown;
        }
        return Resolution::FormNotAttached;
    }

    let enabled: Vec<&ConfigCandidate> =
        matching.iter().copied().filter(|c| c.config.enabled).collect();

    match enabled.len() {
        1 => Resolution::Matched(enabled[0].config.clone()),
        0 => Resolution::Matched(matching[0].config.clone()),
        _ => Resolution::Conflict(enabled.iter().map(|c| c.config.id).collect()),
    }
}

/// Outcome of campaign-scoped resolution for a Google lead.
///
/// Google configs match on campaign id alone, so the only ambiguity is
/// more than one enabled config for the campaign — a tie the operator
/// must break, never resolved silently to the first.
#[derive(Debug)]
pub enum CampaignResolution<'a> {
    /// The single enabled config, or the first disabled one so the
    /// caller can surface the disabled state.
    Matched(&'a MappingConfig),
    NoConfigForCampaign,
    Conflict(Vec<Uuid>),
}

pub fn resolve_campaign(configs: &[MappingConfig]) -> CampaignResolution<'_> {
    if configs.is_empty() {
        return CampaignResolution::NoConfigForCampaign;
    }

    let enabled: Vec<&MappingConfig> = configs.iter().filter(|c| c.enabled).collect();
    match enabled.as_slice() {
        [] => CampaignResolution::Matched(&configs[0]),
        [single] => CampaignResolution::Matched(single),
        many => CampaignResolution::Conflict(many.iter().map(|c| c.id).collect()),
    }
}

/// Operator-facing diagnostic for an ambiguous campaign.
pub fn campaign_conflict_diagnostic(scope_key: &str, ids: &[Uuid]) -> String {
    format!(
        "Ambiguous configuration: {} enabled configs match campaign '{}' ({:?}); disable all but one",
        ids.len(),
        scope_key,
        ids
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;

    fn candidate(enabled: bool, forms: &[&str]) -> ConfigCandidate {
        ConfigCandidate {
            config: MappingConfig {
                id: Uuid::new_v4(),
                platform: Platform::Facebook,
                scope_key: "page_1".to_string(),
                destination_doctype: "Lead".to_string(),
                enabled,
                webhook_key: None,
                mapping_rules: vec![],
                constant_rules: vec![],
            },
            attached_forms: forms.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_single_enabled_match() {
        let candidates = vec![candidate(true, &["form_a", "form_b"])];
        match resolve(&candidates, "form_a", true) {
            Resolution::Matched(config) => assert!(config.enabled),
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_no_config_for_scope() {
        assert!(matches!(
            resolve(&[], "form_a", true),
            Resolution::NoConfigForScope
        ));
    }

    #[test]
    fn test_form_not_attached() {
        let candidates = vec![candidate(true, &["form_b"])];
        assert!(matches!(
            resolve(&candidates, "form_a", true),
            Resolution::FormNotAttached
        ));
    }

    #[test]
    fn test_form_unknown_takes_precedence_over_not_attached() {
        let candidates = vec![candidate(true, &["form_b"])];
        assert!(matches!(
            resolve(&candidates, "form_a", false),
            Resolution::FormUnknown
        ));
    }

    #[test]
    fn test_two_enabled_matches_is_conflict() {
        let candidates = vec![
            candidate(true, &["form_a"]),
            candidate(true, &["form_a"]),
        ];
        match resolve(&candidates, "form_a", true) {
            Resolution::Conflict(ids) => assert_eq!(ids.len(), 2),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_disabled_match_still_resolves() {
        // The orchestrator turns this into the Disabled terminal state.
        let candidates = vec![candidate(false, &["form_a"])];
        match resolve(&candidates, "form_a", true) {
            Resolution::Matched(config) => assert!(!config.enabled),
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_enabled_wins_over_disabled() {
        let disabled = candidate(false, &["form_a"]);
        let enabled = candidate(true, &["form_a"]);
        let expected = enabled.config.id;
        match resolve(&[disabled, enabled], "form_a", true) {
            Resolution::Matched(config) => assert_eq!(config.id, expected),
            other => panic!("expected match, got {:?}", other),
        }
    }

    fn campaign_config(enabled: bool) -> MappingConfig {
        let mut config = candidate(enabled, &[]).config;
        config.platform = Platform::Google;
        config.scope_key = "100200300".to_string();
        config.webhook_key = Some("shared-key".to_string());
        config
    }

    #[test]
    fn test_campaign_single_enabled_config_matches() {
        let configs = vec![campaign_config(true)];
        match resolve_campaign(&configs) {
            CampaignResolution::Matched(config) => assert!(config.enabled),
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_campaign_no_config() {
        assert!(matches!(
            resolve_campaign(&[]),
            CampaignResolution::NoConfigForCampaign
        ));
    }

    #[test]
    fn test_campaign_disabled_config_still_resolves() {
        let configs = vec![campaign_config(false)];
        match resolve_campaign(&configs) {
            CampaignResolution::Matched(config) => assert!(!config.enabled),
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_campaign_two_enabled_configs_is_conflict() {
        let configs = vec![campaign_config(true), campaign_config(true)];
        match resolve_campaign(&configs) {
            CampaignResolution::Conflict(ids) => assert_eq!(ids.len(), 2),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_campaign_enabled_wins_over_disabled() {
        let disabled = campaign_config(false);
        let enabled = campaign_config(true);
        let expected = enabled.id;
        match resolve_campaign(&[disabled, enabled]) {
            CampaignResolution::Matched(config) => assert_eq!(config.id, expected),
            other => panic!("expected match, got {:?}", other),
        }
    }
}
