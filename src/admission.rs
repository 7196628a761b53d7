use kube::ResourceExt;

use crate::config::OperatorConfig;
use crate::crd::{AppWrapper, QUEUE_NAME_LABEL};
use crate::podsets::{template_type_meta, validate_pod_sets};

/* ============================= TYPES ============================= */

/// Result of validating an AppWrapper at admission time.
#[derive(Debug, Clone)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub message: Option<String>,
    pub violations: Vec<String>,
}

impl AdmissionVerdict {
    fn from_violations(violations: Vec<String>) -> Self {
        if violations.is_empty() {
            Self {
                allowed: true,
                message: None,
                violations,
            }
        } else {
            Self {
                allowed: false,
                message: Some(format_denial_message(&violations)),
                violations,
            }
        }
    }
}

/// Format a human-readable denial message from a list of violations.
pub fn format_denial_message(violations: &[String]) -> String {
    format!("AppWrapper rejected: {}", violations.join(", "))
}

/* ============================= CORE LOGIC ============================= */

/// Validate an AppWrapper's structure before admission: every component has
/// resolvable type meta, stays in the AppWrapper's namespace, and declares
/// pod sets consistent with what its template implies. Queue membership is
/// enforced when the operator does not manage unqueued jobs.
///
/// The TLS serving and SubjectAccessReview plumbing around this check live
/// with the host webhook; this is the decision function.
pub fn validate_appwrapper(aw: &AppWrapper, config: &OperatorConfig) -> AdmissionVerdict {
    let mut violations = Vec::new();

    if aw.spec.components.is_empty() {
        violations.push("spec.components must not be empty".to_string());
    }

    let namespace = aw.namespace().unwrap_or_default();

    for (index, component) in aw.spec.components.iter().enumerate() {
        if let Err(err) = template_type_meta(&component.template) {
            violations.push(format!("component {index}: {err}"));
            continue;
        }

        if let Some(template_ns) = component.template["metadata"]["namespace"].as_str()
            && template_ns != namespace
        {
            violations.push(format!(
                "component {index}: cross-namespace reference to '{template_ns}'"
            ));
        }

        if let Err(err) = validate_pod_sets(component) {
            violations.push(format!("component {index}: {err}"));
        }
    }

    if config.enable_kueue_integrations
        && !config.manage_jobs_without_queue_name
        && !aw.labels().contains_key(QUEUE_NAME_LABEL)
        && config.default_queue_name.is_none()
    {
        violations.push(format!("missing required label '{QUEUE_NAME_LABEL}'"));
    }

    AdmissionVerdict::from_violations(violations)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AppWrapperComponent, AppWrapperPodSet, AppWrapperSpec};
    use serde_json::json;

    fn pod_component(name: &str) -> AppWrapperComponent {
        AppWrapperComponent {
            template: json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": name},
                "spec": {"containers": [{"name": "main", "image": "busybox:1.36"}]}
            }),
            declared_pod_sets: vec![AppWrapperPodSet::new("template", Some(1))],
            ..Default::default()
        }
    }

    fn wrapper(components: Vec<AppWrapperComponent>) -> AppWrapper {
        let mut aw = AppWrapper::new(
            "wrapper",
            AppWrapperSpec {
                components,
                ..Default::default()
            },
        );
        aw.metadata.namespace = Some("batch".to_string());
        aw
    }

    #[test]
    fn test_allow_well_formed_wrapper() {
        let verdict = validate_appwrapper(
            &wrapper(vec![pod_component("p1")]),
            &OperatorConfig::default(),
        );
        assert!(verdict.allowed);
        assert!(verdict.message.is_none());
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn test_deny_empty_components() {
        let verdict = validate_appwrapper(&wrapper(vec![]), &OperatorConfig::default());
        assert!(!verdict.allowed);
        assert!(
            verdict
                .message
                .as_deref()
                .is_some_and(|m| m.contains("must not be empty"))
        );
    }

    #[test]
    fn test_deny_missing_type_meta() {
        let verdict = validate_appwrapper(
            &wrapper(vec![AppWrapperComponent {
                template: json!({"metadata": {"name": "x"}, "spec": {}}),
                ..Default::default()
            }]),
            &OperatorConfig::default(),
        );
        assert!(!verdict.allowed);
        assert!(verdict.violations[0].contains("component 0"));
    }

    #[test]
    fn test_deny_cross_namespace_component() {
        let mut component = pod_component("p1");
        component.template["metadata"]["namespace"] = json!("other");
        let verdict = validate_appwrapper(&wrapper(vec![component]), &OperatorConfig::default());
        assert!(!verdict.allowed);
        assert!(verdict.violations[0].contains("cross-namespace"));
    }

    #[test]
    fn test_deny_pod_set_replica_mismatch() {
        let mut component = pod_component("p1");
        component.declared_pod_sets = vec![AppWrapperPodSet::new("template", Some(3))];
        let verdict = validate_appwrapper(&wrapper(vec![component]), &OperatorConfig::default());
        assert!(!verdict.allowed);
    }

    #[test]
    fn test_violations_accumulate_across_components() {
        let mut bad = pod_component("p2");
        bad.template["metadata"]["namespace"] = json!("other");
        let verdict = validate_appwrapper(
            &wrapper(vec![
                AppWrapperComponent {
                    template: json!({"spec": {}}),
                    ..Default::default()
                },
                bad,
            ]),
            &OperatorConfig::default(),
        );
        assert!(!verdict.allowed);
        assert!(verdict.violations.len() >= 2);
    }

    // ── queue membership ──

    fn strict_queue_config() -> OperatorConfig {
        OperatorConfig {
            manage_jobs_without_queue_name: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_deny_unqueued_wrapper_when_queues_required() {
        let verdict = validate_appwrapper(&wrapper(vec![pod_component("p1")]), &strict_queue_config());
        assert!(!verdict.allowed);
        assert!(verdict.violations[0].contains(QUEUE_NAME_LABEL));
    }

    #[test]
    fn test_allow_queued_wrapper_when_queues_required() {
        let mut aw = wrapper(vec![pod_component("p1")]);
        aw.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(QUEUE_NAME_LABEL.to_string(), "team-queue".to_string());
        let verdict = validate_appwrapper(&aw, &strict_queue_config());
        assert!(verdict.allowed);
    }

    #[test]
    fn test_default_queue_satisfies_requirement() {
        let config = OperatorConfig {
            default_queue_name: Some("default-queue".to_string()),
            ..strict_queue_config()
        };
        let verdict = validate_appwrapper(&wrapper(vec![pod_component("p1")]), &config);
        assert!(verdict.allowed);
    }
}
