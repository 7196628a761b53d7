use serde_json::{Value, json};
use thiserror::Error;

use crate::config::{AutopilotConfig, TaintEffect};
use crate::crd::{APPWRAPPER_LABEL, AppWrapperPodSet, GROUP, PodSetInfo, QUEUE_NAME_LABEL};
use crate::podsets::{PathError, resolve_path_mut};
use crate::quantity;

/* ============================= ERRORS ============================= */

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InjectError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("conflicting values for {kind} key '{key}'")]
    Conflict { kind: &'static str, key: String },

    #[error("expected '{0}' to be a map")]
    NotAMap(String),
}

/* ============================= CONTEXT ============================= */

/// Everything injection needs to know about the owning AppWrapper and the
/// operator configuration.
pub struct InjectionContext<'a> {
    pub aw_name: &'a str,
    pub aw_uid: &'a str,
    pub queue_name: Option<&'a str>,
    pub scheduler_name: Option<&'a str>,
    pub autopilot: &'a AutopilotConfig,
}

/* ============================= MAP MERGING ============================= */

fn ensure_map<'a>(
    parent: &'a mut Value,
    key: &str,
) -> Result<&'a mut serde_json::Map<String, Value>, InjectError> {
    let obj = parent
        .as_object_mut()
        .ok_or_else(|| InjectError::NotAMap(key.to_string()))?;
    obj.entry(key).or_insert_with(|| json!({}));
    obj[key]
        .as_object_mut()
        .ok_or_else(|| InjectError::NotAMap(key.to_string()))
}

/// Insert `key: value`; a pre-existing entry with a different value is fatal,
/// an identical one is a no-op (first value wins).
fn merge_entry(
    map: &mut serde_json::Map<String, Value>,
    kind: &'static str,
    key: &str,
    value: &str,
) -> Result<(), InjectError> {
    match map.get(key) {
        Some(existing) if existing != value => Err(InjectError::Conflict {
            kind,
            key: key.to_string(),
        }),
        Some(_) => Ok(()),
        None => {
            map.insert(key.to_string(), json!(value));
            Ok(())
        }
    }
}

/* ============================= COMPONENT INJECTION ============================= */

/// Build the controller owner reference naming the AppWrapper.
pub fn owner_reference(aw_name: &str, aw_uid: &str) -> Value {
    json!({
        "apiVersion": format!("{GROUP}/v1"),
        "kind": "AppWrapper",
        "name": aw_name,
        "uid": aw_uid,
        "controller": true,
        "blockOwnerDeletion": true,
    })
}

/// Inject the AppWrapper's metadata into a component template: the
/// cross-linking label and the controller owner reference on the resource
/// itself, then the per-pod-set injections at every declared path.
///
/// Re-running on an already injected template is a no-op.
pub fn inject_component(
    template: &mut Value,
    ctx: &InjectionContext<'_>,
    pod_sets: &[AppWrapperPodSet],
    pod_set_infos: &[PodSetInfo],
) -> Result<(), InjectError> {
    let metadata = ensure_map(template, "metadata")?;
    metadata.entry("labels").or_insert_with(|| json!({}));
    let labels = metadata["labels"]
        .as_object_mut()
        .ok_or_else(|| InjectError::NotAMap("metadata.labels".to_string()))?;
    merge_entry(labels, "label", APPWRAPPER_LABEL, ctx.aw_name)?;

    let owners = metadata
        .entry("ownerReferences")
        .or_insert_with(|| json!([]));
    if let Some(list) = owners.as_array_mut() {
        let already_owned = list
            .iter()
            .any(|o| o["uid"] == ctx.aw_uid && o["controller"] == json!(true));
        if !already_owned {
            list.push(owner_reference(ctx.aw_name, ctx.aw_uid));
        }
    }

    for (i, pod_set) in pod_sets.iter().enumerate() {
        let pod_template = resolve_path_mut(template, &pod_set.path)?;
        inject_pod_set(pod_template, ctx, pod_set_infos.get(i))?;
    }

    Ok(())
}

/* ============================= POD SET INJECTION ============================= */

/// Apply all per-pod-set injections, in order: labels, quota-manager
/// overrides, tolerations, scheduling gates, scheduler name, anti-affinity.
pub fn inject_pod_set(
    pod_template: &mut Value,
    ctx: &InjectionContext<'_>,
    info: Option<&PodSetInfo>,
) -> Result<(), InjectError> {
    {
        let metadata = ensure_map(pod_template, "metadata")?;
        metadata.entry("labels").or_insert_with(|| json!({}));
        let labels = metadata["labels"]
            .as_object_mut()
            .ok_or_else(|| InjectError::NotAMap("metadata.labels".to_string()))?;
        merge_entry(labels, "label", APPWRAPPER_LABEL, ctx.aw_name)?;
        if let Some(queue) = ctx.queue_name {
            merge_entry(labels, "label", QUEUE_NAME_LABEL, queue)?;
        }
    }

    if let Some(info) = info {
        apply_pod_set_info(pod_template, info)?;
    }

    let spec = resolve_spec(pod_template)?;

    if let Some(scheduler) = ctx.scheduler_name
        && spec.get("schedulerName").is_none()
    {
        spec.insert("schedulerName".to_string(), json!(scheduler));
    }

    if ctx.autopilot.inject_anti_affinities {
        inject_anti_affinity(pod_template, ctx.autopilot)?;
    }

    Ok(())
}

fn resolve_spec(
    pod_template: &mut Value,
) -> Result<&mut serde_json::Map<String, Value>, InjectError> {
    ensure_map(pod_template, "spec")
}

fn apply_pod_set_info(pod_template: &mut Value, info: &PodSetInfo) -> Result<(), InjectError> {
    {
        let metadata = ensure_map(pod_template, "metadata")?;
        for (field, kind, entries) in [
            ("annotations", "annotation", &info.annotations),
            ("labels", "label", &info.labels),
        ] {
            if entries.is_empty() {
                continue;
            }
            metadata.entry(field).or_insert_with(|| json!({}));
            let map = metadata[field]
                .as_object_mut()
                .ok_or_else(|| InjectError::NotAMap(format!("metadata.{field}")))?;
            for (k, v) in entries {
                merge_entry(map, kind, k, v)?;
            }
        }
    }

    let spec = resolve_spec(pod_template)?;

    if !info.node_selector.is_empty() {
        spec.entry("nodeSelector").or_insert_with(|| json!({}));
        let selector = spec["nodeSelector"]
            .as_object_mut()
            .ok_or_else(|| InjectError::NotAMap("spec.nodeSelector".to_string()))?;
        for (k, v) in &info.node_selector {
            merge_entry(selector, "node selector", k, v)?;
        }
    }

    if !info.tolerations.is_empty() {
        spec.entry("tolerations").or_insert_with(|| json!([]));
        if let Some(list) = spec["tolerations"].as_array_mut() {
            for toleration in &info.tolerations {
                let value = serde_json::to_value(toleration).unwrap_or_default();
                if !list.contains(&value) {
                    list.push(value);
                }
            }
        }
    }

    if !info.scheduling_gates.is_empty() {
        spec.entry("schedulingGates").or_insert_with(|| json!([]));
        if let Some(list) = spec["schedulingGates"].as_array_mut() {
            for gate in &info.scheduling_gates {
                let present = list.iter().any(|g| g["name"] == gate.name.as_str());
                if !present {
                    list.push(json!({"name": gate.name}));
                }
            }
        }
    }

    Ok(())
}

/* ============================= ANTI-AFFINITY ============================= */

/// True when any container or init container requests or limits `resource`
/// with a nonzero quantity.
pub fn pod_spec_requests_resource(spec: &Value, resource: &str) -> bool {
    for list in ["containers", "initContainers"] {
        let Some(containers) = spec[list].as_array() else {
            continue;
        };
        for container in containers {
            for section in ["requests", "limits"] {
                if let Some(amount) = container["resources"][section].get(resource) {
                    let quantity = match amount {
                        Value::String(s) => {
                            k8s_openapi::apimachinery::pkg::api::resource::Quantity(s.clone())
                        }
                        other => k8s_openapi::apimachinery::pkg::api::resource::Quantity(
                            other.to_string(),
                        ),
                    };
                    if quantity::is_nonzero(&quantity) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

/// Build node-affinity terms steering this pod set away from nodes whose
/// health labels flag a resource it consumes. `NoExecute`/`NoSchedule` rules
/// become required `NotIn` expressions; `PreferNoSchedule` rules become
/// preferred terms with the configured weight. Existing affinity is
/// preserved; identical expressions are not appended twice.
fn inject_anti_affinity(
    pod_template: &mut Value,
    autopilot: &AutopilotConfig,
) -> Result<(), InjectError> {
    // (key, values) pairs, grouped by label key per effect class
    let mut required: Vec<(String, Vec<String>)> = Vec::new();
    let mut preferred: Vec<(String, Vec<String>)> = Vec::new();

    {
        let spec = &pod_template["spec"];
        for (resource, rules) in &autopilot.resource_taints {
            if !pod_spec_requests_resource(spec, resource) {
                continue;
            }
            for rule in rules {
                let bucket = match rule.effect {
                    TaintEffect::NoExecute | TaintEffect::NoSchedule => &mut required,
                    TaintEffect::PreferNoSchedule => &mut preferred,
                };
                match bucket.iter_mut().find(|(key, _)| *key == rule.key) {
                    Some((_, values)) => {
                        if !values.contains(&rule.value) {
                            values.push(rule.value.clone());
                        }
                    }
                    None => bucket.push((rule.key.clone(), vec![rule.value.clone()])),
                }
            }
        }
    }

    if required.is_empty() && preferred.is_empty() {
        return Ok(());
    }

    let spec = resolve_spec(pod_template)?;
    spec.entry("affinity").or_insert_with(|| json!({}));
    let affinity = spec["affinity"]
        .as_object_mut()
        .ok_or_else(|| InjectError::NotAMap("spec.affinity".to_string()))?;
    affinity
        .entry("nodeAffinity")
        .or_insert_with(|| json!({}));
    let node_affinity = affinity["nodeAffinity"]
        .as_object_mut()
        .ok_or_else(|| InjectError::NotAMap("spec.affinity.nodeAffinity".to_string()))?;

    if !required.is_empty() {
        let selector = node_affinity
            .entry("requiredDuringSchedulingIgnoredDuringExecution")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| {
                InjectError::NotAMap("requiredDuringSchedulingIgnoredDuringExecution".to_string())
            })?;
        let terms = selector
            .entry("nodeSelectorTerms")
            .or_insert_with(|| json!([]))
            .as_array_mut()
            .ok_or_else(|| InjectError::NotAMap("nodeSelectorTerms".to_string()))?;
        if terms.is_empty() {
            terms.push(json!({}));
        }
        // new expressions join the first node-selector term
        let first = terms[0]
            .as_object_mut()
            .ok_or_else(|| InjectError::NotAMap("nodeSelectorTerms[0]".to_string()))?;
        let expressions = first
            .entry("matchExpressions")
            .or_insert_with(|| json!([]))
            .as_array_mut()
            .ok_or_else(|| InjectError::NotAMap("matchExpressions".to_string()))?;
        for (key, values) in &required {
            let expr = json!({"key": key, "operator": "NotIn", "values": values});
            if !expressions.contains(&expr) {
                expressions.push(expr);
            }
        }
    }

    if !preferred.is_empty() {
        let list = node_affinity
            .entry("preferredDuringSchedulingIgnoredDuringExecution")
            .or_insert_with(|| json!([]));
        if let Some(terms) = list.as_array_mut() {
            for (key, values) in &preferred {
                let term = json!({
                    "weight": autopilot.prefer_no_schedule_weight,
                    "preference": {
                        "matchExpressions": [
                            {"key": key, "operator": "NotIn", "values": values}
                        ]
                    }
                });
                if !terms.contains(&term) {
                    terms.push(term);
                }
            }
        }
    }

    Ok(())
}

/* ============================= DEFAULTING ============================= */

fn default_field(map: &mut serde_json::Map<String, Value>, key: &str, value: Value) {
    map.entry(key).or_insert(value);
}

fn apply_container_defaults(container: &mut Value) {
    let Some(map) = container.as_object_mut() else {
        return;
    };

    let image = map
        .get("image")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let pull_policy = if image.ends_with(":latest") || !image.contains(':') {
        "Always"
    } else {
        "IfNotPresent"
    };
    default_field(map, "imagePullPolicy", json!(pull_policy));
    default_field(map, "terminationMessagePath", json!("/dev/termination-log"));
    default_field(map, "terminationMessagePolicy", json!("File"));

    if let Some(ports) = map.get_mut("ports").and_then(Value::as_array_mut) {
        for port in ports {
            if let Some(port) = port.as_object_mut() {
                default_field(port, "protocol", json!("TCP"));
            }
        }
    }
}

fn apply_volume_defaults(volume: &mut Value) {
    let Some(map) = volume.as_object_mut() else {
        return;
    };
    if let Some(host_path) = map.get_mut("hostPath").and_then(Value::as_object_mut) {
        default_field(host_path, "type", json!(""));
    }
    if let Some(secret) = map.get_mut("secret").and_then(Value::as_object_mut) {
        default_field(secret, "defaultMode", json!(420));
    }
    if let Some(config_map) = map.get_mut("configMap").and_then(Value::as_object_mut) {
        default_field(config_map, "defaultMode", json!(420));
    }
}

/// Fill in the defaults the API server would apply to a pod spec, so that a
/// spec-derived template compares equal to what the server stores.
pub fn apply_pod_spec_defaults(pod_template: &mut Value) {
    let Some(spec) = pod_template
        .get_mut("spec")
        .and_then(Value::as_object_mut)
    else {
        return;
    };

    default_field(spec, "restartPolicy", json!("Always"));
    default_field(spec, "dnsPolicy", json!("ClusterFirst"));
    default_field(spec, "schedulerName", json!("default-scheduler"));
    default_field(spec, "terminationGracePeriodSeconds", json!(30));

    for list in ["containers", "initContainers"] {
        if let Some(containers) = spec.get_mut(list).and_then(Value::as_array_mut) {
            for container in containers {
                apply_container_defaults(container);
            }
        }
    }

    if let Some(volumes) = spec.get_mut("volumes").and_then(Value::as_array_mut) {
        for volume in volumes {
            apply_volume_defaults(volume);
        }
    }
}

/* ============================= TESTS ============================= */
