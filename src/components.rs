use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, ResourceExt};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::annotations::WrapperParams;
use crate::config::OperatorConfig;
use crate::crd::{
    APPWRAPPER_LABEL, AppWrapper, AppWrapperComponentStatus, AppWrapperCondition,
    AppWrapperPodSet, AppWrapperStatus, ConditionType, condition, reasons, set_condition,
};
use crate::inject::{InjectionContext, inject_component};
use crate::podsets::{PodSetError, infer_pod_sets, template_type_meta};

pub const FIELD_MANAGER: &str = "kube-appwrapper-operator";

/* ============================= ERRORS ============================= */

/// Create errors split by whether the admission grace window applies.
/// Fatal errors fail the AppWrapper without retries.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("{0}")]
    Fatal(String),

    #[error("{0}")]
    Transient(String),
}

fn classify_create_error(err: kube::Error) -> ComponentError {
    match &err {
        kube::Error::Api(resp) if matches!(resp.code, 400 | 404 | 405 | 422) => {
            ComponentError::Fatal(resp.message.clone())
        }
        _ => ComponentError::Transient(err.to_string()),
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists")
}

/* ============================= STATUS MIRROR ============================= */

fn component_pod_sets(component: &crate::crd::AppWrapperComponent) -> Vec<AppWrapperPodSet> {
    if !component.declared_pod_sets.is_empty() {
        component.declared_pod_sets.clone()
    } else {
        infer_pod_sets(&component.template)
            .ok()
            .flatten()
            .unwrap_or_default()
    }
}

/// Build the status mirror of the spec components, recorded once when the
/// AppWrapper leaves the Empty phase.
pub fn init_component_status(
    aw: &AppWrapper,
) -> Result<Vec<AppWrapperComponentStatus>, PodSetError> {
    aw.spec
        .components
        .iter()
        .map(|component| {
            let (api_version, kind) = template_type_meta(&component.template)?;
            let name = component.template["metadata"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            Ok(AppWrapperComponentStatus {
                name,
                kind,
                api_version,
                pod_sets: component_pod_sets(component),
                conditions: Vec::new(),
            })
        })
        .collect()
}

fn component_deployed(entry: &AppWrapperComponentStatus) -> Option<bool> {
    condition(&entry.conditions, ConditionType::ResourcesDeployed).map(|c| c.status)
}

/* ============================= MATERIALIZATION ============================= */

fn parse_gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

/// Materialize one component: clone the template, inject the AppWrapper's
/// metadata, and turn it into a dynamic object ready for Create.
pub fn build_component_object(
    aw: &AppWrapper,
    config: &OperatorConfig,
    index: usize,
) -> Result<(ApiResource, DynamicObject), ComponentError> {
    let component = &aw.spec.components[index];
    let namespace = aw.namespace().unwrap_or_default();

    let (api_version, kind) =
        template_type_meta(&component.template).map_err(|e| ComponentError::Fatal(e.to_string()))?;

    if let Some(template_ns) = component.template["metadata"]["namespace"].as_str()
        && template_ns != namespace
    {
        return Err(ComponentError::Fatal(format!(
            "component {index} names namespace '{template_ns}' but the AppWrapper is in '{namespace}'"
        )));
    }

    let mut template: Value = component.template.clone();

    let queue_name = if config.enable_kueue_integrations {
        aw.labels().get(crate::crd::QUEUE_NAME_LABEL).cloned()
    } else {
        None
    };
    let ctx = InjectionContext {
        aw_name: &aw.name_any(),
        aw_uid: aw.metadata.uid.as_deref().unwrap_or_default(),
        queue_name: queue_name.as_deref(),
        scheduler_name: config.scheduler_name.as_deref(),
        autopilot: &config.autopilot,
    };
    inject_component(
        &mut template,
        &ctx,
        &component_pod_sets(component),
        &component.pod_set_infos,
    )
    .map_err(|e| ComponentError::Fatal(e.to_string()))?;

    let object: DynamicObject = serde_json::from_value(template)
        .map_err(|e| ComponentError::Fatal(format!("component {index} is not a valid object: {e}")))?;
    if object.metadata.name.is_none() {
        return Err(ComponentError::Fatal(format!(
            "component {index} template has no metadata.name"
        )));
    }

    Ok((ApiResource::from_gvk(&parse_gvk(&api_version, &kind)), object))
}

/* ============================= CREATE ============================= */

fn owned_by(object: &DynamicObject, aw: &AppWrapper) -> bool {
    let aw_uid = aw.metadata.uid.as_deref().unwrap_or_default();
    object
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| {
            owners
                .iter()
                .any(|o| o.controller == Some(true) && o.uid == aw_uid)
        })
}

/// Create every component not yet marked deployed, patching per-component
/// success into status between creates so progress survives a later
/// conflict. The caller must pass a status freshly read in this reconcile.
pub async fn create_components(
    client: &Client,
    config: &OperatorConfig,
    aw: &AppWrapper,
    status: &mut AppWrapperStatus,
    now: DateTime<Utc>,
) -> Result<(), ComponentError> {
    let namespace = aw.namespace().unwrap_or_default();
    let name = aw.name_any();
    let wrappers: Api<AppWrapper> = Api::namespaced(client.clone(), &namespace);

    for index in 0..aw.spec.components.len() {
        if status
            .component_status
            .get(index)
            .and_then(component_deployed)
            == Some(true)
        {
            continue;
        }

        let (resource, object) = build_component_object(aw, config, index)?;
        let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), &namespace, &resource);
        let object_name = object.name_any();

        match api.create(&PostParams::default(), &object).await {
            Ok(_) => {
                info!(appwrapper = %name, component = %object_name, "component_created");
            }
            Err(err) if is_already_exists(&err) => {
                let existing = api
                    .get(&object_name)
                    .await
                    .map_err(|e| ComponentError::Transient(e.to_string()))?;
                if !owned_by(&existing, aw) {
                    return Err(ComponentError::Fatal(format!(
                        "component {object_name} exists but is not controlled by this AppWrapper"
                    )));
                }
                info!(appwrapper = %name, component = %object_name, "component_adopted");
            }
            Err(err) => return Err(classify_create_error(err)),
        }

        if let Some(entry) = status.component_status.get_mut(index) {
            set_condition(
                &mut entry.conditions,
                AppWrapperCondition::new(ConditionType::ResourcesDeployed, true, now)
                    .with_reason(reasons::COMPONENT_CREATED),
            );
        }

        // incremental patch so a conflict on a later component keeps progress
        wrappers
            .patch_status(
                &name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(serde_json::json!({"status": status})),
            )
            .await
            .map_err(|e| ComponentError::Transient(e.to_string()))?;
    }

    Ok(())
}

/* ============================= DELETE ============================= */

pub async fn list_wrapper_pods(
    client: &Client,
    namespace: &str,
    aw_name: &str,
) -> Result<Vec<Pod>, kube::Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(&format!("{APPWRAPPER_LABEL}={aw_name}"));
    Ok(pods.list(&params).await?.items)
}

/// Delete all wrapped resources with background propagation, escalating to
/// forced deletion (labeled pods first, then residual objects) once the
/// forceful grace expires. Returns true when nothing remains.
pub async fn delete_components(
    client: &Client,
    aw: &AppWrapper,
    status: &mut AppWrapperStatus,
    params: &WrapperParams,
    now: DateTime<Utc>,
) -> Result<bool, kube::Error> {
    let namespace = aw.namespace().unwrap_or_default();
    let aw_name = aw.name_any();

    set_condition(
        &mut status.conditions,
        AppWrapperCondition::new(ConditionType::DeletingResources, true, now)
            .with_reason(reasons::DELETION_INITIATED),
    );
    let deleting_since =
        crate::crd::condition_transitioned_at(&status.conditions, ConditionType::DeletingResources)
            .unwrap_or(now);
    let force = now >= deleting_since + params.forceful_deletion_grace_period;

    let pods = list_wrapper_pods(client, &namespace, &aw_name).await?;

    if force && !pods.is_empty() {
        let pod_api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        for pod in &pods {
            let pod_name = pod.name_any();
            warn!(appwrapper = %aw_name, pod = %pod_name, "force_deleting_pod");
            match pod_api
                .delete(&pod_name, &DeleteParams::default().grace_period(0))
                .await
            {
                Ok(_) => {}
                Err(err) if is_not_found(&err) => {}
                Err(err) => return Err(err),
            }
        }
        // residual objects are only force-deleted once the pods are gone
        return Ok(false);
    }

    let mut remaining = false;
    for entry in &mut status.component_status {
        if component_deployed(entry) == Some(false) {
            continue;
        }

        let resource = ApiResource::from_gvk(&parse_gvk(&entry.api_version, &entry.kind));
        let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), &namespace, &resource);
        let delete_params = if force {
            DeleteParams::background().grace_period(0)
        } else {
            DeleteParams::background()
        };

        match api.delete(&entry.name, &delete_params).await {
            Ok(_) => {
                remaining = true;
            }
            Err(err) if is_not_found(&err) => {
                set_condition(
                    &mut entry.conditions,
                    AppWrapperCondition::new(ConditionType::ResourcesDeployed, false, now)
                        .with_reason(reasons::COMPONENT_DELETED),
                );
            }
            Err(err) => return Err(err),
        }
    }

    Ok(!remaining && pods.is_empty())
}

/* ============================= COMPONENT PROBING ============================= */

/// Live-object probe of the recorded components.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentProbe {
    pub deployed: usize,
    pub failed: Vec<String>,
}

fn has_failed_condition(object: &DynamicObject) -> bool {
    object.data["status"]["conditions"]
        .as_array()
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c["type"] == "Failed" && c["status"] == "True")
        })
}

/// Probe each deployed component's backing object. Batch jobs and training
/// jobs report failure through a `Failed=True` condition. RayCluster and
/// RayJob transiently report failed before ready, so for those kinds only
/// deployment is counted. NotFound is ignored.
pub async fn get_component_status(
    client: &Client,
    namespace: &str,
    status: &AppWrapperStatus,
) -> Result<ComponentProbe, kube::Error> {
    let mut probe = ComponentProbe::default();

    for entry in &status.component_status {
        if component_deployed(entry) != Some(true) {
            continue;
        }

        let resource = ApiResource::from_gvk(&parse_gvk(&entry.api_version, &entry.kind));
        let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &resource);

        match entry.kind.as_str() {
            "Job" | "PyTorchJob" => {
                if let Some(object) = api.get_opt(&entry.name).await? {
                    probe.deployed += 1;
                    if has_failed_condition(&object) {
                        probe.failed.push(entry.name.clone());
                    }
                }
            }
            _ => {
                if api.get_metadata_opt(&entry.name).await?.is_some() {
                    probe.deployed += 1;
                }
            }
        }
    }

    Ok(probe)
}

/* ============================= TESTS ============================= */
