use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= IDENTITY ============================= */

/// API group shared by both custom resources.
pub const GROUP: &str = "workload.stochastic.io";

/// Finalizer held while wrapped resources may still exist.
pub const FINALIZER: &str = "workload.stochastic.io/finalizer";

/// Label stamped on every wrapped resource and every pod it spawns.
pub const APPWRAPPER_LABEL: &str = "workload.stochastic.io/appwrapper";

/// Queue-name label used when quota-manager integration is enabled.
pub const QUEUE_NAME_LABEL: &str = "kueue.x-k8s.io/queue-name";

/* ============================= PHASE ============================= */

/// Lifecycle phase of an AppWrapper.
///
/// `Empty` is the unset phase of a freshly created object. `Terminating` is a
/// presentation phase shown while deletion is pending under the finalizer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum AppWrapperPhase {
    #[default]
    Empty,
    Suspended,
    Resuming,
    Running,
    Suspending,
    Resetting,
    Succeeded,
    Failed,
    Terminating,
}

impl std::fmt::Display for AppWrapperPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/* ============================= CONDITIONS ============================= */

/// Closed set of condition types tracked on an AppWrapper and its components.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    QuotaReserved,
    ResourcesDeployed,
    PodsReady,
    Unhealthy,
    DeletingResources,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Condition reasons surfaced in status and events.
pub mod reasons {
    pub const COMPONENT_CREATED: &str = "ComponentCreatedSuccessfully";
    pub const COMPONENT_DELETED: &str = "ComponentDeleted";
    pub const CREATE_FAILED: &str = "CreateFailed";
    pub const FOUND_FAILED_PODS: &str = "FoundFailedPods";
    pub const FAILED_COMPONENT: &str = "FailedComponent";
    pub const MISSING_COMPONENT: &str = "MissingComponent";
    pub const INSUFFICIENT_PODS_READY: &str = "InsufficientPodsReady";
    pub const AUTOPILOT_UNHEALTHY: &str = "AutopilotUnhealthy";
    pub const DELETION_INITIATED: &str = "DeletionInitiated";
}

/// A latched condition. `last_transition_time` drives all grace-period
/// arithmetic, so it must stay stable across identical observations.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppWrapperCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    pub status: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub last_transition_time: Time,
}

impl AppWrapperCondition {
    pub fn new(condition_type: ConditionType, status: bool, now: DateTime<Utc>) -> Self {
        Self {
            condition_type,
            status,
            reason: None,
            message: None,
            last_transition_time: Time(now),
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Upsert `cond` into `conditions`, preserving `last_transition_time` when
/// neither the status nor the reason changed (only the message is refreshed).
pub fn set_condition(conditions: &mut Vec<AppWrapperCondition>, cond: AppWrapperCondition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == cond.condition_type)
    {
        Some(existing) => {
            if existing.status == cond.status && existing.reason == cond.reason {
                existing.message = cond.message;
            } else {
                *existing = cond;
            }
        }
        None => conditions.push(cond),
    }
}

pub fn condition_is_true(conditions: &[AppWrapperCondition], t: ConditionType) -> bool {
    conditions.iter().any(|c| c.condition_type == t && c.status)
}

pub fn condition(
    conditions: &[AppWrapperCondition],
    t: ConditionType,
) -> Option<&AppWrapperCondition> {
    conditions.iter().find(|c| c.condition_type == t)
}

/// Transition time of a condition, regardless of its current status.
pub fn condition_transitioned_at(
    conditions: &[AppWrapperCondition],
    t: ConditionType,
) -> Option<DateTime<Utc>> {
    condition(conditions, t).map(|c| c.last_transition_time.0)
}

/* ============================= SPEC ============================= */

/// A dotted/indexed path into a component template plus a replica count.
///
/// The path grammar is `template (.field | [int])*` and must resolve to a
/// pod-template-spec inside the component's template.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppWrapperPodSet {
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl AppWrapperPodSet {
    pub fn new(path: &str, replicas: Option<i32>) -> Self {
        Self {
            path: path.to_string(),
            replicas,
        }
    }
}

/// A scheduling gate by name (deduplicated on injection).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingGate {
    pub name: String,
}

/// Per-pod-set overrides written by the quota manager just before admission.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodSetInfo {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scheduling_gates: Vec<SchedulingGate>,
}

/// One wrapped resource: an opaque template plus its declared pod sets.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppWrapperComponent {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// The resource document to be created once quota is reserved.
    #[schemars(schema_with = "preserve_unknown_fields_schema")]
    pub template: serde_json::Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub declared_pod_sets: Vec<AppWrapperPodSet>,

    /// Populated by the quota manager; cleared again on restore.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_set_infos: Vec<PodSetInfo>,
}

/// AppWrapper groups heterogeneous workloads into one admission unit.
///
/// The spec is immutable after admission except for `suspend` (requested by
/// the quota manager) and the quota-manager-owned `podSetInfos`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "workload.stochastic.io",
    version = "v1",
    kind = "AppWrapper",
    plural = "appwrappers",
    shortname = "aw",
    status = "AppWrapperStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AppWrapperSpec {
    /// When true the workload must not run; wrapped resources are removed.
    #[serde(default)]
    pub suspend: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_by: Option<String>,

    pub components: Vec<AppWrapperComponent>,
}

fn preserve_unknown_fields_schema(
    _: &mut schemars::r#gen::SchemaGenerator,
) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    }))
    .expect("static schema is valid")
}

/* ============================= STATUS ============================= */

/// Mirror of one spec component, carrying its deployment state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppWrapperComponentStatus {
    pub name: String,
    pub kind: String,
    pub api_version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_sets: Vec<AppWrapperPodSet>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<AppWrapperCondition>,
}

/// Observed state; written only by the reconciler via merge patches.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppWrapperStatus {
    #[serde(default)]
    pub phase: AppWrapperPhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<AppWrapperCondition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_status: Vec<AppWrapperComponentStatus>,

    /// Count of reset cycles consumed; never decreases.
    #[serde(default)]
    pub retries: i32,
}

impl AppWrapper {
    pub fn phase(&self) -> AppWrapperPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn condition_is_true(&self, t: ConditionType) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| condition_is_true(&s.conditions, t))
    }

    pub fn condition_transitioned_at(&self, t: ConditionType) -> Option<DateTime<Utc>> {
        self.status
            .as_ref()
            .and_then(|s| condition_transitioned_at(&s.conditions, t))
    }

    /// Expected pod count: Σ replicas over the recorded component pod sets.
    pub fn expected_pod_count(&self) -> i32 {
        self.status
            .as_ref()
            .map(|s| {
                s.component_status
                    .iter()
                    .flat_map(|c| &c.pod_sets)
                    .map(|ps| ps.replicas.unwrap_or(1))
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Total declared pod sets across all components.
    pub fn pod_set_count(&self) -> usize {
        self.spec
            .components
            .iter()
            .map(|c| c.declared_pod_sets.len())
            .sum()
    }
}

/* ============================= QUOTA POOL ============================= */

/// One resource's quota within a flavor of a quota pool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuota {
    pub name: String,

    pub nominal_quota: Quantity,

    /// Ceiling on capacity lent to other pools; absent means "no cap".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lending_limit: Option<Quantity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FlavorQuotas {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceQuota>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub covered_resources: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flavors: Vec<FlavorQuotas>,
}

/// QuotaPool models the shared "slack" capacity pool whose lending limit the
/// operator adjusts as node health changes. Only the first flavor of the
/// first resource group is managed.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "workload.stochastic.io",
    version = "v1",
    kind = "QuotaPool",
    plural = "quotapools"
)]
#[serde(rename_all = "camelCase")]
pub struct QuotaPoolSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohort: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_groups: Vec<ResourceGroup>,
}

/* ============================= TESTS ============================= */
