use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/* ============================= TAINT RULES ============================= */

/// Taint effect attached to a node-health rule.
///
/// `NoExecute` rules feed the no-execute map (workloads must be evicted),
/// `NoSchedule` rules feed the no-schedule map, and `PreferNoSchedule` rules
/// only shape preferred anti-affinity terms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaintEffect {
    NoSchedule,
    NoExecute,
    PreferNoSchedule,
}

/// One health-label rule for a resource: a node carrying `key: value` has the
/// resource in the state implied by `effect`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTaintRule {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

/* ============================= FAULT TOLERANCE ============================= */

/// Operator-wide defaults for grace periods and retries. Individual
/// AppWrappers may override these via annotations, clamped to
/// `grace_period_maximum`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FaultToleranceConfig {
    #[serde(with = "humantime_serde")]
    pub admission_grace_period: Duration,

    #[serde(with = "humantime_serde")]
    pub warmup_grace_period: Duration,

    #[serde(with = "humantime_serde")]
    pub failure_grace_period: Duration,

    #[serde(with = "humantime_serde")]
    pub retry_pause_period: Duration,

    pub retry_limit: i32,

    #[serde(with = "humantime_serde")]
    pub forceful_deletion_grace_period: Duration,

    /// Hold window before a Failed AppWrapper's resources are removed.
    #[serde(with = "humantime_serde")]
    pub deletion_on_failure_grace_period: Duration,

    /// Zero means resources of a Succeeded AppWrapper are kept forever.
    #[serde(with = "humantime_serde")]
    pub success_ttl: Duration,

    /// Upper bound for every annotation-supplied grace period.
    #[serde(with = "humantime_serde")]
    pub grace_period_maximum: Duration,
}

impl Default for FaultToleranceConfig {
    fn default() -> Self {
        Self {
            admission_grace_period: Duration::from_secs(60),
            warmup_grace_period: Duration::from_secs(5 * 60),
            failure_grace_period: Duration::from_secs(60),
            retry_pause_period: Duration::from_secs(90),
            retry_limit: 3,
            forceful_deletion_grace_period: Duration::from_secs(10 * 60),
            deletion_on_failure_grace_period: Duration::ZERO,
            success_ttl: Duration::ZERO,
            grace_period_maximum: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/* ============================= AUTOPILOT ============================= */

/// Node-health policy: which labels flag a resource unhealthy and whether the
/// operator steers pods away from flagged nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AutopilotConfig {
    pub monitor_nodes: bool,

    pub inject_anti_affinities: bool,

    /// Weight of preferred anti-affinity terms built from PreferNoSchedule rules.
    pub prefer_no_schedule_weight: i32,

    /// resource name → health-label rules for that resource.
    #[serde(alias = "resourceUnhealthyConfig")]
    pub resource_taints: BTreeMap<String, Vec<NodeTaintRule>>,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        let gpu_rules = vec![
            NodeTaintRule {
                key: "autopilot.stochastic.io/gpuhealth".to_string(),
                value: "ERR".to_string(),
                effect: TaintEffect::NoSchedule,
            },
            NodeTaintRule {
                key: "autopilot.stochastic.io/gpuhealth".to_string(),
                value: "TESTING".to_string(),
                effect: TaintEffect::NoSchedule,
            },
            NodeTaintRule {
                key: "autopilot.stochastic.io/gpuhealth".to_string(),
                value: "EVICT".to_string(),
                effect: TaintEffect::NoExecute,
            },
        ];

        Self {
            monitor_nodes: true,
            inject_anti_affinities: true,
            prefer_no_schedule_weight: 1,
            resource_taints: BTreeMap::from([("nvidia.com/gpu".to_string(), gpu_rules)]),
        }
    }
}

impl AutopilotConfig {
    /// Rules for a resource, empty when the resource is not monitored.
    pub fn rules_for(&self, resource: &str) -> &[NodeTaintRule] {
        self.resource_taints
            .get(resource)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/* ============================= OPERATOR CONFIG ============================= */

/// Top-level operator configuration, loaded from the mounted `config.yaml`.
/// Every field has a default so a missing or partial file is usable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// Cooperate with the quota manager and propagate child-workload admission.
    pub enable_kueue_integrations: bool,

    /// Accept AppWrappers lacking a queue-name label.
    pub manage_jobs_without_queue_name: bool,

    /// Queue label injected by the admission webhook when none is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_queue_name: Option<String>,

    /// Scheduler injected into pod specs that do not name one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,

    /// Name of the QuotaPool whose lending limit tracks node health.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack_queue_name: Option<String>,

    /// Enable the webhook's SubjectAccessReview pass.
    pub user_rbac_admission_check: bool,

    pub fault_tolerance: FaultToleranceConfig,

    pub autopilot: AutopilotConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            enable_kueue_integrations: true,
            manage_jobs_without_queue_name: true,
            default_queue_name: None,
            scheduler_name: None,
            slack_queue_name: None,
            user_rbac_admission_check: true,
            fault_tolerance: FaultToleranceConfig::default(),
            autopilot: AutopilotConfig::default(),
        }
    }
}

impl OperatorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("Failed to parse operator config YAML")
    }
}

/* ============================= TESTS ============================= */
