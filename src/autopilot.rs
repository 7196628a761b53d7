use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{AutopilotConfig, TaintEffect};
use crate::quantity;

/* ============================= CLASSIFICATION ============================= */

const UNREACHABLE_TAINT: &str = "node.kubernetes.io/unreachable";
const NOT_READY_TAINT: &str = "node.kubernetes.io/not-ready";

fn node_labels(node: &Node) -> Option<&BTreeMap<String, String>> {
    node.metadata.labels.as_ref()
}

fn node_capacity(node: &Node) -> Option<&BTreeMap<String, Quantity>> {
    node.status.as_ref().and_then(|s| s.capacity.as_ref())
}

fn has_rule_match(node: &Node, rules: &[crate::config::NodeTaintRule], effect: TaintEffect) -> bool {
    let Some(labels) = node_labels(node) else {
        return false;
    };
    rules
        .iter()
        .filter(|r| r.effect == effect)
        .any(|r| labels.get(&r.key) == Some(&r.value))
}

/// Resources on `node` whose health labels demand eviction, with the node's
/// capacity for each.
pub fn node_no_execute_resources(
    node: &Node,
    autopilot: &AutopilotConfig,
) -> BTreeMap<String, Quantity> {
    let mut flagged = BTreeMap::new();
    for (resource, rules) in &autopilot.resource_taints {
        if has_rule_match(node, rules, TaintEffect::NoExecute) {
            let capacity = node_capacity(node)
                .and_then(|c| c.get(resource))
                .cloned()
                .unwrap_or_else(|| Quantity("0".to_string()));
            flagged.insert(resource.clone(), capacity);
        }
    }
    flagged
}

/// The node's full capacity when nothing more should be scheduled on it:
/// cordoned, tainted unreachable/not-ready with NoExecute, or carrying a
/// health label that forbids scheduling onto one of its resources.
pub fn node_no_schedule_resources(
    node: &Node,
    autopilot: &AutopilotConfig,
) -> BTreeMap<String, Quantity> {
    let spec = node.spec.as_ref();

    let cordoned = spec.is_some_and(|s| s.unschedulable == Some(true));

    let tainted_unready = spec
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|taints| {
            taints.iter().any(|t| {
                (t.key == UNREACHABLE_TAINT || t.key == NOT_READY_TAINT)
                    && t.effect == "NoExecute"
            })
        });

    let health_flagged = autopilot.resource_taints.values().any(|rules| {
        has_rule_match(node, rules, TaintEffect::NoSchedule)
            || has_rule_match(node, rules, TaintEffect::NoExecute)
    });

    if cordoned || tainted_unready || health_flagged {
        node_capacity(node).cloned().unwrap_or_default()
    } else {
        BTreeMap::new()
    }
}

/* ============================= SHARED STATE ============================= */

type ResourceMap = BTreeMap<String, Quantity>;
type NodeMap = BTreeMap<String, ResourceMap>;

/// Cluster-global node-health maps. The node monitor is the sole writer;
/// the AppWrapper and slack-pool reconcilers read under the shared lock.
/// Changes are published as a coalescing signal on a capacity-1 channel.
pub struct NodeHealth {
    no_execute: RwLock<NodeMap>,
    no_schedule: RwLock<NodeMap>,
    events: mpsc::Sender<()>,
}

impl NodeHealth {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<()>) {
        let (events, rx) = mpsc::channel(1);
        (
            Arc::new(Self {
                no_execute: RwLock::new(BTreeMap::new()),
                no_schedule: RwLock::new(BTreeMap::new()),
                events,
            }),
            rx,
        )
    }

    /// Re-classify `node` and update both maps, diffing against the previous
    /// entries. Publishes a signal when either map changed.
    pub fn update_node(&self, node: &Node, autopilot: &AutopilotConfig) -> bool {
        let name = node.metadata.name.clone().unwrap_or_default();
        let no_execute = node_no_execute_resources(node, autopilot);
        let no_schedule = node_no_schedule_resources(node, autopilot);

        let changed_execute = Self::apply(&self.no_execute, &name, no_execute);
        let changed_schedule = Self::apply(&self.no_schedule, &name, no_schedule);
        let changed = changed_execute || changed_schedule;

        if changed {
            info!(node = %name, "node_health_changed");
            self.publish();
        }
        changed
    }

    /// Drop a deleted node from both maps.
    pub fn remove_node(&self, name: &str) -> bool {
        let removed_execute = Self::remove(&self.no_execute, name);
        let removed_schedule = Self::remove(&self.no_schedule, name);
        let changed = removed_execute || removed_schedule;
        if changed {
            info!(node = %name, "node_health_entry_removed");
            self.publish();
        }
        changed
    }

    fn apply(map: &RwLock<NodeMap>, name: &str, resources: ResourceMap) -> bool {
        let mut guard = map.write().unwrap_or_else(|e| e.into_inner());
        if resources.is_empty() {
            guard.remove(name).is_some()
        } else if guard.get(name) == Some(&resources) {
            false
        } else {
            guard.insert(name.to_string(), resources);
            true
        }
    }

    fn remove(map: &RwLock<NodeMap>, name: &str) -> bool {
        let mut guard = map.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(name).is_some()
    }

    // Non-blocking: a full buffer means a wake-up is already pending, and the
    // receiver re-reads both maps on every wake-up.
    fn publish(&self) {
        let _ = self.events.try_send(());
    }

    /// Snapshot of the no-execute map for pod-status evaluation.
    pub fn no_execute_snapshot(&self) -> NodeMap {
        self.no_execute
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn no_schedule_snapshot(&self) -> NodeMap {
        self.no_schedule
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Total unschedulable quantity per resource, in milli-units, aggregated
    /// across all no-schedule nodes.
    pub fn unschedulable_totals(&self) -> BTreeMap<String, i64> {
        let guard = self.no_schedule.read().unwrap_or_else(|e| e.into_inner());
        let mut totals = BTreeMap::new();
        for resources in guard.values() {
            for (resource, amount) in resources {
                let entry = totals.entry(resource.clone()).or_insert(0i64);
                quantity::accumulate(entry, amount);
            }
        }
        totals
    }
}

/* ============================= TESTS ============================= */
