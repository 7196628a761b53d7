use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::annotations::WrapperParams;
use crate::quantity;

/* ============================= SUMMARY ============================= */

/// Aggregate health of the pods labeled with one AppWrapper.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodStatusSummary {
    pub pending: i32,
    pub running: i32,
    pub succeeded: i32,
    pub failed: i32,

    /// A failed pod exited with a code that forbids retry.
    pub terminal_failure: bool,

    /// No-execute nodes hosting running pods that consume a flagged resource.
    pub unhealthy_nodes: BTreeSet<String>,
}

impl PodStatusSummary {
    /// All expected pods ran to completion and nothing is left behind.
    pub fn all_succeeded(&self, expected: i32) -> bool {
        self.succeeded >= expected && self.pending == 0 && self.running == 0 && self.failed == 0
    }

    /// Enough pods are running or already done to call the workload ready.
    pub fn ready(&self, expected: i32) -> bool {
        self.running + self.succeeded >= expected
    }
}

/* ============================= EXIT CODES ============================= */

/// Decide whether a nonzero exit code is terminal under the AppWrapper's
/// exit-code annotations: listed in `terminalExitCodes`, or absent from
/// `retryableExitCodes` when that list is given.
pub fn is_terminal_exit_code(params: &WrapperParams, code: i32) -> bool {
    if code == 0 {
        return false;
    }
    if let Some(terminal) = &params.terminal_exit_codes
        && terminal.contains(&code)
    {
        return true;
    }
    if let Some(retryable) = &params.retryable_exit_codes
        && !retryable.contains(&code)
    {
        return true;
    }
    false
}

fn pod_terminal_failure(pod: &Pod, params: &WrapperParams) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    for statuses in [&status.container_statuses, &status.init_container_statuses] {
        let Some(statuses) = statuses else { continue };
        for cs in statuses {
            if let Some(state) = &cs.state
                && let Some(terminated) = &state.terminated
                && is_terminal_exit_code(params, terminated.exit_code)
            {
                return true;
            }
        }
    }
    false
}

/* ============================= NODE HEALTH ============================= */

fn container_uses_resource(container: &Container, resource: &str) -> bool {
    let Some(resources) = &container.resources else {
        return false;
    };
    for section in [&resources.requests, &resources.limits] {
        if let Some(map) = section
            && let Some(amount) = map.get(resource)
            && quantity::is_nonzero(amount)
        {
            return true;
        }
    }
    false
}

fn pod_uses_flagged_resource(pod: &Pod, flagged: &BTreeMap<String, Quantity>) -> bool {
    let Some(spec) = &pod.spec else {
        return false;
    };
    let containers = spec.containers.iter();
    let init_containers = spec.init_containers.iter().flatten();
    for container in containers.chain(init_containers) {
        if flagged
            .keys()
            .any(|resource| container_uses_resource(container, resource))
        {
            return true;
        }
    }
    false
}

/* ============================= AGGREGATION ============================= */

/// Classify the AppWrapper's pods by phase and arbitrate failures.
///
/// `no_execute_nodes` is a snapshot of the cluster-global no-execute map; a
/// running pod on such a node that consumes a flagged resource marks the node
/// unhealthy for this AppWrapper.
pub fn summarize_pods(
    pods: &[Pod],
    params: &WrapperParams,
    no_execute_nodes: &BTreeMap<String, BTreeMap<String, Quantity>>,
) -> PodStatusSummary {
    let mut summary = PodStatusSummary::default();

    for pod in pods {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Pending");

        match phase {
            "Succeeded" => summary.succeeded += 1,
            "Running" => {
                summary.running += 1;
                if let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
                    && let Some(flagged) = no_execute_nodes.get(node_name)
                    && pod_uses_flagged_resource(pod, flagged)
                {
                    summary.unhealthy_nodes.insert(node_name.to_string());
                }
            }
            "Failed" => {
                summary.failed += 1;
                if pod_terminal_failure(pod, params) {
                    summary.terminal_failure = true;
                }
            }
            _ => summary.pending += 1,
        }
    }

    summary
}

/* ============================= TESTS ============================= */
