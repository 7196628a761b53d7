use serde_json::Value;
use thiserror::Error;

use crate::crd::{AppWrapper, AppWrapperPhase, ConditionType, PodSetInfo};
use crate::podsets::{PathError, resolve_path};

/* ============================= TYPES ============================= */

/// One pod set as the quota manager sizes it: a resolved pod-template-spec
/// plus its replica count.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadPodSet {
    pub name: String,
    pub template: Value,
    pub count: i32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("expected {expected} pod set infos, got {given}")]
    InfoCountMismatch { given: usize, expected: usize },

    #[error(transparent)]
    Path(#[from] PathError),
}

/* ============================= CONTRACT ============================= */

/// The surface the quota manager drives an AppWrapper through: inspect its
/// pod sets, inject per-pod-set overrides, flip suspension, and read the
/// terminal verdict.
pub trait QuotaManagedWorkload {
    fn pod_sets(&self) -> Result<Vec<WorkloadPodSet>, WorkloadError>;
    fn is_suspended(&self) -> bool;
    fn is_active(&self) -> bool;
    fn suspend(&mut self);
    fn run_with_pod_sets_info(&mut self, infos: Vec<PodSetInfo>) -> Result<(), WorkloadError>;
    fn restore_pod_sets_info(&mut self);
    /// `(message, success, finished)`; a Failed AppWrapper still tearing
    /// down its resources is not yet finished.
    fn finished(&self) -> (String, bool, bool);
    fn pods_ready(&self) -> bool;
}

impl QuotaManagedWorkload for AppWrapper {
    fn pod_sets(&self) -> Result<Vec<WorkloadPodSet>, WorkloadError> {
        let mut sets = Vec::new();
        for (index, component) in self.spec.components.iter().enumerate() {
            // prefer the recorded mirror; fall back to the declaration
            let recorded = self
                .status
                .as_ref()
                .and_then(|s| s.component_status.get(index));
            let (name, pod_sets) = match recorded {
                Some(entry) => (entry.name.clone(), &entry.pod_sets),
                None => (
                    component.template["metadata"]["name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    &component.declared_pod_sets,
                ),
            };

            for (j, pod_set) in pod_sets.iter().enumerate() {
                let template = resolve_path(&component.template, &pod_set.path)?;
                sets.push(WorkloadPodSet {
                    name: format!("{name}-{j}"),
                    template: template.clone(),
                    count: pod_set.replicas.unwrap_or(1),
                });
            }
        }
        Ok(sets)
    }

    fn is_suspended(&self) -> bool {
        self.spec.suspend
    }

    fn is_active(&self) -> bool {
        self.condition_is_true(ConditionType::QuotaReserved)
    }

    fn suspend(&mut self) {
        self.spec.suspend = true;
    }

    fn run_with_pod_sets_info(&mut self, infos: Vec<PodSetInfo>) -> Result<(), WorkloadError> {
        let expected = self.pod_set_count();
        if infos.len() != expected {
            return Err(WorkloadError::InfoCountMismatch {
                given: infos.len(),
                expected,
            });
        }

        let mut remaining = infos;
        for component in &mut self.spec.components {
            let take = component.declared_pod_sets.len();
            component.pod_set_infos = remaining.drain(..take).collect();
        }

        self.spec.suspend = false;
        Ok(())
    }

    fn restore_pod_sets_info(&mut self) {
        for component in &mut self.spec.components {
            component.pod_set_infos.clear();
        }
    }

    fn finished(&self) -> (String, bool, bool) {
        let resources_deployed = self.condition_is_true(ConditionType::ResourcesDeployed);
        match self.phase() {
            AppWrapperPhase::Succeeded => {
                ("AppWrapper finished successfully".to_string(), true, true)
            }
            AppWrapperPhase::Failed if resources_deployed => (
                "AppWrapper failed; resources are still being removed".to_string(),
                false,
                false,
            ),
            AppWrapperPhase::Failed => ("AppWrapper failed".to_string(), false, true),
            _ => (String::new(), false, false),
        }
    }

    fn pods_ready(&self) -> bool {
        self.condition_is_true(ConditionType::PodsReady)
    }
}

/* ============================= TESTS ============================= */
