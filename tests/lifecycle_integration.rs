mod common;

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{make_pod, make_wrapper, pod_component, t, with_exit_code};

use kube_appwrapper::annotations::{RETRY_LIMIT, WrapperParams};
use kube_appwrapper::components::ComponentProbe;
use kube_appwrapper::config::FaultToleranceConfig;
use kube_appwrapper::controller::{
    CreateOutcome, RetentionStep, RunningContext, StepPlan, plan_failed, plan_resuming,
    plan_running, plan_succeeded, resume_allowed,
};
use kube_appwrapper::crd::{
    AppWrapper, AppWrapperCondition, AppWrapperPhase, AppWrapperStatus, ConditionType, PodSetInfo,
    condition_is_true, reasons, set_condition,
};
use kube_appwrapper::podstatus::{PodStatusSummary, summarize_pods};
use kube_appwrapper::workload::QuotaManagedWorkload;

// ══════════════════════════════════════════════════════════════════
// Lifecycle integration tests (no cluster required)
//
// Drives the per-AppWrapper state machine through full phase traces by
// feeding the pure phase planners the observations a live reconciler
// would gather, mirroring the orchestrator's condition bookkeeping.
// ══════════════════════════════════════════════════════════════════

/// Minimal in-memory double of the reconcile loop: holds the wrapper,
/// its status, and a fake clock, and applies planner decisions the way
/// the orchestrator does.
struct Harness {
    aw: AppWrapper,
    status: AppWrapperStatus,
    params: WrapperParams,
    now: DateTime<Utc>,
    trace: Vec<AppWrapperPhase>,
}

impl Harness {
    fn new(aw: AppWrapper) -> Self {
        let params = WrapperParams::for_wrapper(&FaultToleranceConfig::default(), &aw);
        Self {
            aw,
            status: AppWrapperStatus::default(),
            params,
            now: t(0),
            trace: vec![AppWrapperPhase::Empty],
        }
    }

    fn tick(&mut self, seconds: i64) {
        self.now += chrono::Duration::seconds(seconds);
    }

    fn set_conditions(&mut self, entries: &[(ConditionType, bool)]) {
        for (condition_type, value) in entries {
            set_condition(
                &mut self.status.conditions,
                AppWrapperCondition::new(*condition_type, *value, self.now),
            );
        }
    }

    fn enter(&mut self, phase: AppWrapperPhase) {
        self.status.phase = phase;
        self.trace.push(phase);
    }

    fn apply(&mut self, plan: &StepPlan) {
        self.status.retries += plan.retries_increment;
        if let Some(report) = &plan.unhealthy {
            set_condition(
                &mut self.status.conditions,
                AppWrapperCondition::new(ConditionType::Unhealthy, true, self.now)
                    .with_reason(report.reason)
                    .with_message(report.message.clone()),
            );
        }
        if let Some(ready) = plan.pods_ready {
            set_condition(
                &mut self.status.conditions,
                AppWrapperCondition::new(ConditionType::PodsReady, ready, self.now),
            );
        }
        if plan.phase != self.status.phase {
            self.enter(plan.phase);
        }
        if matches!(
            plan.phase,
            AppWrapperPhase::Succeeded | AppWrapperPhase::Failed
        ) {
            self.set_conditions(&[(ConditionType::QuotaReserved, false)]);
        }
    }

    // Empty → Suspended: finalizer taken, mirror recorded, conditions seeded.
    fn reconcile_empty(&mut self) {
        self.status.component_status =
            kube_appwrapper::components::init_component_status(&self.aw)
                .expect("components should mirror");
        self.set_conditions(&[
            (ConditionType::QuotaReserved, false),
            (ConditionType::ResourcesDeployed, false),
        ]);
        self.enter(AppWrapperPhase::Suspended);
    }

    // Suspended → Resuming once the quota manager clears suspend.
    fn reconcile_suspended(&mut self) {
        if resume_allowed(&self.aw, true) {
            self.set_conditions(&[
                (ConditionType::QuotaReserved, true),
                (ConditionType::ResourcesDeployed, true),
                (ConditionType::PodsReady, false),
                (ConditionType::Unhealthy, false),
            ]);
            self.enter(AppWrapperPhase::Resuming);
        }
    }

    fn reconcile_resuming(&mut self, outcome: CreateOutcome) {
        if outcome == CreateOutcome::Created {
            for entry in &mut self.status.component_status {
                set_condition(
                    &mut entry.conditions,
                    AppWrapperCondition::new(ConditionType::ResourcesDeployed, true, self.now)
                        .with_reason(reasons::COMPONENT_CREATED),
                );
            }
        }
        let deployed_at = self
            .aw_condition_time(ConditionType::ResourcesDeployed)
            .unwrap_or(self.now);
        let plan = plan_resuming(
            &outcome,
            deployed_at,
            self.status.retries,
            &self.params,
            self.now,
        );
        self.apply(&plan);
    }

    fn reconcile_running(&mut self, pods: &PodStatusSummary, probe: &ComponentProbe) -> StepPlan {
        let failed_pods_since = kube_appwrapper::crd::condition(
            &self.status.conditions,
            ConditionType::Unhealthy,
        )
        .filter(|c| c.status && c.reason.as_deref() == Some(reasons::FOUND_FAILED_PODS))
        .map(|c| c.last_transition_time.0);

        let plan = plan_running(&RunningContext {
            pods,
            probe,
            expected_pods: self.expected_pods(),
            recorded_components: self.status.component_status.len(),
            retries: self.status.retries,
            params: &self.params,
            deployed_at: self
                .aw_condition_time(ConditionType::ResourcesDeployed)
                .unwrap_or(self.now),
            failed_pods_since,
            now: self.now,
        });
        self.apply(&plan);
        plan
    }

    fn expected_pods(&self) -> i32 {
        self.status
            .component_status
            .iter()
            .flat_map(|c| &c.pod_sets)
            .map(|ps| ps.replicas.unwrap_or(1))
            .sum()
    }

    fn aw_condition_time(&self, t: ConditionType) -> Option<DateTime<Utc>> {
        kube_appwrapper::crd::condition_transitioned_at(&self.status.conditions, t)
    }

    fn probe_all_deployed(&self) -> ComponentProbe {
        ComponentProbe {
            deployed: self.status.component_status.len(),
            failed: vec![],
        }
    }
}

fn summarize(pods: &[k8s_openapi::api::core::v1::Pod], params: &WrapperParams) -> PodStatusSummary {
    summarize_pods(pods, params, &std::collections::BTreeMap::new())
}

// ── Scenario: happy path ──

#[test]
fn test_happy_path_phase_trace() {
    // two pods: 100m CPU each, one with a GPU, one without
    let mut aw = make_wrapper(
        "happy",
        vec![pod_component("gpu-pod", "1"), pod_component("cpu-pod", "0")],
    );

    aw.run_with_pod_sets_info(vec![PodSetInfo::default(), PodSetInfo::default()])
        .expect("two pod sets expected");

    let mut harness = Harness::new(aw);

    // reconcile 1: Empty → Suspended
    harness.reconcile_empty();
    assert_eq!(harness.expected_pods(), 2);

    // reconcile 2: Suspended → Resuming (suspend cleared, infos filled)
    harness.tick(1);
    harness.reconcile_suspended();

    // reconcile 3: Resuming → Running (components created)
    harness.tick(1);
    harness.reconcile_resuming(CreateOutcome::Created);

    // reconcile 4: Running with both pods running
    harness.tick(5);
    let running_pods = vec![
        make_pod("gpu-pod", "Running", Some("n1"), "1"),
        make_pod("cpu-pod", "Running", Some("n2"), "0"),
    ];
    let summary = summarize(&running_pods, &harness.params);
    let probe = harness.probe_all_deployed();
    let plan = harness.reconcile_running(&summary, &probe);
    assert_eq!(plan.requeue_after, Some(Duration::from_secs(60)));
    assert!(condition_is_true(
        &harness.status.conditions,
        ConditionType::PodsReady
    ));

    // reconcile 5: both pods succeeded
    harness.tick(30);
    let done_pods = vec![
        make_pod("gpu-pod", "Succeeded", Some("n1"), "1"),
        make_pod("cpu-pod", "Succeeded", Some("n2"), "0"),
    ];
    let summary = summarize(&done_pods, &harness.params);
    let probe = harness.probe_all_deployed();
    harness.reconcile_running(&summary, &probe);

    assert_eq!(
        harness.trace,
        vec![
            AppWrapperPhase::Empty,
            AppWrapperPhase::Suspended,
            AppWrapperPhase::Resuming,
            AppWrapperPhase::Running,
            AppWrapperPhase::Succeeded,
        ]
    );
    assert!(!condition_is_true(
        &harness.status.conditions,
        ConditionType::QuotaReserved
    ));
    assert_eq!(harness.status.retries, 0);
}

#[test]
fn test_happy_path_success_ttl_reaps_resources() {
    let mut params = WrapperParams::resolve(&FaultToleranceConfig::default(), None);
    params.success_ttl = Duration::from_secs(300);

    let succeeded_at = t(1000);

    // within the TTL the resources are held
    assert_eq!(
        plan_succeeded(true, params.success_ttl, succeeded_at, t(1100)),
        RetentionStep::Wait(Duration::from_secs(200))
    );
    // after the TTL they are removed
    assert_eq!(
        plan_succeeded(true, params.success_ttl, succeeded_at, t(1400)),
        RetentionStep::DeleteResources
    );
    // once removed nothing is left to do
    assert_eq!(
        plan_succeeded(false, params.success_ttl, succeeded_at, t(2000)),
        RetentionStep::Keep
    );
}

// ── Scenario: forced suspension ──

#[test]
fn test_forced_suspension_from_running() {
    let mut aw = make_wrapper("forced", vec![pod_component("a", "0"), pod_component("b", "0")]);
    aw.run_with_pod_sets_info(vec![PodSetInfo::default(), PodSetInfo::default()])
        .expect("two pod sets expected");

    let mut harness = Harness::new(aw);
    harness.reconcile_empty();
    harness.reconcile_suspended();
    harness.reconcile_resuming(CreateOutcome::Created);
    assert_eq!(harness.status.phase, AppWrapperPhase::Running);

    // the quota manager takes the quota back
    harness.aw.suspend();
    assert!(harness.aw.is_suspended());

    // next reconcile: Running → Suspending (the orchestrator checks suspend
    // before looking at pods)
    harness.enter(AppWrapperPhase::Suspending);

    // teardown completes: Suspending → Suspended with quota released
    harness.set_conditions(&[
        (ConditionType::QuotaReserved, false),
        (ConditionType::ResourcesDeployed, false),
        (ConditionType::PodsReady, false),
    ]);
    harness.enter(AppWrapperPhase::Suspended);

    assert_eq!(
        harness.trace,
        vec![
            AppWrapperPhase::Empty,
            AppWrapperPhase::Suspended,
            AppWrapperPhase::Resuming,
            AppWrapperPhase::Running,
            AppWrapperPhase::Suspending,
            AppWrapperPhase::Suspended,
        ]
    );
    assert!(!condition_is_true(
        &harness.status.conditions,
        ConditionType::QuotaReserved
    ));
    assert!(!condition_is_true(
        &harness.status.conditions,
        ConditionType::ResourcesDeployed
    ));
}

// ── Scenario: pod failure with retryLimit=0, failureGrace=0 ──

#[test]
fn test_pod_failure_without_retry_budget_fails_terminally() {
    let mut aw = make_wrapper("failing", vec![pod_component("a", "0")]);
    aw.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .extend([
            (RETRY_LIMIT.to_string(), "0".to_string()),
            (
                kube_appwrapper::annotations::FAILURE_GRACE_PERIOD.to_string(),
                "0s".to_string(),
            ),
        ]);
    aw.run_with_pod_sets_info(vec![PodSetInfo::default()])
        .expect("one pod set expected");

    let mut harness = Harness::new(aw.clone());
    harness.params = WrapperParams::for_wrapper(&FaultToleranceConfig::default(), &aw);
    assert_eq!(harness.params.retry_limit, 0);
    assert_eq!(harness.params.failure_grace_period, Duration::ZERO);

    harness.reconcile_empty();
    harness.reconcile_suspended();
    harness.reconcile_resuming(CreateOutcome::Created);

    // one pod fails; with zero grace and zero budget the next reconcile fails
    harness.tick(10);
    let pods = vec![make_pod("a", "Failed", Some("n1"), "0")];
    let summary = summarize(&pods, &harness.params);
    let probe = harness.probe_all_deployed();
    let plan = harness.reconcile_running(&summary, &probe);

    assert_eq!(plan.phase, AppWrapperPhase::Failed);
    assert_eq!(harness.status.retries, 0);
    assert!(!condition_is_true(
        &harness.status.conditions,
        ConditionType::QuotaReserved
    ));

    // subsequent reconciles remove the resources immediately (zero grace)
    assert_eq!(
        plan_failed(true, false, Duration::ZERO, harness.now, harness.now),
        RetentionStep::DeleteResources
    );
}

#[test]
fn test_terminal_exit_code_fails_even_with_budget() {
    let mut aw = make_wrapper("exit-codes", vec![pod_component("a", "0")]);
    aw.run_with_pod_sets_info(vec![PodSetInfo::default()])
        .expect("one pod set expected");
    let mut harness = Harness::new(aw);
    harness.params.terminal_exit_codes = Some(vec![42]);
    harness.reconcile_empty();
    harness.reconcile_suspended();
    harness.reconcile_resuming(CreateOutcome::Created);

    harness.tick(10);
    let pods = vec![with_exit_code(make_pod("a", "Failed", Some("n1"), "0"), 42)];
    let summary = summarize(&pods, &harness.params);
    assert!(summary.terminal_failure);

    let probe = harness.probe_all_deployed();
    let plan = harness.reconcile_running(&summary, &probe);
    assert_eq!(plan.phase, AppWrapperPhase::Failed);
    assert_eq!(harness.status.retries, 0);
}

// ── Scenario: fatal create error ──

#[test]
fn test_fatal_create_error_fails_on_first_reconcile() {
    let mut aw = make_wrapper(
        "fatal",
        vec![pod_component("good", "0"), pod_component("bad", "0")],
    );
    aw.run_with_pod_sets_info(vec![PodSetInfo::default(), PodSetInfo::default()])
        .expect("two pod sets expected");

    let mut harness = Harness::new(aw);
    harness.reconcile_empty();
    harness.reconcile_suspended();

    // first component deployed, second rejected by the API server
    if let Some(entry) = harness.status.component_status.get_mut(0) {
        set_condition(
            &mut entry.conditions,
            AppWrapperCondition::new(ConditionType::ResourcesDeployed, true, harness.now)
                .with_reason(reasons::COMPONENT_CREATED),
        );
    }
    harness.reconcile_resuming(CreateOutcome::Fatal(
        "Pod \"bad\" is invalid: spec.containers[0].image: Required value".to_string(),
    ));

    assert_eq!(harness.status.phase, AppWrapperPhase::Failed);
    assert_eq!(harness.status.retries, 0);

    let first = &harness.status.component_status[0];
    assert!(condition_is_true(
        &first.conditions,
        ConditionType::ResourcesDeployed
    ));
    let second = &harness.status.component_status[1];
    assert!(!condition_is_true(
        &second.conditions,
        ConditionType::ResourcesDeployed
    ));

    let unhealthy =
        kube_appwrapper::crd::condition(&harness.status.conditions, ConditionType::Unhealthy)
            .expect("unhealthy latched");
    assert_eq!(unhealthy.reason.as_deref(), Some(reasons::CREATE_FAILED));
}

// ── Scenario: transient create errors retry within the admission grace ──

#[test]
fn test_transient_create_errors_retry_then_reset() {
    let mut aw = make_wrapper("transient", vec![pod_component("a", "0")]);
    aw.run_with_pod_sets_info(vec![PodSetInfo::default()])
        .expect("one pod set expected");

    let mut harness = Harness::new(aw);
    harness.reconcile_empty();
    harness.reconcile_suspended();

    // within the admission grace the wrapper stays Resuming
    harness.tick(10);
    harness.reconcile_resuming(CreateOutcome::Transient("etcd leader changed".to_string()));
    assert_eq!(harness.status.phase, AppWrapperPhase::Resuming);
    assert_eq!(harness.status.retries, 0);

    // past the grace the failure consumes a retry
    harness.tick(120);
    harness.reconcile_resuming(CreateOutcome::Transient("etcd leader changed".to_string()));
    assert_eq!(harness.status.phase, AppWrapperPhase::Resetting);
    assert_eq!(harness.status.retries, 1);
}

// ── Condition latch stability across reconciles ──

#[test]
fn test_failed_pod_grace_window_is_stable_across_reconciles() {
    let mut aw = make_wrapper("grace", vec![pod_component("a", "0")]);
    aw.run_with_pod_sets_info(vec![PodSetInfo::default()])
        .expect("one pod set expected");
    let mut harness = Harness::new(aw);
    harness.reconcile_empty();
    harness.reconcile_suspended();
    harness.reconcile_resuming(CreateOutcome::Created);

    let pods = vec![make_pod("a", "Failed", Some("n1"), "0")];

    // first observation latches the Unhealthy condition
    harness.tick(10);
    let summary = summarize(&pods, &harness.params);
    let probe = harness.probe_all_deployed();
    harness.reconcile_running(&summary, &probe);
    assert_eq!(harness.status.phase, AppWrapperPhase::Running);
    let latched = harness
        .aw_condition_time(ConditionType::Unhealthy)
        .expect("latched");

    // a second identical observation keeps the transition time
    harness.tick(20);
    let summary = summarize(&pods, &harness.params);
    let probe = harness.probe_all_deployed();
    harness.reconcile_running(&summary, &probe);
    assert_eq!(
        harness.aw_condition_time(ConditionType::Unhealthy),
        Some(latched)
    );

    // once the 60s grace has fully elapsed, the wrapper resets
    harness.tick(60);
    let summary = summarize(&pods, &harness.params);
    let probe = harness.probe_all_deployed();
    let plan = harness.reconcile_running(&summary, &probe);
    assert_eq!(plan.phase, AppWrapperPhase::Resetting);
    assert_eq!(harness.status.retries, 1);
}

// ── Node-health migration does not consume the retry budget ──

#[test]
fn test_autopilot_migration_preserves_retry_budget() {
    let mut aw = make_wrapper("migrating", vec![pod_component("a", "1")]);
    aw.run_with_pod_sets_info(vec![PodSetInfo::default()])
        .expect("one pod set expected");
    let mut harness = Harness::new(aw);
    harness.reconcile_empty();
    harness.reconcile_suspended();
    harness.reconcile_resuming(CreateOutcome::Created);

    // the pod runs on a node whose GPU must be evicted
    let no_execute = std::collections::BTreeMap::from([(
        "n1".to_string(),
        std::collections::BTreeMap::from([(
            "nvidia.com/gpu".to_string(),
            k8s_openapi::apimachinery::pkg::api::resource::Quantity("4".to_string()),
        )]),
    )]);
    let pods = vec![make_pod("a", "Running", Some("n1"), "1")];
    harness.tick(10);
    let summary = summarize_pods(&pods, &harness.params, &no_execute);
    assert!(!summary.unhealthy_nodes.is_empty());

    let probe = harness.probe_all_deployed();
    let plan = harness.reconcile_running(&summary, &probe);
    assert_eq!(plan.phase, AppWrapperPhase::Resetting);
    assert_eq!(harness.status.retries, 0);
}
