use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use thiserror::Error;
use tracing::{info, warn};

use crate::annotations::WrapperParams;
use crate::autopilot::NodeHealth;
use crate::components::{
    self, ComponentError, ComponentProbe, FIELD_MANAGER, create_components, delete_components,
    get_component_status,
};
use crate::config::OperatorConfig;
use crate::crd::{
    AppWrapper, AppWrapperCondition, AppWrapperPhase, AppWrapperStatus, ConditionType, FINALIZER,
    condition, condition_transitioned_at, reasons, set_condition,
};
use crate::podstatus::{PodStatusSummary, summarize_pods};

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum Error {
    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),
}

/* ============================= CONTEXT ============================= */

pub struct Ctx {
    pub client: Client,
    pub config: Arc<OperatorConfig>,
    pub node_health: Arc<NodeHealth>,
    pub reporter: Reporter,
}

/* ============================= STEP PLANS ============================= */

/// An `Unhealthy` observation to latch into status and mirror as an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhealthyReport {
    pub reason: &'static str,
    pub message: String,
}

/// The single transition (or hold) chosen by one reconcile invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlan {
    pub phase: AppWrapperPhase,
    pub requeue_after: Option<Duration>,
    pub retries_increment: i32,
    pub unhealthy: Option<UnhealthyReport>,
    pub pods_ready: Option<bool>,
}

impl StepPlan {
    fn stay(phase: AppWrapperPhase, requeue_after: Duration) -> Self {
        Self {
            phase,
            requeue_after: Some(requeue_after),
            retries_increment: 0,
            unhealthy: None,
            pods_ready: None,
        }
    }

    fn to(phase: AppWrapperPhase) -> Self {
        Self {
            phase,
            requeue_after: Some(Duration::from_secs(1)),
            retries_increment: 0,
            unhealthy: None,
            pods_ready: None,
        }
    }

    fn with_unhealthy(mut self, reason: &'static str, message: impl Into<String>) -> Self {
        self.unhealthy = Some(UnhealthyReport {
            reason,
            message: message.into(),
        });
        self
    }

    fn with_pods_ready(mut self, ready: bool) -> Self {
        self.pods_ready = Some(ready);
        self
    }
}

/* ============================= RESET OR FAIL ============================= */

/// Arbitrate a failure: reset (consuming `increment` retries) while budget
/// remains and the failure is not terminal, otherwise fail. An increment of
/// zero is reserved for node-health migrations, which never consume retries.
pub fn reset_or_fail(
    retries: i32,
    retry_limit: i32,
    terminal: bool,
    increment: i32,
) -> (AppWrapperPhase, i32) {
    if !terminal && retries + increment <= retry_limit {
        (AppWrapperPhase::Resetting, increment)
    } else {
        (AppWrapperPhase::Failed, 0)
    }
}

/* ============================= PHASE PLANNERS ============================= */

/// Resuming: outcome of this invocation's `create_components` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    Fatal(String),
    Transient(String),
}

impl From<Result<(), ComponentError>> for CreateOutcome {
    fn from(result: Result<(), ComponentError>) -> Self {
        match result {
            Ok(()) => CreateOutcome::Created,
            Err(ComponentError::Fatal(msg)) => CreateOutcome::Fatal(msg),
            Err(ComponentError::Transient(msg)) => CreateOutcome::Transient(msg),
        }
    }
}

pub fn plan_resuming(
    outcome: &CreateOutcome,
    deployed_at: DateTime<Utc>,
    retries: i32,
    params: &WrapperParams,
    now: DateTime<Utc>,
) -> StepPlan {
    match outcome {
        CreateOutcome::Created => StepPlan::to(AppWrapperPhase::Running),
        CreateOutcome::Fatal(msg) => StepPlan::to(AppWrapperPhase::Failed)
            .with_unhealthy(reasons::CREATE_FAILED, msg.clone()),
        CreateOutcome::Transient(msg) => {
            if now < deployed_at + params.admission_grace_period {
                StepPlan::stay(AppWrapperPhase::Resuming, Duration::from_secs(1))
                    .with_unhealthy(reasons::CREATE_FAILED, msg.clone())
            } else {
                let (phase, increment) = reset_or_fail(retries, params.retry_limit, false, 1);
                let mut plan = StepPlan::to(phase);
                plan.retries_increment = increment;
                plan.with_unhealthy(reasons::CREATE_FAILED, msg.clone())
            }
        }
    }
}

/// Running: everything this invocation observed about the AppWrapper's pods
/// and components, all timestamps read from latched conditions.
pub struct RunningContext<'a> {
    pub pods: &'a PodStatusSummary,
    pub probe: &'a ComponentProbe,
    pub expected_pods: i32,
    pub recorded_components: usize,
    pub retries: i32,
    pub params: &'a WrapperParams,
    /// `ResourcesDeployed=true` transition; base of the warmup window.
    pub deployed_at: DateTime<Utc>,
    /// `Unhealthy(FoundFailedPods)` latch, when currently in force.
    pub failed_pods_since: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

pub fn plan_running(ctx: &RunningContext<'_>) -> StepPlan {
    let params = ctx.params;

    // a deployed component disappeared underneath us: no grace, no retry
    if ctx.probe.deployed < ctx.recorded_components {
        let missing = ctx.recorded_components - ctx.probe.deployed;
        return StepPlan::to(AppWrapperPhase::Failed).with_unhealthy(
            reasons::MISSING_COMPONENT,
            format!("{missing} component(s) no longer exist"),
        );
    }

    if !ctx.probe.failed.is_empty() {
        let (phase, increment) = reset_or_fail(
            ctx.retries,
            params.retry_limit,
            ctx.pods.terminal_failure,
            1,
        );
        let mut plan = StepPlan::to(phase);
        plan.retries_increment = increment;
        return plan.with_unhealthy(
            reasons::FAILED_COMPONENT,
            format!("component(s) reporting failure: {}", ctx.probe.failed.join(", ")),
        );
    }

    if ctx.pods.all_succeeded(ctx.expected_pods) {
        return StepPlan::to(AppWrapperPhase::Succeeded);
    }

    if ctx.pods.failed > 0 {
        let message = format!("{} failed pods", ctx.pods.failed);
        if ctx.pods.terminal_failure {
            let (phase, increment) = reset_or_fail(ctx.retries, params.retry_limit, true, 1);
            let mut plan = StepPlan::to(phase);
            plan.retries_increment = increment;
            return plan.with_unhealthy(reasons::FOUND_FAILED_PODS, message);
        }

        let deadline = ctx.failed_pods_since.unwrap_or(ctx.now) + params.failure_grace_period;
        if ctx.now < deadline {
            let wait = (deadline - ctx.now).to_std().unwrap_or(Duration::from_secs(1));
            return StepPlan::stay(AppWrapperPhase::Running, wait)
                .with_unhealthy(reasons::FOUND_FAILED_PODS, message);
        }
        let (phase, increment) = reset_or_fail(ctx.retries, params.retry_limit, false, 1);
        let mut plan = StepPlan::to(phase);
        plan.retries_increment = increment;
        return plan.with_unhealthy(reasons::FOUND_FAILED_PODS, message);
    }

    if !ctx.pods.unhealthy_nodes.is_empty() {
        // node-health migration: reset without consuming the retry budget
        let nodes: Vec<&str> = ctx.pods.unhealthy_nodes.iter().map(String::as_str).collect();
        return StepPlan::to(AppWrapperPhase::Resetting).with_unhealthy(
            reasons::AUTOPILOT_UNHEALTHY,
            format!("running pods on unhealthy node(s): {}", nodes.join(", ")),
        );
    }

    if ctx.pods.ready(ctx.expected_pods) {
        return StepPlan::stay(AppWrapperPhase::Running, Duration::from_secs(60))
            .with_pods_ready(true);
    }

    let warmup = params.warmup_grace_period.max(params.admission_grace_period);
    if ctx.now < ctx.deployed_at + warmup {
        return StepPlan::stay(AppWrapperPhase::Running, Duration::from_secs(5))
            .with_pods_ready(false);
    }

    let (phase, increment) = reset_or_fail(ctx.retries, params.retry_limit, false, 1);
    let mut plan = StepPlan::to(phase);
    plan.retries_increment = increment;
    plan.with_unhealthy(
        reasons::INSUFFICIENT_PODS_READY,
        format!(
            "expected {} pods but only {} are running or finished",
            ctx.expected_pods,
            ctx.pods.running + ctx.pods.succeeded
        ),
    )
}

pub fn plan_resetting(
    suspend: bool,
    delete_complete: bool,
    deleting_since: DateTime<Utc>,
    retry_pause: Duration,
    now: DateTime<Utc>,
) -> StepPlan {
    if suspend {
        return StepPlan::to(AppWrapperPhase::Suspending);
    }
    if !delete_complete {
        return StepPlan::stay(AppWrapperPhase::Resetting, Duration::from_secs(1));
    }
    let resume_at = deleting_since + retry_pause;
    if now < resume_at {
        let wait = (resume_at - now).to_std().unwrap_or(Duration::from_secs(1));
        return StepPlan::stay(AppWrapperPhase::Resetting, wait);
    }
    StepPlan::to(AppWrapperPhase::Resuming)
}

/// Succeeded/Failed resource retention decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionStep {
    Keep,
    Wait(Duration),
    DeleteResources,
}

pub fn plan_succeeded(
    resources_deployed: bool,
    success_ttl: Duration,
    succeeded_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> RetentionStep {
    if !resources_deployed || success_ttl.is_zero() {
        return RetentionStep::Keep;
    }
    let deadline = succeeded_at + success_ttl;
    if now < deadline {
        RetentionStep::Wait((deadline - now).to_std().unwrap_or(Duration::from_secs(1)))
    } else {
        RetentionStep::DeleteResources
    }
}

pub fn plan_failed(
    resources_deployed: bool,
    force_suspended: bool,
    deletion_grace: Duration,
    failed_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> RetentionStep {
    if !resources_deployed {
        return RetentionStep::Keep;
    }
    if !force_suspended && !deletion_grace.is_zero() {
        let deadline = failed_at + deletion_grace;
        if now < deadline {
            return RetentionStep::Wait(
                (deadline - now).to_std().unwrap_or(Duration::from_secs(1)),
            );
        }
    }
    RetentionStep::DeleteResources
}

/// Suspended → Resuming gating: the quota manager must have cleared suspend
/// and, when quota integration is on, filled every pod set's info.
pub fn resume_allowed(aw: &AppWrapper, kueue_enabled: bool) -> bool {
    if aw.spec.suspend {
        return false;
    }
    if !kueue_enabled {
        return true;
    }
    aw.spec
        .components
        .iter()
        .all(|c| c.pod_set_infos.len() == c.declared_pod_sets.len())
}

/* ============================= ORCHESTRATION ============================= */

fn now_conditions(
    status: &mut AppWrapperStatus,
    now: DateTime<Utc>,
    entries: &[(ConditionType, bool)],
) {
    for (condition_type, value) in entries {
        set_condition(
            &mut status.conditions,
            AppWrapperCondition::new(*condition_type, *value, now),
        );
    }
}

fn apply_plan(status: &mut AppWrapperStatus, plan: &StepPlan, now: DateTime<Utc>) {
    if plan.retries_increment > 0 {
        status.retries += plan.retries_increment;
    }
    if let Some(report) = &plan.unhealthy {
        set_condition(
            &mut status.conditions,
            AppWrapperCondition::new(ConditionType::Unhealthy, true, now)
                .with_reason(report.reason)
                .with_message(report.message.clone()),
        );
    }
    if let Some(ready) = plan.pods_ready {
        set_condition(
            &mut status.conditions,
            AppWrapperCondition::new(ConditionType::PodsReady, ready, now),
        );
    }
    status.phase = plan.phase;
}

async fn patch_wrapper_status(
    api: &Api<AppWrapper>,
    name: &str,
    status: &AppWrapperStatus,
) -> Result<(), kube::Error> {
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(serde_json::json!({"status": status})),
    )
    .await?;
    Ok(())
}

async fn emit(ctx: &Ctx, aw: &AppWrapper, type_: EventType, reason: &str, note: String) {
    let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone(), aw.object_ref(&()));
    let result = recorder
        .publish(Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconciling".to_string(),
            secondary: None,
        })
        .await;
    if let Err(err) = result {
        warn!(appwrapper = %aw.name_any(), error = %err, "event_publish_failed");
    }
}

async fn emit_plan_events(ctx: &Ctx, aw: &AppWrapper, from: AppWrapperPhase, plan: &StepPlan) {
    if let Some(report) = &plan.unhealthy {
        emit(
            ctx,
            aw,
            EventType::Warning,
            "Unhealthy",
            format!("{}: {}", report.reason, report.message),
        )
        .await;
    }
    if plan.phase != from {
        emit(
            ctx,
            aw,
            EventType::Normal,
            &format!("AppWrapper{}", plan.phase),
            format!("phase {from} -> {}", plan.phase),
        )
        .await;
    }
}

fn requeue(plan: &StepPlan) -> Action {
    match plan.requeue_after {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    }
}

/* ============================= FINALIZER ============================= */

fn has_finalizer(aw: &AppWrapper) -> bool {
    aw.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

async fn add_finalizer(api: &Api<AppWrapper>, aw: &AppWrapper) -> Result<(), kube::Error> {
    let mut finalizers = aw.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &aw.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    info!(appwrapper = %aw.name_any(), "finalizer_added");
    Ok(())
}

async fn remove_finalizer(api: &Api<AppWrapper>, aw: &AppWrapper) -> Result<(), kube::Error> {
    let finalizers: Vec<String> = aw
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &aw.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    info!(appwrapper = %aw.name_any(), "finalizer_removed");
    Ok(())
}

/* ============================= RECONCILE ============================= */

/// The per-AppWrapper reconciler: one transition per invocation, status
/// persisted as a single merge patch, deferred work expressed as a requeue
/// computed from latched condition times.
pub async fn reconcile(aw: Arc<AppWrapper>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let name = aw.name_any();
    let namespace = aw.namespace().unwrap_or_default();
    let api: Api<AppWrapper> = Api::namespaced(ctx.client.clone(), &namespace);
    let now = Utc::now();
    let params = WrapperParams::for_wrapper(&ctx.config.fault_tolerance, &aw);
    let mut status = aw.status.clone().unwrap_or_default();
    let phase = aw.phase();

    info!(appwrapper = %name, namespace = %namespace, phase = %phase, "reconcile_start");

    // ── Deletion under the finalizer ──
    if aw.metadata.deletion_timestamp.is_some() {
        if !has_finalizer(&aw) {
            return Ok(Action::await_change());
        }
        status.phase = AppWrapperPhase::Terminating;
        let complete = delete_components(&ctx.client, &aw, &mut status, &params, now).await?;
        if complete {
            remove_finalizer(&api, &aw).await?;
            return Ok(Action::await_change());
        }
        patch_wrapper_status(&api, &name, &status).await?;
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    match phase {
        // ── Empty: take ownership, settle into Suspended ──
        AppWrapperPhase::Empty => {
            if !has_finalizer(&aw) {
                add_finalizer(&api, &aw).await?;
            }
            match components::init_component_status(&aw) {
                Ok(mirror) => {
                    status.component_status = mirror;
                    now_conditions(
                        &mut status,
                        now,
                        &[
                            (ConditionType::QuotaReserved, false),
                            (ConditionType::ResourcesDeployed, false),
                        ],
                    );
                    status.phase = AppWrapperPhase::Suspended;
                }
                Err(err) => {
                    // admission should have rejected this; fail without retry
                    set_condition(
                        &mut status.conditions,
                        AppWrapperCondition::new(ConditionType::Unhealthy, true, now)
                            .with_reason(reasons::CREATE_FAILED)
                            .with_message(err.to_string()),
                    );
                    status.phase = AppWrapperPhase::Failed;
                }
            }
            patch_wrapper_status(&api, &name, &status).await?;
            Ok(Action::requeue(Duration::from_secs(1)))
        }

        // ── Suspended: wait for the quota manager ──
        AppWrapperPhase::Suspended => {
            if resume_allowed(&aw, ctx.config.enable_kueue_integrations) {
                now_conditions(
                    &mut status,
                    now,
                    &[
                        (ConditionType::QuotaReserved, true),
                        (ConditionType::ResourcesDeployed, true),
                        (ConditionType::PodsReady, false),
                        (ConditionType::Unhealthy, false),
                    ],
                );
                status.phase = AppWrapperPhase::Resuming;
                patch_wrapper_status(&api, &name, &status).await?;
                emit(
                    &ctx,
                    &aw,
                    EventType::Normal,
                    "AppWrapperResuming",
                    "quota reserved, deploying components".to_string(),
                )
                .await;
                Ok(Action::requeue(Duration::from_secs(1)))
            } else {
                Ok(Action::await_change())
            }
        }

        // ── Resuming: create components under the admission grace ──
        AppWrapperPhase::Resuming => {
            if aw.spec.suspend {
                status.phase = AppWrapperPhase::Suspending;
                patch_wrapper_status(&api, &name, &status).await?;
                return Ok(Action::requeue(Duration::from_secs(1)));
            }

            let outcome: CreateOutcome =
                create_components(&ctx.client, &ctx.config, &aw, &mut status, now)
                    .await
                    .into();
            let deployed_at = condition_transitioned_at(
                &status.conditions,
                ConditionType::ResourcesDeployed,
            )
            .unwrap_or(now);
            let plan = plan_resuming(&outcome, deployed_at, status.retries, &params, now);

            apply_plan(&mut status, &plan, now);
            if plan.phase == AppWrapperPhase::Failed {
                now_conditions(&mut status, now, &[(ConditionType::QuotaReserved, false)]);
            }
            patch_wrapper_status(&api, &name, &status).await?;
            emit_plan_events(&ctx, &aw, phase, &plan).await;
            Ok(requeue(&plan))
        }

        // ── Running: track pods and component health ──
        AppWrapperPhase::Running => {
            if aw.spec.suspend {
                status.phase = AppWrapperPhase::Suspending;
                patch_wrapper_status(&api, &name, &status).await?;
                return Ok(Action::requeue(Duration::from_secs(1)));
            }

            let probe = get_component_status(&ctx.client, &namespace, &status).await?;
            let pods = components::list_wrapper_pods(&ctx.client, &namespace, &name).await?;
            let summary = summarize_pods(&pods, &params, &ctx.node_health.no_execute_snapshot());

            let failed_pods_since = condition(&status.conditions, ConditionType::Unhealthy)
                .filter(|c| c.status && c.reason.as_deref() == Some(reasons::FOUND_FAILED_PODS))
                .map(|c| c.last_transition_time.0);
            let deployed_at = condition_transitioned_at(
                &status.conditions,
                ConditionType::ResourcesDeployed,
            )
            .unwrap_or(now);

            let plan = plan_running(&RunningContext {
                pods: &summary,
                probe: &probe,
                expected_pods: aw.expected_pod_count(),
                recorded_components: status.component_status.len(),
                retries: status.retries,
                params: &params,
                deployed_at,
                failed_pods_since,
                now,
            });

            apply_plan(&mut status, &plan, now);
            if matches!(
                plan.phase,
                AppWrapperPhase::Succeeded | AppWrapperPhase::Failed
            ) {
                now_conditions(&mut status, now, &[(ConditionType::QuotaReserved, false)]);
            }
            patch_wrapper_status(&api, &name, &status).await?;
            emit_plan_events(&ctx, &aw, phase, &plan).await;
            Ok(requeue(&plan))
        }

        // ── Suspending: tear down, then release quota ──
        AppWrapperPhase::Suspending => {
            let complete = delete_components(&ctx.client, &aw, &mut status, &params, now).await?;
            if complete {
                now_conditions(
                    &mut status,
                    now,
                    &[
                        (ConditionType::QuotaReserved, false),
                        (ConditionType::ResourcesDeployed, false),
                        (ConditionType::DeletingResources, false),
                        (ConditionType::PodsReady, false),
                    ],
                );
                status.phase = AppWrapperPhase::Suspended;
                patch_wrapper_status(&api, &name, &status).await?;
                emit(
                    &ctx,
                    &aw,
                    EventType::Normal,
                    "AppWrapperSuspended",
                    "resources removed, quota released".to_string(),
                )
                .await;
                return Ok(Action::await_change());
            }
            patch_wrapper_status(&api, &name, &status).await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }

        // ── Resetting: tear down, pause, then resume ──
        AppWrapperPhase::Resetting => {
            let complete = if aw.spec.suspend {
                false
            } else {
                delete_components(&ctx.client, &aw, &mut status, &params, now).await?
            };
            let deleting_since = condition_transitioned_at(
                &status.conditions,
                ConditionType::DeletingResources,
            )
            .unwrap_or(now);
            let plan = plan_resetting(
                aw.spec.suspend,
                complete,
                deleting_since,
                params.retry_pause_period,
                now,
            );

            if plan.phase == AppWrapperPhase::Resuming {
                now_conditions(
                    &mut status,
                    now,
                    &[
                        (ConditionType::ResourcesDeployed, true),
                        (ConditionType::DeletingResources, false),
                        (ConditionType::PodsReady, false),
                        (ConditionType::Unhealthy, false),
                    ],
                );
            }
            apply_plan(&mut status, &plan, now);
            patch_wrapper_status(&api, &name, &status).await?;
            emit_plan_events(&ctx, &aw, phase, &plan).await;
            Ok(requeue(&plan))
        }

        // ── Succeeded: optionally reap resources after the TTL ──
        AppWrapperPhase::Succeeded => {
            let resources_deployed =
                crate::crd::condition_is_true(&status.conditions, ConditionType::ResourcesDeployed);
            let succeeded_at =
                condition_transitioned_at(&status.conditions, ConditionType::QuotaReserved)
                    .unwrap_or(now);
            match plan_succeeded(resources_deployed, params.success_ttl, succeeded_at, now) {
                RetentionStep::Keep => Ok(Action::await_change()),
                RetentionStep::Wait(wait) => Ok(Action::requeue(wait)),
                RetentionStep::DeleteResources => {
                    let complete =
                        delete_components(&ctx.client, &aw, &mut status, &params, now).await?;
                    if complete {
                        now_conditions(
                            &mut status,
                            now,
                            &[
                                (ConditionType::ResourcesDeployed, false),
                                (ConditionType::DeletingResources, false),
                            ],
                        );
                    }
                    patch_wrapper_status(&api, &name, &status).await?;
                    if complete {
                        Ok(Action::await_change())
                    } else {
                        Ok(Action::requeue(Duration::from_secs(5)))
                    }
                }
            }
        }

        // ── Failed: hold for the deletion grace, then reap ──
        AppWrapperPhase::Failed => {
            let resources_deployed =
                crate::crd::condition_is_true(&status.conditions, ConditionType::ResourcesDeployed);
            let failed_at =
                condition_transitioned_at(&status.conditions, ConditionType::QuotaReserved)
                    .unwrap_or(now);
            match plan_failed(
                resources_deployed,
                aw.spec.suspend,
                params.deletion_on_failure_grace_period,
                failed_at,
                now,
            ) {
                RetentionStep::Keep => Ok(Action::await_change()),
                RetentionStep::Wait(wait) => Ok(Action::requeue(wait)),
                RetentionStep::DeleteResources => {
                    let complete =
                        delete_components(&ctx.client, &aw, &mut status, &params, now).await?;
                    if complete {
                        now_conditions(
                            &mut status,
                            now,
                            &[
                                (ConditionType::ResourcesDeployed, false),
                                (ConditionType::DeletingResources, false),
                            ],
                        );
                    }
                    patch_wrapper_status(&api, &name, &status).await?;
                    if complete {
                        Ok(Action::await_change())
                    } else {
                        Ok(Action::requeue(Duration::from_secs(5)))
                    }
                }
            }
        }

        // only shown while deletion is pending; nothing to drive here
        AppWrapperPhase::Terminating => Ok(Action::await_change()),
    }
}

/* ============================= TESTS ============================= */
