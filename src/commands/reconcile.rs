use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::Reporter;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use prometheus::{Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use kube_appwrapper::autopilot::NodeHealth;
use kube_appwrapper::components::FIELD_MANAGER;
use kube_appwrapper::config::OperatorConfig;
use kube_appwrapper::controller::{self, Ctx};
use kube_appwrapper::crd::{APPWRAPPER_LABEL, AppWrapper, QuotaPool};
use kube_appwrapper::slack;

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "appwrapper_reconcile_total",
        "Total AppWrapper reconciliation cycles",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "appwrapper_reconcile_errors_total",
        "Total AppWrapper reconciliation errors",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "appwrapper_reconcile_duration_seconds",
        "Duration of each AppWrapper reconciliation cycle in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

static NODE_HEALTH_EVENTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "appwrapper_node_health_events_total",
        "Node health classification changes observed",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static NO_EXECUTE_NODES: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "appwrapper_no_execute_nodes",
        "Nodes currently requiring eviction of flagged workloads",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static NO_SCHEDULE_NODES: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "appwrapper_no_schedule_nodes",
        "Nodes currently excluded from scheduling",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static SLACK_ADJUSTMENTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "appwrapper_slack_adjustments_total",
        "Lending-limit patches applied to the slack quota pool",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static SLACK_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "appwrapper_slack_errors_total",
        "Slack quota pool reconciliation errors",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

/* ============================= STATE ============================= */

pub(crate) struct ReconcileState {
    pub(crate) ready: bool,
}

/* ============================= ENTRY ============================= */

pub async fn run(config_path: &Path) -> Result<()> {
    println!("Starting AppWrapper operator...\n");

    let config = Arc::new(if config_path.exists() {
        OperatorConfig::load(config_path)?
    } else {
        OperatorConfig::default()
    });

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    // Verify actual cluster connectivity before starting the controllers
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    // Force-init Prometheus metrics so they appear on /metrics
    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&RECONCILE_DURATION);
    LazyLock::force(&NODE_HEALTH_EVENTS);
    LazyLock::force(&NO_EXECUTE_NODES);
    LazyLock::force(&NO_SCHEDULE_NODES);
    LazyLock::force(&SLACK_ADJUSTMENTS);
    LazyLock::force(&SLACK_ERRORS);

    let addr = SocketAddr::from(([0, 0, 0, 0], 9090));

    println!("  CRD watch ................... AppWrapper.workload.stochastic.io/v1");
    println!(
        "  Node monitor ................ {}",
        if config.autopilot.monitor_nodes { "on" } else { "off" }
    );
    println!(
        "  Slack quota pool ............ {}",
        config.slack_queue_name.as_deref().unwrap_or("(none)")
    );
    println!("  Metrics server .............. http://{addr}");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("operator_started");

    let reconcile_state = Arc::new(Mutex::new(ReconcileState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = reconcile_state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle =
        tokio::spawn(async move { start_metrics_server(http_state, http_shutdown, addr).await });

    let (node_health, slack_trigger) = NodeHealth::new();

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // ── AppWrapper controller ──
    let ctx = Arc::new(Ctx {
        client: client.clone(),
        config: config.clone(),
        node_health: node_health.clone(),
        reporter: Reporter {
            controller: FIELD_MANAGER.into(),
            instance: None,
        },
    });

    let wrappers: Api<AppWrapper> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());

    let controller_state = reconcile_state.clone();
    let wrapper_controller = Controller::new(wrappers, watcher::Config::default())
        .watches(pods, watcher::Config::default(), |pod: Pod| {
            // pods re-trigger their owning AppWrapper via the cross-linking label
            let namespace = pod.namespace()?;
            let name = pod.labels().get(APPWRAPPER_LABEL)?.clone();
            Some(ObjectRef::<AppWrapper>::new(&name).within(&namespace))
        })
        .run(reconcile_with_metrics, error_policy, ctx)
        .for_each(move |result| {
            let state = controller_state.clone();
            async move {
                {
                    let mut s = state.lock().await;
                    if !s.ready {
                        s.ready = true;
                    }
                }
                if let Err(e) = result {
                    warn!(error = %e, "reconcile_dispatch_error");
                }
            }
        });
    tasks.push(tokio::spawn(wrapper_controller));

    // ── Node health monitor ──
    if config.autopilot.monitor_nodes {
        let monitor_client = client.clone();
        let monitor_config = config.clone();
        let monitor_state = node_health.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_node_monitor(monitor_client, monitor_config, monitor_state).await {
                warn!(error = %e, "node_monitor_stopped");
            }
        }));
    }

    // ── Slack quota pool controller ──
    if let Some(slack_name) = config.slack_queue_name.clone() {
        let slack_ctx = Arc::new(SlackCtx {
            client: client.clone(),
            node_health: node_health.clone(),
        });
        let pools: Api<QuotaPool> = Api::all(client.clone());
        let pool_watch =
            watcher::Config::default().fields(&format!("metadata.name={slack_name}"));
        let mut rx = slack_trigger;
        let trigger = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));

        let slack_controller = Controller::new(pools, pool_watch)
            .reconcile_all_on(trigger)
            .run(reconcile_slack, slack_error_policy, slack_ctx)
            .for_each(|result| async move {
                if let Err(e) = result {
                    warn!(error = %e, "slack_dispatch_error");
                }
            });
        tasks.push(tokio::spawn(slack_controller));
    }

    // Ctrl+C aborts the controller tasks; the kube Controller has no
    // built-in shutdown hook, so dropping the futures stops them.
    signal::ctrl_c().await?;

    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping operator...");

    for task in &tasks {
        task.abort();
    }
    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("operator_stopped");
    println!("Operator stopped.");

    Ok(())
}

/* ============================= APPWRAPPER DISPATCH ============================= */

async fn reconcile_with_metrics(
    aw: Arc<AppWrapper>,
    ctx: Arc<Ctx>,
) -> std::result::Result<Action, controller::Error> {
    RECONCILE_TOTAL.inc();
    let _timer = RECONCILE_DURATION.start_timer();
    controller::reconcile(aw, ctx).await
}

fn error_policy(aw: Arc<AppWrapper>, error: &controller::Error, _ctx: Arc<Ctx>) -> Action {
    RECONCILE_ERRORS.inc();
    warn!(appwrapper = %aw.name_any(), error = %error, "reconcile_error");
    Action::requeue(Duration::from_secs(10))
}

/* ============================= NODE MONITOR ============================= */

async fn run_node_monitor(
    client: Client,
    config: Arc<OperatorConfig>,
    node_health: Arc<NodeHealth>,
) -> Result<()> {
    let nodes: Api<Node> = Api::all(client);
    let mut stream = watcher(nodes, watcher::Config::default()).boxed();

    info!("node_monitor_started");

    while let Some(event) = stream.try_next().await? {
        match event {
            watcher::Event::Applied(node) => {
                if node_health.update_node(&node, &config.autopilot) {
                    NODE_HEALTH_EVENTS.inc();
                }
            }
            watcher::Event::Deleted(node) => {
                if node_health.remove_node(&node.name_any()) {
                    NODE_HEALTH_EVENTS.inc();
                }
            }
            watcher::Event::Restarted(nodes) => {
                for node in nodes {
                    node_health.update_node(&node, &config.autopilot);
                }
            }
        }
        NO_EXECUTE_NODES.set(node_health.no_execute_snapshot().len() as i64);
        NO_SCHEDULE_NODES.set(node_health.no_schedule_snapshot().len() as i64);
    }

    Ok(())
}

/* ============================= SLACK POOL DISPATCH ============================= */

struct SlackCtx {
    client: Client,
    node_health: Arc<NodeHealth>,
}

async fn reconcile_slack(
    pool: Arc<QuotaPool>,
    ctx: Arc<SlackCtx>,
) -> std::result::Result<Action, controller::Error> {
    let totals = ctx.node_health.unschedulable_totals();

    if let Some(resources) = slack::plan_lending_update(&pool.spec, &totals) {
        let name = pool.name_any();
        let updated = slack::apply_lending_update(&pool.spec, resources);
        let api: Api<QuotaPool> = Api::all(ctx.client.clone());
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(serde_json::json!({"spec": updated})),
        )
        .await?;
        SLACK_ADJUSTMENTS.inc();
        info!(pool = %name, "slack_lending_limits_adjusted");
    }

    Ok(Action::requeue(Duration::from_secs(600)))
}

fn slack_error_policy(
    pool: Arc<QuotaPool>,
    error: &controller::Error,
    _ctx: Arc<SlackCtx>,
) -> Action {
    SLACK_ERRORS.inc();
    warn!(pool = %pool.name_any(), error = %error, "slack_reconcile_error");
    // conflicts are benign; the next pass recomputes from the maps
    Action::requeue(Duration::from_secs(10))
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_reconcile_router(state: Arc<Mutex<ReconcileState>>) -> Router {
    Router::new()
        .route("/metrics", get(reconcile_metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || reconcile_ready_handler(state.clone())
            }),
        )
}

async fn start_metrics_server(
    state: Arc<Mutex<ReconcileState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_reconcile_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server on :9090")?;

    info!(addr = %addr, "metrics_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn reconcile_ready_handler(state: Arc<Mutex<ReconcileState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn reconcile_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */
