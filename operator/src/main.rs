use clap::Parser;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::{api::ListParams, client::Client, Api, ResourceExt};
use prometheus::Registry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vpsie_types::NodeGroup;

mod config;
mod drain;
mod health;
mod leader;
mod metrics;
mod nodegroups;
mod rebalance;
mod scaledown;
mod scaleup;
mod util;
mod vpsie;
mod vpsnodes;

use config::{Cli, Config, LogFormat};
use drain::{DrainConfig, DrainEngine, DrainMetrics};
use health::ReadinessState;
use rebalance::{
    analyzer::{AnalyzerConfig, RebalanceAnalyzer},
    cost::{CostCalculator, DEFAULT_COST_TTL},
    executor::{ExecutorConfig, RebalanceExecutor},
    metrics::RebalanceMetrics,
    planner::PlannerConfig,
    Rebalancer,
};
use scaledown::{
    metrics::ScaleDownMetrics,
    policy::{PolicyConfig, PolicyEngine},
    safety::{SafetyConfig, SafetyEvaluator},
    source::MetricsServerSource,
    tracker::{TrackerConfig, UtilizationTracker},
    ScaleDownConfig, ScaleDownManager,
};
use scaleup::{ScaleUpConfig, ScaleUpEvaluator};
use util::{
    clock::{Clock, SystemClock},
    events, Error,
};
use vpsie::{auth::Credentials, VpsieApi, VpsieClient, VpsieClientConfig};

/// How often the utilization tracker samples the metrics source.
const TRACKER_INTERVAL: Duration = Duration::from_secs(30);

/// How often scale-up and scale-down passes run.
const SCALE_INTERVAL: Duration = Duration::from_secs(60);

/// How often the rebalancer looks at each group.
const REBALANCE_INTERVAL: Duration = Duration::from_secs(600);

/// How often credentials are re-read for rotation.
const CREDENTIAL_ROTATION_INTERVAL: Duration = Duration::from_secs(300);

/// How often the readiness probe verifies cloud reachability.
const CLOUD_PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for in-flight reconciliations on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    // Exit the whole process when any thread panics: in a container a
    // restart beats a half-alive operator.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let cli = Cli::parse();
    let config = match Config::resolve(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            std::process::exit(2);
        }
    };
    init_tracing(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "starting vpsie-autoscaler");

    let client: Client = Client::try_default()
        .await
        .expect("expected a valid kubeconfig or in-cluster environment");

    if let Err(err) = run(client, config).await {
        error!(error = %err, "fatal startup error");
        std::process::exit(1);
    }
}

fn init_tracing(config: &Config) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.log_level.parse().unwrap_or_else(|_| "info".parse().unwrap()))
        .from_env_lossy();
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .init(),
        LogFormat::Console => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init(),
    }
}

async fn run(client: Client, config: Config) -> Result<(), Error> {
    let registry = Registry::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Reading the credentials secret must succeed at startup; the
    // operator is useless without the cloud.
    let secret_api: Api<Secret> =
        Api::namespaced(client.clone(), &config.vpsie_secret_namespace);
    let secret = secret_api.get(&config.vpsie_secret_name).await.map_err(|err| {
        Error::FatalError(format!(
            "reading credentials secret {}/{}: {}",
            config.vpsie_secret_namespace, config.vpsie_secret_name, err
        ))
    })?;
    let credentials = Credentials::from_secret(&secret)?;

    let vpsie = Arc::new(VpsieClient::new(
        &VpsieClientConfig {
            request_timeout: config.vpsie_timeout,
            rate_limit_rpm: config.rate_limit_rpm,
            ..Default::default()
        },
        credentials,
        clock.clone(),
        &registry,
    )?);
    let vpsie_api: Arc<dyn VpsieApi> = vpsie.clone();

    let drain = Arc::new(DrainEngine::new(
        client.clone(),
        DrainConfig {
            drain_timeout: config.drain_timeout,
            per_pod_timeout: config.drain_timeout / 2,
            eviction_grace_period: config.eviction_grace_period,
        },
        DrainMetrics::new(&registry),
    ));

    let tracker = Arc::new(UtilizationTracker::new(
        TrackerConfig {
            cpu_threshold: config.scale_cpu_threshold,
            memory_threshold: config.scale_memory_threshold,
            observation_window: config.observation_window,
        },
        clock.clone(),
    ));

    let scaledown_manager = Arc::new(ScaleDownManager::new(
        client.clone(),
        tracker.clone(),
        SafetyEvaluator::new(SafetyConfig::default()),
        PolicyEngine::new(PolicyConfig {
            cooldown: config.cooldown_period,
            global_window: None,
        }),
        drain.clone(),
        ScaleDownConfig {
            max_nodes_per_scale_down: config.max_nodes_per_scale_down,
        },
        ScaleDownMetrics::new(&registry),
        clock.clone(),
    ));

    let cost = Arc::new(CostCalculator::new(
        vpsie_api.clone(),
        DEFAULT_COST_TTL,
        clock.clone(),
    ));

    let rebalancer = if config.rebalancing_enabled {
        let metrics = RebalanceMetrics::new(&registry);
        Some(Arc::new(Rebalancer::new(
            client.clone(),
            RebalanceAnalyzer::new(AnalyzerConfig {
                cooldown: config.rebalancing_cooldown,
                ..Default::default()
            }),
            RebalanceExecutor::new(
                client.clone(),
                drain.clone(),
                metrics.clone(),
                ExecutorConfig::default(),
            ),
            cost.clone(),
            tracker.clone(),
            PlannerConfig {
                strategy: config.rebalancing_strategy,
                batch_size: config.rebalancing_batch_size,
                batch_timeout: config.rebalancing_timeout,
            },
            metrics,
        )))
    } else {
        None
    };

    // Observability surfaces come up before leader election so a
    // follower still answers probes and serves metrics.
    let readiness = Arc::new(ReadinessState::default());
    tokio::spawn(metrics::run_server(config.metrics_bind_address, registry.clone()));
    tokio::spawn(health::run_server(config.health_bind_address, readiness.clone()));
    tokio::spawn(cloud_probe(vpsie_api.clone(), readiness.clone()));
    tokio::spawn(credential_rotation(
        secret_api,
        config.vpsie_secret_name.clone(),
        vpsie.clone(),
    ));

    // Leader gate. Non-leaders idle here, ready for failover.
    let mut leader_rx = if config.leader_election {
        let identity = std::env::var("HOSTNAME").ok().or_else(|| {
            hostname::get().ok().and_then(|h| h.into_string().ok())
        });
        let elector = leader::LeaderElector::new(
            client.clone(),
            config.leader_election_namespace.clone(),
            config.leader_election_id.clone(),
            identity.unwrap_or_else(|| format!("vpsie-autoscaler-{}", uuid::Uuid::new_v4())),
            Duration::from_secs(15),
        );
        let (rx, _handle) = elector.start();
        rx
    } else {
        let (tx, rx) = tokio::sync::watch::channel(true);
        // Keep the channel open for the lifetime of the process.
        std::mem::forget(tx);
        rx
    };
    readiness.set_leader_state_known(true);

    while !*leader_rx.borrow() {
        info!("waiting for leadership");
        if leader_rx.changed().await.is_err() {
            return Err(Error::FatalError("leader election channel closed".to_owned()));
        }
    }
    info!("acquired leadership, starting control loops");

    let nodegroup_ctx = Arc::new(nodegroups::ContextData {
        client: client.clone(),
        metrics: nodegroups::NodeGroupMetrics::new(&registry),
        resync: config.sync_period,
    });
    let vpsnode_ctx = Arc::new(vpsnodes::ContextData {
        client: client.clone(),
        vpsie: vpsie_api.clone(),
        drain: drain.clone(),
        metrics: vpsnodes::VpsNodeMetrics::new(&registry),
        resync: config.sync_period,
    });

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(async move {
        let _ = nodegroups::run(nodegroup_ctx).await;
    }));
    tasks.push(tokio::spawn(async move {
        let _ = vpsnodes::run(vpsnode_ctx).await;
    }));
    tasks.push(tokio::spawn(tracker_loop(
        scaledown_manager.clone(),
        MetricsServerSource::new(client.clone()),
    )));
    tasks.push(tokio::spawn(scale_loop(
        client.clone(),
        scaledown_manager,
        ScaleUpEvaluator::new(ScaleUpConfig::default()),
        cost.clone(),
    )));
    if let Some(rebalancer) = rebalancer {
        tasks.push(tokio::spawn(rebalance_loop(client.clone(), rebalancer)));
    }
    readiness.set_controllers_started(true);

    // Run until a shutdown signal or leadership loss; either way the
    // controllers stop admitting work and in-flight reconciliations
    // get a grace period. Drains finish under their own detached
    // deadlines regardless.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        changed = leader_rx.changed() => {
            if changed.is_ok() && !*leader_rx.borrow() {
                warn!("lost leadership, shutting down for a clean restart");
            }
        }
    }
    readiness.set_controllers_started(false);
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    for task in &tasks {
        task.abort();
    }
    vpsie_api.close().await;
    info!("shutdown complete");
    Ok(())
}

/// Feeds the utilization tracker from the metrics source on a fixed
/// cadence.
async fn tracker_loop(manager: Arc<ScaleDownManager>, source: MetricsServerSource) {
    let mut ticker = tokio::time::interval(TRACKER_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(err) = manager.update_utilization(&source).await {
            warn!(error = %err, "utilization update failed");
        }
    }
}

/// Runs the scale-up evaluator and the scale-down manager over every
/// node group.
async fn scale_loop(
    client: Client,
    manager: Arc<ScaleDownManager>,
    evaluator: ScaleUpEvaluator,
    cost: Arc<CostCalculator>,
) {
    let mut ticker = tokio::time::interval(SCALE_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(err) = scale_pass(&client, &manager, &evaluator, &cost).await {
            warn!(error = %err, "scale pass failed");
        }
    }
}

async fn scale_pass(
    client: &Client,
    manager: &ScaleDownManager,
    evaluator: &ScaleUpEvaluator,
    cost: &CostCalculator,
) -> Result<(), Error> {
    let group_api: Api<NodeGroup> = Api::all(client.clone());
    let groups = group_api.list(&ListParams::default()).await?.items;
    if groups.is_empty() {
        return Ok(());
    }

    // Scale-up first: pending pods outrank savings.
    let pod_api: Api<Pod> = Api::all(client.clone());
    let pods = pod_api
        .list(&ListParams::default().fields("status.phase=Pending"))
        .await?
        .items;
    let offerings: HashMap<String, vpsie::types::Offering> = cost
        .all_costs()
        .await?
        .into_iter()
        .map(|(id, c)| {
            (
                id.clone(),
                vpsie::types::Offering {
                    id,
                    name: String::new(),
                    cpu: c.cpu,
                    memory_mb: c.memory_mb,
                    disk_gb: c.disk_gb,
                    hourly_price: c.hourly_price,
                    datacenter_id: c.datacenter,
                },
            )
        })
        .collect();
    for decision in evaluator.evaluate(&groups, &pods, &offerings, chrono::Utc::now()) {
        let group = groups
            .iter()
            .find(|g| g.name_any() == decision.group && g.namespace().as_deref() == Some(decision.namespace.as_str()));
        if let Some(group) = group {
            info!(group = %decision.group, delta = decision.delta, pods = decision.pending_pods, "scaling up");
            scaleup::apply(client.clone(), group, &decision).await?;
            let recorder = events::recorder(client.clone(), group);
            events::normal(
                &recorder,
                "ScaleUp",
                "ScaleUpTriggered",
                format!(
                    "+{} node(s) for {} unschedulable pod(s)",
                    decision.delta, decision.pending_pods
                ),
            )
            .await;
        }
    }

    // Scale-down second, group by group.
    for group in &groups {
        match manager.pass(group).await {
            Ok(retired) if retired > 0 => {
                info!(group = %group.name_any(), retired, "scale-down pass retired nodes");
            }
            Ok(_) => {}
            Err(err) if err.is_transient() => {
                warn!(group = %group.name_any(), error = %err, "scale-down pass requeued");
            }
            Err(err) => {
                error!(group = %group.name_any(), error = %err, "scale-down pass failed");
            }
        }
    }
    Ok(())
}

/// Periodic rebalancing over every group.
async fn rebalance_loop(client: Client, rebalancer: Arc<Rebalancer>) {
    let mut ticker = tokio::time::interval(REBALANCE_INTERVAL);
    loop {
        ticker.tick().await;
        let group_api: Api<NodeGroup> = Api::all(client.clone());
        let groups = match group_api.list(&ListParams::default()).await {
            Ok(groups) => groups.items,
            Err(err) => {
                warn!(error = %err, "listing groups for rebalance failed");
                continue;
            }
        };
        for group in &groups {
            if let Err(err) = rebalancer.run_once(group).await {
                warn!(group = %group.name_any(), error = %err, "rebalance pass failed");
            }
        }
    }
}

/// Keeps the readiness probe honest about cloud reachability.
async fn cloud_probe(vpsie: Arc<dyn VpsieApi>, readiness: Arc<ReadinessState>) {
    let mut ticker = tokio::time::interval(CLOUD_PROBE_INTERVAL);
    loop {
        ticker.tick().await;
        match vpsie.list_datacenters().await {
            Ok(_) => readiness.set_cloud_reachable(true),
            Err(err) => {
                warn!(error = %err, "cloud API unreachable");
                readiness.set_cloud_reachable(false);
            }
        }
    }
}

/// Re-reads the credentials secret so rotations take effect without a
/// restart. Failures here are graceful; the current token keeps
/// working until its expiry.
async fn credential_rotation(
    secret_api: Api<Secret>,
    secret_name: String,
    vpsie: Arc<VpsieClient>,
) {
    let mut ticker = tokio::time::interval(CREDENTIAL_ROTATION_INTERVAL);
    loop {
        ticker.tick().await;
        match secret_api.get(&secret_name).await {
            Ok(secret) => match Credentials::from_secret(&secret) {
                Ok(credentials) => vpsie.rotate_credentials(credentials),
                Err(err) => warn!(error = %err, "rotated credentials secret is invalid"),
            },
            Err(err) => warn!(error = %err, "re-reading credentials secret failed"),
        }
    }
}
