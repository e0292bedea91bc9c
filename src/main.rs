//! Binary entry point: CLI surface, startup wiring, and graceful shutdown
//! for the Kube Sentinel daemon.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use kube_sentinel::broadcast::Hub;
use kube_sentinel::config::{self, ClusterConfigDoc};
use kube_sentinel::k8s::{ClusterApi, ClusterAuth, KubeClusterApi};
use kube_sentinel::logsource::{LogQlHttpSource, LogSourceAuth, LogQlHttpConfig};
use kube_sentinel::orchestrator::Orchestrator;
use kube_sentinel::poller::PollerConfig;
use kube_sentinel::remediation::{RemediationConfig, RemediationEngine};
use kube_sentinel::rules;
use kube_sentinel::store::MemoryStore;
use kube_sentinel::web::{self, AppState};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "kube-sentinel",
    version,
    about = "Autonomous log-classification and remediation operator for Kubernetes"
)]
struct Cli {
    /// Path to `config.yaml`.
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to `rules.yaml`. Overrides `rulesFile` in the config document.
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    /// Override `web.listen` from the config document.
    #[arg(long, global = true)]
    listen: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the poll/classify/remediate daemon and the dashboard server.
    Run,
    /// Load and validate config + rules, then exit without starting anything.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match cli.command {
        Commands::CheckConfig => check_config(&cli),
        Commands::Run => run(&cli).await,
    }
}

fn check_config(cli: &Cli) -> Result<()> {
    let doc = config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let rules_path = cli.rules.clone().unwrap_or_else(|| PathBuf::from(&doc.rules_file));
    let rule_doc = rules::load(&rules_path)
        .with_context(|| format!("loading rules from {}", rules_path.display()))?;
    rules::build_engine(rule_doc.clone())
        .with_context(|| "compiling rule set".to_string())?;

    println!("{}", "config and rules are valid".green().bold());
    println!(
        "  {} {}",
        "log source:".dimmed(),
        doc.log_source.url
    );
    println!("  {} {}", "listen:".dimmed(), doc.web.listen);
    println!("  {} {} rule(s)", "rules:".dimmed(), rule_doc.rules.len());
    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    let doc = config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    let rules_path = cli.rules.clone().unwrap_or_else(|| PathBuf::from(&doc.rules_file));
    let rule_doc = match rules::load(&rules_path) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(error = %e, path = %rules_path.display(), "no usable rules file; falling back to built-in defaults");
            rules::RuleSetDocument {
                rules: rules::default_rule_specs(),
            }
        }
    };
    let rule_engine = rules::build_engine(rule_doc).context("compiling rule set")?;

    let listen = cli.listen.clone().unwrap_or_else(|| doc.web.listen.clone());

    let cluster_auth = match &doc.cluster {
        ClusterConfigDoc::InCluster => ClusterAuth::InCluster,
        ClusterConfigDoc::Kubeconfig { path } => ClusterAuth::Kubeconfig(PathBuf::from(path)),
    };

    // Cluster unreachability is never fatal: remediation degrades to
    // "always skipped" rather than bringing the whole process down, since
    // the poll/classify/store/dashboard pipeline is still useful on its own.
    let cluster_reachable = Arc::new(AtomicBool::new(false));
    let cluster: Arc<dyn ClusterApi> = match KubeClusterApi::connect(cluster_auth).await {
        Ok(api) => {
            cluster_reachable.store(true, std::sync::atomic::Ordering::Relaxed);
            Arc::new(api)
        }
        Err(e) => {
            error!(error = %e, "cluster API unreachable at startup; remediation will be skipped until it recovers");
            Arc::new(UnreachableCluster)
        }
    };

    let log_source = Arc::new(
        LogQlHttpSource::new(LogQlHttpConfig {
            base_url: doc.log_source.url.clone(),
            timeout_secs: 30,
            default_limit: doc.log_source.result_limit,
            auth: resolve_log_source_auth(&doc.log_source),
        })
        .context("building log source client")?,
    );

    let store: Arc<dyn kube_sentinel::store::IncidentStore> = Arc::new(MemoryStore::new(
        doc.store.max_incidents,
        doc.store.max_remediation_logs,
    ));

    let remediation_config = RemediationConfig {
        enabled: doc.remediation.enabled,
        dry_run: doc.remediation.dry_run,
        namespace_exclusions: doc.remediation.namespace_exclusions.clone(),
        max_actions_per_hour: doc.remediation.max_actions_per_hour,
    };
    let remediation = Arc::new(RemediationEngine::new(cluster, remediation_config));

    let hub = Arc::new(Hub::new());

    let dedup = Arc::new(kube_sentinel::dedup::DedupCache::new(
        kube_sentinel::dedup::DEFAULT_WINDOW,
    ));

    let poller_config = PollerConfig {
        query: doc.log_source.query.clone(),
        poll_interval: doc.poll_interval(),
        lookback: doc.lookback(),
        result_limit: doc.log_source.result_limit,
        ..PollerConfig::default()
    };

    let (orchestrator, batches) = Orchestrator::new(
        log_source,
        poller_config,
        dedup,
        rule_engine.clone(),
        store.clone(),
        remediation.clone(),
        hub.clone(),
    );
    let orchestrator = Arc::new(orchestrator);

    let cancel = CancellationToken::new();

    let orchestrator_handle = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run(batches, cancel).await })
    };

    let app = web::router(AppState {
        store,
        rules: rule_engine,
        rules_file: rules_path,
        remediation,
        hub,
        cluster_reachable,
    });

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding dashboard listener on {listen}"))?;
    info!(%listen, "dashboard listening");

    let server_cancel = cancel.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        server_cancel.cancelled().await;
    });

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "dashboard server exited with error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    cancel.cancel();
    if let Err(e) = orchestrator_handle.await {
        error!(error = %e, "orchestrator task panicked");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

fn resolve_log_source_auth(doc: &kube_sentinel::config::LogSourceConfigDoc) -> LogSourceAuth {
    if let (Some(username), Some(password)) = (&doc.basic_auth_username, &doc.basic_auth_password) {
        return LogSourceAuth::Basic {
            username: username.clone(),
            password: password.clone(),
        };
    }
    if let Some(tenant) = &doc.tenant_header {
        return LogSourceAuth::TenantHeader(tenant.clone());
    }
    LogSourceAuth::None
}

/// Stand-in `ClusterApi` used when the cluster was unreachable at startup.
/// Every operation fails with `Unavailable`, so the remediation engine's
/// gates (which always check the cluster) degrade to skipped actions
/// instead of panicking on a missing client.
struct UnreachableCluster;

#[async_trait::async_trait]
impl ClusterApi for UnreachableCluster {
    async fn get_pod(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<k8s_openapi::api::core::v1::Pod, kube_sentinel::error::ClusterApiError> {
        Err(unavailable())
    }
    async fn list_pods(
        &self,
        _namespace: &str,
        _label_selector: Option<&str>,
    ) -> Result<Vec<k8s_openapi::api::core::v1::Pod>, kube_sentinel::error::ClusterApiError> {
        Err(unavailable())
    }
    async fn delete_pod(
        &self,
        _namespace: &str,
        _name: &str,
        _grace_period_secs: u32,
    ) -> Result<(), kube_sentinel::error::ClusterApiError> {
        Err(unavailable())
    }
    async fn get_deployment_replicas(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<i32, kube_sentinel::error::ClusterApiError> {
        Err(unavailable())
    }
    async fn scale_deployment(
        &self,
        _namespace: &str,
        _name: &str,
        _replicas: i32,
    ) -> Result<(), kube_sentinel::error::ClusterApiError> {
        Err(unavailable())
    }
    async fn patch_deployment_rollback(
        &self,
        _namespace: &str,
        _name: &str,
        _to_revision: u64,
    ) -> Result<(), kube_sentinel::error::ClusterApiError> {
        Err(unavailable())
    }
    async fn list_replicasets(
        &self,
        _namespace: &str,
        _label_selector: Option<&str>,
    ) -> Result<Vec<kube_sentinel::k8s::ReplicaSetOwnerInfo>, kube_sentinel::error::ClusterApiError>
    {
        Err(unavailable())
    }
    async fn list_namespaces(&self) -> Result<Vec<String>, kube_sentinel::error::ClusterApiError> {
        Err(unavailable())
    }
    async fn list_events(
        &self,
        _namespace: &str,
    ) -> Result<Vec<k8s_openapi::api::core::v1::Event>, kube_sentinel::error::ClusterApiError> {
        Err(unavailable())
    }
    async fn resolve_deployment_for_pod(
        &self,
        _namespace: &str,
        _pod_name: &str,
    ) -> Result<String, kube_sentinel::error::ClusterApiError> {
        Err(unavailable())
    }
}

fn unavailable() -> kube_sentinel::error::ClusterApiError {
    kube_sentinel::error::ClusterApiError::Unavailable(
        "cluster API was unreachable at startup".to_string(),
    )
}
