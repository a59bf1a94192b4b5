use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fleetplane::activity::ActivityLog;
use fleetplane::agent::{ConnectionHandler, Hub, LivenessMonitor};
use fleetplane::config::Config;
use fleetplane::db::JobStore;
use fleetplane::db::postgres::Store;
use fleetplane::dispatch::{AgentRunner, Completer, Dispatcher, LocalRunner};
use fleetplane::pki::tls::{ListenerIdentity, server_config};
use fleetplane::pki::{CertificateAuthority, Envelope};
use fleetplane::provider::ProviderRegistry;
use fleetplane::registration::RegistrationService;
use fleetplane::runner::{AnsibleRunner, Runner};
use fleetplane::server::{self, AppState, serve_tls};
use fleetplane::shutdown::install_shutdown_handler;
use fleetplane::tasks::TaskRunner;
use fleetplane::tasks::site_import::SiteImportHandler;
use fleetplane::worker::{Executor, spawn_workers};

const TOKEN_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "fleetplane")]
#[command(version)]
#[command(about = "Control plane for a fleet of managed server nodes")]
struct Args {
    /// Address for the HTTPS listener
    #[arg(long, env = "FLEETPLANE_BIND")]
    bind: Option<SocketAddr>,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Number of job workers
    #[arg(long, env = "FLEETPLANE_WORKERS")]
    workers: Option<usize>,

    /// Apply database migrations and exit
    #[arg(long)]
    migrate_only: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fleetplane=info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Delete expired registration tokens every hour.
async fn cleanup_tokens(registration: RegistrationService, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(TOKEN_CLEANUP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => match registration.cleanup_expired().await {
                Ok(0) => {}
                Ok(deleted) => tracing::info!(deleted, "Removed expired registration tokens"),
                Err(e) => tracing::error!(error = %e, "Registration token cleanup failed"),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing();

    let mut config = Config::from_env_with_database(args.database_url.map(SecretString::from))
        .context("failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.http.bind = bind;
    }
    if let Some(workers) = args.workers {
        config.worker.workers = workers;
    }

    let store = Arc::new(
        Store::new(&config.database)
            .await
            .context("failed to connect to the database")?,
    );
    store.run_migrations().await.context("failed to run migrations")?;
    if args.migrate_only {
        tracing::info!("Migrations applied, exiting");
        return Ok(());
    }

    let recovered = store.recover_stuck_jobs().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "Requeued jobs left in flight by a previous run");
    }

    let shutdown = install_shutdown_handler();

    let envelope = Arc::new(
        Envelope::ensure_identity(&config.pki.age_key_path, true)
            .context("failed to load the envelope identity")?,
    );
    let ca = Arc::new(
        CertificateAuthority::load_or_create(store.as_ref(), &envelope, &config.pki.ca_key_path)
            .await
            .context("failed to load the certificate authority")?,
    );
    let registration = RegistrationService::new(
        store.clone(),
        store.clone(),
        ca.clone(),
        config.pki.node_cert_validity_days,
    );

    // Cloud provider clients are supplied by the embedding deployment.
    let registry = ProviderRegistry::new(Vec::new())?;
    if registry.is_empty() {
        tracing::warn!("No server providers registered, provision_server jobs will fail");
    }

    let activity = ActivityLog::new(store.clone());
    let hub = Arc::new(Hub::new());
    let completer = Arc::new(Completer::new(store.clone(), activity.clone()));
    let agents = ConnectionHandler::new(hub.clone(), completer);

    let ansible: Arc<dyn Runner> = Arc::new(AnsibleRunner::new(&config.runner));
    let local = Arc::new(LocalRunner::new(
        ansible.clone(),
        store.clone(),
        config.runner.playbooks_by_kind.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        hub.clone(),
        Arc::new(AgentRunner::new(hub.clone(), store.clone())),
        local,
        config.runner.playbooks_by_kind.keys().cloned(),
    ));
    let executor = Arc::new(Executor::new(
        store.clone(),
        store.clone(),
        store.clone(),
        registry.clone(),
        envelope.clone(),
        activity.clone(),
        dispatcher,
        config.provision.clone(),
    ));

    let mut tasks: Vec<JoinHandle<()>> =
        spawn_workers(&config.worker, store.clone(), executor, &shutdown);

    let monitor = LivenessMonitor::new(
        hub.clone(),
        store.clone(),
        Arc::new(activity.clone()),
        config.monitor.clone(),
    );
    tasks.push(tokio::spawn(monitor.run(shutdown.clone())));

    let mut task_runner = TaskRunner::new(store.clone(), config.tasks.poll_interval);
    if let Some(playbook) = &config.tasks.site_import_playbook {
        task_runner.register(Arc::new(SiteImportHandler::new(
            store.clone(),
            ansible.clone(),
            playbook.clone(),
            config.tasks.run_timeout,
        )));
    }
    tasks.push(tokio::spawn(task_runner.run(shutdown.clone())));
    tasks.push(tokio::spawn(cleanup_tokens(
        registration.clone(),
        shutdown.clone(),
    )));

    let identity = ListenerIdentity::resolve(&config.http, &ca)?;
    let tls = server_config(&ca, identity)?;
    let state = AppState::new(
        store.clone(),
        registry,
        registration,
        hub.clone(),
        agents,
        config.pki.registration_token_ttl,
        shutdown.clone(),
    );
    let app = server::router(state, config.http.admin_token.clone());
    let listener = TcpListener::bind(config.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    let served = serve_tls(listener, tls, app, shutdown.clone()).await;

    shutdown.cancel();
    hub.close_all().await;
    let joined = tokio::time::timeout(TASK_JOIN_TIMEOUT, async {
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
    })
    .await;
    if joined.is_err() {
        tracing::warn!("Background tasks did not stop in time");
    }

    served.context("HTTPS listener failed")?;
    tracing::info!("Shutdown complete");
    Ok(())
}
