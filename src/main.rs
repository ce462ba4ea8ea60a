use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, info, warn};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use sandboxd::api::{self, AppState};
use sandboxd::chat::ChatProxy;
use sandboxd::config::{Cli, LogFormat, Settings};
use sandboxd::container::{ContainerManager, ContainerRuntime, RuntimeKind};
use sandboxd::db::Database;
use sandboxd::local::LocalExecutor;
use sandboxd::port::PortAllocator;
use sandboxd::session::{SessionRegistry, SessionRepository};
use sandboxd::supervisor::Supervisor;
use sandboxd::workspace::WorkspaceProvisioner;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli).context("loading configuration")?;
    init_logging(&settings);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building the tokio runtime")?
        .block_on(run(settings))
}

fn init_logging(settings: &Settings) {
    let level = settings.log_level.as_str();
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sandboxd={level},tower_http={level}")));

    let result = match settings.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
    };
    if result.is_err() {
        return;
    }

    let log_level = match settings.log_level.as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(log_level);
    builder.try_init().ok();
}

async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    let db = Database::new(&settings.database_path)
        .await
        .context("opening the session database")?;
    let repo = SessionRepository::new(db.pool().clone());

    let ports = Arc::new(PortAllocator::new(
        settings.api_port_range(),
        settings.code_port_range(),
    ));

    let template_dir = settings.workspace_root.join(".config-template");
    let workspace = Arc::new(WorkspaceProvisioner::new(
        settings.workspace_root.clone(),
        template_dir,
    ));
    workspace
        .check_root_writable()
        .await
        .context("workspace_root is not writable")?;

    let runtime_kind = RuntimeKind::from_binary_name(&settings.container_runtime);
    let runtime = ContainerRuntime::new(runtime_kind);
    let containers = Arc::new(ContainerManager::new(Arc::new(runtime), settings.clone()));

    let local = Arc::new(LocalExecutor::new(
        settings.local_agent_binary.clone(),
        settings.agent_key.clone(),
        settings.agent_base_url.clone(),
        settings.agent_model.clone(),
        settings.health_check_timeout(),
    ));

    let sessions = Arc::new(SessionRegistry::new(
        repo,
        ports,
        workspace,
        containers.clone(),
        local,
        settings.clone(),
    ));

    let chat = Arc::new(ChatProxy::new(
        sessions.clone(),
        settings.request_timeout(),
        settings.stream_timeout(),
    ));

    let supervisor = Supervisor::new(sessions.clone(), chat.clone(), containers, settings.clone());
    supervisor.reconcile_orphans().await;

    let supervisor_task = tokio::spawn(async move {
        supervisor.run().await;
    });

    let state = AppState {
        sessions,
        chat,
        settings: settings.clone(),
    };
    let router = api::router(state);

    let listener = TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.bind_addr))?;
    info!("sandboxd listening on {}", settings.bind_addr);

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    supervisor_task.abort();
    serve_result.context("http server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    warn!("shutdown signal received, draining in-flight requests");
}
