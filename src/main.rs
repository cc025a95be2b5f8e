use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use verso::cli::{render_file, Cli, Commands, ServeArgs};
use verso::cluster::{ClusterApi, KubeCluster, MemoryCluster};
use verso::config::{load_settings, serialize_settings, Backend, Settings};
use verso::orchestrator::VersionOrchestrator;
use verso::server::{create_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Some(ref env_file) = cli.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let mut settings = load_settings(cli.config.as_deref()).context("Failed to load settings")?;

    match cli.command {
        Commands::Serve(args) => serve(&mut settings, &args).await,
        Commands::Render(args) => {
            let output = render_file(&args.descriptor, &settings)
                .with_context(|| format!("Failed to render {}", args.descriptor.display()))?;
            println!("{}", output);
            Ok(())
        }
        Commands::Config => {
            println!("{}", serialize_settings(&settings)?);
            Ok(())
        }
    }
}

async fn serve(settings: &mut Settings, args: &ServeArgs) -> anyhow::Result<()> {
    args.apply(settings);
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid settings: {}", e))?;

    match settings.cluster.backend {
        Backend::Kube => {
            let cluster = KubeCluster::try_default()
                .await
                .context("Failed to connect to the Kubernetes API")?
                .with_field_manager(settings.cluster.field_manager.clone());
            run_server(Arc::new(cluster), settings).await
        }
        Backend::Memory => {
            info!("Using in-memory cluster, pods become ready on their own");
            run_server(Arc::new(MemoryCluster::with_auto_ready()), settings).await
        }
    }
}

async fn run_server<C: ClusterApi>(cluster: Arc<C>, settings: &Settings) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let orchestrator = VersionOrchestrator::new(cluster, settings);
    let state = AppState::new(orchestrator).with_shutdown(shutdown.clone());
    let app = create_router(state);

    let addr = settings.server.address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server listening on {}", addr);
    info!("Default namespace: {}", settings.cluster.namespace);
    info!("Endpoints:");
    info!("  GET  /health                    - Health check");
    info!("  POST /v1/versions/start         - Create a version");
    info!("  POST /v1/versions/wait          - Wait for version pods");
    info!("  POST /v1/versions/stop          - Remove a version");
    info!("  POST /v1/versions/publish       - Route product traffic to a version");
    info!("  POST /v1/versions/unpublish     - Take a version off the traffic path");
    info!("  POST /v1/versions/update-config - Replace config and restart workloads");
    info!("  GET  /v1/namespaces/{{ns}}/products/{{p}}/versions/{{v}}/status");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down, canceling pending waits");
            shutdown.cancel();
        })
        .await
        .context("Server error")?;
    Ok(())
}
