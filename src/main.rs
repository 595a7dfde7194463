use simple_deploy_hook::api;
use simple_deploy_hook::logging::setup_logging;
use simple_deploy_hook::pipeline::{ProcessRunner, TokioProcessRunner};
use simple_deploy_hook::publisher::{CommandProxy, NoopProxy, ProxyControl};
use simple_deploy_hook::{AppState, DEFAULT_CONFIG_PATH, DeployConfig};
use std::sync::Arc;
use tracing::{error, info};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, finishing in-flight requests");
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config_path =
        std::env::var("DEPLOY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = match DeployConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = match setup_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logging setup error: {}", e);
            std::process::exit(1);
        }
    };

    config.log_secret_posture();

    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
    let proxy: Arc<dyn ProxyControl> = if config.proxy.enabled {
        Arc::new(CommandProxy::new(
            Arc::clone(&runner),
            config.proxy.reload_command.clone(),
            config.proxy.health_command.clone(),
            config.project.path.clone(),
        ))
    } else {
        info!("Proxy management disabled");
        Arc::new(NoopProxy)
    };

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    info!("Using config at {:?}", config_path);
    info!(
        "Project {} deploys on pushes to {}",
        config.project.path.display(),
        config.release_ref()
    );

    let state = match AppState::new(config, runner, proxy) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to initialize deploy service: {}", e);
            std::process::exit(1);
        }
    };
    let app = api::router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", bind_address, e);
            std::process::exit(1);
        }
    };
    info!("Listening on {}", bind_address);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
