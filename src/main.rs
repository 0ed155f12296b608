mod analysis;
mod api;
mod auth;
mod config;
mod error;
mod providers;
mod store;

use std::sync::Arc;

use tracing::info;

use crate::api::{build_router, AppState};
use crate::auth::{JwksVerifier, ManagementClient};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::providers::build_providers;
use crate::store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shesafe_server=info,axum=info".into()),
        )
        .compact()
        .init();

    let cfg = AppConfig::from_env()?;

    tokio::fs::create_dir_all(&cfg.upload_dir)
        .await
        .map_err(|err| {
            AppError::internal(format!(
                "failed to create upload directory {:?}: {err}",
                cfg.upload_dir
            ))
        })?;

    let store = Store::open(&cfg.database_path).await?;
    let providers = build_providers(&cfg)?;

    let auth_http = reqwest::Client::new();
    let verifier = Arc::new(JwksVerifier::new(auth_http.clone(), &cfg));
    let directory = Arc::new(ManagementClient::new(auth_http, &cfg));

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        store,
        verifier,
        transcriber: providers.transcriber,
        generator: providers.generator,
        synthesizer: providers.synthesizer,
        directory,
    });

    let app = build_router(state);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        host = %cfg.host,
        port = cfg.port,
        database = %cfg.database_path,
        model = %cfg.gemini_model,
        "starting shesafe-server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
