use std::{env, net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use mailsift_core::{
    Config, Database, GmailClient, LabelSync, NoopLabelSync, RuleEngine, init_telemetry,
    migrations,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod api;

#[derive(Clone)]
pub(crate) struct AppState {
    db: Database,
    engine: Arc<RuleEngine>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let db = Database::new(&config.paths.database).await?;
    migrations::run_migrations(&db).await?;

    let sync: Arc<dyn LabelSync> = if config.gmail.enabled {
        info!(api_base = %config.gmail.api_base, "syncing label changes to gmail");
        Arc::new(GmailClient::from_config(&config.gmail)?)
    } else {
        info!("gmail sync disabled; label changes stay local");
        Arc::new(NoopLabelSync)
    };
    let engine = RuleEngine::new(db.clone(), sync, &config.engine)?;

    let shutdown = CancellationToken::new();
    let state = AppState {
        db,
        engine: Arc::new(engine),
    };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("{} listening on {}", config.app.service_name, listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    info!("server stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api::router())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    database: String,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = match state.db.health_check().await {
        Ok(()) => true,
        Err(err) => {
            error!(error = %err, "database health check failed");
            false
        }
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: if healthy { "ok" } else { "unhealthy" }.to_string(),
        }),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use mailsift_core::{EngineConfig, LabelRepository, NewLabel};
    use tempfile::TempDir;

    pub(crate) async fn state() -> (AppState, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("test.sqlite"))
            .await
            .expect("create db");
        migrations::run_migrations(&db).await.expect("migrations");

        let labels = LabelRepository::new(db.clone());
        labels.upsert(NewLabel::system("INBOX")).await.expect("label");
        labels
            .upsert(NewLabel::user("Label_1", "Finance"))
            .await
            .expect("label");

        let engine = RuleEngine::new(db.clone(), Arc::new(NoopLabelSync), &EngineConfig::default())
            .expect("engine");
        (
            AppState {
                db,
                engine: Arc::new(engine),
            },
            dir,
        )
    }
}
