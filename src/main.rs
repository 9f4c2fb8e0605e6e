use anyhow::Result;
use axum::Router;
use helios::{api, config, controller, telemetry};
use config::Config;
use std::time::Duration;
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;
    init_tracing(Some(cfg.settings.log_level.as_str()));

    #[cfg(feature = "metrics")]
    let prometheus = helios::metrics::install_prometheus_recorder()?;

    let app_state = controller::AppState::new(cfg.settings.clone())?;

    #[allow(unused_mut)]
    let mut app: Router = api::router(app_state.clone(), &cfg.server);

    #[cfg(feature = "metrics")]
    {
        app = api::with_metrics(app, prometheus);
    }

    let addr = cfg.server.socket_addr()?;

    if cfg.server.host == "0.0.0.0" {
        warn!(
            "WARNING: Server binding to 0.0.0.0 - the control API will be reachable from the network \
            and it has no authentication."
        );
    }

    info!(
        %addr,
        executor = %cfg.settings.executor_backend,
        telemetry = %cfg.settings.telemetry_backend,
        prices = %cfg.settings.price_provider,
        "starting Helios"
    );

    app_state.scheduler.start(app_state.job_set()).await;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    app_state
        .scheduler
        .shutdown(Duration::from_secs(cfg.server.shutdown_grace_secs))
        .await;
    app_state.release_actuator().await;

    warn!("shutdown complete");
    Ok(())
}
