use advisor_gateway::{config, http, session};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match config::GatewayConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let state = match http::AppState::from_config(config.clone(), shutdown.clone()) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let sweeper = config.session_sweep_interval().map(|interval| {
        session::spawn_session_sweeper(
            state.gateway().sessions().clone(),
            interval,
            shutdown.clone(),
        )
    });

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(_) => {
            eprintln!("STARTUP_ERROR ERR_BIND_FAILED: failed to bind gateway listener");
            std::process::exit(1);
        }
    };

    tracing::info!(bind_addr = %config.bind_addr, "advisor-gateway listening");

    let signal_shutdown = shutdown.clone();
    let served = axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
            signal_shutdown.cancel();
        })
        .await;

    shutdown.cancel();
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }

    if let Err(err) = served {
        eprintln!("STARTUP_ERROR ERR_SERVER_FAILED: {}", err);
        std::process::exit(1);
    }
}
