use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{signal, sync::mpsc};
use tracing::{error, info};

use marketplace_ledger as ledger;
use ledger::events::{EventHandler, EventMetrics, EventSender};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ledger::config::load_config()?;
    ledger::config::init_tracing(cfg.log_level(), cfg.log_json);
    ledger::handlers::health::init_start_time();

    // Init DB
    let db_pool = ledger::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        ledger::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(EventSender::new(event_tx));
    let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(EventMetrics)];
    tokio::spawn(ledger::events::process_events(event_rx, handlers));

    let gateways = Arc::new(
        ledger::gateways::GatewayRegistry::from_config(&cfg.gateways)
            .context("failed to initialise payment gateways")?,
    );
    let payout = ledger::services::payouts::payout_from_config(&cfg.settlement)
        .context("failed to initialise payout client")?;

    let cfg = Arc::new(cfg);
    let services = ledger::handlers::AppServices::new(
        db_arc.clone(),
        cfg.clone(),
        gateways,
        payout,
        event_sender,
    )?;

    let app_state = ledger::AppState {
        db: db_arc,
        jwt: Arc::new(ledger::auth::JwtKeys::new(&cfg.jwt_secret)),
        config: cfg.clone(),
        services,
    };
    let app = ledger::build_router(app_state);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;
    info!("marketplace-ledger listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
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
}
