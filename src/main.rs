use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ina_attribution::{AppState, Config, init_pool, init_router, run_delinquency_sweep};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    let pool = init_pool(&config.database_url).await?;

    // Scheduled delinquency sweeps; the job also stays manually triggerable
    // through POST /jobs/enforce-delinquency.
    let sweep_pool = pool.clone();
    let sweep_every = Duration::from_secs(config.enforcement_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            match run_delinquency_sweep(&sweep_pool).await {
                Ok(summary) if !summary.skipped => {
                    tracing::info!(
                        merchants = summary.merchants_processed,
                        flagged = summary.flagged,
                        suspended = summary.suspended,
                        cleared = summary.cleared,
                        "scheduled delinquency sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!("scheduled delinquency sweep failed: {:?}", e),
            }
        }
    });

    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = TcpListener::bind(addr).await?;

    let app = init_router(AppState { pool, config });
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
