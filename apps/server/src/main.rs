mod config;
mod main_lib;
mod scheduler;

use config::Config;
use main_lib::{build_state, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.log_format);
    let state = build_state(&config).await?;

    let refresh_task = scheduler::start_token_refresh_scheduler(
        state.clone(),
        config.token_refresh_interval,
        config.portfolio_warmup,
    );
    let sweep_task =
        scheduler::start_cache_sweep_scheduler(state.clone(), config.cache_sweep_interval);

    tracing::info!("FinSight daemon running on {}", state.db_path);
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    refresh_task.abort();
    sweep_task.abort();
    Ok(())
}
