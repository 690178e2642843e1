//! zkrollup-operator service entry point.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zkrollup_operator::{run_server, OperatorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,zkrollup_operator=debug,zkrollup_state=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = OperatorConfig::from_env()?;
    tracing::info!(
        depth = config.account_db_depth,
        listen_addr = %config.listen_addr,
        seeded = config.proving_seed.is_some(),
        "starting zkrollup-operator"
    );

    run_server(config).await
}
