use clap::Parser;
use tracing::info;

/// Concurrent chat relay server: public/group/private messaging, in-band
/// file relay and tic-tac-toe mediation over plain TCP.
#[derive(Debug, Parser)]
#[command(name = "estuary", version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:55555")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    info!("estuary relay server");
    estuary::relay::server::run(&cli.listen).await
}
