//! micro-sam command line entry point

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use microsam_cli::Cli;

fn main() {
    let cli = Cli::parse();

    // Library records arrive through the `log` bridge
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "microsam_cli=info,microsam_embeddings=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = microsam_cli::run(cli) {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
