use clap::Parser;
use redact_desk_lib::cli::{self, args::Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    redact_desk_lib::logging::init(cli.verbose);

    cli::run(cli).await
}
