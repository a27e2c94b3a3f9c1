use anyhow::Result;
use clap::Parser;
use dbcask_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let db_path = cli.db_path.clone();
    let state_root = cli.state_root.clone();

    let level = std::env::var("DBCASK_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(level)).init();

    match cli.command {
        Commands::Prepare(args) => args.run(db_path, state_root).await,
        Commands::Get(args) => args.run(db_path, state_root).await,
        Commands::List(args) => args.run(db_path, state_root).await,
        Commands::Rm(args) => args.run(db_path, state_root).await,
    }
}
