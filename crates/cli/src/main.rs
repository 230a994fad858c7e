mod cli;
mod config;
mod ollama;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Commands, Settings};
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    //  Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,llama_core=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();

    let settings = || -> anyhow::Result<Settings> {
        Ok(Settings::resolve(&args.global, &AppConfig::load_or_default()?))
    };

    match args.command {
        Commands::Generate(g) => cli::generate::execute(settings()?, g).await,
        Commands::Embed(e) => cli::embed::execute(settings()?, e).await,
        Commands::Tokenize(t) => cli::tokenize::execute(settings()?, t).await,
        Commands::Meta(m) => cli::meta::execute(m).await,
        Commands::Models(m) => cli::models::execute(m).await,
        Commands::Config(c) => cli::config_cmd::execute(c).await,
    }
}
