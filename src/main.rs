use anyhow::Result;
use clap::Parser;

use code_modules::cli::{Cli, Commands};
use code_modules::{commands, logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    logging::init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Dispatch to appropriate command handler
    match cli.command {
        Commands::Serve(args) => commands::serve::run(args).await,
        Commands::Resolve(args) => commands::resolve::run(args),
        Commands::Compose(args) => commands::compose::run(args),
        Commands::Template(args) => commands::template::run(args.command),
        Commands::Config(args) => commands::config::run(args.command),
    }
}
