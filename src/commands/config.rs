use anyhow::Result;
use tracing::info;

use crate::cli::ConfigCommands;
use crate::config::CodeModulesConfig;
use crate::config_discovery::load_config_with_discovery;

pub fn run(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { path } => validate(&path),
        ConfigCommands::Example => example(),
        ConfigCommands::Show { config } => show(config.as_deref()),
    }
}

fn validate(path: &str) -> Result<()> {
    info!("Validating config file: {}", path);

    let config = CodeModulesConfig::from_file(path)?;
    config.validate()?;

    println!("✓ Configuration file is valid: {}", path);
    println!("\nSummary:");
    println!("  - Bind: {}", config.server.bind);
    println!(
        "  - Admin routes: {}",
        if config.server.admin_token.is_some() { "enabled" } else { "disabled" }
    );
    println!("  - Cache directory: {}", config.cache.dir);
    println!("  - Mutable policy: {}", config.cache.mutable_policy);
    println!(
        "  - Snapshots: {} instance(s), timeout {}",
        config.snapshot.max_instances, config.snapshot.timeout
    );
    println!("  - Networks: {}", config.networks.len());

    for network in &config.networks {
        println!("    {} <- {}", network.id, network.ledger);
    }

    Ok(())
}

fn example() -> Result<()> {
    println!("{}", CodeModulesConfig::example()?);
    Ok(())
}

fn show(config_path: Option<&str>) -> Result<()> {
    let mut config = load_config_with_discovery(config_path)?;
    if config.server.admin_token.is_some() {
        config.server.admin_token = Some("<redacted>".to_string());
    }

    println!("Effective Configuration:\n");
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}
