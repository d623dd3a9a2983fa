use anyhow::{Context, Result};
use std::fs;

use crate::cli::TemplateCommands;
use crate::template::Template;

pub fn run(command: TemplateCommands) -> Result<()> {
    match command {
        TemplateCommands::Check { path } => check(&path),
    }
}

fn check(path: &str) -> Result<()> {
    let source =
        fs::read_to_string(path).with_context(|| format!("Failed to read template: {}", path))?;
    let template = Template::parse(&source).with_context(|| format!("Invalid template: {}", path))?;

    println!("✓ Template is valid: {}", path);
    println!(
        "  {} bytes before the marker, {} bytes after",
        template.before.len(),
        template.after.len()
    );
    Ok(())
}
