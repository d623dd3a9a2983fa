use anyhow::{Context, Result};
use serde_json::json;

use crate::cli::ResolveArgs;
use crate::ledger::MemoryLedger;
use crate::module::ModuleName;
use crate::resolver::DependencyResolver;

pub fn run(args: ResolveArgs) -> Result<()> {
    let ledger = MemoryLedger::from_json_file(&args.ledger)?;
    let name = ModuleName::new(args.module.as_str())
        .with_context(|| format!("Invalid module name: {}", args.module))?;

    let closure = DependencyResolver::new(&ledger).resolve(&name)?;
    let is_mutable = closure.is_mutable();

    if args.json {
        let output = json!({
            "module": name,
            "allDependencies": closure.names(),
            "isMutable": is_mutable,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if closure.is_empty() {
        println!("{} has no dependencies", name);
    } else {
        println!("{} depends on (composition order):", name);
        for (i, module) in closure.ordered.iter().enumerate() {
            let state = if module.is_finalized { "finalized" } else { "mutable" };
            println!("  {}. {} (token {}, {})", i + 1, module.name, module.token_id, state);
        }
    }
    println!("Mutable: {}", if is_mutable { "yes" } else { "no" });

    Ok(())
}
