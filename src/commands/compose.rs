use anyhow::{Context, Result};
use std::fs;

use crate::cli::ComposeArgs;
use crate::compose;
use crate::ledger::{MemoryLedger, ModuleStore};
use crate::module::{Module, ModuleName, Seed};
use crate::resolver::DependencyResolver;
use crate::template::Template;

pub fn run(args: ComposeArgs) -> Result<()> {
    let ledger = MemoryLedger::from_json_file(&args.ledger)?;
    let (root, seed) = select_root(&ledger, &args)?;

    let closure = DependencyResolver::new(&ledger).resolve(&root.name)?;
    let program = compose::compose(&root, &closure, &seed)?;

    let output = if args.raw {
        program.into_string()
    } else {
        let template = match &args.template {
            Some(path) => Template::from_file(path)?,
            None => Template::default(),
        };
        template.wrap(&program)
    };

    match &args.output {
        Some(path) => {
            fs::write(path, &output).with_context(|| format!("Failed to write {}", path))?;
            eprintln!(
                "Composed {} ({} module(s), seed {}) into {}",
                root.name,
                closure.len() + 1,
                seed,
                path
            );
        }
        None => print!("{}", output),
    }

    Ok(())
}

fn select_root(ledger: &MemoryLedger, args: &ComposeArgs) -> Result<(Module, Seed)> {
    if let Some(token_id) = args.token {
        if let Some(invocation) = ledger.get_invocation(token_id) {
            let module = ledger
                .get_module(&invocation.module_name)
                .with_context(|| format!("Module \"{}\" not found", invocation.module_name))?;
            return Ok((module, invocation.seed));
        }
        let module = ledger
            .module_by_token(token_id)
            .with_context(|| format!("Token {} does not exist", token_id))?;
        return Ok((module, Seed::preview()));
    }

    let raw = args.module.as_deref().unwrap_or_default();
    let name = ModuleName::new(raw).with_context(|| format!("Invalid module name: {}", raw))?;
    let module = ledger
        .get_module(&name)
        .with_context(|| format!("Module \"{}\" not found", name))?;
    Ok((module, Seed::preview()))
}
