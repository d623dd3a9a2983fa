//! Program composition
//!
//! Turns a root module and its resolved closure into one JavaScript program.
//! Each module's decoded function is called with the already-built outputs of
//! its declared dependencies, in declaration order, and the result is bound
//! under the module's name. The root is built last and, when invocable, is
//! called with the seed.
//!
//! Composition only assembles text. The program runs later inside an isolated
//! document (iframe sandbox or headless browser), never in this process.

pub mod code;

use std::collections::HashSet;
use std::fmt::Write as _;
use thiserror::Error;
use tracing::debug;

use crate::module::{Module, ModuleName, Seed};
use crate::resolver::ResolvedClosure;

use code::CodeError;

/// Name under which composed bindings are stored in the generated program
const BINDINGS: &str = "__modules";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompositionError {
    #[error("Module \"{module}\" has malformed code: {source}")]
    MalformedCode {
        module: ModuleName,
        #[source]
        source: CodeError,
    },

    /// The closure was not in dependency order. Unreachable when the closure
    /// comes from the resolver.
    #[error("Module \"{module}\" needs \"{dependency}\" before it was built")]
    MissingBinding {
        module: ModuleName,
        dependency: ModuleName,
    },
}

/// Composed JavaScript program text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedProgram(String);

impl ComposedProgram {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Root of a composition; a stored module or an unsaved draft
#[derive(Debug, Clone, Copy)]
pub struct CompositionRoot<'a> {
    pub name: &'a ModuleName,
    pub code: &'a str,
    pub dependencies: &'a [ModuleName],
    pub is_invocable: bool,
}

impl<'a> From<&'a Module> for CompositionRoot<'a> {
    fn from(module: &'a Module) -> Self {
        Self {
            name: &module.name,
            code: &module.code,
            dependencies: &module.dependencies,
            is_invocable: module.is_invocable,
        }
    }
}

/// Compose a stored module
pub fn compose(
    root: &Module,
    closure: &ResolvedClosure,
    seed: &Seed,
) -> Result<ComposedProgram, CompositionError> {
    compose_root(CompositionRoot::from(root), closure, seed)
}

pub fn compose_root(
    root: CompositionRoot<'_>,
    closure: &ResolvedClosure,
    seed: &Seed,
) -> Result<ComposedProgram, CompositionError> {
    let mut built: HashSet<&ModuleName> = HashSet::with_capacity(closure.len());
    let mut out = String::new();

    out.push_str("(() => {\n");
    let _ = writeln!(out, "  const {} = new Map();", BINDINGS);

    for module in &closure.ordered {
        let source = decode_module(&module.name, &module.code, module.dependencies.len())?;
        let arguments = binding_arguments(&module.name, &module.dependencies, &built)?;

        let _ = writeln!(
            out,
            "  {}.set({}, ({})({}));",
            BINDINGS,
            js_string(module.name.as_str()),
            indent_source(&source),
            arguments
        );
        built.insert(&module.name);
    }

    let source = decode_module(root.name, root.code, root.dependencies.len())?;
    let arguments = binding_arguments(root.name, root.dependencies, &built)?;
    let _ = writeln!(
        out,
        "  const root = ({})({});",
        indent_source(&source),
        arguments
    );

    if root.is_invocable {
        let _ = writeln!(out, "  const output = root({});", js_string(seed.as_str()));
        out.push_str("  if (typeof output === \"string\") {\n");
        out.push_str("    document.write(output);\n");
        out.push_str("  }\n");
    }
    out.push_str("})();\n");

    debug!(
        root = %root.name,
        modules = closure.len(),
        bytes = out.len(),
        "Composed program"
    );

    Ok(ComposedProgram(out))
}

fn decode_module(
    name: &ModuleName,
    encoded: &str,
    declared: usize,
) -> Result<String, CompositionError> {
    let decoded = code::admit(encoded).map_err(|source| CompositionError::MalformedCode {
        module: name.clone(),
        source,
    })?;

    if decoded.shape.arity > declared {
        debug!(
            module = %name,
            arity = decoded.shape.arity,
            declared,
            "Function takes more parameters than declared dependencies"
        );
    }

    Ok(decoded.source)
}

fn binding_arguments(
    module: &ModuleName,
    dependencies: &[ModuleName],
    built: &HashSet<&ModuleName>,
) -> Result<String, CompositionError> {
    let mut arguments = Vec::with_capacity(dependencies.len());
    for dependency in dependencies {
        if !built.contains(dependency) {
            return Err(CompositionError::MissingBinding {
                module: module.clone(),
                dependency: dependency.clone(),
            });
        }
        arguments.push(format!("{}.get({})", BINDINGS, js_string(dependency.as_str())));
    }
    Ok(arguments.join(", "))
}

/// Put the source on its own lines so a trailing line comment cannot swallow
/// the generated call
fn indent_source(source: &str) -> String {
    let mut out = String::from("\n");
    for line in source.lines() {
        if !line.is_empty() {
            out.push_str("    ");
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("  ");
    out
}

fn js_string(value: &str) -> String {
    // JSON string literals are valid JavaScript string literals; the extra
    // escape keeps a name from closing the surrounding script element.
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace("</", "<\\/")
}
