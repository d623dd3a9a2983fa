// Library interface for code-modules
// This allows integration tests and external code to use the crate's modules

pub mod cli;
pub mod commands;
pub mod compose;
pub mod config;
pub mod config_discovery;
pub mod http;
pub mod ledger;
pub mod logging;
pub mod module;
pub mod render;
pub mod resolver;
pub mod template;

// Re-export commonly used types
pub use compose::{compose, ComposedProgram, CompositionError};
pub use config::CodeModulesConfig;
pub use http::HttpServer;
pub use ledger::{LedgerError, MemoryLedger, ModuleStore};
pub use module::{Invocation, Module, ModuleName, NetworkId, Seed, TokenId};
pub use render::{RenderError, RenderKind, RenderService};
pub use resolver::{DependencyResolver, ResolveError, ResolvedClosure};
pub use template::{Template, TemplateError, TemplateStore};
