use clap::{Parser, Subcommand};

/// code-modules - Compose and render dependency-linked code modules
///
/// Resolves a module's dependency closure, composes it into a single
/// deterministic program, and serves cached renders of minted tokens.
#[derive(Parser, Debug)]
#[command(name = "code-modules")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compose and render dependency-linked code modules", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the render HTTP service
    Serve(ServeArgs),

    /// Print the dependency closure of a module
    Resolve(ResolveArgs),

    /// Compose a module or token into an HTML document
    Compose(ComposeArgs),

    /// Template utilities
    Template(TemplateArgs),

    /// Configuration management utilities
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Config file path
    #[arg(short = 'c', long, env = "CODE_MODULES_CONFIG")]
    pub config: Option<String>,

    /// Bind address, overrides server.bind
    #[arg(long, env = "CODE_MODULES_BIND")]
    pub bind: Option<String>,

    /// Admin bearer token, overrides server.admin_token
    #[arg(long, env = "CODE_MODULES_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// Render cache directory, overrides cache.dir
    #[arg(long, env = "CODE_MODULES_CACHE_DIR")]
    pub cache_dir: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ResolveArgs {
    /// JSON ledger snapshot
    #[arg(long)]
    pub ledger: String,

    /// Module to resolve
    pub module: String,

    /// Print the closure as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ComposeArgs {
    /// JSON ledger snapshot
    #[arg(long)]
    pub ledger: String,

    /// Module to compose with the preview seed
    #[arg(long, conflicts_with = "token", required_unless_present = "token")]
    pub module: Option<String>,

    /// Token id to compose (invocation seed, or preview seed for module tokens)
    #[arg(long)]
    pub token: Option<u64>,

    /// HTML template file; the built-in template is used when unset
    #[arg(long)]
    pub template: Option<String>,

    /// Print the bare program without the HTML wrapper
    #[arg(long)]
    pub raw: bool,

    /// Output file; stdout when unset
    #[arg(short, long)]
    pub output: Option<String>,
}

#[derive(Parser, Debug)]
pub struct TemplateArgs {
    #[command(subcommand)]
    pub command: TemplateCommands,
}

#[derive(Subcommand, Debug)]
pub enum TemplateCommands {
    /// Check that a template has exactly one inject marker
    Check {
        /// Path to template file
        path: String,
    },
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration file
    Validate {
        /// Path to config file
        path: String,
    },
    /// Print an example config file
    Example,
    /// Show effective configuration
    Show {
        /// Config file path
        #[arg(short = 'c', long, env = "CODE_MODULES_CONFIG")]
        config: Option<String>,
    },
}
