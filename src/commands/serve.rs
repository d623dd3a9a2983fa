use anyhow::{Context, Result};
use std::fs;
use std::sync::Arc;
use tracing::info;

use crate::cli::ServeArgs;
use crate::config::CodeModulesConfig;
use crate::config_discovery::load_config_with_discovery;
use crate::http::HttpServer;
use crate::ledger::{MemoryLedger, ModuleStore};
use crate::render::{
    BrowserSnapshotter, ConcurrencyLimiter, FilesystemRenderStore, FlagStore, RenderService,
    Viewport,
};
use crate::template::{Template, TemplateStore};

pub async fn run(args: ServeArgs) -> Result<()> {
    let mut config = load_config_with_discovery(args.config.as_deref())?;

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(token) = args.admin_token {
        config.server.admin_token = Some(token);
    }
    if let Some(dir) = args.cache_dir {
        config.cache.dir = dir;
    }
    config.validate()?;

    info!("Starting render service");
    info!("Configuration:");
    info!("  Bind: {}", config.server.bind);
    info!("  Cache directory: {}", config.cache.dir);
    info!("  Mutable policy: {}", config.cache.mutable_policy);
    info!("  Flags directory: {}", config.flags.dir);
    info!(
        "  Snapshots: {} via {} (timeout {})",
        config.snapshot.max_instances, config.snapshot.browser, config.snapshot.timeout
    );

    let bind = config.server.bind.clone();
    let admin_token = config.server.admin_token.clone();
    if admin_token.is_none() {
        info!("  Admin routes: disabled");
    }

    let service = build_service(&config)?;
    HttpServer::new(bind, Arc::new(service))
        .with_admin_token(admin_token)
        .run()
        .await
}

/// Assemble the render service from configuration
pub fn build_service(config: &CodeModulesConfig) -> Result<RenderService> {
    let store = Arc::new(FilesystemRenderStore::new(&config.cache.dir)?);

    let snapshotter = Arc::new(BrowserSnapshotter::new(
        &config.snapshot.browser,
        Viewport {
            width: config.snapshot.viewport_width,
            height: config.snapshot.viewport_height,
        },
        config.snapshot.timeout()?,
    ));

    let template = match &config.template.file {
        Some(path) => Template::from_file(path)?,
        None => Template::default(),
    };

    let mut service = RenderService::new(store, snapshotter)
        .with_templates(Arc::new(TemplateStore::new(template)))
        .with_flags(Arc::new(FlagStore::open(&config.flags.dir)?))
        .with_limiter(ConcurrencyLimiter::new(config.snapshot.max_instances))
        .with_policy(config.mutable_policy()?)
        .with_web_url_root(config.server.web_url_root.clone());

    if let Some(path) = &config.snapshot.placeholder {
        let placeholder = fs::read(path)
            .with_context(|| format!("Failed to read placeholder image: {}", path))?;
        service = service.with_placeholder(placeholder);
    }

    for network in &config.networks {
        let ledger = MemoryLedger::from_json_file(&network.ledger)?;
        info!("  Network {} <- {}", network.id, network.ledger);
        service = service.with_network(network.id, Arc::new(ledger) as Arc<dyn ModuleStore>);
    }

    Ok(service)
}
