//! Structured logging for code-modules
//!
//! All logs use structured fields so render traffic can be filtered by
//! network, token and output kind.
//!
//! # Log Format Conventions
//!
//! - `service`: The component emitting the event ("render", "http", ...)
//! - `operation`: What it was doing ("render", "preview", "invalidate", ...)
//! - `status`: The outcome ("hit", "miss", "success", "error", ...)
//! - `network_id`, `token_id`, `kind`: The render cache key
//! - `size_bytes`: Size of the produced content
//!
//! # Examples
//!
//! ```rust,ignore
//! use tracing::info;
//!
//! info!(
//!     service = services::RENDER,
//!     operation = operations::RENDER,
//!     status = status::HIT,
//!     network_id,
//!     token_id,
//!     kind = %kind,
//!     size_bytes = content.len(),
//!     "cache hit"
//! );
//! ```

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Shows "code-modules" instead of the full module path
struct CodeModulesFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for CodeModulesFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(
                writer,
                "{}{:5}(code-modules)\x1b[0m: ",
                level_style,
                meta.level()
            )?;
        } else {
            write!(writer, "{:5}(code-modules): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored
    Pretty,
    /// Same layout without colors (CI/production)
    Compact,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    pub fn parse(value: &str, ci: bool) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ if ci => Self::Compact,
            _ => Self::Pretty,
        }
    }

    /// Read `CODE_MODULES_LOG_FORMAT`, falling back on `CI`
    pub fn from_env() -> Self {
        Self::parse(
            &std::env::var("CODE_MODULES_LOG_FORMAT").unwrap_or_default(),
            std::env::var("CI").is_ok(),
        )
    }
}

/// Initialize the global tracing subscriber
///
/// # Environment Variables
///
/// - `RUST_LOG`: Log filter (e.g. "debug", "code_modules::render=trace")
/// - `CODE_MODULES_LOG_FORMAT`: "pretty", "compact" or "json"
/// - `CI`: If set, defaults to compact format
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match LogFormat::from_env() {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(CodeModulesFormatter { with_ansi: true })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(CodeModulesFormatter { with_ansi: false })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(false)
                    .with_writer(io::stderr)
                    .json(),
            )
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Service names
pub mod services {
    pub const RENDER: &str = "render";
    pub const HTTP: &str = "http";
    pub const ADMIN: &str = "admin";
}

/// Operation names
pub mod operations {
    pub const RENDER: &str = "render";
    pub const PREVIEW: &str = "preview";
    pub const INSPECT: &str = "inspect";
    pub const INVALIDATE: &str = "invalidate";
    pub const SNAPSHOT: &str = "snapshot";
    pub const SET_TEMPLATE: &str = "set_template";
    pub const SET_FLAG: &str = "set_flag";
}

/// Status values
pub mod status {
    pub const SUCCESS: &str = "success";
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const ERROR: &str = "error";
    pub const NOT_FOUND: &str = "not_found";
    pub const PLACEHOLDER: &str = "placeholder";
    pub const REJECTED: &str = "rejected";
}
