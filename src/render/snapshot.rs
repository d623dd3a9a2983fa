//! Isolated screenshot step
//!
//! Composed documents run untrusted module code, so they are only ever
//! executed inside a separate headless browser process. Each capture gets a
//! fresh scratch directory and is bounded by a timeout; when the timeout
//! fires the child is killed and the error propagates to the caller, which
//! releases its limiter slot on the way out.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Built-in 1x1 transparent PNG served for modules that are not featured
pub const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to launch browser \"{browser}\": {source}")]
    Launch {
        browser: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot timed out after {0:?}")]
    Timeout(Duration),

    #[error("Browser exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Browser produced no image")]
    EmptyOutput,

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes a composed document in isolation and captures it as PNG
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn capture(&self, html: &str) -> Result<Vec<u8>, SnapshotError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 350,
            height: 350,
        }
    }
}

/// Headless Chromium-compatible browser driven through its command line
#[derive(Debug, Clone)]
pub struct BrowserSnapshotter {
    browser: PathBuf,
    viewport: Viewport,
    timeout: Duration,
}

impl BrowserSnapshotter {
    pub fn new(browser: impl Into<PathBuf>, viewport: Viewport, timeout: Duration) -> Self {
        Self {
            browser: browser.into(),
            viewport,
            timeout,
        }
    }

    fn command(&self, page: &std::path::Path, output: &std::path::Path) -> Command {
        let mut command = Command::new(&self.browser);
        command
            .arg("--headless")
            .arg("--disable-gpu")
            .arg("--hide-scrollbars")
            .arg("--no-first-run")
            .arg("--disable-extensions")
            .arg(format!(
                "--window-size={},{}",
                self.viewport.width, self.viewport.height
            ))
            .arg(format!("--screenshot={}", output.display()))
            .arg(format!("file://{}", page.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Snapshotter for BrowserSnapshotter {
    async fn capture(&self, html: &str) -> Result<Vec<u8>, SnapshotError> {
        let scratch = tempfile::TempDir::new()?;
        let page = scratch.path().join("index.html");
        let output = scratch.path().join("screenshot.png");
        tokio::fs::write(&page, html).await?;

        let child = self
            .command(&page, &output)
            .spawn()
            .map_err(|source| SnapshotError::Launch {
                browser: self.browser.display().to_string(),
                source,
            })?;

        debug!(
            browser = %self.browser.display(),
            width = self.viewport.width,
            height = self.viewport.height,
            "Launched snapshot browser"
        );

        // Dropping the wait future on timeout drops the child, which kills it
        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout = ?self.timeout, "Snapshot browser timed out, killed");
                return Err(SnapshotError::Timeout(self.timeout));
            }
        };

        if !result.status.success() {
            return Err(SnapshotError::Failed {
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        let image = match tokio::fs::read(&output).await {
            Ok(image) => image,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::EmptyOutput)
            }
            Err(e) => return Err(e.into()),
        };
        if image.is_empty() {
            return Err(SnapshotError::EmptyOutput);
        }

        Ok(image)
    }
}
