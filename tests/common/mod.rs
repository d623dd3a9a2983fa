// Shared fixtures for integration tests
//
// Ledgers are built in memory through the authoring API, so every test owns
// its graph. The snapshot step is replaced by FakeSnapshotter; no browser is
// launched anywhere in the test suite.
#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use code_modules::ledger::ModuleDraft;
use code_modules::render::{MemoryRenderStore, SnapshotError, Snapshotter};
use code_modules::{MemoryLedger, ModuleName, RenderService};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const OWNER: &str = "0x00000000000000000000000000000000000000aa";
pub const NETWORK: u64 = 5777;

pub fn name(s: &str) -> ModuleName {
    ModuleName::new(s).expect("valid module name")
}

pub fn draft(module: &str, deps: &[&str], src: &str) -> ModuleDraft {
    ModuleDraft {
        name: name(module),
        metadata_json: format!(r#"{{"description":"{} module"}}"#, module),
        dependencies: deps.iter().map(|d| name(d)).collect(),
        code: STANDARD.encode(src),
        is_invocable: false,
    }
}

/// Create `(name, deps)` modules in order; each returns a constant
pub fn ledger_with(graph: &[(&str, &[&str])]) -> MemoryLedger {
    let ledger = MemoryLedger::new();
    for (module, deps) in graph {
        let params = deps
            .iter()
            .map(|d| d.replace('-', "_"))
            .collect::<Vec<_>>()
            .join(", ");
        let src = format!("({}) => \"{}\"", params, module);
        ledger
            .create_module(OWNER, draft(module, deps, &src))
            .expect("Failed to create module");
    }
    ledger
}

/// Snapshotter that records calls and optionally stalls
pub struct FakeSnapshotter {
    pub calls: AtomicUsize,
    delay: Duration,
}

impl FakeSnapshotter {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Snapshotter for FakeSnapshotter {
    async fn capture(&self, html: &str) -> Result<Vec<u8>, SnapshotError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut png = b"\x89PNG".to_vec();
        png.extend_from_slice(html.len().to_string().as_bytes());
        Ok(png)
    }
}

pub fn service(
    ledger: Arc<MemoryLedger>,
    snapshotter: Arc<FakeSnapshotter>,
) -> RenderService {
    RenderService::new(Arc::new(MemoryRenderStore::new()), snapshotter)
        .with_network(NETWORK, ledger)
}
