//! Cached, capacity-bounded rendering of module tokens

pub mod cache;
pub mod flags;
pub mod limiter;
pub mod service;
pub mod snapshot;
pub mod stats;

pub use cache::{CacheKey, FilesystemRenderStore, MemoryRenderStore, RenderKind, RenderStore};
pub use flags::FlagStore;
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use service::{
    ModuleInspection, MutablePolicy, PreviewRequest, RenderError, RenderService, RenderSource,
    Rendered,
};
pub use snapshot::{BrowserSnapshotter, SnapshotError, Snapshotter, Viewport, PLACEHOLDER_PNG};
pub use stats::{RenderStats, StatsSnapshot};
