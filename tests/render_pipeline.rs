// Render pipeline integration tests
//
// Drives RenderService end to end against an in-memory ledger: cache round
// trips, capacity rejection, visibility gating and invalidation.
//
// To run: `cargo test --test render_pipeline`

mod common;

use code_modules::render::{
    ConcurrencyLimiter, FilesystemRenderStore, MutablePolicy, RenderSource,
};
use code_modules::{MemoryLedger, ModuleStore, RenderError, RenderKind, RenderService};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn art_ledger() -> Arc<MemoryLedger> {
    let ledger = ledger_with(&[("palette", &[]), ("shape", &["palette"])]);
    let mut art = draft(
        "art",
        &["palette", "shape"],
        "(palette, shape) => (seed) => `<p>${palette}${shape}${seed}</p>`",
    );
    art.is_invocable = true;
    ledger.create_module(OWNER, art).unwrap();
    ledger.set_invocations_max(OWNER, &name("art"), 10).unwrap();
    Arc::new(ledger)
}

#[tokio::test]
async fn test_cache_round_trip_skips_composition() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let ledger = art_ledger();
    let token = ledger.create_invocation(OWNER, &name("art")).unwrap();

    let service = RenderService::new(
        Arc::new(FilesystemRenderStore::new(temp_dir.path()).unwrap()),
        Arc::new(FakeSnapshotter::new()),
    )
    .with_network(NETWORK, ledger);

    let first = service.render(NETWORK, token, RenderKind::Html).await.unwrap();
    let second = service.render(NETWORK, token, RenderKind::Html).await.unwrap();

    assert_eq!(first.source, RenderSource::Rendered);
    assert_eq!(second.source, RenderSource::Cache);
    assert_eq!(first.content, second.content);
    assert_eq!(service.stats().compositions(), 1);
    assert!(temp_dir
        .path()
        .join(format!("{}-{}.html", NETWORK, token))
        .exists());
}

#[tokio::test]
async fn test_composition_is_deterministic_across_services() {
    let ledger = art_ledger();
    let token = ledger.create_invocation(OWNER, &name("art")).unwrap();

    let a = service(ledger.clone(), Arc::new(FakeSnapshotter::new()));
    let b = service(ledger, Arc::new(FakeSnapshotter::new()));

    let left = a.render(NETWORK, token, RenderKind::Html).await.unwrap();
    let right = b.render(NETWORK, token, RenderKind::Html).await.unwrap();
    assert_eq!(left.content, right.content);
}

#[tokio::test]
async fn test_capacity_exceeded_when_slots_held() {
    let ledger = art_ledger();
    let token = ledger.create_invocation(OWNER, &name("art")).unwrap();
    let snapshotter = Arc::new(FakeSnapshotter::new());

    let limiter = ConcurrencyLimiter::new(1);
    let service = service(ledger, snapshotter.clone()).with_limiter(limiter.clone());
    service.flags().add_featured(&name("art")).unwrap();

    let held = limiter.try_acquire().expect("slot should be free");
    let err = service
        .render(NETWORK, token, RenderKind::Image)
        .await
        .unwrap_err();
    assert!(matches!(err, RenderError::CapacityExceeded));
    assert_eq!(err.to_string(), "Max capacity reached, please try again later");
    assert_eq!(snapshotter.calls(), 0);

    drop(held);
    let rendered = service.render(NETWORK, token, RenderKind::Image).await.unwrap();
    assert_eq!(rendered.source, RenderSource::Rendered);
    assert_eq!(snapshotter.calls(), 1);
    assert_eq!(limiter.active(), 0);
}

#[tokio::test]
async fn test_simultaneous_images_reject_excess() {
    let ledger = art_ledger();
    let first = ledger.create_invocation(OWNER, &name("art")).unwrap();
    let second = ledger.create_invocation(OWNER, &name("art")).unwrap();
    let snapshotter = Arc::new(FakeSnapshotter::with_delay(Duration::from_millis(200)));

    let service = service(ledger, snapshotter.clone()).with_limiter(ConcurrencyLimiter::new(1));
    service.flags().add_featured(&name("art")).unwrap();

    let (a, b) = tokio::join!(
        service.render(NETWORK, first, RenderKind::Image),
        service.render(NETWORK, second, RenderKind::Image),
    );

    let rejected = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(RenderError::CapacityExceeded)))
        .count();
    assert_eq!(rejected, 1);
    assert!(a.is_ok() || b.is_ok());
    assert_eq!(snapshotter.calls(), 1);
    assert_eq!(service.limiter().active(), 0);
    assert_eq!(service.stats().snapshot().capacity_rejections, 1);
}

#[tokio::test]
async fn test_unflagged_image_is_placeholder() {
    let ledger = art_ledger();
    let token = ledger.create_invocation(OWNER, &name("art")).unwrap();
    let snapshotter = Arc::new(FakeSnapshotter::new());
    let service = service(ledger, snapshotter.clone()).with_limiter(ConcurrencyLimiter::new(0));

    // Zero slots: the placeholder path never touches the limiter
    let rendered = service.render(NETWORK, token, RenderKind::Image).await.unwrap();
    assert_eq!(rendered.source, RenderSource::Placeholder);
    assert_eq!(snapshotter.calls(), 0);

    service
        .flags()
        .add_whitelisted(NETWORK, &name("art"))
        .unwrap();
    let err = service
        .render(NETWORK, token, RenderKind::Image)
        .await
        .unwrap_err();
    assert!(matches!(err, RenderError::CapacityExceeded));
}

#[tokio::test]
async fn test_not_found_is_not_cached() {
    let ledger = art_ledger();
    let service = service(ledger.clone(), Arc::new(FakeSnapshotter::new()));

    let err = service.render(NETWORK, 999, RenderKind::Html).await.unwrap_err();
    assert!(matches!(err, RenderError::NotFound { .. }));
    assert!(!service.invalidate(NETWORK, 999, RenderKind::Html).await.unwrap());

    let err = service.render(42, 1, RenderKind::Html).await.unwrap_err();
    assert!(matches!(err, RenderError::NetworkUnavailable(42)));
}

#[tokio::test]
async fn test_cycle_fails_without_cache_write() {
    let ledger = ledger_with(&[("loop", &[])]);
    let token = ledger.get_module(&name("loop")).unwrap().token_id;
    ledger
        .update_module(OWNER, draft("loop", &["loop"], "(l) => l"))
        .unwrap();
    let service = service(Arc::new(ledger), Arc::new(FakeSnapshotter::new()));

    let err = service.render(NETWORK, token, RenderKind::Html).await.unwrap_err();
    assert!(matches!(err, RenderError::Resolve(_)));
    assert!(!service.invalidate(NETWORK, token, RenderKind::Html).await.unwrap());
}

#[tokio::test]
async fn test_invalidate_forces_recomposition() {
    let ledger = art_ledger();
    let token = ledger.create_invocation(OWNER, &name("art")).unwrap();
    let service = service(ledger.clone(), Arc::new(FakeSnapshotter::new()));

    let before = service.render(NETWORK, token, RenderKind::Html).await.unwrap();

    // Editing a dependency leaves the cached document stale until invalidated
    ledger
        .update_module(OWNER, draft("palette", &[], "() => \"red\""))
        .unwrap();
    let stale = service.render(NETWORK, token, RenderKind::Html).await.unwrap();
    assert_eq!(stale.source, RenderSource::Cache);
    assert_eq!(stale.content, before.content);

    assert!(service.invalidate(NETWORK, token, RenderKind::Html).await.unwrap());
    let fresh = service.render(NETWORK, token, RenderKind::Html).await.unwrap();
    assert_eq!(fresh.source, RenderSource::Rendered);
    assert_ne!(fresh.content, before.content);
    assert_eq!(service.stats().compositions(), 2);
}

#[tokio::test]
async fn test_bypass_policy_recomposes_mutable_modules() {
    let ledger = art_ledger();
    let token = ledger.create_invocation(OWNER, &name("art")).unwrap();
    let service =
        service(ledger.clone(), Arc::new(FakeSnapshotter::new())).with_policy(MutablePolicy::Bypass);

    service.render(NETWORK, token, RenderKind::Html).await.unwrap();
    let again = service.render(NETWORK, token, RenderKind::Html).await.unwrap();
    assert_eq!(again.source, RenderSource::Rendered);

    for module in ["palette", "shape"] {
        ledger.finalize(OWNER, &name(module)).unwrap();
    }
    service.render(NETWORK, token, RenderKind::Html).await.unwrap();
    let cached = service.render(NETWORK, token, RenderKind::Html).await.unwrap();
    assert_eq!(cached.source, RenderSource::Cache);
}

#[tokio::test]
async fn test_demo_ledger_renders() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/ledger.json");
    let ledger = Arc::new(MemoryLedger::from_json_file(&path).expect("demo ledger loads"));
    let service = service(ledger, Arc::new(FakeSnapshotter::new()));

    let rendered = service.render(NETWORK, 4, RenderKind::Html).await.unwrap();
    let html = std::str::from_utf8(&rendered.content).unwrap();
    assert!(html.contains("__modules.set(\"palette\""));
    assert!(html.contains("__modules.set(\"random\""));
    assert!(html.contains("document.write(output)"));
}
