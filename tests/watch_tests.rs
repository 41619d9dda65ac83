//! Integration tests for live reloading.

mod common;

use async_trait::async_trait;
use common::{init_tracing, write};
use layerconf::{
    ChangeKind, ConfigChange, ConfigLayer, LoadOptions, ResolveHook, WatchOptions, watch_config,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn channel_watch(debounce: Option<Duration>) -> (WatchOptions, mpsc::UnboundedReceiver<ConfigChange>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = WatchOptions::new()
        .with_debounce(debounce)
        .on_change(move |change| {
            let _ = tx.send(change);
        });
    (options, rx)
}

/// Resolve hook that stalls every load, leaving files to normal resolution.
struct SlowResolve {
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl ResolveHook for SlowResolve {
    async fn resolve(&self, _source: &str, _cwd: &Path) -> anyhow::Result<Option<ConfigLayer>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(None)
    }
}

fn slow_options(cwd: &Path, delay: Duration) -> (LoadOptions, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let options = LoadOptions::new().with_cwd(cwd).with_resolve_hook(SlowResolve {
        calls: calls.clone(),
        delay,
    });
    (options, calls)
}

/// Wait until the hook has been entered `count` times.
async fn wait_for_calls(calls: &AtomicUsize, count: usize) {
    timeout(WAIT, async {
        while calls.load(Ordering::SeqCst) < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reload never started");
}

#[tokio::test]
async fn test_update_fires_once_with_old_and_new() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    write(temp.path(), "config.json", r#"{"a": 1}"#);

    let (watch, mut changes) = channel_watch(Some(Duration::from_millis(100)));
    let watcher = watch_config(LoadOptions::new().with_cwd(temp.path()), watch)
        .await
        .unwrap();
    assert_eq!(watcher.config(), json!({"a": 1}));
    assert!(
        watcher
            .watching_files()
            .contains(&temp.path().join("config.json"))
    );

    write(temp.path(), "config.json", r#"{"a": 2}"#);

    let change = timeout(WAIT, changes.recv())
        .await
        .expect("no change delivered")
        .unwrap();
    assert_eq!(change.kind, ChangeKind::Updated);
    assert_eq!(change.path, temp.path().join("config.json"));
    assert_eq!(change.old_config.config["a"], json!(1));
    assert_eq!(change.config.config["a"], json!(2));
    assert_eq!(watcher.get("a"), Some(json!(2)));

    // Nothing else follows the single write
    assert!(
        timeout(Duration::from_millis(500), changes.recv())
            .await
            .is_err()
    );

    watcher.unwatch().await;
}

#[tokio::test]
async fn test_created_file_is_picked_up() {
    init_tracing();
    let temp = TempDir::new().unwrap();

    let (watch, mut changes) = channel_watch(Some(Duration::from_millis(50)));
    let watcher = watch_config(
        LoadOptions::new()
            .with_cwd(temp.path())
            .with_defaults(json!({"port": 3000})),
        watch,
    )
    .await
    .unwrap();
    assert_eq!(watcher.config(), json!({"port": 3000}));

    write(temp.path(), "config.yaml", "port: 4000\n");

    let change = timeout(WAIT, changes.recv())
        .await
        .expect("no change delivered")
        .unwrap();
    assert_eq!(change.kind, ChangeKind::Created);
    assert_eq!(change.config.config["port"], json!(4000));
    assert_eq!(change.old_config.config["port"], json!(3000));

    watcher.unwatch().await;
}

#[tokio::test]
async fn test_extended_layer_change_reloads() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    write(temp.path(), "config.json", r#"{"extends": "./base"}"#);
    write(temp.path(), "base/config.json", r#"{"color": "red"}"#);

    let (watch, mut changes) = channel_watch(Some(Duration::from_millis(50)));
    let watcher = watch_config(LoadOptions::new().with_cwd(temp.path()), watch)
        .await
        .unwrap();
    assert!(
        watcher
            .watching_files()
            .contains(&temp.path().join("base/config.json"))
    );

    write(temp.path(), "base/config.json", r#"{"color": "blue"}"#);

    let change = timeout(WAIT, changes.recv())
        .await
        .expect("no change delivered")
        .unwrap();
    assert_eq!(change.path, temp.path().join("base/config.json"));
    assert_eq!(change.config.config["color"], json!("blue"));

    watcher.unwatch().await;
}

#[tokio::test]
async fn test_unwatch_stops_callbacks() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    write(temp.path(), "config.json", r#"{"a": 1}"#);

    let (watch, mut changes) = channel_watch(Some(Duration::from_millis(50)));
    let watcher = watch_config(LoadOptions::new().with_cwd(temp.path()), watch)
        .await
        .unwrap();
    assert!(watcher.is_watching());

    watcher.unwatch().await;
    watcher.unwatch().await;
    assert!(!watcher.is_watching());

    write(temp.path(), "config.json", r#"{"a": 2}"#);
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The callback was dropped with the reload task, closing the channel
    assert!(changes.recv().await.is_none());
    assert_eq!(watcher.config(), json!({"a": 1}));
}

#[tokio::test]
async fn test_unwatch_during_reload_drops_result() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    write(temp.path(), "config.json", r#"{"a": 1}"#);

    let (options, calls) = slow_options(temp.path(), Duration::from_millis(500));
    let (watch, mut changes) = channel_watch(Some(Duration::from_millis(50)));
    let watcher = watch_config(options, watch).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    write(temp.path(), "config.json", r#"{"a": 2}"#);
    wait_for_calls(&calls, 2).await;

    // The reload is parked inside the hook
    watcher.unwatch().await;
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert!(changes.recv().await.is_none());
    assert_eq!(watcher.config(), json!({"a": 1}));
}

#[tokio::test]
async fn test_events_during_reload_apply_in_order() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    write(temp.path(), "config.json", r#"{"a": 1}"#);

    let (options, calls) = slow_options(temp.path(), Duration::from_millis(400));
    let (watch, mut changes) = channel_watch(Some(Duration::from_millis(50)));
    let watcher = watch_config(options, watch).await.unwrap();

    write(temp.path(), "config.json", r#"{"a": 2}"#);
    wait_for_calls(&calls, 2).await;
    write(temp.path(), "config.json", r#"{"a": 3}"#);

    let mut received = Vec::new();
    while let Ok(Some(change)) = timeout(Duration::from_millis(1500), changes.recv()).await {
        received.push(change);
    }
    assert!(!received.is_empty(), "no change delivered");

    // Each reload starts from the state the previous one published
    let mut previous = json!(1);
    for change in &received {
        assert_eq!(change.old_config.config["a"], previous);
        previous = change.config.config["a"].clone();
    }
    assert_eq!(previous, json!(3));
    assert_eq!(watcher.get("a"), Some(json!(3)));

    watcher.unwatch().await;
}

#[tokio::test]
async fn test_extend_only_layer_is_watched() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    write(temp.path(), "config.json", r#"{"extends": "./theme"}"#);
    write(temp.path(), "theme/config.json", r#"{"extends": "../base"}"#);
    write(temp.path(), "base/config.json", r#"{"color": "red"}"#);

    let (watch, mut changes) = channel_watch(Some(Duration::from_millis(50)));
    let watcher = watch_config(LoadOptions::new().with_cwd(temp.path()), watch)
        .await
        .unwrap();
    assert_eq!(watcher.config(), json!({"color": "red"}));
    assert!(
        watcher
            .watching_files()
            .contains(&temp.path().join("theme/config.json"))
    );

    write(
        temp.path(),
        "theme/config.json",
        r#"{"extends": "../base", "color": "blue"}"#,
    );

    let change = timeout(WAIT, changes.recv())
        .await
        .expect("no change delivered")
        .unwrap();
    assert_eq!(change.path, temp.path().join("theme/config.json"));
    assert_eq!(change.config.config["color"], json!("blue"));
    assert_eq!(watcher.get("color"), Some(json!("blue")));

    watcher.unwatch().await;
}

#[tokio::test]
async fn test_without_debounce() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    write(temp.path(), "config.json", r#"{"a": 1}"#);

    let (watch, mut changes) = channel_watch(None);
    let watcher = watch_config(LoadOptions::new().with_cwd(temp.path()), watch)
        .await
        .unwrap();

    write(temp.path(), "config.json", r#"{"a": 2}"#);

    // A single write may surface as several raw events
    let mut latest = None;
    while let Ok(Some(change)) = timeout(Duration::from_millis(500), changes.recv()).await {
        latest = Some(change);
    }
    let change = latest.expect("no change delivered");
    assert_eq!(change.config.config["a"], json!(2));
    assert_eq!(watcher.get("a"), Some(json!(2)));

    watcher.unwatch().await;
}

#[tokio::test]
async fn test_reload_error_keeps_previous_state() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    write(temp.path(), "config.json", r#"{"a": 1}"#);

    let (error_tx, mut errors) = mpsc::unbounded_channel();
    let watch = WatchOptions::new()
        .with_debounce(Some(Duration::from_millis(50)))
        .on_error(move |err| {
            let _ = error_tx.send(err.to_string());
        });
    let watcher = watch_config(LoadOptions::new().with_cwd(temp.path()), watch)
        .await
        .unwrap();

    write(temp.path(), "config.json", "{ half written");

    let message = timeout(WAIT, errors.recv())
        .await
        .expect("no error delivered")
        .unwrap();
    assert!(message.contains("config.json"));
    assert_eq!(watcher.config(), json!({"a": 1}));

    watcher.unwatch().await;
}

#[tokio::test]
async fn test_initial_load_failure_is_fatal() {
    let temp = TempDir::new().unwrap();
    write(temp.path(), "config.json", "[1, 2]");

    let result = watch_config(LoadOptions::new().with_cwd(temp.path()), WatchOptions::new()).await;
    assert!(matches!(result, Err(layerconf::Error::InvalidConfig { .. })));
}
