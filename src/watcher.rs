//! Live reloading.
//!
//! [`watch_config`] runs the pipeline once, then watches every file that
//! could change the result: the config file candidates of each layer root,
//! declared layer sources, the rc file and `package.json`. Parent directories
//! are watched non-recursively so that files created after the initial load
//! are noticed too.
//!
//! Notifications flow through three stages:
//! - notify (optionally debounced) delivers raw events on a std channel
//! - a blocking forwarder filters them to the watched set and classifies them
//! - a single async task reloads, swaps the shared state and runs callbacks
//!
//! The reload task handles one event at a time. Events that pile up while a
//! reload is running are folded into the next one.

use crate::error::{Error, Result};
use crate::layer::PACKAGE_JSON;
use crate::loader::load_config;
use crate::options::LoadOptions;
use crate::types::{ConfigLayer, ResolvedConfig};
use arc_swap::ArcSwap;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind, Debouncer, new_debouncer};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay used to coalesce bursts of file system events.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Removed,
}

/// Delivered to `on_change` after a successful reload.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub kind: ChangeKind,
    /// The watched file that triggered the reload.
    pub path: PathBuf,
    /// State after the reload.
    pub config: Arc<ResolvedConfig>,
    /// State before the reload.
    pub old_config: Arc<ResolvedConfig>,
}

pub type ChangeCallback = Arc<dyn Fn(ConfigChange) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Watch settings.
#[derive(Clone)]
pub struct WatchOptions {
    /// `None` reacts to every raw event.
    pub debounce: Option<Duration>,
    pub on_change: Option<ChangeCallback>,
    /// Receives watcher and reload failures. The previous state is kept.
    pub on_error: Option<ErrorCallback>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Some(DEFAULT_DEBOUNCE),
            on_change: None,
            on_error: None,
        }
    }
}

impl fmt::Debug for WatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchOptions")
            .field("debounce", &self.debounce)
            .field("on_change", &self.on_change.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce(mut self, debounce: Option<Duration>) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn on_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConfigChange) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// The live notify subscription. Dropping it stops event delivery.
enum Subscription {
    Debounced(Debouncer<RecommendedWatcher>),
    Immediate(RecommendedWatcher),
}

type Notification = std::result::Result<(ChangeKind, PathBuf), notify::Error>;

/// A resolved config that follows its files.
pub struct ConfigWatcher {
    state: Arc<ArcSwap<ResolvedConfig>>,
    watching_files: Vec<PathBuf>,
    closed: Arc<AtomicBool>,
    subscription: Mutex<Option<Subscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("watching_files", &self.watching_files)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ConfigWatcher {
    /// The latest resolution.
    pub fn current(&self) -> Arc<ResolvedConfig> {
        self.state.load_full()
    }

    /// The latest merged config.
    pub fn config(&self) -> Value {
        self.state.load().config.clone()
    }

    /// The latest layers, highest precedence first.
    pub fn layers(&self) -> Vec<ConfigLayer> {
        self.state.load().layers.clone()
    }

    /// Look up a value of the latest config by dotted path.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.state.load().get(path).cloned()
    }

    /// Files under watch. Fixed at start.
    pub fn watching_files(&self) -> &[PathBuf] {
        &self.watching_files
    }

    pub fn is_watching(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Stop watching. The exposed state stays at its last value.
    ///
    /// Once this returns no callback runs again. Calling it more than once is
    /// a no-op.
    pub async fn unwatch(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(lock(&self.subscription).take());
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        info!("Stopped watching {} file(s)", self.watching_files.len());
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Load the config and keep it current as its files change.
///
/// Fails when the initial load fails or the subscription cannot be set up.
/// Later failures go to `on_error`.
pub async fn watch_config(options: LoadOptions, watch: WatchOptions) -> Result<ConfigWatcher> {
    let initial = load_config(&options).await?;
    let watching_files = watching_files(&initial, &options);
    let watched = WatchedSet::new(&watching_files).await;

    let (notify_tx, notify_rx) = unbounded_channel();
    let subscription = subscribe(&watched, watch.debounce, notify_tx)?;
    info!(
        "Watching {} file(s) in {} directories",
        watching_files.len(),
        watched.dirs.len()
    );

    let state = Arc::new(ArcSwap::from_pointee(initial));
    let closed = Arc::new(AtomicBool::new(false));
    let task = tokio::spawn(reload_events(
        notify_rx,
        Reloader {
            options,
            state: state.clone(),
            closed: closed.clone(),
            on_change: watch.on_change,
            on_error: watch.on_error,
        },
    ));

    Ok(ConfigWatcher {
        state,
        watching_files,
        closed,
        subscription: Mutex::new(Some(subscription)),
        task: Mutex::new(Some(task)),
    })
}

/// Files whose changes can affect `resolved`, in discovery order.
pub fn watching_files(resolved: &ResolvedConfig, options: &LoadOptions) -> Vec<PathBuf> {
    let config_file = options.config_file_name();
    let candidates = |cwd: &Path| -> Vec<PathBuf> {
        if options.loaders.supports(Path::new(&config_file)) {
            vec![cwd.join(&config_file)]
        } else {
            options
                .loaders
                .extensions()
                .map(|ext| cwd.join(format!("{config_file}.{ext}")))
                .collect()
        }
    };

    let mut files = candidates(&resolved.cwd);
    // Every layer root, including layers that merged to nothing
    for layer in resolved.layers.iter().chain(&resolved.empty_layers) {
        let Some(cwd) = &layer.cwd else {
            continue;
        };
        files.extend(candidates(cwd));
        if let Some(source) = &layer.source {
            files.push(cwd.join(source));
        }
    }
    if let Some(rc_name) = options.rc_file_name() {
        files.push(resolved.cwd.join(rc_name));
    }
    if options.package_json.is_enabled() {
        files.push(resolved.cwd.join(PACKAGE_JSON));
    }

    let mut seen = HashSet::new();
    files.retain(|file| seen.insert(file.clone()));
    files
}

/// Watched files keyed the way notify reports them.
#[derive(Debug, Clone)]
struct WatchedSet {
    dirs: Vec<PathBuf>,
    /// `<canonical parent>/<file name>` to the watched path.
    by_event_path: HashMap<PathBuf, PathBuf>,
    /// Watched paths that existed at the last event.
    existing: HashSet<PathBuf>,
}

impl WatchedSet {
    async fn new(files: &[PathBuf]) -> Self {
        let mut dirs = Vec::new();
        let mut by_event_path = HashMap::new();
        let mut existing = HashSet::new();

        for file in files {
            let (Some(parent), Some(name)) = (file.parent(), file.file_name()) else {
                continue;
            };
            // notify reports canonical paths
            let Ok(parent) = tokio::fs::canonicalize(parent).await else {
                debug!("Not watching {}: directory is missing", file.display());
                continue;
            };
            if !dirs.contains(&parent) {
                dirs.push(parent.clone());
            }
            by_event_path.insert(parent.join(name), file.clone());
            if tokio::fs::try_exists(file).await.unwrap_or(false) {
                existing.insert(file.clone());
            }
        }

        Self {
            dirs,
            by_event_path,
            existing,
        }
    }

    fn lookup(&self, event_path: &Path) -> Option<PathBuf> {
        self.by_event_path.get(event_path).cloned()
    }

    /// Classify by comparing existence now with existence at the last event.
    fn classify_by_existence(&mut self, path: PathBuf) -> Option<(ChangeKind, PathBuf)> {
        let existed = self.existing.contains(&path);
        let exists = path.exists();
        let kind = match (existed, exists) {
            (false, true) => ChangeKind::Created,
            (true, true) => ChangeKind::Updated,
            (true, false) => ChangeKind::Removed,
            (false, false) => return None,
        };
        if exists {
            self.existing.insert(path.clone());
        } else {
            self.existing.remove(&path);
        }
        Some((kind, path))
    }
}

fn subscribe(
    watched: &WatchedSet,
    debounce: Option<Duration>,
    events: UnboundedSender<Notification>,
) -> Result<Subscription> {
    let lookup = watched.clone();
    let subscription = match debounce {
        Some(delay) => {
            let (tx, rx) = mpsc::channel();
            let mut debouncer = new_debouncer(delay, tx)?;
            for dir in &watched.dirs {
                debug!("Watching directory {}", dir.display());
                debouncer.watcher().watch(dir, RecursiveMode::NonRecursive)?;
            }
            tokio::task::spawn_blocking(move || forward_debounced(rx, events, lookup));
            Subscription::Debounced(debouncer)
        }
        None => {
            let (tx, rx) = mpsc::channel();
            let mut watcher = notify::recommended_watcher(tx)?;
            for dir in &watched.dirs {
                debug!("Watching directory {}", dir.display());
                watcher.watch(dir, RecursiveMode::NonRecursive)?;
            }
            tokio::task::spawn_blocking(move || forward_immediate(rx, events, lookup));
            Subscription::Immediate(watcher)
        }
    };
    Ok(subscription)
}

/// Forward debounced events until the debouncer is dropped.
fn forward_debounced(
    rx: mpsc::Receiver<std::result::Result<Vec<DebouncedEvent>, notify::Error>>,
    tx: UnboundedSender<Notification>,
    mut watched: WatchedSet,
) {
    loop {
        match rx.recv() {
            Ok(Ok(events)) => {
                for change in classify_debounced(events, &mut watched) {
                    debug!("Config change detected: {:?}", change);
                    if tx.send(Ok(change)).is_err() {
                        // Reload task gone, exit
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                // Let the reload task report it
                error!("File watcher error: {}", e);
                if tx.send(Err(e)).is_err() {
                    return;
                }
            }
            Err(_) => {
                // Channel closed, exit
                debug!("Config watcher channel closed, stopping");
                return;
            }
        }
    }
}

fn classify_debounced(
    events: Vec<DebouncedEvent>,
    watched: &mut WatchedSet,
) -> Vec<(ChangeKind, PathBuf)> {
    let mut changes: Vec<(ChangeKind, PathBuf)> = Vec::new();
    for event in events {
        if !matches!(
            event.kind,
            DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
        ) {
            continue;
        }
        // Sibling file in a watched directory
        let Some(path) = watched.lookup(&event.path) else {
            continue;
        };
        // Already reported in this batch
        if changes.iter().any(|(_, seen)| *seen == path) {
            continue;
        }
        if let Some(change) = watched.classify_by_existence(path) {
            changes.push(change);
        }
    }
    changes
}

/// Forward raw events until the watcher is dropped.
fn forward_immediate(
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
    tx: UnboundedSender<Notification>,
    mut watched: WatchedSet,
) {
    loop {
        match rx.recv() {
            Ok(Ok(event)) => {
                for change in classify_event(event, &mut watched) {
                    debug!("Config change detected: {:?}", change);
                    if tx.send(Ok(change)).is_err() {
                        // Reload task gone, exit
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                // Let the reload task report it
                error!("File watcher error: {}", e);
                if tx.send(Err(e)).is_err() {
                    return;
                }
            }
            Err(_) => {
                // Channel closed, exit
                debug!("Config watcher channel closed, stopping");
                return;
            }
        }
    }
}

fn classify_event(event: notify::Event, watched: &mut WatchedSet) -> Vec<(ChangeKind, PathBuf)> {
    let kind = match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            Some(ChangeKind::Created)
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            Some(ChangeKind::Removed)
        }
        // Rename with both ends, decided by what exists now
        EventKind::Modify(ModifyKind::Name(_)) => None,
        // Permissions and timestamps only
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => Some(ChangeKind::Updated),
        // Access and other events
        _ => return Vec::new(),
    };

    let mut changes = Vec::new();
    for event_path in &event.paths {
        let Some(path) = watched.lookup(event_path) else {
            // Not a watched file
            continue;
        };
        match kind {
            Some(kind) => {
                if kind == ChangeKind::Removed {
                    watched.existing.remove(&path);
                } else {
                    watched.existing.insert(path.clone());
                }
                changes.push((kind, path));
            }
            None => changes.extend(watched.classify_by_existence(path)),
        }
    }
    changes
}

struct Reloader {
    options: LoadOptions,
    state: Arc<ArcSwap<ResolvedConfig>>,
    closed: Arc<AtomicBool>,
    on_change: Option<ChangeCallback>,
    on_error: Option<ErrorCallback>,
}

impl Reloader {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn report(&self, err: Error) {
        error!("Config reload failed: {}", err);
        if let Some(on_error) = &self.on_error {
            on_error(&err);
        }
    }
}

async fn reload_events(mut rx: UnboundedReceiver<Notification>, reloader: Reloader) {
    while let Some(first) = rx.recv().await {
        // Fold everything queued since the last reload into one
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        let mut trigger = None;
        for notification in batch {
            match notification {
                Ok(change) => trigger = Some(change),
                Err(e) => reloader.report(Error::Watch(e)),
            }
        }
        // Only watcher errors in this batch
        let Some((kind, path)) = trigger else {
            continue;
        };
        if reloader.is_closed() {
            break;
        }

        info!("Reloading config after {:?} of {}", kind, path.display());
        let resolved = match load_config(&reloader.options).await {
            Ok(resolved) => Arc::new(resolved),
            Err(err) => {
                warn!("Keeping previous config for {}", path.display());
                reloader.report(err);
                continue;
            }
        };

        // Unwatched while loading, drop the result
        if reloader.is_closed() {
            break;
        }
        let old_config = reloader.state.swap(resolved.clone());
        if let Some(on_change) = &reloader.on_change {
            on_change(ConfigChange {
                kind,
                path,
                config: resolved,
                old_config,
            });
        }
    }
    debug!("Config reload task finished");
}
