//! Recursive watch on the certificate directory.
//!
//! Raw notify events are funneled through one channel, debounced per path and
//! filtered against an [`IgnoreList`] before the engine sees them. Paths the
//! engine is writing itself are ignored for a short window, and paths under
//! an active renewal are pinned until the renewal finishes.

use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    error::{EngineError, EngineResult},
    registry::is_certificate_file,
};

/// Paths are compared with their parent directory canonicalized, so
/// `/certs/../certs/a.crt` and a symlinked certs dir still match.
fn ignore_key(path: &Path) -> PathBuf {
    let canonical_parent = path.parent().and_then(|p| p.canonicalize().ok());
    match (canonical_parent, path.file_name()) {
        (Some(parent), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}

#[derive(Debug, Default)]
struct IgnoreState {
    until: HashMap<PathBuf, Instant>,
    pinned: HashMap<PathBuf, usize>,
}

/// Short-lived suppression set consulted before dispatching a file event.
#[derive(Debug)]
pub struct IgnoreList {
    window: Duration,
    state: Mutex<IgnoreState>,
}

impl IgnoreList {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(IgnoreState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, IgnoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Ignore events for `paths` for the next `duration`.
    pub fn ignore_for<'a>(&self, paths: impl IntoIterator<Item = &'a Path>, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut state = self.state();
        for path in paths {
            let slot = state.until.entry(ignore_key(path)).or_insert(deadline);
            if *slot < deadline {
                *slot = deadline;
            }
        }
    }

    /// Ignore events for `paths` for the default window.
    pub fn ignore<'a>(&self, paths: impl IntoIterator<Item = &'a Path>) {
        self.ignore_for(paths, self.window);
    }

    /// Ignore `paths` until the returned guard is dropped, then for one more
    /// window to swallow trailing events.
    pub fn pin<'a>(self: &Arc<Self>, paths: impl IntoIterator<Item = &'a Path>) -> IgnoreGuard {
        let keys: Vec<PathBuf> = paths.into_iter().map(ignore_key).collect();
        {
            let mut state = self.state();
            for key in &keys {
                *state.pinned.entry(key.clone()).or_default() += 1;
            }
        }
        IgnoreGuard {
            list: Arc::clone(self),
            keys,
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        let key = ignore_key(path);
        let now = Instant::now();
        let mut state = self.state();

        state.until.retain(|_, deadline| *deadline > now);
        state.pinned.contains_key(&key) || state.until.contains_key(&key)
    }
}

/// Releases the pins taken by [`IgnoreList::pin`].
#[derive(Debug)]
pub struct IgnoreGuard {
    list: Arc<IgnoreList>,
    keys: Vec<PathBuf>,
}

impl Drop for IgnoreGuard {
    fn drop(&mut self) {
        let deadline = Instant::now() + self.list.window;
        let mut state = self.list.state();
        for key in self.keys.drain(..) {
            if let Some(count) = state.pinned.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    state.pinned.remove(&key);
                }
            }
            state.until.insert(key, deadline);
        }
    }
}

/// Start a recursive watch on `dir`. Every changed path is sent on the
/// returned channel; the watcher stops when the handle is dropped.
pub fn watch(dir: &Path) -> EngineResult<(RecommendedWatcher, mpsc::UnboundedReceiver<PathBuf>)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher =
        notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
            match event {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        notify::EventKind::Modify(_)
                            | notify::EventKind::Create(_)
                            | notify::EventKind::Remove(_)
                    ) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "File watcher error"),
            }
        })
        .map_err(|e| EngineError::io(dir, std::io::Error::other(e.to_string())))?;

    watcher
        .watch(dir, RecursiveMode::Recursive)
        .map_err(|e| EngineError::io(dir, std::io::Error::other(e.to_string())))?;

    debug!(dir = %dir.display(), "Watching certificate directory");
    Ok((watcher, rx))
}

/// Drain `events`, wait until each path has been quiet for `debounce`, drop
/// ignored and non-certificate paths, and hand the rest to `handle` one at a
/// time.
pub async fn dispatch<F, Fut>(
    mut events: mpsc::UnboundedReceiver<PathBuf>,
    debounce: Duration,
    ignore: Arc<IgnoreList>,
    cancel: CancellationToken,
    mut handle: F,
) where
    F: FnMut(PathBuf) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut pending: HashMap<PathBuf, tokio::time::Instant> = HashMap::new();

    loop {
        let next_due = pending.values().min().copied();
        let sleep = async {
            match next_due {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(path) => {
                    trace!(path = %path.display(), "File event");
                    pending.insert(path, tokio::time::Instant::now() + debounce);
                }
                None => break,
            },
            _ = sleep => {
                let now = tokio::time::Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(p, _)| p.clone())
                    .collect();

                for path in due {
                    pending.remove(&path);
                    if !is_certificate_file(&path) {
                        continue;
                    }
                    if ignore.is_ignored(&path) {
                        trace!(path = %path.display(), "Ignoring event for engine-written file");
                        continue;
                    }
                    handle(path).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_window_expires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.crt");
        let list = IgnoreList::new(Duration::from_millis(50));

        list.ignore([path.as_path()]);
        assert!(list.is_ignored(&path));
        assert!(!list.is_ignored(&dir.path().join("b.crt")));

        std::thread::sleep(Duration::from_millis(80));
        assert!(!list.is_ignored(&path));
    }

    #[test]
    fn test_pinned_until_guard_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.crt");
        let list = Arc::new(IgnoreList::new(Duration::from_millis(20)));

        let guard = list.pin([path.as_path()]);
        std::thread::sleep(Duration::from_millis(40));
        assert!(list.is_ignored(&path));

        drop(guard);
        // Still covered by the trailing window.
        assert!(list.is_ignored(&path));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!list.is_ignored(&path));
    }

    #[test]
    fn test_ignore_matches_through_unnormalized_parent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let list = IgnoreList::new(Duration::from_secs(5));

        list.ignore([dir.path().join("sub/../a.crt").as_path()]);
        assert!(list.is_ignored(&dir.path().join("a.crt")));
    }

    #[tokio::test]
    async fn test_dispatch_debounces_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let ignore = Arc::new(IgnoreList::new(Duration::from_secs(5)));
        let cancel = CancellationToken::new();

        let busy = dir.path().join("busy.crt");
        let ignored = dir.path().join("ignored.crt");
        ignore.ignore([ignored.as_path()]);

        for _ in 0..5 {
            tx.send(busy.clone()).unwrap();
        }
        tx.send(ignored).unwrap();
        tx.send(dir.path().join("notes.txt")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn({
            let seen = Arc::clone(&seen);
            let cancel = cancel.clone();
            async move {
                dispatch(rx, Duration::from_millis(20), ignore, cancel, |path| {
                    let seen = Arc::clone(&seen);
                    async move { seen.lock().unwrap().push(path) }
                })
                .await
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![busy]);
    }
}
