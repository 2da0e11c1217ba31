use crate::{PreviewError, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Per-listener channel capacity. Delivery is non-blocking: a full
/// channel drops the event for that listener only; the stream rebuilds
/// from a fresh file snapshot on the next event anyway.
const LISTENER_CAP: usize = 8;

type Listeners = Arc<Mutex<HashMap<String, mpsc::Sender<PathBuf>>>>;

/// One filesystem watcher for the whole backend, fanning `.swift` change
/// events out to per-stream listeners.
///
/// The OS watcher is kept alive behind a mutex; streams on other tasks
/// only ever touch the listener map.
pub struct SharedWatcher {
    listeners: Listeners,
    _watcher: Mutex<RecommendedWatcher>,
}

impl SharedWatcher {
    /// Watches every directory containing at least one Swift file under
    /// `project_root`.
    pub fn new(project_root: &Path) -> Result<SharedWatcher> {
        let dirs = swift_dirs(project_root)?;
        Self::watching(&dirs)
    }

    fn watching(dirs: &[PathBuf]) -> Result<SharedWatcher> {
        let listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let sinks = listeners.clone();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        eprintln!("[Watcher] error: {}", e);
                        return;
                    }
                };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                for path in event.paths {
                    if path.extension().and_then(|e| e.to_str()) == Some("swift") {
                        broadcast(&sinks, path);
                    }
                }
            })
            .map_err(|e| PreviewError::Io(std::io::Error::other(e)))?;

        for dir in dirs {
            if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                eprintln!("[Watcher] cannot watch {}: {}", dir.display(), e);
            }
        }

        Ok(SharedWatcher {
            listeners,
            _watcher: Mutex::new(watcher),
        })
    }

    pub fn subscribe(&self, stream_id: &str) -> mpsc::Receiver<PathBuf> {
        let (tx, rx) = mpsc::channel(LISTENER_CAP);
        self.listeners
            .lock()
            .unwrap()
            .insert(stream_id.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, stream_id: &str) {
        self.listeners.lock().unwrap().remove(stream_id);
    }

    /// True when no stream is subscribed; the owner drops the watcher then.
    pub fn is_idle(&self) -> bool {
        self.listeners.lock().unwrap().is_empty()
    }
}

fn broadcast(listeners: &Listeners, path: PathBuf) {
    let listeners = listeners.lock().unwrap();
    for sender in listeners.values() {
        // Non-blocking: full channels drop the event for that listener.
        let _ = sender.try_send(path.clone());
    }
}

/// Directories containing Swift files, via `git ls-files` when the
/// project is a git checkout, else a directory walk.
fn swift_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    match git_swift_dirs(root) {
        Ok(dirs) if !dirs.is_empty() => Ok(dirs),
        _ => walk_swift_dirs(root),
    }
}

fn git_swift_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["ls-files", "--", "*.swift"])
        .output()?;
    if !output.status.success() {
        return Err(PreviewError::Io(std::io::Error::other(
            "git ls-files unavailable",
        )));
    }
    let mut dirs: Vec<PathBuf> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|file| root.join(file).parent().map(Path::to_path_buf))
        .collect();
    dirs.sort();
    dirs.dedup();
    Ok(dirs)
}

fn walk_swift_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry.path().extension().and_then(|e| e.to_str()) == Some("swift")
        })
        .filter_map(|entry| entry.path().parent().map(Path::to_path_buf))
        .collect();
    dirs.sort();
    dirs.dedup();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const EVENT_WAIT: Duration = Duration::from_secs(2);
    const NO_EVENT_WAIT: Duration = Duration::from_millis(300);

    fn seeded_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Seed.swift"), "struct Seed {}").unwrap();
        dir
    }

    #[tokio::test]
    async fn broadcasts_to_all_listeners() {
        let dir = seeded_dir();
        let watcher = SharedWatcher::new(dir.path()).unwrap();
        let mut rx_a = watcher.subscribe("a");
        let mut rx_b = watcher.subscribe("b");

        let path = dir.path().join("TestView.swift");
        std::fs::write(&path, "struct TestView {}").unwrap();

        let got_a = timeout(EVENT_WAIT, rx_a.recv())
            .await
            .expect("listener a timed out")
            .unwrap();
        assert!(got_a.ends_with("TestView.swift"));
        let got_b = timeout(EVENT_WAIT, rx_b.recv())
            .await
            .expect("listener b timed out")
            .unwrap();
        assert!(got_b.ends_with("TestView.swift"));
    }

    #[tokio::test]
    async fn unsubscribed_listener_stops_receiving() {
        let dir = seeded_dir();
        let watcher = SharedWatcher::new(dir.path()).unwrap();
        let mut rx_a = watcher.subscribe("a");
        let mut rx_b = watcher.subscribe("b");
        watcher.unsubscribe("b");

        std::fs::write(dir.path().join("AnotherView.swift"), "struct AnotherView {}").unwrap();

        timeout(EVENT_WAIT, rx_a.recv())
            .await
            .expect("listener a timed out")
            .unwrap();
        assert!(
            timeout(NO_EVENT_WAIT, rx_b.recv()).await.is_err(),
            "removed listener should not receive events"
        );
    }

    #[tokio::test]
    async fn non_swift_files_are_ignored() {
        let dir = seeded_dir();
        let watcher = SharedWatcher::new(dir.path()).unwrap();
        let mut rx = watcher.subscribe("a");

        std::fs::write(dir.path().join("README.md"), "# readme").unwrap();

        assert!(
            timeout(NO_EVENT_WAIT, rx.recv()).await.is_err(),
            "non-swift writes should not broadcast"
        );
    }

    #[test]
    fn idle_tracks_subscriber_count() {
        let dir = seeded_dir();
        let watcher = SharedWatcher::new(dir.path()).unwrap();
        assert!(watcher.is_idle());
        let _rx = watcher.subscribe("a");
        assert!(!watcher.is_idle());
        watcher.unsubscribe("a");
        assert!(watcher.is_idle());
    }

    #[test]
    fn walk_discovers_swift_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("Sources").join("App");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("View.swift"), "struct V {}").unwrap();
        std::fs::create_dir_all(dir.path().join("Assets")).unwrap();

        let dirs = walk_swift_dirs(dir.path()).unwrap();
        assert_eq!(dirs, vec![nested]);
    }
}
