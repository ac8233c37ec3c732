//! Polling monitor of `(path -> mtime, size, exists)` (spec §4.7). Runs on
//! its own background thread at a fixed interval; callbacks are invoked
//! from that thread and must not re-enter the watcher (enforced by the
//! reloader releasing its lock before calling back into the host, see
//! `reloader.rs`).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}

pub type FileChangeCallback = Arc<dyn Fn(&Path, FileChangeKind) + Send + Sync>;

#[derive(Clone)]
struct FileMetadata {
    callback: FileChangeCallback,
    exists: bool,
    last_write_time: Option<SystemTime>,
    file_size: u64,
}

struct WatcherState {
    watched: HashMap<PathBuf, FileMetadata>,
}

pub struct FileWatcher {
    state: Mutex<WatcherState>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FileWatcher {
    pub fn new(poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WatcherState { watched: HashMap::new() }),
            running: Arc::new(AtomicBool::new(false)),
            poll_interval,
            thread: Mutex::new(None),
        })
    }

    /// Starts watching `path`, seeding its initial metadata immediately so
    /// the first poll tick doesn't spuriously report CREATED/DELETED.
    pub fn watch(&self, path: impl Into<PathBuf>, callback: FileChangeCallback) {
        let path = path.into();
        let (exists, last_write_time, file_size) = stat(&path);
        self.state.lock().watched.insert(path, FileMetadata { callback, exists, last_write_time, file_size });
    }

    pub fn unwatch(&self, path: &Path) {
        self.state.lock().watched.remove(path);
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.state.lock().watched.contains_key(path)
    }

    pub fn watch_count(&self) -> usize {
        self.state.lock().watched.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("file-watcher".into())
            .spawn(move || this.watcher_loop())
            .expect("spawning file watcher thread");
        *self.thread.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn watcher_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick();
            std::thread::sleep(self.poll_interval);
        }
    }

    /// One poll pass over every watched path. Exposed for tests so they
    /// don't need to wait on the real interval.
    pub fn tick(&self) {
        // Collect the (path, callback, change) triples under the lock,
        // then invoke callbacks after releasing it, matching the "don't
        // re-enter the watcher from inside a callback" contract.
        let mut fired: Vec<(PathBuf, FileChangeCallback, FileChangeKind)> = Vec::new();
        {
            let mut state = self.state.lock();
            for (path, meta) in state.watched.iter_mut() {
                let (exists, last_write_time, file_size) = stat(path);
                if meta.exists && !exists {
                    fired.push((path.clone(), meta.callback.clone(), FileChangeKind::Deleted));
                } else if !meta.exists && exists {
                    fired.push((path.clone(), meta.callback.clone(), FileChangeKind::Created));
                } else if meta.exists
                    && exists
                    && (meta.last_write_time != last_write_time || meta.file_size != file_size)
                {
                    fired.push((path.clone(), meta.callback.clone(), FileChangeKind::Modified));
                }
                meta.exists = exists;
                meta.last_write_time = last_write_time;
                meta.file_size = file_size;
            }
        }
        for (path, callback, kind) in fired {
            // Callback exceptions are logged and never propagated; Rust
            // has no exceptions, but a panicking callback would otherwise
            // poison the watcher mutex, so catch_unwind stands in.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&path, kind)));
            if result.is_err() {
                error!(path = %path.display(), "file watcher callback panicked");
            }
        }
    }
}

fn stat(path: &Path) -> (bool, Option<SystemTime>, u64) {
    match fs::metadata(path) {
        Ok(meta) => (true, meta.modified().ok(), meta.len()),
        Err(_) => (false, None, 0),
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("dropping FileWatcher while still running; call stop() explicitly");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn detects_created_modified_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched.txt");

        let watcher = FileWatcher::new(Duration::from_millis(10));
        let events: Arc<StdMutex<Vec<FileChangeKind>>> = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        watcher.watch(&path, Arc::new(move |_p, kind| events_clone.lock().unwrap().push(kind)));

        watcher.tick();
        assert!(events.lock().unwrap().is_empty());

        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "hello").unwrap();
        drop(f);
        watcher.tick();
        assert_eq!(events.lock().unwrap().last(), Some(&FileChangeKind::Created));

        std::thread::sleep(Duration::from_millis(20));
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "more").unwrap();
        drop(f);
        watcher.tick();
        assert_eq!(events.lock().unwrap().last(), Some(&FileChangeKind::Modified));

        fs::remove_file(&path).unwrap();
        watcher.tick();
        assert_eq!(events.lock().unwrap().last(), Some(&FileChangeKind::Deleted));
    }
}
