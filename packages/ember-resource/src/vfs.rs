//! Virtual filesystem port
//!
//! The provider reads resources and watches for changes through the [`Vfs`]
//! trait. Two implementations ship with the crate:
//!
//! - [`DiskVfs`] - std::fs reads with a `notify`-based watcher
//! - [`MemoryVfs`] - in-memory volume whose mutations synthesize watcher
//!   events, used by tests and tooling
//!
//! Debouncing is NOT done here; raw events are drained by the provider which
//! applies its own timer-based coalescing.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use tracing::warn;

/// Readable, seekable resource stream
///
/// Streams are owned by in-flight operations which may resume on any serve
/// worker, so they must cross threads.
pub trait ReadSeek: Read + Seek + Send + Sync {}
impl<T: Read + Seek + Send + Sync> ReadSeek for T {}

/// Raw filesystem change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsEvent {
    pub kind: VfsEventKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsEventKind {
    Added,
    Modified,
    Removed,
}

/// Directory listing element
#[derive(Debug, Clone)]
pub struct VfsDirEntry {
    pub path: PathBuf,
    pub is_directory: bool,
}

/// Change watcher over a directory tree
pub trait VfsWatcher: Send {
    /// Drain every event observed since the previous call
    fn drain(&mut self) -> Vec<VfsEvent>;
}

/// Virtual filesystem volume
pub trait Vfs: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;

    /// Immediate children of a directory
    fn read_dir(&self, path: &Path) -> io::Result<Vec<VfsDirEntry>>;

    /// Watch a directory tree for changes
    fn watch(&self, root: &Path) -> io::Result<Box<dyn VfsWatcher>>;
}

// ---------------------------------------------------------------------------
// Disk implementation
// ---------------------------------------------------------------------------

/// `std::fs`-backed volume with a `notify` watcher
#[derive(Debug, Default, Clone)]
pub struct DiskVfs;

impl DiskVfs {
    pub fn new() -> Self {
        Self
    }
}

impl Vfs for DiskVfs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        let file = std::fs::File::open(path)?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<VfsDirEntry>> {
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(path)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(io::Error::other)?;
            entries.push(VfsDirEntry {
                path: entry.path().to_path_buf(),
                is_directory: entry.file_type().is_dir(),
            });
        }
        Ok(entries)
    }

    fn watch(&self, root: &Path) -> io::Result<Box<dyn VfsWatcher>> {
        DiskWatcher::create(root).map(|watcher| Box::new(watcher) as Box<dyn VfsWatcher>)
    }
}

struct DiskWatcher {
    // Kept alive for the watcher thread; dropping stops the watch.
    _watcher: notify::RecommendedWatcher,
    receiver: Receiver<VfsEvent>,
}

impl DiskWatcher {
    fn create(root: &Path) -> io::Result<Self> {
        use notify::{Event, EventKind, RecursiveMode, Watcher};

        let (sender, receiver) = channel();
        let mut watcher = notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
            match result {
                Ok(event) => {
                    let kind = match event.kind {
                        EventKind::Create(_) => Some(VfsEventKind::Added),
                        EventKind::Modify(_) => Some(VfsEventKind::Modified),
                        EventKind::Remove(_) => Some(VfsEventKind::Removed),
                        _ => None,
                    };

                    if let Some(kind) = kind {
                        for path in event.paths {
                            let _ = sender.send(VfsEvent {
                                kind,
                                path,
                            });
                        }
                    }
                }
                Err(problem) => {
                    warn!(%problem, "file watcher error");
                }
            }
        })
        .map_err(io::Error::other)?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(io::Error::other)?;

        Ok(Self {
            _watcher: watcher,
            receiver,
        })
    }
}

impl VfsWatcher for DiskWatcher {
    fn drain(&mut self) -> Vec<VfsEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    files: FxHashMap<PathBuf, Arc<Vec<u8>>>,
    watchers: Vec<(PathBuf, Arc<Mutex<VecDeque<VfsEvent>>>)>,
}

/// In-memory volume; file mutations synthesize watcher events
#[derive(Clone, Default)]
pub struct MemoryVfs {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a file, emitting Added/Modified to watchers
    pub fn put_file(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        let path = path.into();
        let mut state = self.state.lock();
        let existed = state.files.insert(path.clone(), Arc::new(bytes)).is_some();
        let kind = if existed {
            VfsEventKind::Modified
        } else {
            VfsEventKind::Added
        };
        Self::notify(&mut state, kind, &path);
    }

    /// Remove a file, emitting Removed to watchers
    pub fn remove_file(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.state.lock();
        if state.files.remove(&path).is_some() {
            Self::notify(&mut state, VfsEventKind::Removed, &path);
        }
    }

    fn notify(state: &mut MemoryState, kind: VfsEventKind, path: &Path) {
        for (root, queue) in &state.watchers {
            if path.starts_with(root) {
                queue.lock().push_back(VfsEvent {
                    kind,
                    path: path.to_path_buf(),
                });
            }
        }
    }
}

impl Vfs for MemoryVfs {
    fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state.files.contains_key(path)
            || state.files.keys().any(|candidate| candidate.starts_with(path))
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        let state = self.state.lock();
        match state.files.get(path) {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.as_ref().clone()))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such virtual file: {}", path.display()),
            )),
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<VfsDirEntry>> {
        let state = self.state.lock();
        let mut files = Vec::new();
        let mut directories = Vec::new();

        for candidate in state.files.keys() {
            if let Ok(relative) = candidate.strip_prefix(path) {
                let mut components = relative.components();
                match (components.next(), components.next()) {
                    (Some(_), None) => files.push(VfsDirEntry {
                        path: candidate.clone(),
                        is_directory: false,
                    }),
                    (Some(head), Some(_)) => {
                        let child = path.join(head);
                        if !directories.iter().any(|entry: &VfsDirEntry| entry.path == child) {
                            directories.push(VfsDirEntry {
                                path: child,
                                is_directory: true,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }

        directories.append(&mut files);
        directories.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(directories)
    }

    fn watch(&self, root: &Path) -> io::Result<Box<dyn VfsWatcher>> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        self.state
            .lock()
            .watchers
            .push((root.to_path_buf(), queue.clone()));
        Ok(Box::new(MemoryWatcher { queue }))
    }
}

struct MemoryWatcher {
    queue: Arc<Mutex<VecDeque<VfsEvent>>>,
}

impl VfsWatcher for MemoryWatcher {
    fn drain(&mut self) -> Vec<VfsEvent> {
        self.queue.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_vfs_read_back() {
        let vfs = MemoryVfs::new();
        vfs.put_file("assets/mesh.bin", vec![1, 2, 3]);

        assert!(vfs.exists(Path::new("assets/mesh.bin")));
        let mut stream = vfs.open_read(Path::new("assets/mesh.bin")).unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[test]
    fn test_memory_vfs_lists_directories_and_files() {
        let vfs = MemoryVfs::new();
        vfs.put_file("assets/a.bin", vec![0]);
        vfs.put_file("assets/nested/b.bin", vec![0]);

        let entries = vfs.read_dir(Path::new("assets")).unwrap();
        let directories: Vec<_> = entries.iter().filter(|entry| entry.is_directory).collect();
        let files: Vec<_> = entries.iter().filter(|entry| !entry.is_directory).collect();
        assert_eq!(directories.len(), 1);
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_memory_watcher_sees_mutations() {
        let vfs = MemoryVfs::new();
        let mut watcher = vfs.watch(Path::new("assets")).unwrap();

        vfs.put_file("assets/a.bin", vec![0]);
        vfs.put_file("assets/a.bin", vec![1]);
        vfs.remove_file("assets/a.bin");
        vfs.put_file("elsewhere/b.bin", vec![0]);

        let kinds: Vec<VfsEventKind> = watcher.drain().into_iter().map(|event| event.kind).collect();
        assert_eq!(
            kinds,
            vec![VfsEventKind::Added, VfsEventKind::Modified, VfsEventKind::Removed]
        );
    }

    #[test]
    fn test_disk_vfs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, [7, 8, 9]).unwrap();

        let vfs = DiskVfs::new();
        assert!(vfs.exists(&path));
        let mut stream = vfs.open_read(&path).unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, vec![7, 8, 9]);

        let entries = vfs.read_dir(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_directory);
    }
}
