use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError, Weak};
use tracing::{error, info, warn};

/// Exclusive advisory lock on `<image>.lock`, held for the lifetime of a build
/// so two processes never bind the same image.
pub struct ImageLock {
    lock_file: File,
    path: PathBuf,
}

impl ImageLock {
    pub fn lock_path(image: &Path) -> PathBuf {
        let mut name = image.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Fail with `Locked` when another process holds the lock.
    pub fn try_acquire(image: &Path) -> Result<Self, CoreError> {
        let path = Self::lock_path(image);
        let file = open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                lock_file: file,
                path,
            }),
            Err(_) => Err(CoreError::Locked(image.to_path_buf())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(CoreError::fs("create", parent))?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(CoreError::fs("open", path))
}

impl Drop for ImageLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Something the signal handler can tear down.
pub trait ReleaseHook: Send + Sync {
    fn describe(&self) -> String;

    fn release(&self) -> Result<(), CoreError>;
}

/// Weak handles to every image that asked to be released on interrupt.
pub struct ReleaseRegistry {
    next_id: AtomicU64,
    hooks: Mutex<Vec<(u64, Weak<dyn ReleaseHook>)>>,
}

impl Default for ReleaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseRegistry {
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            hooks: Mutex::new(Vec::new()),
        }
    }

    fn hooks(&self) -> MutexGuard<'_, Vec<(u64, Weak<dyn ReleaseHook>)>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, hook: &Arc<dyn ReleaseHook>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.hooks().push((id, Arc::downgrade(hook)));
        id
    }

    pub fn unregister(&self, id: u64) {
        self.hooks().retain(|(hook_id, _)| *hook_id != id);
    }

    pub fn len(&self) -> usize {
        self.hooks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every live hook, logging failures. Returns how many were
    /// attempted. The registry lock is not held while releasing.
    pub fn release_all(&self) -> usize {
        let live: Vec<Arc<dyn ReleaseHook>> = {
            let mut hooks = self.hooks();
            hooks.retain(|(_, weak)| weak.strong_count() > 0);
            hooks.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        for hook in &live {
            info!("releasing {} on interrupt", hook.describe());
            if let Err(e) = hook.release() {
                error!("failed to release {}: {e}", hook.describe());
            }
        }
        live.len()
    }
}

static REGISTRY: ReleaseRegistry = ReleaseRegistry::new();
static HANDLER: Once = Once::new();
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

fn install_signal_handler() {
    HANDLER.call_once(|| {
        if let Err(e) = ctrlc::set_handler(on_signal) {
            warn!("failed to install signal handler: {e}");
        }
    });
}

fn on_signal() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    eprintln!("\ninterrupt received, releasing bound images...");
    REGISTRY.release_all();
}

/// Register `hook` with the process-wide registry, installing the SIGINT /
/// SIGTERM / SIGHUP handler on first use.
pub fn release_on_interrupt(hook: &Arc<dyn ReleaseHook>) -> InterruptGuard {
    install_signal_handler();
    InterruptGuard {
        id: REGISTRY.register(hook),
    }
}

/// Keeps an image registered for interrupt teardown until dropped.
#[derive(Debug)]
pub struct InterruptGuard {
    id: u64,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        REGISTRY.unregister(self.id);
    }
}

/// Whether a termination signal has been received.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
