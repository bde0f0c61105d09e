//! # Watch
//!
//! Discovers patch modules dropped into a directory and feeds them to a [`PatchEngine`].
//!
//! A patch module is a shared library built against this crate that exports
//! [`MODULE_ENTRY`] with the signature of [`ModuleEntry`]:
//!
//! ```ignore
//! #[no_mangle]
//! pub fn livepatch_module() -> livepatch::PatchModule {
//!     livepatch::PatchModule {
//!         version: "20240101".into(),
//!         candidates: vec![livepatch::PatchCandidate::overlay::<SqPatch>(sq_patch_table()).with_version("20240101")],
//!     }
//! }
//! ```
//!
//! The file name has to end with the module version, e.g. `sq_20240101.so`. Loaded libraries are
//! never unloaded: patched originals jump into them for the rest of the process.

use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use libloading::{Library, Symbol};
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use thiserror::Error;

use crate::code::Architecture;
use crate::engine::{PatchCandidate, PatchEngine};
use crate::patcher::Patcher;

/// Symbol every patch module exports
pub const MODULE_ENTRY: &[u8] = b"livepatch_module\0";

/// Signature of [`MODULE_ENTRY`]
pub type ModuleEntry = fn() -> PatchModule;

/// Environment variable overriding [`WatchConfig::dir`]
pub const DIR_VAR: &str = "LIVEPATCH_DIR";
/// Environment variable overriding [`WatchConfig::interval`], in milliseconds
pub const INTERVAL_VAR: &str = "LIVEPATCH_INTERVAL_MS";

/// What a patch module delivers
#[derive(Debug, Clone)]
pub struct PatchModule {
    /// Version of the module; every candidate must carry it as its tag
    pub version: String,
    /// Patches for any number of entities
    pub candidates: Vec<PatchCandidate>,
}

/// Errors while discovering or loading a module
#[derive(Debug, Error)]
pub enum WatchError {
    /// The watched directory could not be read
    #[error("failed to scan {path}")]
    Io {
        /// Directory or file being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The directory could not be watched
    #[error("failed to watch {path}")]
    Notify {
        /// Watched directory
        path: PathBuf,
        /// Underlying error
        #[source]
        source: notify::Error,
    },
    /// The file is not a loadable library
    #[error("failed to load module {path}")]
    Load {
        /// Module file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: libloading::Error,
    },
    /// The library does not export the module entry
    #[error("module {path} does not export `livepatch_module`")]
    MissingEntry {
        /// Module file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: libloading::Error,
    },
    /// The file name does not end with the version the module reports
    #[error("module {path} reports version {version}, which its file name does not carry")]
    VersionMismatch {
        /// Module file
        path: PathBuf,
        /// Version reported by the module
        version: String,
    },
}

/// Where and how often to look for modules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Directory watched for modules
    pub dir: PathBuf,
    /// Pause between polls of the directory
    pub interval: Duration,
    /// File extension of modules, without the dot
    pub extension: String,
    /// Delete module files once they are loaded
    pub remove_after_load: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            interval: Duration::from_secs(1),
            extension: std::env::consts::DLL_EXTENSION.to_string(),
            remove_after_load: true,
        }
    }
}

impl WatchConfig {
    /// Defaults, overridden by [`DIR_VAR`] and [`INTERVAL_VAR`] when set
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults, overridden by whatever `lookup` returns for [`DIR_VAR`] and [`INTERVAL_VAR`]
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(dir) = lookup(DIR_VAR).filter(|dir| !dir.is_empty()) {
            config.dir = PathBuf::from(dir);
        }
        if let Some(ms) = lookup(INTERVAL_VAR) {
            match ms.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.interval = Duration::from_millis(ms),
                _ => log::warn!("ignoring invalid {INTERVAL_VAR}={ms}"),
            }
        }
        config
    }

    /// Sets [`WatchConfig::dir`]
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Sets [`WatchConfig::interval`]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets [`WatchConfig::extension`]
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Sets [`WatchConfig::remove_after_load`]
    pub fn with_remove_after_load(mut self, remove_after_load: bool) -> Self {
        self.remove_after_load = remove_after_load;
        self
    }
}

/// Whether the file name of `path` ends with `{version}.{extension}`
fn carries_version(path: &Path, version: &str, extension: &str) -> bool {
    !version.is_empty()
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(&format!("{version}.{extension}")))
}

/// Loads patch modules and submits their candidates to an engine
pub struct ModuleWatcher<P, A> {
    /// Where and how often to look
    config: WatchConfig,
    /// Receives every candidate
    engine: Arc<PatchEngine<P, A>>,
}

impl<P, A> ModuleWatcher<P, A>
where
    P: Patcher,
    P::Error: std::error::Error + Send + Sync + 'static,
    A: Architecture,
{
    /// Creates a watcher; nothing is read until [`ModuleWatcher::load_existing`] or
    /// [`ModuleWatcher::start`]
    pub fn new(config: WatchConfig, engine: Arc<PatchEngine<P, A>>) -> Self {
        Self { config, engine }
    }

    /// The engine candidates are submitted to
    pub fn engine(&self) -> &Arc<PatchEngine<P, A>> {
        &self.engine
    }

    /// Whether `path` has the module extension
    fn is_module(&self, path: &Path) -> bool {
        path.extension().and_then(|ext| ext.to_str()) == Some(self.config.extension.as_str())
    }

    /// Module files currently in the directory, in path order.
    ///
    /// Entries that vanish or whose metadata cannot be read are skipped.
    fn module_files(&self) -> Result<Vec<PathBuf>, WatchError> {
        let entries = fs::read_dir(&self.config.dir).map_err(|source| WatchError::Io {
            path: self.config.dir.clone(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else {
                continue;
            };
            let path = entry.path();
            if !self.is_module(&path) {
                continue;
            }
            match fs::metadata(&path) {
                Ok(metadata) if metadata.is_file() => paths.push(path),
                Ok(_) => {}
                Err(e) => log::warn!("skipping {}: {e}", path.display()),
            }
        }

        paths.sort();
        Ok(paths)
    }

    /// Module files named by a create or modify event
    fn module_paths(&self, event: &Event) -> Vec<PathBuf> {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => event
                .paths
                .iter()
                .filter(|path| self.is_module(path))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Loads every module already in the directory. Returns the number of modules loaded.
    ///
    /// Failures are logged per module and do not stop the others.
    ///
    /// # Safety
    ///
    /// Loading a module runs its initialisers and [`MODULE_ENTRY`]. Every module in the directory
    /// must be built against this crate with the same compiler, and submitting its candidates
    /// must satisfy the contract of [`PatchEngine::submit`].
    pub unsafe fn load_existing(&self) -> Result<usize, WatchError> {
        let mut loaded = 0;
        for path in self.module_files()? {
            if self.load_logged(&path) {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Loads the modules named by one directory event
    unsafe fn handle_event(&self, event: &Event) {
        for path in self.module_paths(event) {
            self.load_logged(&path);
        }
    }

    /// [`ModuleWatcher::load`], with the outcome logged
    unsafe fn load_logged(&self, path: &Path) -> bool {
        log::info!("detected new module: {}", path.display());
        match self.load(path) {
            Ok(accepted) => {
                log::info!("loaded module {}, {accepted} candidate(s) accepted", path.display());
                true
            }
            Err(e) => {
                log::error!("{e}: {}", source_chain(&e));
                false
            }
        }
    }

    /// Loads one module and submits its candidates. Returns the number of accepted candidates.
    ///
    /// # Safety
    ///
    /// Same as [`ModuleWatcher::load_existing`].
    pub unsafe fn load(&self, path: &Path) -> Result<usize, WatchError> {
        let library = Library::new(path).map_err(|source| WatchError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        let module = {
            let entry: Symbol<ModuleEntry> = library.get(MODULE_ENTRY).map_err(|source| WatchError::MissingEntry {
                path: path.to_path_buf(),
                source,
            })?;
            entry()
        };

        let accepted = self.accept(path, module)?;
        // originals jump into the module from now on, it must stay mapped
        mem::forget(library);
        Ok(accepted)
    }

    /// Checks the version of a module delivered by `path`, submits its candidates and removes
    /// the file when configured. Returns the number of accepted candidates.
    ///
    /// Nothing is submitted and the file stays when the version does not match.
    unsafe fn accept(&self, path: &Path, module: PatchModule) -> Result<usize, WatchError> {
        if !carries_version(path, &module.version, &self.config.extension) {
            return Err(WatchError::VersionMismatch {
                path: path.to_path_buf(),
                version: module.version,
            });
        }

        let mut accepted = 0;
        for candidate in module.candidates {
            let candidate = candidate.with_module_version(&module.version);
            let entity = candidate.entity.clone();
            match self.engine.submit(candidate) {
                Ok(_) => accepted += 1,
                Err(e) => log::warn!("rejected patch for {entity}: {e}"),
            }
        }

        if self.config.remove_after_load {
            if let Err(e) = fs::remove_file(path) {
                log::warn!("failed to remove {}: {e}", path.display());
            }
        }

        Ok(accepted)
    }
}

impl<P, A> ModuleWatcher<P, A>
where
    P: Patcher + Send + Sync + 'static,
    P::Error: std::error::Error + Send + Sync + 'static,
    A: Architecture + Send + Sync + 'static,
{
    /// Polls the directory every [`WatchConfig::interval`] and loads modules as they are created
    /// or modified, until the returned handle is shut down or dropped. Modules already present
    /// are loaded first, on the same background thread.
    ///
    /// # Safety
    ///
    /// Same as [`ModuleWatcher::load_existing`], for every module that appears while the thread runs.
    pub unsafe fn start(self) -> Result<WatchHandle, WatchError> {
        let dir = self.config.dir.clone();
        let (sender, messages) = mpsc::channel::<Message>();

        let events = sender.clone();
        let mut watcher = PollWatcher::new(
            move |event: notify::Result<Event>| {
                // the loading thread is gone once the handle stops
                let _ = events.send(Message::Event(event));
            },
            notify::Config::default().with_poll_interval(self.config.interval),
        )
        .map_err(|source| WatchError::Notify {
            path: dir.clone(),
            source,
        })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Notify {
                path: dir.clone(),
                source,
            })?;

        let thread = thread::Builder::new()
            .name("livepatch-watch".to_string())
            .spawn(move || {
                log::info!("watching {} for patch modules", self.config.dir.display());
                // Safety: upheld by the caller of `start`
                if let Err(e) = unsafe { self.load_existing() } {
                    log::warn!("{e}: {}", source_chain(&e));
                }
                for message in messages {
                    match message {
                        Message::Event(Ok(event)) => {
                            // Safety: upheld by the caller of `start`
                            unsafe { self.handle_event(&event) };
                        }
                        Message::Event(Err(e)) => log::warn!("error watching {}: {e}", self.config.dir.display()),
                        Message::Stop => break,
                    }
                }
                log::info!("stopped watching {}", self.config.dir.display());
            })
            .map_err(|source| WatchError::Io { path: dir, source })?;

        Ok(WatchHandle {
            watcher: Some(watcher),
            stop: sender,
            thread: Some(thread),
        })
    }
}

/// What the loading thread receives
enum Message {
    /// A directory event from the poller
    Event(notify::Result<Event>),
    /// Leave the loop
    Stop,
}

/// Control over a running watcher thread
pub struct WatchHandle {
    /// Poller of the directory
    watcher: Option<PollWatcher>,
    /// Wakes the loading thread
    stop: Sender<Message>,
    /// The loading thread
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    /// Stops the watcher and waits for its thread to finish
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Stops polling, then signals and joins the thread, once
    fn stop(&mut self) {
        drop(self.watcher.take());
        let _ = self.stop.send(Message::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("patch module watcher panicked");
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Renders the sources of an error, outermost first
fn source_chain(error: &dyn std::error::Error) -> String {
    let mut out = Vec::new();
    let mut source = error.source();
    while let Some(e) = source {
        out.push(e.to_string());
        source = e.source();
    }
    out.join(": ")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};
    use notify::{Event, EventKind};

    use super::{carries_version, ModuleWatcher, PatchModule, WatchConfig, WatchError, DIR_VAR, INTERVAL_VAR};
    use crate::descriptor::{DescriptorTable, EntityLayout};
    use crate::engine::{EngineConfig, PatchCandidate, PatchEngine};

    fn watcher(config: WatchConfig) -> ModuleWatcher<crate::PermissionWrapper<crate::BytePatcher>, crate::Host> {
        ModuleWatcher::new(
            config,
            Arc::new(PatchEngine::new(EngineConfig::default().with_abort_on_fault(false))),
        )
    }

    /// Candidate for an unregistered `entity`, tagged `version`
    fn tagged(entity: &str, version: &str) -> PatchCandidate {
        PatchCandidate::new(entity, DescriptorTable::new(EntityLayout::of::<u64>())).with_version(version)
    }

    #[test]
    /// Existing module files are listed in path order, anything else is left out
    fn test_module_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b_1.so"), b"b").unwrap();
        fs::write(dir.path().join("a_1.so"), b"a").unwrap();
        fs::write(dir.path().join("notes.txt"), b"n").unwrap();
        fs::create_dir(dir.path().join("nested.so")).unwrap();

        let watcher = watcher(WatchConfig::default().with_dir(dir.path()).with_extension("so"));
        assert_eq!(
            watcher.module_files().unwrap(),
            [dir.path().join("a_1.so"), dir.path().join("b_1.so")]
        );
    }

    #[cfg(unix)]
    #[test]
    /// A file whose metadata cannot be read is skipped without failing the listing
    fn test_module_files_dangling() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a_1.so"), b"a").unwrap();
        std::os::unix::fs::symlink(dir.path().join("gone"), dir.path().join("dangling_1.so")).unwrap();

        let watcher = watcher(WatchConfig::default().with_dir(dir.path()).with_extension("so"));
        assert_eq!(watcher.module_files().unwrap(), [dir.path().join("a_1.so")]);
    }

    #[test]
    fn test_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher(WatchConfig::default().with_dir(dir.path().join("missing")));
        assert!(matches!(watcher.module_files(), Err(WatchError::Io { .. })));
        assert!(matches!(unsafe { watcher.load_existing() }, Err(WatchError::Io { .. })));
    }

    #[test]
    /// Only create and modify events for module files are loaded
    fn test_module_paths() {
        let watcher = watcher(WatchConfig::default().with_extension("so"));
        let module = Path::new("/patches/sq_1.so");
        let notes = Path::new("/patches/notes.txt");

        let created = Event::new(EventKind::Create(CreateKind::File))
            .add_path(module.to_path_buf())
            .add_path(notes.to_path_buf());
        assert_eq!(watcher.module_paths(&created), [module]);

        let modified = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Any))).add_path(module.to_path_buf());
        assert_eq!(watcher.module_paths(&modified), [module]);

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(module.to_path_buf());
        assert!(watcher.module_paths(&removed).is_empty());
    }

    #[test]
    fn test_carries_version() {
        assert!(carries_version(Path::new("/tmp/sq_20240101.so"), "20240101", "so"));
        assert!(carries_version(Path::new("20240101.dll"), "20240101", "dll"));
        assert!(!carries_version(Path::new("/tmp/sq_20240102.so"), "20240101", "so"));
        assert!(!carries_version(Path::new("/tmp/sq_20240101.so"), "20240101", "dll"));
        assert!(!carries_version(Path::new("/tmp/sq_.so"), "", "so"));
    }

    #[test]
    fn test_config_lookup() {
        let config = WatchConfig::from_lookup(|key| match key {
            DIR_VAR => Some("/var/patches".to_string()),
            INTERVAL_VAR => Some("250".to_string()),
            _ => None,
        });
        assert_eq!(config.dir, Path::new("/var/patches"));
        assert_eq!(config.interval, Duration::from_millis(250));
        assert!(config.remove_after_load);

        // unusable values keep the defaults
        let config = WatchConfig::from_lookup(|key| (key == INTERVAL_VAR).then(|| "soon".to_string()));
        assert_eq!(config, WatchConfig::default());
    }

    #[test]
    /// Candidates are stamped with the module version; mis-tagged ones are counted out
    fn test_accept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sq_20240101.so");
        fs::write(&path, b"module").unwrap();

        let watcher = watcher(WatchConfig::default().with_dir(dir.path()).with_extension("so"));
        let module = PatchModule {
            version: "20240101".into(),
            candidates: vec![tagged("alpha", "20240101"), tagged("beta", "20231231")],
        };

        assert_eq!(unsafe { watcher.accept(&path, module) }.unwrap(), 1);
        assert!(watcher.engine().pending("alpha"));
        assert!(!watcher.engine().pending("beta"));
        assert!(!path.exists());
    }

    #[test]
    /// Module files stay in place when removal is turned off
    fn test_accept_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sq_7.so");
        fs::write(&path, b"module").unwrap();

        let watcher = watcher(
            WatchConfig::default()
                .with_dir(dir.path())
                .with_extension("so")
                .with_remove_after_load(false),
        );
        let module = PatchModule {
            version: "7".into(),
            candidates: vec![tagged("alpha", "7")],
        };

        assert_eq!(unsafe { watcher.accept(&path, module) }.unwrap(), 1);
        assert!(path.exists());
    }

    #[test]
    /// A module whose file name lacks its version submits nothing and keeps its file
    fn test_accept_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sq_20240101.so");
        fs::write(&path, b"module").unwrap();

        let watcher = watcher(WatchConfig::default().with_dir(dir.path()).with_extension("so"));
        let module = PatchModule {
            version: "20240102".into(),
            candidates: vec![tagged("alpha", "20240102")],
        };

        let result = unsafe { watcher.accept(&path, module) };
        assert!(matches!(result, Err(WatchError::VersionMismatch { ref version, .. }) if version == "20240102"));
        assert!(!watcher.engine().pending("alpha"));
        assert!(path.exists());
    }

    #[test]
    /// A file that is not a library fails to load and is left in place
    fn test_load_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken_1.so");
        fs::write(&path, b"definitely not an ELF").unwrap();

        let watcher = watcher(WatchConfig::default().with_dir(dir.path()).with_extension("so"));
        assert!(matches!(unsafe { watcher.load(&path) }, Err(WatchError::Load { .. })));
        assert_eq!(unsafe { watcher.load_existing() }.unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    /// The background thread stops promptly on shutdown
    fn test_start_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher(
            WatchConfig::default()
                .with_dir(dir.path())
                .with_interval(Duration::from_secs(3600)),
        );

        let handle = unsafe { watcher.start() }.unwrap();
        handle.shutdown();
    }
}
