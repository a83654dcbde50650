//! Dynamic library loading for declared symbols
//!
//! Resolves library names to files using platform naming conventions and
//! search paths, loads them with `libloading`, and caches loaded libraries
//! by path. Libraries are shared: finalizers bound from a library hold it
//! open after the loader is gone.

use crate::ffi::linker::{LinkError, SymbolResolver};
use crate::ffi::ownership::KeepAlive;
use crate::ffi::types::{LibraryId, SymbolName};
use libloading::Library;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Dynamic library loader with caching and platform-specific path resolution
///
/// # Safety
///
/// Loading a dynamic library runs its initialization code inside this
/// process. Only configure libraries you trust.
pub struct LibraryLoader {
    /// Loaded libraries by resolved path
    loaded: HashMap<PathBuf, Arc<Library>>,
    /// Library each name was loaded from
    by_name: HashMap<LibraryId, Arc<Library>>,
    /// Explicit file per library name (from bindings manifests)
    explicit: HashMap<LibraryId, PathBuf>,
    search_paths: Vec<PathBuf>,
}

impl LibraryLoader {
    pub fn new() -> Self {
        Self {
            loaded: HashMap::new(),
            by_name: HashMap::new(),
            explicit: HashMap::new(),
            search_paths: Self::default_search_paths(),
        }
    }

    /// Loader searching `paths` first, then the platform defaults
    pub fn with_search_paths(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut loader = Self::new();
        let mut paths: Vec<PathBuf> = paths.into_iter().collect();
        paths.append(&mut loader.search_paths);
        loader.search_paths = paths;
        loader
    }

    /// Standard system library directories, current directory first
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/lib"));
            if cfg!(target_pointer_width = "64") {
                paths.push(PathBuf::from("/usr/lib64"));
                paths.push(PathBuf::from("/lib64"));
            }
        }

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/opt/homebrew/lib"));
        }

        #[cfg(target_os = "windows")]
        {
            if let Ok(system_root) = std::env::var("SystemRoot") {
                paths.push(PathBuf::from(format!("{}\\System32", system_root)));
            }
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.insert(0, cwd);
        }

        paths
    }

    /// Pin a library name to a specific file
    pub fn register_path(&mut self, library: LibraryId, path: PathBuf) {
        self.explicit.insert(library, path);
    }

    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find the file for a library name
    ///
    /// - Linux: lib{name}.so
    /// - macOS: lib{name}.dylib or lib{name}.so
    /// - Windows: {name}.dll
    fn resolve_library_path(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() && path.exists() {
            return Some(path.to_path_buf());
        }

        let extensions: &[&str] = if cfg!(target_os = "windows") {
            &["dll"]
        } else if cfg!(target_os = "macos") {
            &["dylib", "so"]
        } else {
            &["so"]
        };
        let prefixes: &[&str] = if cfg!(target_os = "windows") {
            &["", "lib"]
        } else {
            &["lib", ""]
        };

        for dir in &self.search_paths {
            for prefix in prefixes {
                for ext in extensions {
                    let candidate = dir.join(format!("{}{}.{}", prefix, name, ext));
                    if candidate.exists() {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }

    /// Load a library, returning the cached instance when already loaded
    pub fn load(&mut self, library: &LibraryId) -> Result<Arc<Library>, LinkError> {
        if let Some(lib) = self.by_name.get(library) {
            return Ok(Arc::clone(lib));
        }

        let path = match self.explicit.get(library) {
            Some(path) => path.clone(),
            None => match self.resolve_library_path(library.as_str()) {
                Some(path) => path,
                // Let the platform loader search (ld.so.cache, versioned names)
                None => PathBuf::from(libloading::library_filename(library.as_str())),
            },
        };

        let lib = match self.loaded.get(&path) {
            Some(lib) => Arc::clone(lib),
            None => {
                let lib = unsafe { Library::new(&path) }.map_err(|e| LinkError::LoadFailed {
                    library: library.clone(),
                    reason: e.to_string(),
                })?;
                tracing::info!(
                    library = %library,
                    path = %path.display(),
                    "loaded native library"
                );
                let lib = Arc::new(lib);
                self.loaded.insert(path, Arc::clone(&lib));
                lib
            }
        };
        self.by_name.insert(library.clone(), Arc::clone(&lib));
        Ok(lib)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolResolver for LibraryLoader {
    fn resolve(
        &mut self,
        library: &LibraryId,
        symbol: &SymbolName,
    ) -> Result<*const c_void, LinkError> {
        let lib = self.load(library)?;
        let address = unsafe {
            lib.get::<*const c_void>(symbol.as_str().as_bytes())
                .map(|sym| *sym)
        }
        .map_err(|_| LinkError::SymbolNotFound {
            library: library.clone(),
            symbol: symbol.clone(),
        })?;
        if address.is_null() {
            return Err(LinkError::SymbolNotFound {
                library: library.clone(),
                symbol: symbol.clone(),
            });
        }
        Ok(address)
    }

    fn keep_alive(&self, library: &LibraryId) -> Option<KeepAlive> {
        let lib: KeepAlive = self.by_name.get(library)?.clone();
        Some(lib)
    }
}
