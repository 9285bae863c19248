//! Native Module Importer
//!
//! Serves statically linked builtins, then shared libraries found on the
//! search path. Library handles are cached by module name for the lifetime
//! of the importer; each import asks the library for a fresh module.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::logging::MODULE;
use crate::module::{Module, NativeModule};

/// Entry point every native module library exports as `CreateModule`.
///
/// Returns an owned, heap-allocated module or null when creation failed.
pub type CreateModuleFn = unsafe extern "C" fn(&Engine) -> *mut NativeModule;

/// Constructor of a statically linked module
pub type BuiltinFactory = fn(&Engine) -> NativeModule;

const CREATE_MODULE_SYMBOL: &[u8] = b"CreateModule\0";

/// Error type for opening a module library
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("No library at {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
}

/// An opened library that may provide a `CreateModule` entry point
pub trait ModuleLibrary {
    fn path(&self) -> &Path;

    fn create_module_fn(&self) -> Option<CreateModuleFn>;
}

/// Opens module libraries by path
pub trait LibraryLoader {
    fn open(&self, path: &Path) -> Result<Rc<dyn ModuleLibrary>, LibraryError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared library loading
// ─────────────────────────────────────────────────────────────────────────────

/// [`LibraryLoader`] backed by the system dynamic loader
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl LibraryLoader for DylibLoader {
    fn open(&self, path: &Path) -> Result<Rc<dyn ModuleLibrary>, LibraryError> {
        // Bare file names go to the system search; anything with a directory
        // must exist first.
        let has_directory = path.parent().is_some_and(|parent| !parent.as_os_str().is_empty());
        if has_directory && !path.exists() {
            return Err(LibraryError::NotFound {
                path: path.to_path_buf(),
            });
        }

        // SAFETY: loading a module library runs its initializers; module
        // libraries are trusted code built against this crate.
        let library = unsafe { libloading::Library::new(path) }.map_err(|source| LibraryError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Rc::new(DylibLibrary {
            path: path.to_path_buf(),
            library,
        }))
    }
}

struct DylibLibrary {
    path: PathBuf,
    library: libloading::Library,
}

impl ModuleLibrary for DylibLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn create_module_fn(&self) -> Option<CreateModuleFn> {
        // SAFETY: `CreateModule` is emitted by `declare_native_module!`, which
        // fixes its signature to `CreateModuleFn`.
        unsafe {
            self.library
                .get::<CreateModuleFn>(CREATE_MODULE_SYMBOL)
                .ok()
                .map(|symbol| *symbol)
        }
    }
}

impl Drop for DylibLibrary {
    fn drop(&mut self) {
        info!(target: MODULE, "Unloading native module {}", self.path.display());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Importer
// ─────────────────────────────────────────────────────────────────────────────

pub struct NativeModuleImporter {
    search_paths: Vec<PathBuf>,
    loader: Box<dyn LibraryLoader>,
    builtins: RefCell<HashMap<String, BuiltinFactory>>,
    handles: RefCell<HashMap<String, Rc<dyn ModuleLibrary>>>,
}

impl NativeModuleImporter {
    pub fn new(search_paths: Vec<PathBuf>, loader: Box<dyn LibraryLoader>) -> Self {
        Self {
            search_paths,
            loader,
            builtins: RefCell::new(HashMap::new()),
            handles: RefCell::new(HashMap::new()),
        }
    }

    /// Register a statically linked module. The first registration of a name wins.
    pub fn register_builtin(&self, name: impl Into<String>, factory: BuiltinFactory) -> bool {
        let name = name.into();
        let mut builtins = self.builtins.borrow_mut();
        if builtins.contains_key(&name) {
            warn!(target: MODULE, "Builtin module '{}' is already registered", name);
            return false;
        }
        debug!(target: MODULE, "Registered builtin module '{}'", name);
        builtins.insert(name, factory);
        true
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Create a module named `name`, or `None` if no builtin or library
    /// provides one.
    pub fn import_module(&self, engine: &Engine, name: &str) -> Option<Module> {
        let builtin = self.builtins.borrow().get(name).copied();
        if let Some(factory) = builtin {
            debug!(target: MODULE, "Creating builtin module '{}'", name);
            return Some(Module::Native(factory(engine)));
        }

        let cached = self.handles.borrow().get(name).cloned();
        let library = match cached {
            Some(library) => {
                debug!(target: MODULE, "Using cached library for '{}'", name);
                library
            }
            None => {
                let library = self.find_library(name)?;
                self.handles
                    .borrow_mut()
                    .insert(name.to_string(), library.clone());
                library
            }
        };

        let Some(create_module) = library.create_module_fn() else {
            warn!(
                target: MODULE,
                "{} has no CreateModule entry point",
                library.path().display()
            );
            return None;
        };

        // SAFETY: the entry point returns either null or a module allocated
        // with `Box`, whose ownership passes to us.
        let module = unsafe {
            let raw = create_module(engine);
            if raw.is_null() {
                warn!(target: MODULE, "CreateModule returned null for '{}'", name);
                return None;
            }
            Box::from_raw(raw)
        };

        let mut module = *module;
        module.attach_library(library);
        info!(target: MODULE, "Loaded native module '{}'", module.name());
        Some(Module::Native(module))
    }

    fn find_library(&self, name: &str) -> Option<Rc<dyn ModuleLibrary>> {
        let file_name = libloading::library_filename(name);

        for directory in &self.search_paths {
            let path = if directory.as_os_str().is_empty() {
                PathBuf::from(&file_name)
            } else {
                directory.join(&file_name)
            };

            match self.loader.open(&path) {
                Ok(library) => {
                    debug!(target: MODULE, "Opened {}", path.display());
                    return Some(library);
                }
                Err(e) => debug!(target: MODULE, "{}", e),
            }
        }

        debug!(target: MODULE, "No library found for '{}'", name);
        None
    }

    /// Whether a library handle for `name` is cached
    pub fn is_cached(&self, name: &str) -> bool {
        self.handles.borrow().contains_key(name)
    }

    pub fn handle_count(&self) -> usize {
        self.handles.borrow().len()
    }
}

impl Drop for NativeModuleImporter {
    fn drop(&mut self) {
        for (name, library) in self.handles.get_mut().drain() {
            let users = Rc::strong_count(&library) - 1;
            if users > 0 {
                debug!(target: MODULE, "Releasing handle for '{}' ({} modules still alive)", name, users);
            } else {
                debug!(target: MODULE, "Releasing handle for '{}'", name);
            }
        }
    }
}

/// Emit the `CreateModule` entry point for a native module library.
///
/// The entry point also routes the library's `tracing` events to the host's
/// subscriber (see [`crate::logging::forward_to`]).
///
/// ```ignore
/// fn create(_engine: &scripter::Engine) -> scripter::NativeModule {
///     scripter::NativeModule::new("hello")
/// }
///
/// scripter::declare_native_module!(create);
/// ```
#[macro_export]
macro_rules! declare_native_module {
    ($constructor:path) => {
        #[unsafe(no_mangle)]
        #[allow(non_snake_case, improper_ctypes_definitions)]
        pub extern "C" fn CreateModule(engine: &$crate::Engine) -> *mut $crate::NativeModule {
            $crate::logging::forward_to(engine.dispatch());
            let constructor: fn(&$crate::Engine) -> $crate::NativeModule = $constructor;
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(constructor(engine)))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScripterConfig;
    use crate::engine::Platform;
    use crate::module::Args;
    use std::cell::Cell;

    fn hello<'js>(args: Args<'js>) -> rquickjs::Result<rquickjs::Value<'js>> {
        Ok(rquickjs::Value::new_undefined(args.ctx().clone()))
    }

    extern "C" fn create_test(_engine: &Engine) -> *mut NativeModule {
        let mut module = NativeModule::new("test");
        module.register_function("hello", hello);
        Box::into_raw(Box::new(module))
    }

    extern "C" fn create_null(_engine: &Engine) -> *mut NativeModule {
        std::ptr::null_mut()
    }

    struct FakeLibrary {
        path: PathBuf,
        entry: Option<CreateModuleFn>,
        unloads: Rc<Cell<usize>>,
    }

    impl ModuleLibrary for FakeLibrary {
        fn path(&self) -> &Path {
            &self.path
        }

        fn create_module_fn(&self) -> Option<CreateModuleFn> {
            self.entry
        }
    }

    impl Drop for FakeLibrary {
        fn drop(&mut self) {
            self.unloads.set(self.unloads.get() + 1);
        }
    }

    #[derive(Clone, Default)]
    struct FakeLoader {
        libraries: Rc<RefCell<HashMap<PathBuf, Option<CreateModuleFn>>>>,
        opened: Rc<RefCell<Vec<PathBuf>>>,
        unloads: Rc<Cell<usize>>,
    }

    impl FakeLoader {
        fn with(self, path: impl Into<PathBuf>, entry: Option<CreateModuleFn>) -> Self {
            self.libraries.borrow_mut().insert(path.into(), entry);
            self
        }
    }

    impl LibraryLoader for FakeLoader {
        fn open(&self, path: &Path) -> Result<Rc<dyn ModuleLibrary>, LibraryError> {
            self.opened.borrow_mut().push(path.to_path_buf());
            match self.libraries.borrow().get(path) {
                Some(&entry) => Ok(Rc::new(FakeLibrary {
                    path: path.to_path_buf(),
                    entry,
                    unloads: self.unloads.clone(),
                })),
                None => Err(LibraryError::NotFound {
                    path: path.to_path_buf(),
                }),
            }
        }
    }

    fn lib(dir: &str, name: &str) -> PathBuf {
        let file_name = libloading::library_filename(name);
        if dir.is_empty() {
            PathBuf::from(file_name)
        } else {
            Path::new(dir).join(file_name)
        }
    }

    fn search_paths() -> Vec<PathBuf> {
        vec![PathBuf::from("/first"), PathBuf::from("/second"), PathBuf::new()]
    }

    #[test]
    fn test_import_caches_handle() {
        let platform = Platform::initialize(ScripterConfig::default()).unwrap();
        let engine = Engine::new(&platform).unwrap();
        let loader = FakeLoader::default().with(lib("/second", "test"), Some(create_test));
        let importer = NativeModuleImporter::new(search_paths(), Box::new(loader.clone()));

        let first = importer.import_module(&engine, "test").unwrap();
        let second = importer.import_module(&engine, "test").unwrap();
        assert_eq!(first.package_name(), "test");
        assert_eq!(second.package_name(), "test");

        // Two opens for the first import, none for the cache hit
        assert_eq!(
            *loader.opened.borrow(),
            vec![lib("/first", "test"), lib("/second", "test")]
        );
        assert!(importer.is_cached("test"));
        assert_eq!(importer.handle_count(), 1);

        drop(first);
        drop(second);
        assert_eq!(loader.unloads.get(), 0);
        drop(importer);
        assert_eq!(loader.unloads.get(), 1);
    }

    #[test]
    fn test_search_order_precedence() {
        let platform = Platform::initialize(ScripterConfig::default()).unwrap();
        let engine = Engine::new(&platform).unwrap();
        let loader = FakeLoader::default()
            .with(lib("/first", "test"), Some(create_test))
            .with(lib("", "test"), None);
        let importer = NativeModuleImporter::new(search_paths(), Box::new(loader.clone()));

        let module = importer.import_module(&engine, "test").unwrap();
        let Module::Native(module) = module else {
            panic!("expected a native module");
        };
        assert_eq!(module.library().unwrap().path(), lib("/first", "test"));
        assert_eq!(loader.opened.borrow().len(), 1);
    }

    #[test]
    fn test_system_search_entry() {
        let platform = Platform::initialize(ScripterConfig::default()).unwrap();
        let engine = Engine::new(&platform).unwrap();
        let loader = FakeLoader::default().with(lib("", "test"), Some(create_test));
        let importer = NativeModuleImporter::new(search_paths(), Box::new(loader));

        assert!(importer.import_module(&engine, "test").is_some());
    }

    #[test]
    fn test_missing_library_and_entry_point() {
        let platform = Platform::initialize(ScripterConfig::default()).unwrap();
        let engine = Engine::new(&platform).unwrap();
        let loader = FakeLoader::default()
            .with(lib("/first", "empty"), None)
            .with(lib("/first", "broken"), Some(create_null));
        let importer = NativeModuleImporter::new(search_paths(), Box::new(loader));

        assert!(importer.import_module(&engine, "nothing").is_none());
        assert!(!importer.is_cached("nothing"));

        assert!(importer.import_module(&engine, "empty").is_none());
        assert!(importer.is_cached("empty"));

        assert!(importer.import_module(&engine, "broken").is_none());
    }

    #[test]
    fn test_module_keeps_library_alive() {
        let platform = Platform::initialize(ScripterConfig::default()).unwrap();
        let engine = Engine::new(&platform).unwrap();
        let loader = FakeLoader::default().with(lib("/first", "test"), Some(create_test));
        let importer = NativeModuleImporter::new(search_paths(), Box::new(loader.clone()));

        let module = importer.import_module(&engine, "test").unwrap();
        drop(importer);
        assert_eq!(loader.unloads.get(), 0);
        drop(module);
        assert_eq!(loader.unloads.get(), 1);
    }

    #[test]
    fn test_builtins_take_precedence() {
        fn builtin(_engine: &Engine) -> NativeModule {
            NativeModule::new("test")
        }

        let platform = Platform::initialize(ScripterConfig::default()).unwrap();
        let engine = Engine::new(&platform).unwrap();
        let loader = FakeLoader::default().with(lib("/first", "test"), Some(create_test));
        let importer = NativeModuleImporter::new(search_paths(), Box::new(loader.clone()));

        assert!(importer.register_builtin("test", builtin));
        assert!(!importer.register_builtin("test", builtin));

        let Some(Module::Native(module)) = importer.import_module(&engine, "test") else {
            panic!("expected a native module");
        };
        assert!(module.library().is_none());
        assert!(loader.opened.borrow().is_empty());
    }

    #[test]
    fn test_dylib_loader_missing_file() {
        let err = DylibLoader
            .open(Path::new("/definitely/not/here/libnothing.so"))
            .err()
            .unwrap();
        assert!(matches!(err, LibraryError::NotFound { .. }));
    }
}
