//! Module Importers
//!
//! Two process-lifetime services owned by the [`Platform`](crate::Platform):
//! one for native modules (builtins and shared libraries), one for script
//! modules. Engines consult the script importer first.

mod native;
mod script;

pub use native::{
    BuiltinFactory, CreateModuleFn, DylibLoader, LibraryError, LibraryLoader, ModuleLibrary,
    NativeModuleImporter,
};
pub use script::JavascriptModuleImporter;
