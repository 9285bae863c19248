//! Builtin modules served without touching the filesystem

pub mod console;
#[cfg(unix)]
pub mod system;

use crate::importer::NativeModuleImporter;

/// Register every builtin on `importer`
pub fn register_builtins(importer: &NativeModuleImporter) {
    importer.register_builtin("console", console::create);
    #[cfg(unix)]
    importer.register_builtin("system", system::create);
}
