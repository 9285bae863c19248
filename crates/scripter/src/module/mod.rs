//! Modules
//!
//! A module is a package name plus a set of callable exports that can be
//! turned into a script object on demand. Native modules are backed by Rust
//! callbacks, script modules by values exported from a `.js` file.

mod args;
mod native;
mod script;

pub use args::Args;
pub use native::{NativeFunction, NativeModule, ValueAttribute};
pub use script::ScriptModule;

pub(crate) use script::Export;

use rquickjs::{Ctx, Value};

#[derive(Debug)]
pub enum Module {
    Native(NativeModule),
    Script(ScriptModule),
}

impl Module {
    /// The global key the module is bound to when imported
    pub fn package_name(&self) -> &str {
        match self {
            Module::Native(module) => module.name(),
            Module::Script(module) => module.name(),
        }
    }

    /// Build the script-visible value for this module in `ctx`
    pub fn generate_object<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        match self {
            Module::Native(module) => Ok(module.generate_object(ctx)?.into_value()),
            Module::Script(module) => module.generate_object(ctx),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Module::Native(_))
    }
}

impl From<NativeModule> for Module {
    fn from(module: NativeModule) -> Self {
        Module::Native(module)
    }
}

impl From<ScriptModule> for Module {
    fn from(module: ScriptModule) -> Self {
        Module::Script(module)
    }
}
