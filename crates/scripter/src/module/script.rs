//! Script Modules
//!
//! Values a script file handed out through `addExport`, kept alive after the
//! environment that produced them is gone.

use std::path::{Path, PathBuf};

use rquickjs::{Ctx, Object, Persistent, Value};
use tracing::warn;

use crate::engine::Engine;
use crate::logging::MODULE;

/// One `addExport` call
pub(crate) struct Export {
    pub name: Option<String>,
    pub value: Persistent<Value<'static>>,
}

pub struct ScriptModule {
    name: String,
    path: PathBuf,
    exports: Vec<Export>,
    // Declared after `exports`: the runtime must outlive the persistent values.
    _engine: Engine,
}

impl ScriptModule {
    pub(crate) fn new(engine: Engine, name: String, path: PathBuf, exports: Vec<Export>) -> Self {
        Self {
            name,
            path,
            exports,
            _engine: engine,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// File the module was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    /// Names of the named exports, in registration order
    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        self.exports.iter().filter_map(|export| export.name.as_deref())
    }

    /// Named exports become an object. Without any, the first positional
    /// export is the module value; an empty module is an empty object.
    pub(crate) fn generate_object<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        let named = self.exports.iter().any(|export| export.name.is_some());

        if named {
            let object = Object::new(ctx.clone())?;
            for export in &self.exports {
                match &export.name {
                    Some(name) => object.set(name.as_str(), export.value.clone().restore(ctx)?)?,
                    None => warn!(
                        target: MODULE,
                        "Module '{}' mixes positional and named exports; positional export ignored",
                        self.name
                    ),
                }
            }
            return Ok(object.into_value());
        }

        match self.exports.split_first() {
            Some((first, rest)) => {
                if !rest.is_empty() {
                    warn!(
                        target: MODULE,
                        "Module '{}' has {} positional exports; only the first is used",
                        self.name,
                        self.exports.len()
                    );
                }
                first.value.clone().restore(ctx)
            }
            None => Ok(Object::new(ctx.clone())?.into_value()),
        }
    }
}

impl std::fmt::Debug for ScriptModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptModule")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("exports", &self.exports.len())
            .finish()
    }
}
