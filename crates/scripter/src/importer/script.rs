//! Javascript Module Importer
//!
//! Resolves `<name>.<ext>` next to the importing script, runs it in a
//! throwaway environment with an `addExport` global and keeps what it
//! exported.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Persistent, Value};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EnvId, fresh_context};
use crate::error::{Result, ScripterError};
use crate::logging::MODULE;
use crate::module::{Args, Export, Module, ScriptModule};
use crate::script_env::{self, EnvScope, ScriptOrigin};

pub struct JavascriptModuleImporter {
    extension: String,
    /// Files currently being loaded, outermost first
    loading: RefCell<Vec<PathBuf>>,
}

impl JavascriptModuleImporter {
    pub fn new(extension: &str) -> Self {
        Self {
            extension: extension.trim_start_matches('.').to_string(),
            loading: RefCell::new(Vec::new()),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Where `name` lives for a script at `requesting_script`. Without a
    /// requesting script, names resolve against the working directory.
    pub fn resolve_path(&self, name: &str, requesting_script: Option<&Path>) -> PathBuf {
        let directory = requesting_script
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_default();
        directory.join(format!("{}.{}", name, self.extension))
    }

    /// Load the script module `name`.
    ///
    /// `Ok(None)` when no such file exists. A module that fails to compile or
    /// throws while running is an error, as is a module that (indirectly)
    /// imports itself.
    pub fn import_module<'js>(
        &self,
        engine: &Engine,
        ctx: &Ctx<'js>,
        name: &str,
        requesting_script: Option<&Path>,
    ) -> Result<Option<Module>> {
        let path = self.resolve_path(name, requesting_script);
        if !path.is_file() {
            debug!(target: MODULE, "No script module at {}", path.display());
            return Ok(None);
        }

        let path = path
            .canonicalize()
            .map_err(|source| ScripterError::ScriptRead { path: path.clone(), source })?;

        if self.loading.borrow().contains(&path) {
            warn!(target: MODULE, "Circular import of '{}' ({})", name, path.display());
            return Err(ScripterError::CircularImport(name.to_string()));
        }

        self.loading.borrow_mut().push(path.clone());
        let result = self.load(engine, ctx, name, &path);
        self.loading.borrow_mut().pop();

        let module = result?;
        info!(
            target: MODULE,
            "Loaded script module '{}' with {} exports",
            module.name(),
            module.export_count()
        );
        Ok(Some(Module::Script(module)))
    }

    fn load<'js>(&self, engine: &Engine, parent: &Ctx<'js>, name: &str, path: &Path) -> Result<ScriptModule> {
        let ctx = fresh_context(parent)?;
        let origin = ScriptOrigin::default();
        let sink = ExportSink::default();

        let env = SubEnv::enter(engine, origin.clone())?;
        install_add_export(&ctx, &sink)?;
        script_env::install_intrinsics(engine, &ctx, &origin)?;

        let result = EnvScope::new(engine.clone(), ctx, origin).compile_and_run(path);
        sink.close();
        let exports = sink.take();
        drop(env);
        result?;

        let package_name = Path::new(name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());

        Ok(ScriptModule::new(
            engine.clone(),
            package_name,
            path.to_path_buf(),
            exports,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sub-environment
// ─────────────────────────────────────────────────────────────────────────────

/// Stack entry for a module being loaded; removed when dropped
struct SubEnv<'a> {
    engine: &'a Engine,
    id: EnvId,
}

impl<'a> SubEnv<'a> {
    fn enter(engine: &'a Engine, origin: ScriptOrigin) -> Result<Self> {
        engine.ensure_running()?;
        let id = engine.allocate_env_id();
        engine.push_env(id, None, origin)?;
        Ok(Self { engine, id })
    }
}

impl Drop for SubEnv<'_> {
    fn drop(&mut self) {
        if self.engine.pop_env(self.id).is_err() {
            warn!(target: MODULE, "Module environment {} was not on top of the stack", self.id);
            self.engine.remove_env(self.id);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Exports
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SinkState {
    exports: Vec<Export>,
    closed: bool,
}

/// Collects `addExport` calls for one load
#[derive(Clone, Default)]
struct ExportSink(Rc<RefCell<SinkState>>);

impl ExportSink {
    fn push(&self, export: Export) -> bool {
        let mut state = self.0.borrow_mut();
        if state.closed {
            return false;
        }
        state.exports.push(export);
        true
    }

    fn close(&self) {
        self.0.borrow_mut().closed = true;
    }

    /// Move the exports out. The sink stays reachable from the module's
    /// `addExport` function, so it must not keep values alive.
    fn take(&self) -> Vec<Export> {
        std::mem::take(&mut self.0.borrow_mut().exports)
    }
}

fn install_add_export<'js>(ctx: &Ctx<'js>, sink: &ExportSink) -> rquickjs::Result<()> {
    let sink = sink.clone();
    let function = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, rest: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let args = Args::new(ctx.clone(), Rc::from("addExport"), rest.0);
            let export = match args.len() {
                1 => Export {
                    name: None,
                    value: Persistent::save(&ctx, args.value(0)?),
                },
                2 => Export {
                    name: Some(args.string(0)?),
                    value: Persistent::save(&ctx, args.value(1)?),
                },
                count => {
                    return Err(Engine::throw_type_error(
                        &ctx,
                        format!("addExport: expected 1 or 2 arguments, got {}", count),
                    ));
                }
            };

            if !sink.push(export) {
                return Err(Engine::throw_exception(
                    &ctx,
                    "addExport: module has already finished loading",
                ));
            }
            Ok(Value::new_undefined(ctx))
        },
    )?
    .with_name("addExport")?;

    ctx.globals().set("addExport", function)
}
