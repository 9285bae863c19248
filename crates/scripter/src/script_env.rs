//! Script Environments
//!
//! A [`ScriptEnv`] is one execution context on an engine, with its own
//! globals and the `importModule` intrinsic. Environments are entered with
//! [`ScriptEnv::enable`] and left with [`ScriptEnv::disable`]; only the most
//! recently enabled one may run code.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rquickjs::function::Rest;
use rquickjs::{Context, Ctx, Exception, FromJs, Function, IntoJs, Value};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EnvId, eval_script};
use crate::error::{Result, ScripterError, parse_stack};
use crate::logging::{MODULE, SCRIPTER};
use crate::module::{Args, Module};

/// Origin recorded for source text evaluated with [`EnvScope::eval`]
const EVAL_ORIGIN: &str = "<eval>";

/// Path of the script an environment ran most recently
#[derive(Clone, Default)]
pub(crate) struct ScriptOrigin(Rc<RefCell<Option<PathBuf>>>);

impl ScriptOrigin {
    fn get(&self) -> Option<PathBuf> {
        self.0.borrow().clone()
    }

    fn set(&self, path: PathBuf) {
        *self.0.borrow_mut() = Some(path);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ScriptEnv
// ─────────────────────────────────────────────────────────────────────────────

pub struct ScriptEnv {
    engine: Engine,
    context: Context,
    origin: ScriptOrigin,
    id: EnvId,
}

impl ScriptEnv {
    /// Create an environment. The engine's isolate must be running.
    pub fn new(engine: &Engine) -> Result<Self> {
        engine.ensure_running()?;

        let context = Context::full(engine.runtime())?;
        let origin = ScriptOrigin::default();
        context.with(|ctx| install_intrinsics(engine, &ctx, &origin))?;

        let id = engine.allocate_env_id();
        debug!(target: SCRIPTER, "Created script environment {}", id);

        Ok(Self {
            engine: engine.clone(),
            context,
            origin,
            id,
        })
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Make this the active environment
    pub fn enable(&self) -> Result<()> {
        self.engine.ensure_running()?;
        self.engine
            .push_env(self.id, Some(self.context.clone()), self.origin.clone())
    }

    /// Leave this environment, restoring the one enabled before it
    pub fn disable(&self) -> Result<()> {
        self.engine.pop_env(self.id)
    }

    /// Whether this environment is enabled, active or not
    pub fn is_enabled(&self) -> bool {
        self.engine.is_enabled(self.id)
    }

    pub fn is_active(&self) -> bool {
        self.engine.is_active(self.id)
    }

    /// Run `f` with access to this environment's live values
    pub fn with<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(EnvScope<'_>) -> R,
    {
        self.engine.ensure_running()?;
        if !self.is_active() {
            return Err(ScripterError::EnvNotActive(self.id));
        }
        Ok(self.context.with(|ctx| {
            f(EnvScope::new(self.engine.clone(), ctx, self.origin.clone()))
        }))
    }

    /// Run the script at `path`
    pub fn compile_and_run(&self, path: impl AsRef<Path>) -> Result<()> {
        self.with(|scope| scope.compile_and_run(path).map(|_| ()))?
    }

    /// Bind `module` as a global under its package name
    pub fn import_module(&self, module: &Module) -> Result<()> {
        self.with(|scope| scope.import_module(module))?
    }

    /// Whether a global function `name` exists
    pub fn has_function(&self, name: &str) -> Result<bool> {
        self.with(|scope| scope.get_function(name).is_some())
    }

    /// Call the global function `name` without arguments
    pub fn call_function(&self, name: &str) -> Result<()> {
        self.with(|scope| scope.call_function(name).map(|_| ()))?
    }
}

impl Drop for ScriptEnv {
    fn drop(&mut self) {
        if self.engine.remove_env(self.id) {
            warn!(target: SCRIPTER, "Script environment {} dropped while enabled", self.id);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EnvScope
// ─────────────────────────────────────────────────────────────────────────────

/// Access to an entered environment for the duration of one call
pub struct EnvScope<'js> {
    engine: Engine,
    ctx: Ctx<'js>,
    origin: ScriptOrigin,
}

impl<'js> EnvScope<'js> {
    pub(crate) fn new(engine: Engine, ctx: Ctx<'js>, origin: ScriptOrigin) -> Self {
        Self {
            engine,
            ctx,
            origin,
        }
    }

    pub fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The script this environment ran most recently
    pub fn script_path(&self) -> Option<PathBuf> {
        self.origin.get()
    }

    /// Read, compile and run the script at `path`, using its canonical path
    /// as the diagnostic origin.
    pub fn compile_and_run(&self, path: impl AsRef<Path>) -> Result<Value<'js>> {
        let path = path.as_ref();
        let path = path.canonicalize().map_err(|source| ScripterError::ScriptRead {
            path: path.to_path_buf(),
            source,
        })?;

        let source = std::fs::read(&path).map_err(|source| ScripterError::ScriptRead {
            path: path.clone(),
            source,
        })?;

        debug!(target: SCRIPTER, "Running {}", path.display());
        self.origin.set(path.clone());

        let result = eval_script::<Value<'js>>(&self.ctx, source, &path.to_string_lossy());
        self.engine.check_try_catch(&self.ctx, result)
    }

    /// Evaluate source text as sloppy-mode global code
    pub fn eval<V: FromJs<'js>>(&self, source: &str) -> Result<V> {
        let result = eval_script::<V>(&self.ctx, source, EVAL_ORIGIN);
        self.engine.check_try_catch(&self.ctx, result)
    }

    /// Bind `module` as a global under its package name, replacing any
    /// previous binding.
    pub fn import_module(&self, module: &Module) -> Result<()> {
        let result = bind_module(&self.ctx, module);
        self.engine.check_try_catch(&self.ctx, result)
    }

    /// The global function `name`, if there is one
    pub fn get_function(&self, name: &str) -> Option<Function<'js>> {
        match self.ctx.globals().get::<_, Option<Function<'js>>>(name) {
            Ok(Some(function)) => Some(function),
            Ok(None) => {
                debug!(target: SCRIPTER, "Function '{}' not found", name);
                None
            }
            Err(e) => {
                if matches!(e, rquickjs::Error::Exception) {
                    let _ = self.ctx.catch();
                }
                debug!(target: SCRIPTER, "Global '{}' is not a function: {}", name, e);
                None
            }
        }
    }

    pub fn set_global<V: IntoJs<'js>>(&self, name: &str, value: V) -> Result<()> {
        let result = self.ctx.globals().set(name, value);
        self.engine.check_try_catch(&self.ctx, result)
    }

    pub fn get_global<V: FromJs<'js>>(&self, name: &str) -> Result<V> {
        let result = self.ctx.globals().get::<_, V>(name);
        self.engine.check_try_catch(&self.ctx, result)
    }

    /// Call the global function `name` without arguments
    pub fn call_function(&self, name: &str) -> Result<Value<'js>> {
        let function = self
            .get_function(name)
            .ok_or_else(|| ScripterError::FunctionNotFound(name.to_string()))?;
        let result = function.call::<_, Value<'js>>(());
        self.engine.check_try_catch(&self.ctx, result)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Intrinsics
// ─────────────────────────────────────────────────────────────────────────────

/// Install `importModule` into `ctx`
pub(crate) fn install_intrinsics<'js>(
    engine: &Engine,
    ctx: &Ctx<'js>,
    origin: &ScriptOrigin,
) -> rquickjs::Result<()> {
    let engine = engine.downgrade();
    let origin = origin.clone();

    let import = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, rest: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let args = Args::new(ctx.clone(), Rc::from("importModule"), rest.0);
            let Some(engine) = engine.upgrade() else {
                return Err(Engine::throw_exception(&ctx, ScripterError::EngineGone.to_string()));
            };
            import_module(&engine, &origin, args)
        },
    )?
    .with_name("importModule")?;

    ctx.globals().set("importModule", import)
}

/// `importModule(name, loadToGlobal = true)`
fn import_module<'js>(
    engine: &Engine,
    origin: &ScriptOrigin,
    args: Args<'js>,
) -> rquickjs::Result<Value<'js>> {
    args.expect_min(1)?;
    let name = args.string(0)?;
    let load_to_global = args.optional_boolean(1, true)?;
    let ctx = args.ctx();

    let requesting = requesting_script(ctx).or_else(|| origin.get());
    debug!(
        target: MODULE,
        "importModule('{}') from {}",
        name,
        requesting
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<unknown>".to_string())
    );

    let module = match engine.resolve_module(ctx, &name, requesting.as_deref()) {
        Ok(Some(module)) => module,
        Ok(None) => {
            return Err(Engine::throw_exception(
                ctx,
                format!("Could not load module {}", name),
            ));
        }
        Err(e) => {
            return Err(Engine::throw_exception(
                ctx,
                format!("Failed to load module {}: {}", name, e),
            ));
        }
    };

    if load_to_global {
        bind_module(ctx, &module)?;
        Ok(Value::new_undefined(ctx.clone()))
    } else {
        module.generate_object(ctx)
    }
}

fn bind_module<'js>(ctx: &Ctx<'js>, module: &Module) -> rquickjs::Result<()> {
    let name = module.package_name();
    let value = module.generate_object(ctx)?;
    let globals = ctx.globals();
    if globals.contains_key(name)? {
        warn!(target: MODULE, "Global '{}' already exists; replacing it with the imported module", name);
    }
    globals.set(name, value)?;
    let kind = if module.is_native() { "native" } else { "script" };
    info!(target: MODULE, "Imported {} module '{}'", kind, name);
    Ok(())
}

/// Script that is calling into native code right now, from the live stack
fn requesting_script(ctx: &Ctx<'_>) -> Option<PathBuf> {
    // Errors raised from native code get the live backtrace attached, and
    // this never consults the script-visible `Error` binding.
    let _ = Exception::throw_internal(ctx, "importModule backtrace");
    let error = ctx.catch().into_exception()?;
    let stack = error.stack()?;

    let frame = parse_stack(&stack)
        .into_iter()
        .find(|frame| frame.script.is_some())?;
    let path = PathBuf::from(frame.script?);
    (path.is_absolute() && path.is_file()).then_some(path)
}
