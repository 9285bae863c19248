//! Engine and Platform
//!
//! The [`Platform`] is the process-level service container: it brings up
//! logging and owns the two module importers. Each [`Engine`] owns one QuickJS
//! runtime (the isolate) plus the stack of script environments entered on it.

use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::fmt;
use std::path::Path;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};

use rquickjs::convert::Coerced;
use rquickjs::{Context, Ctx, Exception, FromJs, Runtime, Value as JsValue, qjs};
use tracing::{Dispatch, debug, error, info, warn};

use crate::config::ScripterConfig;
use crate::error::{Result, ScriptException, ScripterError};
use crate::importer::{
    BuiltinFactory, DylibLoader, JavascriptModuleImporter, LibraryLoader, NativeModuleImporter,
};
use crate::logging::{self, SCRIPTER};
use crate::module::Module;
use crate::script_env::{EnvScope, ScriptOrigin};

// ─────────────────────────────────────────────────────────────────────────────
// Platform
// ─────────────────────────────────────────────────────────────────────────────

thread_local! {
    static PLATFORM_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Process-level services shared by every engine on this thread.
///
/// Initialization order is logging, native importer, script importer; the
/// importers are released in the reverse order once the platform and every
/// engine created from it are gone.
pub struct Platform {
    // Fields drop in declaration order.
    script_importer: Rc<JavascriptModuleImporter>,
    native_importer: Rc<NativeModuleImporter>,
    config: ScripterConfig,
}

impl Platform {
    /// Initialize with the default `libloading`-backed native loader
    pub fn initialize(config: ScripterConfig) -> Result<Self> {
        Self::builder(config).initialize()
    }

    pub fn builder(config: ScripterConfig) -> PlatformBuilder {
        PlatformBuilder {
            config,
            loader: None,
            builtins: Vec::new(),
        }
    }

    pub fn config(&self) -> &ScripterConfig {
        &self.config
    }

    pub fn native_importer(&self) -> &Rc<NativeModuleImporter> {
        &self.native_importer
    }

    pub fn script_importer(&self) -> &Rc<JavascriptModuleImporter> {
        &self.script_importer
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        info!(target: SCRIPTER, "Shutting down scripting platform");
        PLATFORM_ACTIVE.with(|active| active.set(false));
    }
}

/// Builder for [`Platform`]
pub struct PlatformBuilder {
    config: ScripterConfig,
    loader: Option<Box<dyn LibraryLoader>>,
    builtins: Vec<(String, BuiltinFactory)>,
}

impl PlatformBuilder {
    /// Replace the shared-library loader used by the native importer
    pub fn library_loader(mut self, loader: impl LibraryLoader + 'static) -> Self {
        self.loader = Some(Box::new(loader));
        self
    }

    /// Register an additional statically linked module
    pub fn builtin(mut self, name: impl Into<String>, factory: BuiltinFactory) -> Self {
        self.builtins.push((name.into(), factory));
        self
    }

    pub fn initialize(self) -> Result<Platform> {
        if PLATFORM_ACTIVE.with(|active| active.replace(true)) {
            return Err(ScripterError::PlatformInitialized);
        }

        let Self {
            config,
            loader,
            builtins,
        } = self;

        logging::init(&config.log);

        let loader = loader.unwrap_or_else(|| Box::new(DylibLoader));
        let native_importer = NativeModuleImporter::new(config.modules.search_paths.clone(), loader);
        if config.modules.builtins {
            crate::modules::register_builtins(&native_importer);
        }
        for (name, factory) in builtins {
            native_importer.register_builtin(name, factory);
        }

        let script_importer = JavascriptModuleImporter::new(&config.modules.script_extension);

        info!(target: SCRIPTER, "Scripting platform initialized");

        Ok(Platform {
            script_importer: Rc::new(script_importer),
            native_importer: Rc::new(native_importer),
            config,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of an engine's isolate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateState {
    Created,
    Running,
    Ended,
}

/// Identifies one script environment on an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(u64);

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An entered environment. Nested sub-environments live inside a runtime
/// lock and carry no `Context` handle.
struct StackEntry {
    id: EnvId,
    context: Option<Context>,
    origin: ScriptOrigin,
}

struct EngineInner {
    runtime: Runtime,
    isolate: Cell<IsolateState>,
    next_env: Cell<u64>,
    stack: RefCell<Vec<StackEntry>>,
    last_exception: RefCell<Option<ScriptException>>,
    native_importer: Rc<NativeModuleImporter>,
    script_importer: Rc<JavascriptModuleImporter>,
    dispatch: Dispatch,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if self.isolate.get() == IsolateState::Running {
            warn!(target: SCRIPTER, "Engine dropped without end_isolate");
        }
        let stack = self.stack.get_mut();
        if !stack.is_empty() {
            warn!(target: SCRIPTER, "Engine dropped with {} environments still enabled", stack.len());
            stack.clear();
        }
    }
}

/// One script engine instance.
///
/// Cloning is cheap and yields another handle to the same isolate. Handles
/// are `!Send`: an engine is driven by a single thread.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

/// Back-pointer held by intrinsics installed into script environments
#[derive(Clone)]
pub(crate) struct WeakEngine(Weak<EngineInner>);

impl WeakEngine {
    pub(crate) fn upgrade(&self) -> Option<Engine> {
        self.0.upgrade().map(|inner| Engine { inner })
    }
}

impl Engine {
    /// Create an engine using the platform's importers and runtime limits
    pub fn new(platform: &Platform) -> Result<Self> {
        let runtime = Runtime::new()?;

        let limits = &platform.config.runtime;
        if let Some(limit) = limits.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = limits.max_stack_size {
            runtime.set_max_stack_size(size);
        }

        debug!(target: SCRIPTER, "Created engine");

        Ok(Self {
            inner: Rc::new(EngineInner {
                runtime,
                isolate: Cell::new(IsolateState::Created),
                next_env: Cell::new(0),
                stack: RefCell::new(Vec::new()),
                last_exception: RefCell::new(None),
                native_importer: platform.native_importer.clone(),
                script_importer: platform.script_importer.clone(),
                dispatch: tracing::dispatcher::get_default(Dispatch::clone),
            }),
        })
    }

    /// The `tracing` dispatcher that was current when the engine was created.
    /// Native module libraries forward their events to it.
    pub fn dispatch(&self) -> &Dispatch {
        &self.inner.dispatch
    }

    /// Begin the window in which environments may be created and run
    pub fn start_isolate(&self) -> Result<()> {
        self.transition(IsolateState::Created, IsolateState::Running)
    }

    /// Close the isolate window; no environment may run afterwards
    pub fn end_isolate(&self) -> Result<()> {
        self.transition(IsolateState::Running, IsolateState::Ended)?;
        let enabled = self.inner.stack.borrow().len();
        if enabled > 0 {
            warn!(target: SCRIPTER, "Isolate ended with {} environments still enabled", enabled);
        }
        Ok(())
    }

    pub fn isolate_state(&self) -> IsolateState {
        self.inner.isolate.get()
    }

    fn transition(&self, from: IsolateState, to: IsolateState) -> Result<()> {
        let actual = self.inner.isolate.get();
        if actual != from {
            return Err(ScripterError::IsolateState {
                expected: from,
                actual,
            });
        }
        self.inner.isolate.set(to);
        debug!(target: SCRIPTER, "Isolate {:?} -> {:?}", from, to);
        Ok(())
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        let actual = self.inner.isolate.get();
        if actual != IsolateState::Running {
            return Err(ScripterError::IsolateState {
                expected: IsolateState::Running,
                actual,
            });
        }
        Ok(())
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub(crate) fn downgrade(&self) -> WeakEngine {
        WeakEngine(Rc::downgrade(&self.inner))
    }

    pub fn native_importer(&self) -> &NativeModuleImporter {
        &self.inner.native_importer
    }

    pub fn script_importer(&self) -> &JavascriptModuleImporter {
        &self.inner.script_importer
    }

    /// Run garbage collection
    pub fn run_gc(&self) {
        self.inner.runtime.run_gc();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Context stack
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn allocate_env_id(&self) -> EnvId {
        let id = self.inner.next_env.get();
        self.inner.next_env.set(id + 1);
        EnvId(id)
    }

    pub(crate) fn push_env(
        &self,
        id: EnvId,
        context: Option<Context>,
        origin: ScriptOrigin,
    ) -> Result<()> {
        let mut stack = self.inner.stack.borrow_mut();
        if stack.iter().any(|entry| entry.id == id) {
            return Err(ScripterError::EnvAlreadyEnabled(id));
        }
        stack.push(StackEntry {
            id,
            context,
            origin,
        });
        debug!(target: SCRIPTER, "Enabled environment {} (depth {})", id, stack.len());
        Ok(())
    }

    pub(crate) fn pop_env(&self, id: EnvId) -> Result<()> {
        let mut stack = self.inner.stack.borrow_mut();
        match stack.last() {
            Some(top) if top.id == id => {
                stack.pop();
                debug!(target: SCRIPTER, "Disabled environment {} (depth {})", id, stack.len());
                Ok(())
            }
            _ => Err(ScripterError::EnvNotActive(id)),
        }
    }

    /// Drop `id` from wherever it sits in the stack. Returns whether it was present.
    pub(crate) fn remove_env(&self, id: EnvId) -> bool {
        let mut stack = self.inner.stack.borrow_mut();
        let before = stack.len();
        stack.retain(|entry| entry.id != id);
        before != stack.len()
    }

    pub(crate) fn is_active(&self, id: EnvId) -> bool {
        self.active_env() == Some(id)
    }

    pub(crate) fn is_enabled(&self, id: EnvId) -> bool {
        self.inner.stack.borrow().iter().any(|entry| entry.id == id)
    }

    /// The environment on top of the context stack
    pub fn active_env(&self) -> Option<EnvId> {
        self.inner.stack.borrow().last().map(|entry| entry.id)
    }

    /// Run `f` against the active environment.
    ///
    /// Must not be called from inside a native callback: the runtime is
    /// already locked there.
    pub fn with_active<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(EnvScope<'_>) -> R,
    {
        self.ensure_running()?;
        let (context, origin) = self
            .inner
            .stack
            .borrow()
            .last()
            .and_then(|entry| Some((entry.context.clone()?, entry.origin.clone())))
            .ok_or(ScripterError::NoActiveEnv)?;
        Ok(context.with(|ctx| f(EnvScope::new(self.clone(), ctx, origin))))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Module resolution
    // ─────────────────────────────────────────────────────────────────────

    /// Resolve `name` for a script running at `requesting_script`: script
    /// modules first, native modules second.
    pub fn resolve_module<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        requesting_script: Option<&Path>,
    ) -> Result<Option<Module>> {
        if let Some(module) = self
            .script_importer()
            .import_module(self, ctx, name, requesting_script)?
        {
            return Ok(Some(module));
        }
        Ok(self.native_importer().import_module(self, name))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Exceptions
    // ─────────────────────────────────────────────────────────────────────

    /// Raise an `Error` in the running script. The returned error must be
    /// handed straight back to the engine from the native callback.
    pub fn throw_exception(ctx: &Ctx<'_>, message: impl AsRef<str>) -> rquickjs::Error {
        Exception::throw_message(ctx, message.as_ref())
    }

    /// Raise a `TypeError` in the running script
    pub fn throw_type_error(ctx: &Ctx<'_>, message: impl AsRef<str>) -> rquickjs::Error {
        Exception::throw_type(ctx, message.as_ref())
    }

    /// Exception-check boundary.
    ///
    /// A pending script exception is taken from the context, logged with its
    /// location and call stack, recorded as the engine's last exception and
    /// returned as [`ScripterError::Script`].
    pub fn check_try_catch<'js, T>(&self, ctx: &Ctx<'js>, result: rquickjs::Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(rquickjs::Error::Exception) => {
                let exception = capture_exception(&ctx.catch());
                report_exception(&exception);
                *self.inner.last_exception.borrow_mut() = Some(exception.clone());
                Err(ScripterError::Script(Box::new(exception)))
            }
            Err(e) => {
                error!(target: SCRIPTER, "Script engine error: {}", e);
                Err(e.into())
            }
        }
    }

    /// The most recent exception seen at an exception-check boundary
    pub fn last_exception(&self) -> Option<ScriptException> {
        self.inner.last_exception.borrow().clone()
    }

    pub fn take_last_exception(&self) -> Option<ScriptException> {
        self.inner.last_exception.borrow_mut().take()
    }
}

/// Turn a thrown value into a [`ScriptException`]
pub(crate) fn capture_exception(value: &JsValue<'_>) -> ScriptException {
    let mut exception = match value.as_object() {
        Some(object) => {
            let name = object.get::<_, Option<String>>("name").ok().flatten();
            let stack = object.get::<_, Option<String>>("stack").ok().flatten();
            let message = object
                .get::<_, Option<String>>("message")
                .ok()
                .flatten()
                .unwrap_or_else(|| coerce_string(value));
            ScriptException::new(name, message, stack.as_deref())
        }
        None => ScriptException::new(None, coerce_string(value), None),
    };

    if let (Some(file), Some(line)) = (&exception.file, exception.line) {
        exception.source_line = read_source_line(Path::new(file), line);
    }
    exception
}

pub(crate) fn coerce_string(value: &JsValue<'_>) -> String {
    value
        .get::<Coerced<String>>()
        .map(|coerced| coerced.0)
        .unwrap_or_else(|_| "<unprintable value>".to_string())
}

fn read_source_line(path: &Path, line: u32) -> Option<String> {
    let source = std::fs::read_to_string(path).ok()?;
    let index = usize::try_from(line).ok()?.checked_sub(1)?;
    source.lines().nth(index).map(str::to_string)
}

fn report_exception(exception: &ScriptException) {
    let function = exception
        .script_frame()
        .map(|frame| frame.function.as_str())
        .unwrap_or("<unknown>");
    error!(target: SCRIPTER, function, "Uncaught {}", exception);
    if let Some(source_line) = &exception.source_line {
        error!(target: SCRIPTER, "    {}", source_line.trim_end());
    }
    for frame in &exception.frames {
        error!(target: SCRIPTER, "    at {}", frame);
    }
}

/// Create a new context on the runtime that owns `parent`.
///
/// The runtime is already locked for `'js` (the caller holds `parent`), so
/// going through `Context::full` would deadlock. The new context starts with
/// the standard intrinsics and is released when the returned `Ctx` and every
/// function created in it are gone.
pub(crate) fn fresh_context<'js>(parent: &Ctx<'js>) -> rquickjs::Result<Ctx<'js>> {
    // SAFETY: `parent` proves the runtime lock is held for 'js and the raw
    // runtime pointer is valid. `Ctx::from_raw` takes its own reference, so the
    // reference returned by `JS_NewContext` is released right away.
    unsafe {
        let runtime = qjs::JS_GetRuntime(parent.as_raw().as_ptr());
        let raw = NonNull::new(qjs::JS_NewContext(runtime)).ok_or(rquickjs::Error::Allocation)?;
        let ctx = Ctx::from_raw(raw);
        qjs::JS_FreeContext(raw.as_ptr());
        Ok(ctx)
    }
}

/// Evaluate `source` as sloppy-mode global code, recording `file_name` as its
/// origin in backtraces.
///
/// `Ctx::eval` forces strict mode and `Ctx::eval_file` keeps only the last
/// path component, neither of which matches how host scripts are run.
pub(crate) fn eval_script<'js, V: FromJs<'js>>(
    ctx: &Ctx<'js>,
    source: impl Into<Vec<u8>>,
    file_name: &str,
) -> rquickjs::Result<V> {
    let source = CString::new(source)?;
    let file_name = CString::new(file_name)?;
    // SAFETY: the runtime lock is held for 'js, both strings are NUL
    // terminated and outlive the call, and the returned value is owned.
    let value = unsafe {
        let raw = qjs::JS_Eval(
            ctx.as_raw().as_ptr(),
            source.as_ptr(),
            source.as_bytes().len() as _,
            file_name.as_ptr(),
            qjs::JS_EVAL_TYPE_GLOBAL as _,
        );
        if qjs::JS_IsException(raw) {
            return Err(rquickjs::Error::Exception);
        }
        JsValue::from_raw(ctx.clone(), raw)
    };
    V::from_js(ctx, value)
}
