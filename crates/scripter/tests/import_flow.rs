//! End-to-end module import tests: scripts on disk, native modules through a
//! substitute library loader.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;
use scripter::importer::{CreateModuleFn, LibraryError, LibraryLoader, ModuleLibrary};
use scripter::rquickjs::Value;
use scripter::{Args, Engine, NativeModule, Platform, ScriptEnv, ScripterConfig};
use tempfile::TempDir;

thread_local! {
    static WOW_CALLS: Cell<usize> = const { Cell::new(0) };
}

fn wow<'js>(args: Args<'js>) -> scripter::rquickjs::Result<Value<'js>> {
    WOW_CALLS.with(|calls| calls.set(calls.get() + 1));
    Ok(Value::new_undefined(args.ctx().clone()))
}

extern "C" fn create_test(_engine: &Engine) -> *mut NativeModule {
    let mut module = NativeModule::new("test");
    module.register_function("wow", wow);
    Box::into_raw(Box::new(module))
}

struct TestLibrary {
    path: PathBuf,
}

impl ModuleLibrary for TestLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn create_module_fn(&self) -> Option<CreateModuleFn> {
        Some(create_test)
    }
}

/// Serves `libtest` from any search directory and counts opens
#[derive(Clone, Default)]
struct TestLoader {
    opens: Rc<Cell<usize>>,
}

impl LibraryLoader for TestLoader {
    fn open(&self, path: &Path) -> Result<Rc<dyn ModuleLibrary>, LibraryError> {
        if path.file_name() != Some(libloading_name("test").as_os_str()) {
            return Err(LibraryError::NotFound {
                path: path.to_path_buf(),
            });
        }
        self.opens.set(self.opens.get() + 1);
        Ok(Rc::new(TestLibrary {
            path: path.to_path_buf(),
        }))
    }
}

fn libloading_name(name: &str) -> PathBuf {
    PathBuf::from(format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        name,
        std::env::consts::DLL_SUFFIX
    ))
}

struct Host {
    _dir: TempDir,
    root: PathBuf,
    loader: TestLoader,
    engine: Engine,
    _platform: Platform,
}

impl Host {
    fn new() -> Result<Self> {
        let loader = TestLoader::default();
        let platform = Platform::builder(ScripterConfig::default())
            .library_loader(loader.clone())
            .initialize()?;
        let engine = Engine::new(&platform)?;
        engine.start_isolate()?;

        let dir = TempDir::new()?;
        let root = dir.path().canonicalize()?;
        Ok(Self {
            _dir: dir,
            root,
            loader,
            engine,
            _platform: platform,
        })
    }

    fn write(&self, name: &str, source: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, source)?;
        Ok(path)
    }

    fn env(&self) -> Result<ScriptEnv> {
        let env = ScriptEnv::new(&self.engine)?;
        env.enable()?;
        Ok(env)
    }
}

#[test]
fn native_module_is_cached_across_environments() -> Result<()> {
    let host = Host::new()?;
    let first = host.write("first.js", "importModule('test');\ntest.wow();\ntest.wow();\n")?;
    let second = host.write("second.js", "importModule('test');\ntest.wow();\n")?;

    let before = WOW_CALLS.with(Cell::get);

    let env = host.env()?;
    env.compile_and_run(&first)?;
    env.disable()?;

    let other = host.env()?;
    other.compile_and_run(&second)?;
    other.disable()?;

    assert_eq!(WOW_CALLS.with(Cell::get) - before, 3);
    assert_eq!(host.loader.opens.get(), 1);
    assert!(host.engine.native_importer().is_cached("test"));
    assert_eq!(host.engine.native_importer().handle_count(), 1);
    Ok(())
}

#[test]
fn script_exports_outlive_module_environment() -> Result<()> {
    let host = Host::new()?;
    host.write(
        "counter.js",
        "var count = 0;\n\
         addExport('next', function () { count += 1; return count; });\n",
    )?;
    let main = host.write(
        "main.js",
        "importModule('counter');\n\
         var next = counter.next;\n\
         function main() { return next() + next(); }\n",
    )?;

    let env = host.env()?;
    env.compile_and_run(&main)?;
    host.engine.run_gc();

    let total: i32 = env.with(|scope| scope.eval("main()"))??;
    assert_eq!(total, 3);
    env.disable()?;
    Ok(())
}

#[test]
fn value_mode_import_leaves_globals_alone() -> Result<()> {
    let host = Host::new()?;
    host.write("greeting.js", "addExport(function (who) { return 'hello ' + who; });\n")?;
    let main = host.write(
        "main.js",
        "var greet = importModule('greeting', false);\n\
         var result = greet('world');\n\
         var bound = typeof greeting !== 'undefined';\n",
    )?;

    let env = host.env()?;
    env.compile_and_run(&main)?;
    env.with(|scope| -> Result<()> {
        assert_eq!(scope.get_global::<String>("result")?, "hello world");
        assert!(!scope.get_global::<bool>("bound")?);
        Ok(())
    })??;
    env.disable()?;
    Ok(())
}

#[test]
fn nested_imports_resolve_relative_to_module() -> Result<()> {
    let host = Host::new()?;
    host.write("lib/math.js", "importModule('square');\naddExport('fourth', function (x) { return square.of(square.of(x)); });\n")?;
    host.write("lib/square.js", "addExport('of', function (x) { return x * x; });\n")?;
    let main = host.write("main.js", "importModule('lib/math');\nvar result = math.fourth(2);\n")?;

    let env = host.env()?;
    env.compile_and_run(&main)?;
    let result: i32 = env.with(|scope| scope.get_global("result"))??;
    assert_eq!(result, 16);
    assert_eq!(host.engine.active_env(), Some(env.id()));
    env.disable()?;
    Ok(())
}

#[test]
fn import_resolves_against_calling_function_script() -> Result<()> {
    let host = Host::new()?;
    host.write("one/helper.js", "addExport('home', 'one');\n")?;
    host.write("two/helper.js", "addExport('home', 'two');\n")?;
    let first = host.write(
        "one/a.js",
        "function f() { return importModule('helper', false); }\n",
    )?;
    let second = host.write("two/b.js", "var fromTwo = importModule('helper', false).home;\n")?;

    let env = host.env()?;
    env.compile_and_run(&first)?;
    env.compile_and_run(&second)?;

    env.with(|scope| -> Result<()> {
        assert_eq!(scope.script_path(), Some(second.clone()));
        assert_eq!(scope.get_global::<String>("fromTwo")?, "two");
        let home: String = scope.eval("f().home")?;
        assert_eq!(home, "one");
        Ok(())
    })??;
    env.disable()?;
    Ok(())
}

#[test]
fn overridden_error_does_not_affect_resolution() -> Result<()> {
    let host = Host::new()?;
    host.write("lib/helper.js", "addExport('home', 'lib');\n")?;
    let library = host.write(
        "lib/entry.js",
        "function load() { return importModule('helper', false).home; }\n",
    )?;
    let main = host.write(
        "main.js",
        "Error = function () { return { stack: '    at fake (/nowhere/fake.js:1)' }; };\n\
         var home = load();\n",
    )?;

    let env = host.env()?;
    env.compile_and_run(&library)?;
    env.compile_and_run(&main)?;
    let home: String = env.with(|scope| scope.get_global("home"))??;
    assert_eq!(home, "lib");
    env.disable()?;
    Ok(())
}

#[test]
fn unknown_module_throws() -> Result<()> {
    let host = Host::new()?;
    let main = host.write(
        "main.js",
        "var message = '';\n\
         try { importModule('nowhere'); } catch (e) { message = e.message; }\n",
    )?;

    let env = host.env()?;
    env.compile_and_run(&main)?;
    let message: String = env.with(|scope| scope.get_global("message"))??;
    assert_eq!(message, "Could not load module nowhere");
    env.disable()?;
    Ok(())
}

#[test]
fn failing_module_propagates() -> Result<()> {
    let host = Host::new()?;
    host.write("broken.js", "addExport('early', 1);\nthrow new Error('boom');\n")?;
    let main = host.write("main.js", "importModule('broken');\nvar reached = true;\n")?;

    let env = host.env()?;
    let err = env.compile_and_run(&main).unwrap_err();
    let exception = err.exception().expect("script exception");
    assert!(exception.message.starts_with("Failed to load module broken:"));
    assert!(exception.message.contains("boom"));

    let reached: Option<bool> = env.with(|scope| scope.get_global("reached"))??;
    assert_eq!(reached, None);
    assert_eq!(host.engine.last_exception().map(|e| e.message), Some(exception.message.clone()));
    assert_eq!(host.engine.active_env(), Some(env.id()));
    env.disable()?;
    Ok(())
}

#[test]
fn circular_import_is_detected() -> Result<()> {
    let host = Host::new()?;
    host.write("ping.js", "importModule('pong');\naddExport('name', 'ping');\n")?;
    host.write("pong.js", "importModule('ping');\naddExport('name', 'pong');\n")?;
    let main = host.write(
        "main.js",
        "var message = '';\n\
         try { importModule('ping'); } catch (e) { message = e.message; }\n",
    )?;

    let env = host.env()?;
    env.compile_and_run(&main)?;
    let message: String = env.with(|scope| scope.get_global("message"))??;
    assert!(message.starts_with("Failed to load module ping:"));
    assert!(message.contains("Circular import of module 'ping'"));
    assert!(host.engine.script_importer().resolve_path("ping", Some(&main)).is_file());
    env.disable()?;
    Ok(())
}

#[test]
fn reimport_replaces_binding() -> Result<()> {
    let host = Host::new()?;
    host.write("state.js", "addExport('fresh', true);\n")?;
    let main = host.write(
        "main.js",
        "importModule('state');\n\
         state.fresh = false;\n\
         importModule('state');\n\
         var fresh = state.fresh;\n",
    )?;

    let env = host.env()?;
    env.compile_and_run(&main)?;
    let fresh: bool = env.with(|scope| scope.get_global("fresh"))??;
    assert!(fresh);
    env.disable()?;
    Ok(())
}

#[test]
fn builtins_need_no_library() -> Result<()> {
    let host = Host::new()?;
    let main = host.write(
        "main.js",
        "importModule('console');\n\
         console.info('from script');\n\
         var flags = importModule('system', false).FILE_READ_ONLY;\n",
    )?;

    let env = host.env()?;
    env.compile_and_run(&main)?;
    let flags: i32 = env.with(|scope| scope.get_global("flags"))??;
    assert_eq!(flags, 0);
    assert_eq!(host.loader.opens.get(), 0);
    env.disable()?;
    Ok(())
}
