//! `hello` native module
//!
//! Build with `cargo build -p scripter-hello`, then from a script:
//!
//! ```js
//! importModule("hello");
//! hello.wow();
//! ```

use scripter::rquickjs::Value;
use scripter::{Args, Engine, NativeModule};

fn wow<'js>(args: Args<'js>) -> scripter::rquickjs::Result<Value<'js>> {
    println!("Hello World js func");
    tracing::info!(target: scripter::logging::JS, "hello.wow called");
    Ok(Value::new_undefined(args.ctx().clone()))
}

fn create(_engine: &Engine) -> NativeModule {
    let mut module = NativeModule::new("hello");
    module.register_function("wow", wow);
    module
}

scripter::declare_native_module!(create);
