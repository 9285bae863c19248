//! `console` builtin
//!
//! Routes script output into the `scripter::js` log target.

use rquickjs::Value;

use crate::engine::Engine;
use crate::logging::JS;
use crate::module::{Args, NativeModule};

pub fn create(_engine: &Engine) -> NativeModule {
    let mut module = NativeModule::new("console");
    module.register_function("info", info);
    module.register_function("warning", warning);
    module.register_function("error", error);
    module.register_function("critical", critical);
    module.register_function("assert", assert);
    module
}

fn info<'js>(args: Args<'js>) -> rquickjs::Result<Value<'js>> {
    tracing::info!(target: JS, "{}", args.joined(0)?);
    Ok(Value::new_undefined(args.ctx().clone()))
}

fn warning<'js>(args: Args<'js>) -> rquickjs::Result<Value<'js>> {
    tracing::warn!(target: JS, "{}", args.joined(0)?);
    Ok(Value::new_undefined(args.ctx().clone()))
}

fn error<'js>(args: Args<'js>) -> rquickjs::Result<Value<'js>> {
    tracing::error!(target: JS, "{}", args.joined(0)?);
    Ok(Value::new_undefined(args.ctx().clone()))
}

fn critical<'js>(args: Args<'js>) -> rquickjs::Result<Value<'js>> {
    tracing::error!(target: JS, critical = true, "{}", args.joined(0)?);
    Ok(Value::new_undefined(args.ctx().clone()))
}

/// `assert(condition, ...message)`
fn assert<'js>(args: Args<'js>) -> rquickjs::Result<Value<'js>> {
    args.expect_min(1)?;
    if args.boolean(0)? {
        return Ok(Value::new_undefined(args.ctx().clone()));
    }

    let message = args.joined(1)?;
    let message = if message.is_empty() {
        "Assertion failed".to_string()
    } else {
        format!("Assertion failed: {}", message)
    };
    tracing::error!(target: JS, critical = true, "{}", message);

    if cfg!(debug_assertions) {
        std::process::abort();
    }
    Err(Engine::throw_exception(args.ctx(), message))
}
