//! Scripter - Embeddable JavaScript Host
//!
//! This crate hosts QuickJS (through `rquickjs`) and lets scripts pull in
//! host functionality with `importModule(name)`:
//! - `Platform` / `Engine`: process services and one isolate per engine
//! - `ScriptEnv`: execution contexts with an explicit enable/disable stack
//! - Native modules from builtins or shared libraries (`CreateModule`)
//! - Script modules: `.js` files that publish values with `addExport`

// Re-export the engine binding so native module crates use the same version
pub use rquickjs;

// Configuration and logging
pub mod config;
pub mod logging;

// Errors
pub mod error;

// Engine, platform and context stack
pub mod engine;

// Module abstraction and importers
pub mod importer;
pub mod module;

// Builtin host modules
pub mod modules;

// Script environments
pub mod script_env;

pub use config::ScripterConfig;
pub use engine::{Engine, EnvId, IsolateState, Platform, PlatformBuilder};
pub use error::{Result, ScriptException, ScripterError, StackFrame};
pub use module::{Args, Module, NativeFunction, NativeModule, ScriptModule, ValueAttribute};
pub use script_env::{EnvScope, ScriptEnv};
