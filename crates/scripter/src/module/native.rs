//! Native Modules
//!
//! A module whose functions are Rust callbacks, either statically linked
//! (builtins) or created by a shared library's `CreateModule` entry point.

use std::collections::HashMap;
use std::rc::Rc;

use rquickjs::function::Rest;
use rquickjs::object::Property;
use rquickjs::{Ctx, Function, Object, Value};
use tracing::warn;

use crate::importer::ModuleLibrary;
use crate::logging::MODULE;
use crate::module::Args;

/// Signature of a function exported by a native module
pub type NativeFunction = for<'js> fn(Args<'js>) -> rquickjs::Result<Value<'js>>;

/// Whether scripts may assign to a module constant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueAttribute {
    ReadOnly,
    ReadWrite,
}

/// A set of native functions and int32 constants published under one name
pub struct NativeModule {
    name: String,
    functions: HashMap<String, NativeFunction>,
    values: HashMap<String, (i32, ValueAttribute)>,
    library: Option<Rc<dyn ModuleLibrary>>,
}

impl NativeModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: HashMap::new(),
            values: HashMap::new(),
            library: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `function` under `name`. A duplicate name is rejected and the
    /// earlier registration kept.
    pub fn register_function(&mut self, name: impl Into<String>, function: NativeFunction) -> bool {
        let name = name.into();
        if self.functions.contains_key(&name) || self.values.contains_key(&name) {
            warn!(target: MODULE, "Module '{}' already exports '{}'", self.name, name);
            return false;
        }
        self.functions.insert(name, function);
        true
    }

    /// Register an int32 constant under `name`
    pub fn register_value(
        &mut self,
        name: impl Into<String>,
        value: i32,
        attribute: ValueAttribute,
    ) -> bool {
        let name = name.into();
        if self.functions.contains_key(&name) || self.values.contains_key(&name) {
            warn!(target: MODULE, "Module '{}' already exports '{}'", self.name, name);
            return false;
        }
        self.values.insert(name, (value, attribute));
        true
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// The library this module was created from, if any
    pub fn library(&self) -> Option<&Rc<dyn ModuleLibrary>> {
        self.library.as_ref()
    }

    pub(crate) fn attach_library(&mut self, library: Rc<dyn ModuleLibrary>) {
        self.library = Some(library);
    }

    pub(crate) fn generate_object<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
        let object = Object::new(ctx.clone())?;

        for (name, &callback) in &self.functions {
            let function_name: Rc<str> = Rc::from(name.as_str());
            let library = self.library.clone();
            let function = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, rest: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                    // Holds the library mapped while the function is reachable.
                    let _library = &library;
                    callback(Args::new(ctx, function_name.clone(), rest.0))
                },
            )?
            .with_name(name.as_str())?;
            object.set(name.as_str(), function)?;
        }

        for (name, &(value, attribute)) in &self.values {
            let property = match attribute {
                ValueAttribute::ReadOnly => Property::from(value).enumerable(),
                ValueAttribute::ReadWrite => Property::from(value).writable().enumerable().configurable(),
            };
            object.prop(name.as_str(), property)?;
        }

        Ok(object)
    }
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModule")
            .field("name", &self.name)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("values", &self.values)
            .field("library", &self.library.is_some())
            .finish()
    }
}
