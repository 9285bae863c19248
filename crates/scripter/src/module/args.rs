//! Argument contract checks for native callbacks

use std::rc::Rc;

use rquickjs::convert::Coerced;
use rquickjs::{Ctx, Value};

use crate::engine::Engine;

/// The arguments of one native call, plus the context it runs in.
///
/// Every accessor raises a `TypeError` naming the function, the argument
/// index and the expected type, so a callback can bail out with `?`.
pub struct Args<'js> {
    ctx: Ctx<'js>,
    function: Rc<str>,
    values: Vec<Value<'js>>,
}

impl<'js> Args<'js> {
    pub fn new(ctx: Ctx<'js>, function: Rc<str>, values: Vec<Value<'js>>) -> Self {
        Self {
            ctx,
            function,
            values,
        }
    }

    pub fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    /// Name the function was registered under
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value<'js>> {
        self.values.get(index)
    }

    /// Any value; only fails when the argument is missing
    pub fn value(&self, index: usize) -> rquickjs::Result<Value<'js>> {
        self.values
            .get(index)
            .cloned()
            .ok_or_else(|| self.mismatch(index, "a value"))
    }

    pub fn expect_len(&self, count: usize) -> rquickjs::Result<()> {
        if self.values.len() != count {
            return Err(Engine::throw_type_error(
                &self.ctx,
                format!(
                    "{}: expected {} arguments, got {}",
                    self.function,
                    count,
                    self.values.len()
                ),
            ));
        }
        Ok(())
    }

    pub fn expect_min(&self, count: usize) -> rquickjs::Result<()> {
        if self.values.len() < count {
            return Err(Engine::throw_type_error(
                &self.ctx,
                format!(
                    "{}: expected at least {} arguments, got {}",
                    self.function,
                    count,
                    self.values.len()
                ),
            ));
        }
        Ok(())
    }

    pub fn string(&self, index: usize) -> rquickjs::Result<String> {
        match self.values.get(index).and_then(|value| value.as_string()) {
            Some(string) => string.to_string(),
            None => Err(self.mismatch(index, "a string")),
        }
    }

    /// An int32, also accepting integral numbers stored as doubles
    pub fn int32(&self, index: usize) -> rquickjs::Result<i32> {
        let Some(value) = self.values.get(index) else {
            return Err(self.mismatch(index, "an int32"));
        };
        if let Some(int) = value.as_int() {
            return Ok(int);
        }
        match value.as_float() {
            Some(float)
                if float.fract() == 0.0
                    && float >= f64::from(i32::MIN)
                    && float <= f64::from(i32::MAX) =>
            {
                Ok(float as i32)
            }
            _ => Err(self.mismatch(index, "an int32")),
        }
    }

    pub fn boolean(&self, index: usize) -> rquickjs::Result<bool> {
        self.values
            .get(index)
            .and_then(|value| value.as_bool())
            .ok_or_else(|| self.mismatch(index, "a boolean"))
    }

    /// A boolean that may be left out or passed as `undefined`
    pub fn optional_boolean(&self, index: usize, default: bool) -> rquickjs::Result<bool> {
        match self.values.get(index) {
            None => Ok(default),
            Some(value) if value.is_undefined() => Ok(default),
            Some(_) => self.boolean(index),
        }
    }

    /// Arguments from `from` onwards, converted to strings and joined by spaces
    pub fn joined(&self, from: usize) -> rquickjs::Result<String> {
        let mut parts = Vec::with_capacity(self.values.len().saturating_sub(from));
        for value in self.values.iter().skip(from) {
            parts.push(value.get::<Coerced<String>>()?.0);
        }
        Ok(parts.join(" "))
    }

    fn mismatch(&self, index: usize, expected: &str) -> rquickjs::Error {
        let actual = match self.values.get(index) {
            Some(value) => value.type_of().as_str(),
            None => "nothing",
        };
        Engine::throw_type_error(
            &self.ctx,
            format!(
                "{}: argument {} must be {}, got {}",
                self.function, index, expected, actual
            ),
        )
    }
}
