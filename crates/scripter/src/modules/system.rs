//! `system` builtin
//!
//! Raw file descriptor access plus stdout printing. OS failures are thrown
//! into the calling script.

use std::ffi::CString;
use std::io::{self, Write};

use rquickjs::Value;

use crate::engine::Engine;
use crate::module::{Args, NativeModule, ValueAttribute};

const CREATE_MODE: libc::c_uint = 0o644;

pub fn create(_engine: &Engine) -> NativeModule {
    let mut module = NativeModule::new("system");
    module.register_function("open", open);
    module.register_function("write", write);
    module.register_function("close", close);
    module.register_function("print", print);
    module.register_function("println", println);

    for (name, value) in [
        ("FILE_READ_ONLY", libc::O_RDONLY),
        ("FILE_WRITE_ONLY", libc::O_WRONLY),
        ("FILE_READ_WRITE", libc::O_RDWR),
        ("FILE_CREATE", libc::O_CREAT),
        ("FILE_TRUNCATE", libc::O_TRUNC),
        ("FILE_APPEND", libc::O_APPEND),
    ] {
        module.register_value(name, value, ValueAttribute::ReadOnly);
    }
    module
}

/// `open(path, flags) -> fd`
fn open<'js>(args: Args<'js>) -> rquickjs::Result<Value<'js>> {
    args.expect_len(2)?;
    let path = args.string(0)?;
    let flags = args.int32(1)?;

    let c_path = CString::new(path.as_str())
        .map_err(|_| Engine::throw_type_error(args.ctx(), "open: path contains a NUL byte"))?;

    // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, CREATE_MODE) };
    if fd < 0 {
        return Err(os_error(&args, &path));
    }
    Ok(Value::new_int(args.ctx().clone(), fd))
}

/// `write(fd, data) -> bytes written`
fn write<'js>(args: Args<'js>) -> rquickjs::Result<Value<'js>> {
    args.expect_len(2)?;
    let fd = args.int32(0)?;
    let data = args.string(1)?;

    // SAFETY: the buffer is valid for `data.len()` bytes.
    let written = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if written < 0 {
        return Err(os_error(&args, &fd.to_string()));
    }
    let written = i32::try_from(written).unwrap_or(i32::MAX);
    Ok(Value::new_int(args.ctx().clone(), written))
}

/// `close(fd)`
fn close<'js>(args: Args<'js>) -> rquickjs::Result<Value<'js>> {
    args.expect_len(1)?;
    let fd = args.int32(0)?;

    // SAFETY: closing an arbitrary descriptor is memory safe; invalid ones fail with EBADF.
    if unsafe { libc::close(fd) } < 0 {
        return Err(os_error(&args, &fd.to_string()));
    }
    Ok(Value::new_undefined(args.ctx().clone()))
}

fn print<'js>(args: Args<'js>) -> rquickjs::Result<Value<'js>> {
    let text = args.joined(0)?;
    let mut stdout = io::stdout().lock();
    stdout
        .write_all(text.as_bytes())
        .and_then(|()| stdout.flush())
        .map_err(|e| Engine::throw_exception(args.ctx(), format!("print: {}", e)))?;
    Ok(Value::new_undefined(args.ctx().clone()))
}

fn println<'js>(args: Args<'js>) -> rquickjs::Result<Value<'js>> {
    let text = args.joined(0)?;
    writeln!(io::stdout().lock(), "{}", text)
        .map_err(|e| Engine::throw_exception(args.ctx(), format!("println: {}", e)))?;
    Ok(Value::new_undefined(args.ctx().clone()))
}

fn os_error(args: &Args<'_>, subject: &str) -> rquickjs::Error {
    let error = io::Error::last_os_error();
    Engine::throw_exception(args.ctx(), format!("{}: {}: {}", args.function(), subject, error))
}
