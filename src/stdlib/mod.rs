//! Host-provided standard globals.
//!
//! Each sub-library registers a `(name, function)` table into the global
//! environment. Host functions all share one shape: they receive the
//! execution context and the argument tuple and return a result tuple.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{LuaError, LuaResult};
use crate::table::Table;
use crate::value::{CFunction, TableHandle, Value};
use crate::vm::LuaVM;

mod base;
mod coroutine;
mod math;
mod string;
mod table;

/// Install every standard library into the VM's globals.
pub fn install(vm: &mut LuaVM) -> LuaResult<()> {
    base::install(vm)?;
    math::install(vm)?;
    string::install(vm)?;
    table::install(vm)?;
    coroutine::install(vm)?;
    Ok(())
}

/// Register a function list into a table.
pub(crate) fn register(
    target: &TableHandle,
    functions: &[(&str, CFunction)],
) -> LuaResult<()> {
    for (name, function) in functions {
        target
            .borrow_mut()
            .raw_set(Value::string(*name), Value::Function(*function))?;
    }
    Ok(())
}

/// Create a library table, fill it, and publish it under `name`.
pub(crate) fn register_library(
    vm: &mut LuaVM,
    name: &str,
    functions: &[(&str, CFunction)],
) -> LuaResult<TableHandle> {
    let library = Rc::new(RefCell::new(Table::new()));
    register(&library, functions)?;
    vm.set_global(name, Value::Table(Rc::clone(&library)))?;
    Ok(library)
}

pub(crate) fn arg_error(func: &str, arg: usize, msg: impl Into<String>) -> LuaError {
    LuaError::BadArgument {
        func: func.to_string(),
        arg,
        msg: msg.into(),
    }
}

fn describe(args: &[Value], n: usize) -> &'static str {
    match args.get(n - 1) {
        Some(value) => value.type_name(),
        None => "no value",
    }
}

/// Fetch argument `n` (1-based); missing arguments read as nil.
pub(crate) fn arg(args: &[Value], n: usize) -> Value {
    args.get(n - 1).cloned().unwrap_or(Value::Nil)
}

/// Argument `n` as a number, with Lua's string coercion.
pub(crate) fn check_number(func: &str, args: &[Value], n: usize) -> LuaResult<f64> {
    arg(args, n)
        .coerce_number()
        .ok_or_else(|| arg_error(func, n, format!("number expected, got {}", describe(args, n))))
}

/// Argument `n` as a number, defaulting when absent or nil.
pub(crate) fn opt_number(
    func: &str,
    args: &[Value],
    n: usize,
    default: f64,
) -> LuaResult<f64> {
    match arg(args, n) {
        Value::Nil => Ok(default),
        other => other.coerce_number().ok_or_else(|| {
            arg_error(func, n, format!("number expected, got {}", describe(args, n)))
        }),
    }
}

/// Argument `n` as string bytes, with Lua's number-to-string coercion.
pub(crate) fn check_string(func: &str, args: &[Value], n: usize) -> LuaResult<Vec<u8>> {
    arg(args, n)
        .coerce_string()
        .ok_or_else(|| arg_error(func, n, format!("string expected, got {}", describe(args, n))))
}

/// Argument `n` as a table handle.
pub(crate) fn check_table(func: &str, args: &[Value], n: usize) -> LuaResult<TableHandle> {
    match arg(args, n) {
        Value::Table(t) => Ok(t),
        _ => Err(arg_error(
            func,
            n,
            format!("table expected, got {}", describe(args, n)),
        )),
    }
}

/// Argument `n` as a callable function value.
pub(crate) fn check_function(func: &str, args: &[Value], n: usize) -> LuaResult<Value> {
    let value = arg(args, n);
    if value.is_function() {
        Ok(value)
    } else {
        Err(arg_error(
            func,
            n,
            format!("function expected, got {}", describe(args, n)),
        ))
    }
}
