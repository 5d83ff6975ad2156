//! The `coroutine` library.
//!
//! `yield` raises the internal unwind token; the dispatch loop carries it to
//! the matching `resume`, which reports `(true, values...)`. Script errors
//! inside a coroutine die at the same boundary and become
//! `(false, message)`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{LuaError, LuaResult};
use crate::value::Value;
use crate::vm::{Coroutine, ExecutionContext, LuaVM, ResumeResult};

use super::{arg, arg_error, check_function, register_library};

/// Install the `coroutine` table.
pub fn install(vm: &mut LuaVM) -> LuaResult<()> {
    register_library(
        vm,
        "coroutine",
        &[
            ("create", create),
            ("resume", resume),
            ("yield", yield_),
            ("status", status),
        ],
    )?;
    Ok(())
}

/// `coroutine.create(f)`: a new suspended coroutine; nothing runs yet.
fn create(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let entry = check_function("create", &args, 1)?;
    Ok(vec![Value::Coroutine(Rc::new(RefCell::new(
        Coroutine::new(entry),
    )))])
}

/// `coroutine.resume(co, ...)`: `(true, ...)` on yield or return,
/// `(false, message)` on error or when the coroutine cannot be resumed.
fn resume(ctx: &mut ExecutionContext<'_>, mut args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let co = match arg(&args, 1) {
        Value::Coroutine(co) => co,
        _ => return Err(arg_error("resume", 1, "coroutine expected")),
    };
    let rest = if args.is_empty() {
        Vec::new()
    } else {
        args.split_off(1)
    };
    match ctx.resume(&co, rest) {
        Ok(ResumeResult::Yielded(values)) | Ok(ResumeResult::Returned(values)) => {
            let mut results = vec![Value::Boolean(true)];
            results.extend(values);
            Ok(results)
        }
        Err(err) => Ok(vec![Value::Boolean(false), Value::string(err.to_string())]),
    }
}

/// `coroutine.yield(...)`: unwind to the nearest resume.
fn yield_(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Err(LuaError::Yield(args))
}

/// `coroutine.status(co)`.
fn status(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let co = match arg(&args, 1) {
        Value::Coroutine(co) => co,
        _ => return Err(arg_error("status", 1, "coroutine expected")),
    };
    let status = co.borrow().status();
    Ok(vec![Value::string(status.name())])
}
