//! The `string` library. Operates on raw bytes throughout.

use crate::error::LuaResult;
use crate::value::{LuaString, Value};
use crate::vm::{ExecutionContext, LuaVM};

use std::rc::Rc;

use super::{check_number, check_string, opt_number, register_library};

/// Install the `string` table.
pub fn install(vm: &mut LuaVM) -> LuaResult<()> {
    register_library(
        vm,
        "string",
        &[
            ("len", len),
            ("sub", sub),
            ("upper", upper),
            ("lower", lower),
            ("rep", rep),
            ("reverse", reverse),
        ],
    )?;
    Ok(())
}

fn string_value(bytes: Vec<u8>) -> Value {
    Value::String(Rc::new(LuaString::from_bytes(bytes)))
}

/// Translate a 1-based, possibly negative string position to an offset.
fn position(pos: f64, len: usize) -> i64 {
    let pos = pos as i64;
    if pos >= 0 {
        pos
    } else {
        len as i64 + pos + 1
    }
}

fn len(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let bytes = check_string("len", &args, 1)?;
    Ok(vec![Value::Number(bytes.len() as f64)])
}

/// `string.sub(s, i, j?)` with negative indices counting from the end.
fn sub(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let bytes = check_string("sub", &args, 1)?;
    let total = bytes.len();
    let mut first = position(check_number("sub", &args, 2)?, total);
    let mut last = position(opt_number("sub", &args, 3, -1.0)?, total);
    if first < 1 {
        first = 1;
    }
    if last > total as i64 {
        last = total as i64;
    }
    Ok(vec![if first > last {
        string_value(Vec::new())
    } else {
        string_value(bytes[first as usize - 1..last as usize].to_vec())
    }])
}

fn upper(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let mut bytes = check_string("upper", &args, 1)?;
    bytes.make_ascii_uppercase();
    Ok(vec![string_value(bytes)])
}

fn lower(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let mut bytes = check_string("lower", &args, 1)?;
    bytes.make_ascii_lowercase();
    Ok(vec![string_value(bytes)])
}

fn rep(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let bytes = check_string("rep", &args, 1)?;
    let count = check_number("rep", &args, 2)?;
    let count = if count < 0.0 { 0 } else { count as usize };
    let mut repeated = Vec::with_capacity(bytes.len() * count);
    for _ in 0..count {
        repeated.extend_from_slice(&bytes);
    }
    Ok(vec![string_value(repeated)])
}

fn reverse(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let mut bytes = check_string("reverse", &args, 1)?;
    bytes.reverse();
    Ok(vec![string_value(bytes)])
}
