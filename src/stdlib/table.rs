//! The `table` library.

use std::rc::Rc;

use crate::error::{LuaError, LuaResult};
use crate::value::{LuaString, Value};
use crate::vm::{ExecutionContext, LuaVM};

use super::{arg, arg_error, check_number, check_table, register_library};

/// Install the `table` table.
pub fn install(vm: &mut LuaVM) -> LuaResult<()> {
    register_library(
        vm,
        "table",
        &[
            ("insert", insert),
            ("remove", remove),
            ("concat", concat),
        ],
    )?;
    Ok(())
}

/// `table.insert(t, v)` appends; `table.insert(t, pos, v)` shifts up.
fn insert(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let table = check_table("insert", &args, 1)?;
    let length = table.borrow().len();
    match args.len() {
        2 => {
            table.borrow_mut().raw_seti(length + 1, arg(&args, 2))?;
        }
        3 => {
            let pos = check_number("insert", &args, 2)?;
            if pos.fract() != 0.0 || pos < 1.0 || pos > (length + 1) as f64 {
                return Err(arg_error("insert", 2, "position out of bounds"));
            }
            let pos = pos as usize;
            let mut t = table.borrow_mut();
            let mut i = length;
            while i >= pos {
                let value = t.raw_get(&Value::Number(i as f64));
                t.raw_seti(i + 1, value)?;
                if i == pos {
                    break;
                }
                i -= 1;
            }
            t.raw_seti(pos, arg(&args, 3))?;
        }
        _ => {
            return Err(LuaError::Runtime(
                "wrong number of arguments to 'insert'".to_string(),
            ))
        }
    }
    Ok(Vec::new())
}

/// `table.remove(t, pos?)`: remove and return the element at `pos`
/// (default: the last), shifting down.
fn remove(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let table = check_table("remove", &args, 1)?;
    let length = table.borrow().len();
    let pos = match arg(&args, 2) {
        Value::Nil => length as f64,
        other => other
            .coerce_number()
            .ok_or_else(|| arg_error("remove", 2, "number expected"))?,
    };
    if length == 0 {
        return Ok(vec![Value::Nil]);
    }
    if pos.fract() != 0.0 || pos < 1.0 || pos > length as f64 {
        return Err(arg_error("remove", 2, "position out of bounds"));
    }
    let pos = pos as usize;
    let mut t = table.borrow_mut();
    let removed = t.raw_get(&Value::Number(pos as f64));
    for i in pos..length {
        let value = t.raw_get(&Value::Number((i + 1) as f64));
        t.raw_seti(i, value)?;
    }
    t.raw_set(Value::Number(length as f64), Value::Nil)?;
    Ok(vec![removed])
}

/// `table.concat(t, sep?, i?, j?)`: join string/number elements.
fn concat(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let table = check_table("concat", &args, 1)?;
    let separator = match arg(&args, 2) {
        Value::Nil => Vec::new(),
        other => other
            .coerce_string()
            .ok_or_else(|| arg_error("concat", 2, "string expected"))?,
    };
    let first = match arg(&args, 3) {
        Value::Nil => 1,
        other => other
            .coerce_number()
            .ok_or_else(|| arg_error("concat", 3, "number expected"))? as i64,
    };
    let last = match arg(&args, 4) {
        Value::Nil => table.borrow().len() as i64,
        other => other
            .coerce_number()
            .ok_or_else(|| arg_error("concat", 4, "number expected"))? as i64,
    };
    let mut joined = Vec::new();
    for i in first..=last {
        let element = table.borrow().raw_get(&Value::Number(i as f64));
        let bytes = element.coerce_string().ok_or_else(|| {
            LuaError::Runtime(format!(
                "invalid value (at index {}) in table for 'concat'",
                i
            ))
        })?;
        if i > first {
            joined.extend_from_slice(&separator);
        }
        joined.extend_from_slice(&bytes);
    }
    Ok(vec![Value::String(Rc::new(LuaString::from_bytes(joined)))])
}
