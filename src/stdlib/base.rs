//! The base library: the globals every chunk can reach without a prefix.

use std::rc::Rc;

use crate::error::{LuaError, LuaResult};
use crate::metamethod::Metamethod;
use crate::value::Value;
use crate::vm::{ExecutionContext, LuaVM};

use super::{arg, arg_error, check_number, check_table, opt_number, register};

/// Install the base library into the globals.
pub fn install(vm: &mut LuaVM) -> LuaResult<()> {
    let globals = vm.globals();
    register(
        &globals,
        &[
            ("print", print),
            ("type", type_name),
            ("tostring", tostring),
            ("tonumber", tonumber),
            ("next", next),
            ("pairs", pairs),
            ("ipairs", ipairs),
            ("select", select),
            ("setmetatable", setmetatable),
            ("getmetatable", getmetatable),
            ("rawget", rawget),
            ("rawset", rawset),
            ("rawequal", rawequal),
            ("assert", assert),
            ("error", error),
            ("unpack", unpack),
        ],
    )?;
    // _G refers back to the global table itself.
    globals
        .borrow_mut()
        .raw_set(Value::string("_G"), Value::Table(vm.globals()))?;
    Ok(())
}

/// `print(...)`: tostring each argument, join with TAB, write a line.
fn print(ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let line = args
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\t");
    writeln!(ctx.output(), "{}", line)
        .map_err(|e| LuaError::Runtime(format!("io error: {}", e)))?;
    Ok(Vec::new())
}

/// `type(v)`: the type name as a string.
fn type_name(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    if args.is_empty() {
        return Err(arg_error("type", 1, "value expected"));
    }
    Ok(vec![Value::string(arg(&args, 1).type_name())])
}

/// `tostring(v)`: the value's display form.
fn tostring(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    if args.is_empty() {
        return Err(arg_error("tostring", 1, "value expected"));
    }
    Ok(vec![Value::string(arg(&args, 1).to_string())])
}

/// `tonumber(v)`: number coercion, nil when not convertible.
fn tonumber(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![match arg(&args, 1).coerce_number() {
        Some(n) => Value::Number(n),
        None => Value::Nil,
    }])
}

/// `next(t, k)`: the key/value after `k` in traversal order.
fn next(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let table = check_table("next", &args, 1)?;
    let key = arg(&args, 2);
    let entry = table.borrow().next(&key)?;
    Ok(match entry {
        Some((k, v)) => vec![k, v],
        None => vec![Value::Nil],
    })
}

/// `pairs(t)`: the iterator triple `(next, t, nil)`.
fn pairs(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let table = check_table("pairs", &args, 1)?;
    Ok(vec![
        Value::Function(next),
        Value::Table(table),
        Value::Nil,
    ])
}

fn ipairs_iterator(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let table = check_table("ipairs", &args, 1)?;
    let index = check_number("ipairs", &args, 2)? + 1.0;
    let value = table.borrow().raw_get(&Value::Number(index));
    Ok(if value.is_nil() {
        vec![Value::Nil]
    } else {
        vec![Value::Number(index), value]
    })
}

/// `ipairs(t)`: numeric iteration from 1 up to the first nil.
fn ipairs(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let table = check_table("ipairs", &args, 1)?;
    Ok(vec![
        Value::Function(ipairs_iterator),
        Value::Table(table),
        Value::Number(0.0),
    ])
}

/// `select("#", ...)` / `select(n, ...)`.
fn select(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let count = args.len().saturating_sub(1);
    if let Value::String(s) = arg(&args, 1) {
        if s.as_bytes() == b"#" {
            return Ok(vec![Value::Number(count as f64)]);
        }
    }
    let n = check_number("select", &args, 1)?;
    if n.fract() != 0.0 {
        return Err(arg_error("select", 1, "number has no integer representation"));
    }
    let start = if n < 0.0 {
        count as i64 + n as i64 + 1
    } else {
        n as i64
    };
    if start < 1 || start > count as i64 {
        return Err(arg_error("select", 1, "index out of range"));
    }
    Ok(args[start as usize..].to_vec())
}

/// `setmetatable(t, m)`: honours `__metatable` protection.
fn setmetatable(ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let table = check_table("setmetatable", &args, 1)?;
    let meta = match arg(&args, 2) {
        Value::Nil => None,
        Value::Table(m) => Some(m),
        _ => return Err(arg_error("setmetatable", 2, "nil or table expected")),
    };
    let value = Value::Table(Rc::clone(&table));
    if ctx.metamethod_of(&value, Metamethod::Metatable).is_some() {
        return Err(LuaError::Runtime(
            "cannot change a protected metatable".to_string(),
        ));
    }
    table.borrow_mut().set_metatable(meta);
    Ok(vec![value])
}

/// `getmetatable(t)`: the metatable, or its `__metatable` field when set.
fn getmetatable(ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let value = arg(&args, 1);
    Ok(vec![match ctx.value_metatable(&value) {
        Some(metatable) => match ctx.metamethod_of(&value, Metamethod::Metatable) {
            Some(protected) => protected,
            None => Value::Table(metatable),
        },
        None => Value::Nil,
    }])
}

/// `rawget(t, k)`: read bypassing `__index`.
fn rawget(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let table = check_table("rawget", &args, 1)?;
    let key = arg(&args, 2);
    let value = table.borrow().raw_get(&key);
    Ok(vec![value])
}

/// `rawset(t, k, v)`: write bypassing `__newindex`; returns the table.
fn rawset(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let table = check_table("rawset", &args, 1)?;
    table.borrow_mut().raw_set(arg(&args, 2), arg(&args, 3))?;
    Ok(vec![Value::Table(table)])
}

/// `rawequal(a, b)`: equality bypassing `__eq`.
fn rawequal(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Boolean(arg(&args, 1) == arg(&args, 2))])
}

/// `assert(v, message?)`: pass everything through when truthy.
fn assert(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    if arg(&args, 1).truthy() {
        return Ok(args);
    }
    let message = match arg(&args, 2) {
        Value::Nil => "assertion failed!".to_string(),
        other => other.to_string(),
    };
    Err(LuaError::Runtime(message))
}

/// `error(message, level?)`: raise a runtime error. Level 0 suppresses the
/// position prefix.
fn error(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let message = arg(&args, 1).to_string();
    let level = opt_number("error", &args, 2, 1.0)?;
    if level == 0.0 {
        Err(LuaError::Script(message))
    } else {
        Err(LuaError::Runtime(message))
    }
}

/// `unpack(t, i?, j?)`: the elements `t[i..j]` as a tuple.
fn unpack(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let table = check_table("unpack", &args, 1)?;
    let first = opt_number("unpack", &args, 2, 1.0)? as i64;
    let last = match arg(&args, 3) {
        Value::Nil => table.borrow().len() as i64,
        other => other
            .coerce_number()
            .ok_or_else(|| arg_error("unpack", 3, "number expected"))? as i64,
    };
    let mut values = Vec::new();
    for i in first..=last {
        values.push(table.borrow().raw_get(&Value::Number(i as f64)));
    }
    Ok(values)
}
