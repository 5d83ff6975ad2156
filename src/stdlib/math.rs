//! The `math` library.

use std::cell::RefCell;
use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::LuaResult;
use crate::value::Value;
use crate::vm::{ExecutionContext, LuaVM};

use super::{arg, arg_error, check_number, register_library};

// One generator per VM thread, reseedable through math.randomseed.
thread_local! {
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::from_entropy());
}

/// Install the `math` table.
pub fn install(vm: &mut LuaVM) -> LuaResult<()> {
    let library = register_library(
        vm,
        "math",
        &[
            ("abs", abs),
            ("ceil", ceil),
            ("floor", floor),
            ("sqrt", sqrt),
            ("exp", exp),
            ("log", log),
            ("sin", sin),
            ("cos", cos),
            ("tan", tan),
            ("asin", asin),
            ("acos", acos),
            ("atan", atan),
            ("deg", deg),
            ("rad", rad),
            ("fmod", fmod),
            ("modf", modf),
            ("min", min),
            ("max", max),
            ("random", random),
            ("randomseed", randomseed),
        ],
    )?;
    let mut library = library.borrow_mut();
    library.raw_set(Value::string("pi"), Value::Number(PI))?;
    library.raw_set(Value::string("huge"), Value::Number(f64::INFINITY))?;
    Ok(())
}

fn abs(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number("abs", &args, 1)?.abs())])
}

fn ceil(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number("ceil", &args, 1)?.ceil())])
}

fn floor(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number("floor", &args, 1)?.floor())])
}

fn sqrt(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number("sqrt", &args, 1)?.sqrt())])
}

fn exp(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number("exp", &args, 1)?.exp())])
}

fn log(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number("log", &args, 1)?.ln())])
}

fn sin(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number("sin", &args, 1)?.sin())])
}

fn cos(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number("cos", &args, 1)?.cos())])
}

fn tan(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number("tan", &args, 1)?.tan())])
}

/// Arc sine, defined for -1 <= x <= 1.
fn asin(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let x = check_number("asin", &args, 1)?;
    if !(-1.0..=1.0).contains(&x) {
        return Err(arg_error("asin", 1, "value out of range"));
    }
    Ok(vec![Value::Number(x.asin())])
}

/// Arc cosine, defined for -1 <= x <= 1.
fn acos(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let x = check_number("acos", &args, 1)?;
    if !(-1.0..=1.0).contains(&x) {
        return Err(arg_error("acos", 1, "value out of range"));
    }
    Ok(vec![Value::Number(x.acos())])
}

fn atan(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Number(check_number("atan", &args, 1)?.atan())])
}

fn deg(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Number(
        check_number("deg", &args, 1)?.to_degrees(),
    )])
}

fn rad(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    Ok(vec![Value::Number(
        check_number("rad", &args, 1)?.to_radians(),
    )])
}

/// Remainder with the sign of the dividend (C `fmod`).
fn fmod(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let x = check_number("fmod", &args, 1)?;
    let y = check_number("fmod", &args, 2)?;
    Ok(vec![Value::Number(x % y)])
}

/// Split into integral and fractional parts, both keeping the sign.
fn modf(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let x = check_number("modf", &args, 1)?;
    Ok(vec![Value::Number(x.trunc()), Value::Number(x.fract())])
}

fn min(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let mut best = check_number("min", &args, 1)?;
    for n in 2..=args.len() {
        best = best.min(check_number("min", &args, n)?);
    }
    Ok(vec![Value::Number(best)])
}

fn max(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let mut best = check_number("max", &args, 1)?;
    for n in 2..=args.len() {
        best = best.max(check_number("max", &args, n)?);
    }
    Ok(vec![Value::Number(best)])
}

/// `random()` -> [0,1); `random(m)` -> [1,m]; `random(m,n)` -> [m,n].
fn random(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let r: f64 = RNG.with(|rng| rng.borrow_mut().gen());
    let value = match args.len() {
        0 => r,
        1 => {
            let m = check_number("random", &args, 1)?.floor();
            if m < 1.0 {
                return Err(arg_error("random", 1, "interval is empty"));
            }
            (r * m).floor() + 1.0
        }
        _ => {
            let m = check_number("random", &args, 1)?.floor();
            let n = check_number("random", &args, 2)?.floor();
            if n < m {
                return Err(arg_error("random", 2, "interval is empty"));
            }
            (r * (n - m + 1.0)).floor() + m
        }
    };
    Ok(vec![Value::Number(value)])
}

fn randomseed(_ctx: &mut ExecutionContext<'_>, args: Vec<Value>) -> LuaResult<Vec<Value>> {
    let seed = match arg(&args, 1) {
        Value::Nil => 0.0,
        other => other.coerce_number().unwrap_or(0.0),
    };
    RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed.to_bits()));
    Ok(Vec::new())
}
