//! Host-global semantics, driven through small chunks that call one library
//! function and return its results.

mod common;

use common::*;
use selenite::opcode::OpCode::*;
use selenite::{LuaVM, Value};

fn run(bytes: &[u8]) -> Vec<Value> {
    let mut vm = LuaVM::load(bytes).expect("chunk loads");
    vm.run().expect("chunk runs")
}

fn run_err(bytes: &[u8]) -> String {
    let mut vm = LuaVM::load(bytes).expect("chunk loads");
    vm.run().expect_err("chunk fails").to_string()
}

#[test]
fn tostring_and_tonumber() {
    assert_eq!(
        run(&call_chunk("tostring", None, vec![Const::Num(42.0)])),
        vec![Value::string("42")]
    );
    assert_eq!(
        run(&call_chunk("tostring", None, vec![Const::Bool(true)])),
        vec![Value::string("true")]
    );
    assert_eq!(
        run(&call_chunk("tostring", None, vec![Const::Nil])),
        vec![Value::string("nil")]
    );
    assert_eq!(
        run(&call_chunk("tonumber", None, vec![Const::Str("  0x10  ")])),
        vec![Value::Number(16.0)]
    );
    assert_eq!(
        run(&call_chunk("tonumber", None, vec![Const::Str("3.5")])),
        vec![Value::Number(3.5)]
    );
    assert_eq!(
        run(&call_chunk("tonumber", None, vec![Const::Str("zap")])),
        vec![Value::Nil]
    );
}

#[test]
fn type_names() {
    assert_eq!(
        run(&call_chunk("type", None, vec![Const::Nil])),
        vec![Value::string("nil")]
    );
    assert_eq!(
        run(&call_chunk("type", None, vec![Const::Num(1.0)])),
        vec![Value::string("number")]
    );
    assert_eq!(
        run(&call_chunk("type", None, vec![Const::Str("s")])),
        vec![Value::string("string")]
    );
}

#[test]
fn select_count_and_tail() {
    assert_eq!(
        run(&call_chunk(
            "select",
            None,
            vec![Const::Str("#"), Const::Str("a"), Const::Str("b")]
        )),
        vec![Value::Number(2.0)]
    );
    assert_eq!(
        run(&call_chunk(
            "select",
            None,
            vec![
                Const::Num(2.0),
                Const::Str("a"),
                Const::Str("b"),
                Const::Str("c")
            ]
        )),
        vec![Value::string("b"), Value::string("c")]
    );
    // Negative indices count from the end.
    assert_eq!(
        run(&call_chunk(
            "select",
            None,
            vec![
                Const::Num(-1.0),
                Const::Str("a"),
                Const::Str("b"),
                Const::Str("c")
            ]
        )),
        vec![Value::string("c")]
    );
    let err = run_err(&call_chunk(
        "select",
        None,
        vec![Const::Num(5.0), Const::Str("a")],
    ));
    assert!(err.contains("index out of range"), "got: {err}");
    let err = run_err(&call_chunk(
        "select",
        None,
        vec![Const::Num(-4.0), Const::Str("a")],
    ));
    assert!(err.contains("index out of range"), "got: {err}");
}

#[test]
fn math_functions() {
    assert_eq!(
        run(&call_chunk("math", Some("floor"), vec![Const::Num(3.7)])),
        vec![Value::Number(3.0)]
    );
    assert_eq!(
        run(&call_chunk("math", Some("ceil"), vec![Const::Num(3.2)])),
        vec![Value::Number(4.0)]
    );
    assert_eq!(
        run(&call_chunk("math", Some("abs"), vec![Const::Num(-5.0)])),
        vec![Value::Number(5.0)]
    );
    assert_eq!(
        run(&call_chunk(
            "math",
            Some("max"),
            vec![Const::Num(1.0), Const::Num(9.0), Const::Num(4.0)]
        )),
        vec![Value::Number(9.0)]
    );
    assert_eq!(
        run(&call_chunk(
            "math",
            Some("min"),
            vec![Const::Num(1.0), Const::Num(9.0), Const::Num(4.0)]
        )),
        vec![Value::Number(1.0)]
    );
    assert_eq!(
        run(&call_chunk(
            "math",
            Some("fmod"),
            vec![Const::Num(7.0), Const::Num(3.0)]
        )),
        vec![Value::Number(1.0)]
    );
    assert_eq!(
        run(&call_chunk("math", Some("modf"), vec![Const::Num(3.25)])),
        vec![Value::Number(3.0), Value::Number(0.25)]
    );
    assert_eq!(
        run(&call_chunk("math", Some("sqrt"), vec![Const::Num(49.0)])),
        vec![Value::Number(7.0)]
    );
}

#[test]
fn math_constants_are_plain_numbers() {
    // return math.pi, math.huge
    let main = Proto::main(
        vec![
            encode_abx(GetGlobal, 0, 0),
            encode_abc(GetTable, 1, 0, RK | 1),
            encode_abc(GetTable, 2, 0, RK | 2),
            encode_abc(Return, 1, 3, 0),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![Const::Str("math"), Const::Str("pi"), Const::Str("huge")],
    );
    let results = run(&chunk(main));
    assert_eq!(results[0], Value::Number(std::f64::consts::PI));
    assert_eq!(results[1], Value::Number(f64::INFINITY));
}

#[test]
fn math_random_respects_ranges() {
    for _ in 0..50 {
        let results = run(&call_chunk(
            "math",
            Some("random"),
            vec![Const::Num(3.0), Const::Num(5.0)],
        ));
        match &results[0] {
            Value::Number(n) => {
                assert!(*n >= 3.0 && *n <= 5.0 && n.fract() == 0.0, "got {n}");
            }
            other => panic!("expected number, got {other:?}"),
        }
    }
}

#[test]
fn string_functions() {
    assert_eq!(
        run(&call_chunk("string", Some("len"), vec![Const::Str("hello")])),
        vec![Value::Number(5.0)]
    );
    assert_eq!(
        run(&call_chunk(
            "string",
            Some("sub"),
            vec![Const::Str("hello"), Const::Num(2.0), Const::Num(4.0)]
        )),
        vec![Value::string("ell")]
    );
    assert_eq!(
        run(&call_chunk(
            "string",
            Some("sub"),
            vec![Const::Str("hello"), Const::Num(-3.0)]
        )),
        vec![Value::string("llo")]
    );
    assert_eq!(
        run(&call_chunk(
            "string",
            Some("sub"),
            vec![Const::Str("hello"), Const::Num(4.0), Const::Num(2.0)]
        )),
        vec![Value::string("")]
    );
    assert_eq!(
        run(&call_chunk("string", Some("upper"), vec![Const::Str("mixed42")])),
        vec![Value::string("MIXED42")]
    );
    assert_eq!(
        run(&call_chunk(
            "string",
            Some("rep"),
            vec![Const::Str("ab"), Const::Num(3.0)]
        )),
        vec![Value::string("ababab")]
    );
    assert_eq!(
        run(&call_chunk("string", Some("reverse"), vec![Const::Str("abc")])),
        vec![Value::string("cba")]
    );
}

#[test]
fn next_walks_insertion_order() {
    // local t = {}; t.b = 1; t.a = 2
    // local k1, v1 = next(t)
    // local k2, v2 = next(t, k1)
    // local k3 = next(t, k2)
    // return k1, v1, k2, v2, k3
    let main = Proto::main(
        vec![
            encode_abc(NewTable, 0, 0, 2),
            encode_abc(SetTable, 0, RK | 0, RK | 2),
            encode_abc(SetTable, 0, RK | 1, RK | 3),
            encode_abx(GetGlobal, 1, 4),
            encode_abc(Move, 2, 0, 0),
            encode_abc(Call, 1, 2, 3), // k1, v1 = R1, R2
            encode_abx(GetGlobal, 3, 4),
            encode_abc(Move, 4, 0, 0),
            encode_abc(Move, 5, 1, 0),
            encode_abc(Call, 3, 3, 3), // k2, v2 = R3, R4
            encode_abx(GetGlobal, 5, 4),
            encode_abc(Move, 6, 0, 0),
            encode_abc(Move, 7, 3, 0),
            encode_abc(Call, 5, 3, 2), // k3 = R5
            encode_abc(Return, 1, 6, 0),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![
            Const::Str("b"),
            Const::Str("a"),
            Const::Num(1.0),
            Const::Num(2.0),
            Const::Str("next"),
        ],
    );
    assert_eq!(
        run(&chunk(main)),
        vec![
            Value::string("b"),
            Value::Number(1.0),
            Value::string("a"),
            Value::Number(2.0),
            Value::Nil,
        ]
    );
}

#[test]
fn next_rejects_unknown_keys() {
    // next({}, "ghost")
    let main = Proto::main(
        vec![
            encode_abx(GetGlobal, 0, 0),
            encode_abc(NewTable, 1, 0, 0),
            encode_abx(LoadK, 2, 1),
            encode_abc(Call, 0, 3, 1),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![Const::Str("next"), Const::Str("ghost")],
    );
    assert!(run_err(&chunk(main)).contains("invalid key to 'next'"));
}

#[test]
fn unpack_spreads_the_array_part() {
    // return unpack({10, 20, 30})
    let main = Proto::main(
        vec![
            encode_abx(GetGlobal, 0, 0),
            encode_abc(NewTable, 1, 3, 0),
            encode_abx(LoadK, 2, 1),
            encode_abx(LoadK, 3, 2),
            encode_abx(LoadK, 4, 3),
            encode_abc(SetList, 1, 3, 1),
            encode_abc(Call, 0, 2, 0),
            encode_abc(Return, 0, 0, 0),
        ],
        vec![
            Const::Str("unpack"),
            Const::Num(10.0),
            Const::Num(20.0),
            Const::Num(30.0),
        ],
    );
    assert_eq!(
        run(&chunk(main)),
        vec![
            Value::Number(10.0),
            Value::Number(20.0),
            Value::Number(30.0)
        ]
    );
}

#[test]
fn assert_passes_and_fails() {
    assert_eq!(
        run(&call_chunk(
            "assert",
            None,
            vec![Const::Num(1.0), Const::Str("m")]
        )),
        vec![Value::Number(1.0), Value::string("m")]
    );
    let err = run_err(&call_chunk(
        "assert",
        None,
        vec![Const::Bool(false), Const::Str("expected failure")],
    ));
    assert!(err.contains("expected failure"));
    let err = run_err(&call_chunk("assert", None, vec![Const::Nil]));
    assert!(err.contains("assertion failed!"));
}

#[test]
fn rawequal_ignores_eq_metamethods() {
    assert_eq!(
        run(&call_chunk(
            "rawequal",
            None,
            vec![Const::Str("x"), Const::Str("x")]
        )),
        vec![Value::Boolean(true)]
    );
    assert_eq!(
        run(&call_chunk(
            "rawequal",
            None,
            vec![Const::Num(1.0), Const::Str("1")]
        )),
        vec![Value::Boolean(false)]
    );
}

#[test]
fn table_insert_remove_concat() {
    // local t = {"a", "c"}
    // table.insert(t, 2, "b"); table.insert(t, "d")
    // table.remove(t, 1)
    // return table.concat(t, "-")
    let main = Proto::main(
        vec![
            encode_abc(NewTable, 0, 2, 0),
            encode_abx(LoadK, 1, 1),
            encode_abx(LoadK, 2, 2),
            encode_abc(SetList, 0, 2, 1),
            // table.insert(t, 2, "b")
            encode_abx(GetGlobal, 1, 0),
            encode_abc(GetTable, 1, 1, RK | 3),
            encode_abc(Move, 2, 0, 0),
            encode_abx(LoadK, 3, 4),
            encode_abx(LoadK, 4, 5),
            encode_abc(Call, 1, 4, 1),
            // table.insert(t, "d")
            encode_abx(GetGlobal, 1, 0),
            encode_abc(GetTable, 1, 1, RK | 3),
            encode_abc(Move, 2, 0, 0),
            encode_abx(LoadK, 3, 6),
            encode_abc(Call, 1, 3, 1),
            // removed = table.remove(t, 1)
            encode_abx(GetGlobal, 1, 0),
            encode_abc(GetTable, 1, 1, RK | 7),
            encode_abc(Move, 2, 0, 0),
            encode_abx(LoadK, 3, 8),
            encode_abc(Call, 1, 3, 2), // R1 = removed
            // table.concat(t, "-")
            encode_abx(GetGlobal, 2, 0),
            encode_abc(GetTable, 2, 2, RK | 9),
            encode_abc(Move, 3, 0, 0),
            encode_abx(LoadK, 4, 10),
            encode_abc(Call, 2, 3, 2), // R2 = joined
            encode_abc(Return, 2, 2, 0),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![
            Const::Str("table"),   // 0
            Const::Str("a"),       // 1
            Const::Str("c"),       // 2
            Const::Str("insert"),  // 3
            Const::Num(2.0),       // 4
            Const::Str("b"),       // 5
            Const::Str("d"),       // 6
            Const::Str("remove"),  // 7
            Const::Num(1.0),       // 8
            Const::Str("concat"),  // 9
            Const::Str("-"),       // 10
        ],
    );
    assert_eq!(run(&chunk(main)), vec![Value::string("b-c-d")]);
}

#[test]
fn pairs_returns_next_table_nil() {
    // local t = {}; local f, s = pairs(t)
    // return f == next, s == t
    let main = Proto::main(
        vec![
            encode_abc(NewTable, 0, 0, 0),
            encode_abx(GetGlobal, 1, 0),
            encode_abc(Move, 2, 0, 0),
            encode_abc(Call, 1, 2, 4), // f, s, k = R1, R2, R3
            encode_abx(GetGlobal, 4, 1),
            encode_abc(Eq, 1, 1, 4), // f == next
            encode_asbx(Jmp, 0, 1),
            encode_abc(LoadBool, 5, 0, 1),
            encode_abc(LoadBool, 5, 1, 0),
            encode_abc(Eq, 1, 2, 0), // s == t
            encode_asbx(Jmp, 0, 1),
            encode_abc(LoadBool, 6, 0, 1),
            encode_abc(LoadBool, 6, 1, 0),
            encode_abc(Return, 5, 3, 0),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![Const::Str("pairs"), Const::Str("next")],
    );
    assert_eq!(
        run(&chunk(main)),
        vec![Value::Boolean(true), Value::Boolean(true)]
    );
}

#[test]
fn ipairs_stops_at_first_nil() {
    // local t = {10, 20}; t[4] = 40; local s = 0
    // for i, v in ipairs(t) do s = s + v end
    // return s
    let main = Proto::main(
        vec![
            encode_abc(NewTable, 0, 2, 0),
            encode_abx(LoadK, 1, 0),
            encode_abx(LoadK, 2, 1),
            encode_abc(SetList, 0, 2, 1),
            encode_abc(SetTable, 0, RK | 2, RK | 3),
            encode_abx(LoadK, 1, 4), // s = 0 (R1)
            encode_abx(GetGlobal, 2, 5),
            encode_abc(Move, 3, 0, 0),
            encode_abc(Call, 2, 2, 4), // R2..R4 = ipairs(t)
            encode_asbx(Jmp, 0, 1),
            encode_abc(Add, 1, 1, 6), // s = s + v
            encode_abc(TForLoop, 2, 0, 2),
            encode_asbx(Jmp, 0, -3),
            encode_abc(Return, 1, 2, 0),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![
            Const::Num(10.0),
            Const::Num(20.0),
            Const::Num(4.0),
            Const::Num(40.0),
            Const::Num(0.0),
            Const::Str("ipairs"),
        ],
    );
    assert_eq!(run(&chunk(main)), vec![Value::Number(30.0)]);
}

#[test]
fn registered_host_function_is_callable() {
    // hook(5) for an embedder-registered hook
    fn hook(
        _ctx: &mut selenite::vm::ExecutionContext<'_>,
        args: Vec<Value>,
    ) -> selenite::LuaResult<Vec<Value>> {
        let n = match args.first() {
            Some(Value::Number(n)) => *n,
            _ => 0.0,
        };
        Ok(vec![Value::Number(n * 10.0)])
    }

    let bytes = call_chunk("hook", None, vec![Const::Num(5.0)]);
    let mut vm = LuaVM::load(&bytes).expect("chunk loads");
    vm.register_function("hook", hook).expect("registration");
    assert_eq!(vm.run().expect("chunk runs"), vec![Value::Number(50.0)]);
}

#[test]
fn globals_are_reachable_from_the_embedder() {
    // answer = 41 + 1
    let main = Proto::main(
        vec![
            encode_abc(Add, 0, RK | 1, RK | 2),
            encode_abx(SetGlobal, 0, 0),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![Const::Str("answer"), Const::Num(41.0), Const::Num(1.0)],
    );
    let mut vm = LuaVM::load(&chunk(main)).expect("chunk loads");
    vm.set_global("seed", Value::Number(7.0)).expect("set");
    vm.run().expect("chunk runs");
    assert_eq!(vm.get_global("answer"), Value::Number(42.0));
    assert_eq!(vm.get_global("seed"), Value::Number(7.0));
}
