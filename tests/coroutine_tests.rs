//! Coroutine lifecycle: yield/resume pairing, argument plumbing, death on
//! return and on error.

mod common;

use common::*;
use selenite::opcode::OpCode::*;
use selenite::LuaVM;

/// A main chunk that creates a coroutine from nested proto 0 and prints the
/// results of `count` resumes, passing one constant argument to each.
/// Layout: K0.."coroutine", K1.."create", K2.."resume", K3.."print",
/// K4... the per-resume arguments.
fn driver(body: Proto, resume_args: &[f64]) -> Vec<u8> {
    let mut constants = vec![
        Const::Str("coroutine"),
        Const::Str("create"),
        Const::Str("resume"),
        Const::Str("print"),
    ];
    let mut code = vec![
        encode_abx(GetGlobal, 0, 0),
        encode_abc(GetTable, 0, 0, RK | 1),
        encode_abx(Closure, 1, 0),
        encode_abc(Call, 0, 2, 2), // co = R0
    ];
    for (i, arg) in resume_args.iter().enumerate() {
        constants.push(Const::Num(*arg));
        code.extend_from_slice(&[
            encode_abx(GetGlobal, 1, 3),
            encode_abx(GetGlobal, 2, 0),
            encode_abc(GetTable, 2, 2, RK | 2),
            encode_abc(Move, 3, 0, 0),
            encode_abx(LoadK, 4, 4 + i as u32),
            encode_abc(Call, 2, 3, 0),
            encode_abc(Call, 1, 0, 1),
        ]);
    }
    code.push(encode_abc(Return, 0, 1, 0));
    chunk(Proto::main(code, constants).with_protos(vec![body]))
}

#[test]
fn yield_and_return_pair_with_resumes() {
    // function(a) local b = coroutine.yield(a + 1); return b * 2 end
    let body = Proto::function(
        1,
        0,
        vec![
            encode_abx(GetGlobal, 1, 0),
            encode_abc(GetTable, 1, 1, RK | 1),
            encode_abc(Add, 2, 0, RK | 2),
            encode_abc(Call, 1, 2, 2),
            encode_abc(Mul, 2, 1, RK | 3),
            encode_abc(Return, 2, 2, 0),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![
            Const::Str("coroutine"),
            Const::Str("yield"),
            Const::Num(1.0),
            Const::Num(2.0),
        ],
    );
    assert_eq!(
        run_and_print(&driver(body, &[10.0, 5.0])),
        "true\t11\ntrue\t10\n"
    );
}

#[test]
fn resuming_a_dead_coroutine_reports_failure() {
    // function() return 1 end, resumed twice
    let body = Proto::function(
        0,
        0,
        vec![
            encode_abx(LoadK, 0, 0),
            encode_abc(Return, 0, 2, 0),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![Const::Num(1.0)],
    );
    assert_eq!(
        run_and_print(&driver(body, &[0.0, 0.0])),
        "true\t1\nfalse\tcannot resume dead coroutine\n"
    );
}

#[test]
fn error_inside_coroutine_surfaces_at_resume() {
    // function() error("boom") end
    let body = Proto::function(
        0,
        0,
        vec![
            encode_abx(GetGlobal, 0, 0),
            encode_abx(LoadK, 1, 1),
            encode_abc(Call, 0, 2, 1),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![Const::Str("error"), Const::Str("boom")],
    );
    let printed = run_and_print(&driver(body, &[0.0]));
    assert!(printed.starts_with("false\t"), "printed: {printed}");
    assert!(printed.contains("boom"), "printed: {printed}");
    // A second resume after the failure reports death.
    let printed = run_and_print(&driver(
        Proto::function(
            0,
            0,
            vec![
                encode_abx(GetGlobal, 0, 0),
                encode_abx(LoadK, 1, 1),
                encode_abc(Call, 0, 2, 1),
                encode_abc(Return, 0, 1, 0),
            ],
            vec![Const::Str("error"), Const::Str("boom")],
        ),
        &[0.0, 0.0],
    ));
    assert!(printed.ends_with("false\tcannot resume dead coroutine\n"));
}

#[test]
fn multi_value_yield_round_trip() {
    // function() coroutine.yield(1, 2) return 3 end
    let body = Proto::function(
        0,
        0,
        vec![
            encode_abx(GetGlobal, 0, 0),
            encode_abc(GetTable, 0, 0, RK | 1),
            encode_abx(LoadK, 1, 2),
            encode_abx(LoadK, 2, 3),
            encode_abc(Call, 0, 3, 1),
            encode_abx(LoadK, 0, 4),
            encode_abc(Return, 0, 2, 0),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![
            Const::Str("coroutine"),
            Const::Str("yield"),
            Const::Num(1.0),
            Const::Num(2.0),
            Const::Num(3.0),
        ],
    );
    assert_eq!(
        run_and_print(&driver(body, &[0.0, 0.0])),
        "true\t1\t2\ntrue\t3\n"
    );
}

#[test]
fn status_tracks_the_lifecycle() {
    // local co = coroutine.create(function() coroutine.yield() end)
    // print(coroutine.status(co)); coroutine.resume(co)
    // print(coroutine.status(co)); coroutine.resume(co)
    // print(coroutine.status(co))
    let body = Proto::function(
        0,
        0,
        vec![
            encode_abx(GetGlobal, 0, 0),
            encode_abc(GetTable, 0, 0, RK | 1),
            encode_abc(Call, 0, 1, 1),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![Const::Str("coroutine"), Const::Str("yield")],
    );
    let main = Proto::main(
        vec![
            encode_abx(GetGlobal, 0, 0),
            encode_abc(GetTable, 0, 0, RK | 1),
            encode_abx(Closure, 1, 0),
            encode_abc(Call, 0, 2, 2), // co = R0
            // print(coroutine.status(co))
            encode_abx(GetGlobal, 1, 4),
            encode_abx(GetGlobal, 2, 0),
            encode_abc(GetTable, 2, 2, RK | 3),
            encode_abc(Move, 3, 0, 0),
            encode_abc(Call, 2, 2, 0),
            encode_abc(Call, 1, 0, 1),
            // coroutine.resume(co)
            encode_abx(GetGlobal, 1, 0),
            encode_abc(GetTable, 1, 1, RK | 2),
            encode_abc(Move, 2, 0, 0),
            encode_abc(Call, 1, 2, 1),
            // print(coroutine.status(co))
            encode_abx(GetGlobal, 1, 4),
            encode_abx(GetGlobal, 2, 0),
            encode_abc(GetTable, 2, 2, RK | 3),
            encode_abc(Move, 3, 0, 0),
            encode_abc(Call, 2, 2, 0),
            encode_abc(Call, 1, 0, 1),
            // coroutine.resume(co)
            encode_abx(GetGlobal, 1, 0),
            encode_abc(GetTable, 1, 1, RK | 2),
            encode_abc(Move, 2, 0, 0),
            encode_abc(Call, 1, 2, 1),
            // print(coroutine.status(co))
            encode_abx(GetGlobal, 1, 4),
            encode_abx(GetGlobal, 2, 0),
            encode_abc(GetTable, 2, 2, RK | 3),
            encode_abc(Move, 3, 0, 0),
            encode_abc(Call, 2, 2, 0),
            encode_abc(Call, 1, 0, 1),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![
            Const::Str("coroutine"),
            Const::Str("create"),
            Const::Str("resume"),
            Const::Str("status"),
            Const::Str("print"),
        ],
    )
    .with_protos(vec![body]);
    assert_eq!(
        run_and_print(&chunk(main)),
        "suspended\nsuspended\ndead\n"
    );
}

#[test]
fn yield_from_the_main_chunk_is_an_error() {
    // coroutine.yield(1)
    let main = Proto::main(
        vec![
            encode_abx(GetGlobal, 0, 0),
            encode_abc(GetTable, 0, 0, RK | 1),
            encode_abx(LoadK, 1, 2),
            encode_abc(Call, 0, 2, 1),
            encode_abc(Return, 0, 1, 0),
        ],
        vec![
            Const::Str("coroutine"),
            Const::Str("yield"),
            Const::Num(1.0),
        ],
    );
    let mut vm = LuaVM::load(&chunk(main)).expect("chunk loads");
    let err = vm.run().expect_err("root yield");
    assert!(err.to_string().contains("outside a coroutine"));
}
