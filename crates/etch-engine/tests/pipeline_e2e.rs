//! End-to-end pipeline scenarios through the embedding context:
//! fold → prove → emit → execute.

use etch_engine::ast::builder::*;
use etch_engine::ast::{BinOp, Expr, ExprKind, Program, SourcePos, Stmt, StmtKind, Type};
use etch_engine::{CValue, Context, ContextOptions};

fn ctx() -> Context {
    Context::new(ContextOptions::default())
}

fn release_ctx() -> Context {
    Context::new(ContextOptions {
        release: true,
        opt_level: 2,
        ..ContextOptions::default()
    })
}

// fn main() -> int { let a: int = 9_223_372_036_854_775_800; let b: int = 100; return a + b; }
#[test]
fn overflow_is_rejected_before_running() {
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            let_stmt("a", Type::Int, int(9_223_372_036_854_775_800)),
            let_stmt("b", Type::Int, int(100)),
            stmt_at(ret(at(binary(BinOp::Add, var("a"), var("b")), 1, 70)), 1, 63),
        ],
    ));
    let mut c = ctx();
    assert!(c.compile_ast(program).is_err());
    let message = c.get_error().expect("error recorded");
    assert!(message.contains("overflow"), "got: {message}");
}

// fn main() -> int { let xs = [1,2,3]; let i = 2; return xs[i]; }
#[test]
fn provable_index_compiles_and_runs() {
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            let_stmt(
                "xs",
                Type::Array(Box::new(Type::Int)),
                array(vec![int(1), int(2), int(3)]),
            ),
            let_stmt("i", Type::Int, int(2)),
            ret(index(var("xs"), var("i"))),
        ],
    ));
    let mut c = ctx();
    c.compile_ast(program).unwrap();
    assert_eq!(c.execute().unwrap(), CValue::Int(3));
}

// fn main() -> void { let x = 5; print(0); }
#[test]
fn unused_variable_is_rejected() {
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Void,
        vec![
            let_stmt("x", Type::Int, int(5)),
            expr_stmt(call("print", vec![int(0)])),
        ],
    ));
    let mut c = ctx();
    assert!(c.compile_ast(program).is_err());
    let message = c.get_error().expect("error recorded");
    assert!(message.contains("unused variable 'x'"), "got: {message}");
}

fn propagation_program(input: &str) -> Program {
    // fn parse(s: string) -> result[int,string] { return parseInt(s); }
    // fn main() -> int { let n = parse(input)?; return n; }
    let mut program = Program::new();
    program.add_function(func(
        "parse",
        vec![param("s", Type::Str)],
        Type::ResultTy(Box::new(Type::Int), Box::new(Type::Str)),
        vec![ret(call("parseInt", vec![var("s")]))],
    ));
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            let_stmt("n", Type::Int, propagate(call("parse", vec![string(input)]))),
            ret(var("n")),
        ],
    ));
    program
}

#[test]
fn result_propagation_unwraps_ok() {
    let mut c = ctx();
    c.compile_ast(propagation_program("12")).unwrap();
    assert_eq!(c.execute().unwrap(), CValue::Int(12));
}

#[test]
fn result_propagation_escapes_main_as_err() {
    let mut c = ctx();
    c.compile_ast(propagation_program("oops")).unwrap();
    match c.execute().unwrap() {
        CValue::Err(inner) => match *inner {
            CValue::Str(s) => assert!(s.contains("invalid integer"), "got: {s}"),
            other => panic!("unexpected err payload: {other:?}"),
        },
        other => panic!("expected err propagation, got: {other:?}"),
    }
}

// fn cycle() -> void { let a = ref(nil); let b = ref(a); *a = b; }
// fn main() -> void { for i in 0..10000 { cycle(); } }
fn cycle_program(iterations: i64) -> Program {
    let mut program = Program::new();
    program.add_function(func(
        "cycle",
        vec![],
        Type::Void,
        vec![
            let_stmt("a", Type::Ref(Box::new(Type::Inferred)), new_ref(nil())),
            let_stmt("b", Type::Ref(Box::new(Type::Inferred)), new_ref(var("a"))),
            Stmt::new(
                StmtKind::Assign {
                    target: etch_engine::ast::LValue::Deref(var("a")),
                    value: var("b"),
                },
                SourcePos::unknown(),
            ),
        ],
    ));
    program.add_function(func(
        "main",
        vec![],
        Type::Void,
        vec![for_stmt(
            "i",
            int(0),
            int(iterations),
            vec![expr_stmt(call("cycle", vec![]))],
        )],
    ));
    program
}

#[test]
fn frame_budgeted_gc_respects_budget_and_collects_everything() {
    let mut c = ctx();
    c.begin_frame(2000);
    c.compile_ast(cycle_program(10_000)).unwrap();
    c.execute().unwrap();

    let stats = c.gc_stats();
    assert!(
        stats.gc_time_us <= 2000,
        "per-frame gc time {} exceeded the budget",
        stats.gc_time_us
    );

    // Grant full frames until the collector drains the dirty set, then run
    // it to completion: no cell survives.
    while c.heap_needs_collection() {
        c.begin_frame(16_000);
        c.vm_mut().unwrap().collect_garbage();
    }
    let vm = c.vm_mut().unwrap();
    vm.collect_garbage();
    assert_eq!(vm.heap.live_cells(), 0);
    assert_eq!(vm.heap.total_retains, vm.heap.total_releases);
}

// Host: setGlobal(ctx, "n", 42); compile "fn main()->int{ return n; }"; execute.
#[test]
fn embedding_global_round_trip() {
    let mut c = ctx();
    c.set_global("n", CValue::Int(42));

    let mut program = Program::new();
    program.add_function(func("main", vec![], Type::Int, vec![ret(var("n"))]));
    c.compile_ast(program).unwrap();

    assert_eq!(c.execute().unwrap(), CValue::Int(42));
    assert_eq!(c.get_global("n"), Some(CValue::Int(42)));
}

#[test]
fn release_mode_inlines_and_preserves_attribution() {
    // fn helper(n: int) -> int { return n / 0; } would be rejected; instead
    // verify that a clean helper inlines and the program still runs.
    let mut program = Program::new();
    program.add_function(func(
        "double",
        vec![param("n", Type::Int)],
        Type::Int,
        vec![ret(binary(BinOp::Mul, var("n"), int(2)))],
    ));
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![ret(call("double", vec![int(21)]))],
    ));
    let mut c = release_ctx();
    c.compile_ast(program).unwrap();
    assert_eq!(c.execute().unwrap(), CValue::Int(42));
}

#[test]
fn guarded_accumulation_is_provable_and_correct() {
    // let acc = 0; for i in 0..10 { if acc < 1000 { acc = acc + i; } } → 45
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            let_stmt("acc", Type::Int, int(0)),
            for_stmt(
                "i",
                int(0),
                int(10),
                vec![if_stmt(
                    binary(BinOp::Lt, var("acc"), int(1000)),
                    vec![assign("acc", binary(BinOp::Add, var("acc"), var("i")))],
                    vec![],
                )],
            ),
            ret(var("acc")),
        ],
    ));
    let mut c = ctx();
    c.compile_ast(program).unwrap();
    assert_eq!(c.execute().unwrap(), CValue::Int(45));
}

#[test]
fn comptime_injected_global_reaches_runtime() {
    // comptime { inject("answer", "int", 6 * 7); }  fn main() -> int { return answer; }
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            Stmt::new(
                StmtKind::Comptime(vec![expr_stmt(call(
                    "inject",
                    vec![
                        string("answer"),
                        string("int"),
                        binary(BinOp::Mul, int(6), int(7)),
                    ],
                ))]),
                SourcePos::unknown(),
            ),
            ret(var("answer")),
        ],
    ));
    let mut c = ctx();
    c.compile_ast(program).unwrap();
    assert_eq!(c.execute().unwrap(), CValue::Int(42));
}

#[test]
fn compiles_probe_reaches_runtime_as_bool() {
    // fn main() -> int { let ok = compiles { let x: int = 1; };
    //                    if ok { return 1; } return 0; }
    let probe = Expr::new(
        ExprKind::Compiles(vec![let_stmt("x", Type::Int, int(1))]),
        Type::Inferred,
        SourcePos::unknown(),
    );
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            let_stmt("ok", Type::Bool, probe),
            if_stmt(var("ok"), vec![ret(int(1))], vec![ret(int(0))]),
        ],
    ));
    let mut c = ctx();
    c.compile_ast(program).unwrap();
    assert_eq!(c.execute().unwrap(), CValue::Int(1));
}

#[test]
fn bytecode_cache_round_trips_identically() {
    use etch_engine::bytecode;
    let dir = tempfile::TempDir::new().unwrap();
    let src_path = dir.path().join("prog.etch");
    std::fs::write(&src_path, "synthetic").unwrap();

    let mut c = ctx();
    c.compile_ast(cycle_program(3)).unwrap();
    let compiled = c.bytecode().unwrap().clone();

    // save → on-disk file in the sibling __etch__ directory.
    let cache_file = bytecode::save_cached(&src_path, &compiled).unwrap();
    assert_eq!(cache_file, bytecode::cache_path(&src_path));
    assert!(cache_file.exists());

    // load(save(compile(S))) ≡ compile(S) on the in-memory representation.
    let bytes = std::fs::read(&cache_file).unwrap();
    let decoded = bytecode::decode_program(&bytes).unwrap();
    assert_eq!(decoded.code, compiled.code);
    assert_eq!(decoded.functions, compiled.functions);
    assert_eq!(decoded.globals, compiled.globals);
    assert_eq!(decoded.strings, compiled.strings);
    assert_eq!(decoded.floats, compiled.floats);
    assert_eq!(decoded.ints, compiled.ints);
    assert_eq!(decoded.debug, compiled.debug);
    assert_eq!(decoded.destructors, compiled.destructors);
    assert_eq!(decoded.source_hash, compiled.source_hash);

    // And the decoded program still runs.
    let mut c2 = ctx();
    c2.install_precompiled(decoded).unwrap();
    c2.execute().unwrap();
}

#[test]
fn runtime_error_reports_position_and_runs_defers() {
    // Host callback cancels execution; defers must still run. Use a defer
    // that writes through a global so the effect is observable.
    let mut program = Program::new();
    program.globals.push(let_stmt("witness", Type::Int, int(0)));
    let mut host_decl = func("boom", vec![], Type::Int, vec![]);
    host_decl.flags.host = true;
    program.add_function(host_decl);
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            Stmt::new(
                StmtKind::Defer(vec![assign("witness", int(7))]),
                SourcePos::unknown(),
            ),
            ret(at(call("boom", vec![]), 4, 11)),
        ],
    ));
    let mut c = ctx();
    c.register_function("boom", Box::new(|_| Err("kaput".to_string())));
    c.compile_ast(program).unwrap();
    let err = c.execute().unwrap_err();
    assert!(err.to_string().contains("kaput"));
    // The defer ran during unwinding.
    assert_eq!(c.get_global("witness"), Some(CValue::Int(7)));
}
