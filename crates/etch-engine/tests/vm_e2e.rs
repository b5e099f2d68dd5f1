//! VM behavior: dispatch, defers, coroutines, channels, weak references,
//! destructors, and heap accounting. These lower ASTs straight through the
//! emitter and drive the VM directly.

use etch_engine::ast::builder::*;
use etch_engine::ast::{
    BinOp, Expr, ExprKind, LValue, ObjectDecl, Program, SourcePos, Stmt, StmtKind, Type,
};
use etch_engine::codegen::{emit_program, CodegenOptions};
use etch_engine::vm::{Value, Vm};
use std::cell::RefCell;
use std::rc::Rc;

fn run(program: &Program) -> (Result<Value, etch_engine::vm::VmError>, String) {
    let bytecode = emit_program(program, &CodegenOptions::default()).expect("emit");
    let out = Rc::new(RefCell::new(String::new()));
    let mut vm = Vm::sandbox(Rc::new(bytecode), out.clone());
    let result = vm.execute();
    let text = out.borrow().clone();
    (result, text)
}

fn run_value(program: &Program) -> Value {
    let (result, _) = run(program);
    result.expect("execution")
}

#[test]
fn arithmetic_and_branches() {
    // if 2 + 3 < 10 { return 1; } return 0;
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            if_stmt(
                binary(BinOp::Lt, binary(BinOp::Add, int(2), int(3)), int(10)),
                vec![ret(int(1))],
                vec![],
            ),
            ret(int(0)),
        ],
    ));
    assert_eq!(run_value(&program), Value::Int(1));
}

#[test]
fn while_loop_counts() {
    // let n = 0; while n < 5 { n = n + 1; } return n;
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            let_stmt("n", Type::Int, int(0)),
            while_stmt(
                binary(BinOp::Lt, var("n"), int(5)),
                vec![assign("n", binary(BinOp::Add, var("n"), int(1)))],
            ),
            ret(var("n")),
        ],
    ));
    assert_eq!(run_value(&program), Value::Int(5));
}

#[test]
fn for_loop_with_break_and_continue() {
    // sum of odd i in 0..10, stopping at i == 7  → 1 + 3 + 5 = 9... then 7 breaks
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            let_stmt("sum", Type::Int, int(0)),
            for_stmt(
                "i",
                int(0),
                int(10),
                vec![
                    if_stmt(
                        binary(BinOp::Eq, var("i"), int(7)),
                        vec![Stmt::new(StmtKind::Break, SourcePos::unknown())],
                        vec![],
                    ),
                    if_stmt(
                        binary(
                            BinOp::Eq,
                            binary(BinOp::Mod, var("i"), int(2)),
                            int(0),
                        ),
                        vec![Stmt::new(StmtKind::Continue, SourcePos::unknown())],
                        vec![],
                    ),
                    assign("sum", binary(BinOp::Add, var("sum"), var("i"))),
                ],
            ),
            ret(var("sum")),
        ],
    ));
    assert_eq!(run_value(&program), Value::Int(1 + 3 + 5));
}

#[test]
fn function_calls_and_recursion() {
    // fib(10) = 55
    let mut program = Program::new();
    program.add_function(func(
        "fib",
        vec![param("n", Type::Int)],
        Type::Int,
        vec![
            if_stmt(binary(BinOp::Lt, var("n"), int(2)), vec![ret(var("n"))], vec![]),
            ret(binary(
                BinOp::Add,
                call("fib", vec![binary(BinOp::Sub, var("n"), int(1))]),
                call("fib", vec![binary(BinOp::Sub, var("n"), int(2))]),
            )),
        ],
    ));
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![ret(call("fib", vec![int(10)]))],
    ));
    assert_eq!(run_value(&program), Value::Int(55));
}

#[test]
fn defers_run_in_reverse_on_return() {
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Void,
        vec![
            Stmt::new(
                StmtKind::Defer(vec![expr_stmt(call("print", vec![string("a")]))]),
                SourcePos::unknown(),
            ),
            Stmt::new(
                StmtKind::Defer(vec![expr_stmt(call("print", vec![string("b")]))]),
                SourcePos::unknown(),
            ),
            expr_stmt(call("print", vec![string("c")])),
        ],
    ));
    let (result, output) = run(&program);
    result.unwrap();
    assert_eq!(output, "cba");
}

#[test]
fn defers_run_during_error_unwinding() {
    // defer { print("cleanup") } then divide by zero.
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            Stmt::new(
                StmtKind::Defer(vec![expr_stmt(call("print", vec![string("cleanup")]))]),
                SourcePos::unknown(),
            ),
            let_stmt("z", Type::Int, int(0)),
            ret(binary(BinOp::Div, int(1), var("z"))),
        ],
    ));
    let (result, output) = run(&program);
    let err = result.unwrap_err();
    assert!(err.message.contains("division by zero"));
    assert_eq!(output, "cleanup");
}

#[test]
fn arrays_alias_through_assignment() {
    // let xs = [1,2,3]; let ys = xs; ys[0] = 9; return xs[0];  → 9
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
            let_stmt("ys", Type::Array(Box::new(Type::Int)), var("xs")),
            Stmt::new(
                StmtKind::Assign {
                    target: LValue::Index {
                        base: var("ys"),
                        index: int(0),
                    },
                    value: int(9),
                },
                SourcePos::unknown(),
            ),
            ret(index(var("xs"), int(0))),
        ],
    ));
    assert_eq!(run_value(&program), Value::Int(9));
}

#[test]
fn out_of_bounds_index_is_a_runtime_error() {
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            let_stmt(
                "xs",
                Type::Array(Box::new(Type::Int)),
                array(vec![int(1)]),
            ),
            ret(at(index(var("xs"), int(5)), 2, 12)),
        ],
    ));
    let (result, _) = run(&program);
    let err = result.unwrap_err();
    assert!(err.message.contains("out of bounds"));
    assert_eq!(err.line, 2);
    assert_eq!(err.col, 12);
}

#[test]
fn weak_reference_dies_with_its_target() {
    // let r = ref(5); let w = weak(r); r = ref(6); return *w;  → nil
    let weak_of = Expr::new(
        ExprKind::WeakOf(Box::new(var("r"))),
        Type::Inferred,
        SourcePos::unknown(),
    );
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Inferred,
        vec![
            let_stmt("r", Type::Ref(Box::new(Type::Int)), new_ref(int(5))),
            let_stmt("w", Type::Weak(Box::new(Type::Int)), weak_of),
            assign("r", new_ref(int(6))),
            ret(deref(var("w"))),
        ],
    ));
    assert_eq!(run_value(&program), Value::Nil);
}

#[test]
fn coroutine_yield_resume() {
    // fn gen() -> void { yield 1; yield 2; }
    // main: let c = spawn gen(); resume + resume → 3
    let yield1 = Expr::new(
        ExprKind::YieldExpr(Some(Box::new(int(1)))),
        Type::Inferred,
        SourcePos::unknown(),
    );
    let yield2 = Expr::new(
        ExprKind::YieldExpr(Some(Box::new(int(2)))),
        Type::Inferred,
        SourcePos::unknown(),
    );
    let spawn = Expr::new(
        ExprKind::Spawn {
            call: Box::new(call("gen", vec![])),
        },
        Type::Inferred,
        SourcePos::unknown(),
    );
    let resume_a = Expr::new(
        ExprKind::Resume(Box::new(var("c"))),
        Type::Inferred,
        SourcePos::unknown(),
    );
    let resume_b = Expr::new(
        ExprKind::Resume(Box::new(var("c"))),
        Type::Inferred,
        SourcePos::unknown(),
    );

    let mut program = Program::new();
    program.add_function(func(
        "gen",
        vec![],
        Type::Void,
        vec![expr_stmt(yield1), expr_stmt(yield2)],
    ));
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            let_stmt("c", Type::Coroutine(Box::new(Type::Int)), spawn),
            let_stmt("a", Type::Int, resume_a),
            let_stmt("b", Type::Int, resume_b),
            ret(binary(BinOp::Add, var("a"), var("b"))),
        ],
    ));
    assert_eq!(run_value(&program), Value::Int(3));
}

#[test]
fn channel_send_receive_across_tasks() {
    // fn producer(ch: channel[int]) -> void { send ch <- 7; }
    // main: let ch = channel(1); spawn producer(ch); return recv ch;
    let make_chan = Expr::new(
        ExprKind::MakeChannel {
            elem: Type::Int,
            capacity: Box::new(int(1)),
        },
        Type::Inferred,
        SourcePos::unknown(),
    );
    let send = Expr::new(
        ExprKind::ChanSend {
            chan: Box::new(var("ch")),
            value: Box::new(int(7)),
        },
        Type::Inferred,
        SourcePos::unknown(),
    );
    let recv = Expr::new(
        ExprKind::ChanRecv {
            chan: Box::new(var("ch")),
        },
        Type::Inferred,
        SourcePos::unknown(),
    );
    let spawn = Expr::new(
        ExprKind::Spawn {
            call: Box::new(call("producer", vec![var("ch")])),
        },
        Type::Inferred,
        SourcePos::unknown(),
    );

    let mut program = Program::new();
    program.add_function(func(
        "producer",
        vec![param("ch", Type::Channel(Box::new(Type::Int)))],
        Type::Void,
        vec![expr_stmt(send)],
    ));
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            let_stmt("ch", Type::Channel(Box::new(Type::Int)), make_chan),
            expr_stmt(spawn),
            ret(recv),
        ],
    ));
    assert_eq!(run_value(&program), Value::Int(7));
}

#[test]
fn channel_preserves_fifo_order() {
    // main buffers two values, then drains them in order.
    let make_chan = Expr::new(
        ExprKind::MakeChannel {
            elem: Type::Int,
            capacity: Box::new(int(2)),
        },
        Type::Inferred,
        SourcePos::unknown(),
    );
    let send = |v: i64| {
        Expr::new(
            ExprKind::ChanSend {
                chan: Box::new(var("ch")),
                value: Box::new(int(v)),
            },
            Type::Inferred,
            SourcePos::unknown(),
        )
    };
    let recv = || {
        Expr::new(
            ExprKind::ChanRecv {
                chan: Box::new(var("ch")),
            },
            Type::Inferred,
            SourcePos::unknown(),
        )
    };
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            let_stmt("ch", Type::Channel(Box::new(Type::Int)), make_chan),
            expr_stmt(send(10)),
            expr_stmt(send(32)),
            let_stmt("a", Type::Int, recv()),
            let_stmt("b", Type::Int, recv()),
            ret(binary(BinOp::Add, var("a"), binary(BinOp::Mul, var("b"), int(0)))),
        ],
    ));
    // a must be the first value sent.
    assert_eq!(run_value(&program), Value::Int(10));
}

#[test]
fn destructor_runs_when_object_dies() {
    // object File { fd: int } with destructor closeFile.
    let mut program = Program::new();
    program.user_types.objects.insert(
        "File".to_string(),
        ObjectDecl {
            name: "File".to_string(),
            fields: vec![("fd".to_string(), Type::Int)],
            destructor: Some(etch_engine::ast::mangle(
                "closeFile",
                &[Type::Object("File".to_string())],
                &Type::Void,
            )),
        },
    );
    program.add_function(func(
        "closeFile",
        vec![param("f", Type::Object("File".to_string()))],
        Type::Void,
        vec![expr_stmt(call("print", vec![string("closed ")]))],
    ));
    let file_lit = |fd: i64| {
        Expr::new(
            ExprKind::ObjectLit {
                type_name: "File".to_string(),
                fields: vec![("fd".to_string(), int(fd))],
            },
            Type::Object("File".to_string()),
            SourcePos::unknown(),
        )
    };
    program.add_function(func(
        "main",
        vec![],
        Type::Void,
        vec![
            let_stmt("f", Type::Object("File".to_string()), file_lit(3)),
            assign("f", file_lit(4)),
            expr_stmt(call("print", vec![string("end")])),
        ],
    ));
    let (result, output) = run(&program);
    result.unwrap();
    assert_eq!(output, "closed end");
}

#[test]
fn builtins_cover_options_and_results() {
    // unwrap(parseInt("41")) + 1 → 42
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![ret(binary(
            BinOp::Add,
            call("unwrap", vec![call("parseInt", vec![string("41")])]),
            int(1),
        ))],
    ));
    assert_eq!(run_value(&program), Value::Int(42));
}

#[test]
fn closures_capture_by_value() {
    // let x = 5; let f = |y| x + y; x = 100; return f(10);  → 15
    let lambda = Expr::new(
        ExprKind::Lambda {
            params: vec![param("y", Type::Int)],
            body: vec![ret(binary(BinOp::Add, var("x"), var("y")))],
            ret: Type::Int,
        },
        Type::Inferred,
        SourcePos::unknown(),
    );
    let invoke = Expr::new(
        ExprKind::Invoke {
            callee: Box::new(var("f")),
            args: vec![int(10)],
        },
        Type::Inferred,
        SourcePos::unknown(),
    );
    let mut program = Program::new();
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![
            let_stmt("x", Type::Int, int(5)),
            let_stmt("f", Type::Inferred, lambda),
            assign("x", int(100)),
            ret(invoke),
        ],
    ));
    assert_eq!(run_value(&program), Value::Int(15));
}

#[test]
fn stack_overflow_is_reported() {
    // fn spin(n: int) -> int { return spin(n + 1); }
    let mut program = Program::new();
    program.add_function(func(
        "spin",
        vec![param("n", Type::Int)],
        Type::Int,
        vec![ret(call("spin", vec![binary(BinOp::Add, var("n"), int(1))]))],
    ));
    program.add_function(func(
        "main",
        vec![],
        Type::Int,
        vec![ret(call("spin", vec![int(0)]))],
    ));
    let (result, _) = run(&program);
    assert!(result.unwrap_err().message.contains("stack overflow"));
}

#[test]
fn heap_accounting_balances_after_collection() {
    // Build and drop reference cycles, then collect.
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
                    target: LValue::Deref(var("a")),
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
            int(100),
            vec![expr_stmt(call("cycle", vec![]))],
        )],
    ));
    let bytecode = emit_program(&program, &CodegenOptions::default()).expect("emit");
    let out = Rc::new(RefCell::new(String::new()));
    let mut vm = Vm::sandbox(Rc::new(bytecode), out);
    vm.execute().unwrap();
    vm.collect_garbage();
    assert_eq!(vm.heap.live_cells(), 0);
    assert_eq!(vm.heap.total_retains, vm.heap.total_releases);
}
