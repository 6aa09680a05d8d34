//! End-to-end tests: build a program tree, compile it against the core
//! prelude and run it on a fresh VM.
//!
//! Covers the full pipeline the embedding API exposes: execution results,
//! scoping, closures, tables, module import with relocation and the bulk
//! table operations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tabula_compiler::{compile, ProgramLoader};
use tabula_syntax::ast::{
    AssignTarget, BinOp, Expr, FnDecl, Ident, Position, Program, Stmt, TableEntry,
};
use tabula_vm::module::ModuleRegistry;
use tabula_vm::value::{HeapRef, IntrinsicFn, RuntimeError, Unit};
use tabula_vm::{Library, Vm};

// ============================================================================
// Tree builders
// ============================================================================

fn pos(line: u32) -> Position {
    Position::new(line)
}

fn int(v: i64) -> Expr {
    Expr::Int(v, pos(1))
}

fn str_(s: &str) -> Expr {
    Expr::Str(s.to_string(), pos(1))
}

fn name(n: &str) -> Expr {
    Expr::Name(Ident::new(n, 1))
}

fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        pos: pos(1),
    }
}

fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call {
        callee: Box::new(callee),
        args,
        pos: pos(1),
    }
}

fn var(n: &str, init: Expr) -> Stmt {
    Stmt::Var {
        name: Ident::new(n, 1),
        init,
        mutable: true,
    }
}

fn assign(n: &str, value: Expr) -> Stmt {
    Stmt::Assign {
        target: AssignTarget::Name(Ident::new(n, 1)),
        value,
        pos: pos(1),
    }
}

fn ret(value: Expr) -> Stmt {
    Stmt::Return {
        value: Some(value),
        pos: pos(1),
    }
}

fn func_stmt(n: &str, params: &[&str], body: Vec<Stmt>, line: u32) -> Stmt {
    Stmt::Function(FnDecl {
        name: Ident::new(n, line),
        params: params.iter().map(|p| Ident::new(*p, line)).collect(),
        body,
        pos: pos(line),
    })
}

fn lambda(params: &[&str], body: Vec<Stmt>) -> Expr {
    Expr::Function {
        params: params.iter().map(|p| Ident::new(*p, 1)).collect(),
        body,
        pos: pos(1),
    }
}

fn table(entries: Vec<TableEntry>) -> Expr {
    Expr::Table {
        entries,
        pos: pos(1),
    }
}

fn item(e: Expr) -> TableEntry {
    TableEntry::Item(e)
}

fn pair(key: Expr, value: Expr) -> TableEntry {
    TableEntry::Pair { key, value }
}

/// Compile against the core prelude and run on a fresh VM.
fn run(body: Vec<Stmt>) -> Result<Unit, RuntimeError> {
    let library = Library::core();
    let unit = compile(&Program::new(body), &library.global_names())
        .unwrap_or_else(|failure| panic!("compile failed: {failure}"));
    let mut vm = Vm::new(library);
    vm.run(&unit.chunk)
}

fn get(table: &Unit, key: Unit) -> Unit {
    table.get_keyed(&key).unwrap()
}

// ============================================================================
// Execution basics
// ============================================================================

#[test]
fn arithmetic_program_produces_its_trailing_expression() {
    let result = run(vec![
        var("x", int(2)),
        var("y", int(3)),
        Stmt::Expr(bin(BinOp::Mul, name("x"), name("y"))),
    ])
    .unwrap();
    assert!(result.equals(&Unit::Int(6)));
}

#[test]
fn while_loop_accumulates() {
    // var sum = 0; var i = 0; while i < 5 { sum = sum + i; i = i + 1; } sum
    let result = run(vec![
        var("sum", int(0)),
        var("i", int(0)),
        Stmt::While {
            cond: bin(BinOp::Lt, name("i"), int(5)),
            body: vec![
                assign("sum", bin(BinOp::Add, name("sum"), name("i"))),
                assign("i", bin(BinOp::Add, name("i"), int(1))),
            ],
            pos: pos(3),
        },
        Stmt::Expr(name("sum")),
    ])
    .unwrap();
    assert!(result.equals(&Unit::Int(10)));
}

#[test]
fn if_else_picks_a_branch() {
    let result = run(vec![
        var("r", int(0)),
        Stmt::If {
            cond: bin(BinOp::Gt, int(1), int(2)),
            then_body: vec![assign("r", int(10))],
            else_body: vec![assign("r", int(20))],
            pos: pos(2),
        },
        Stmt::Expr(name("r")),
    ])
    .unwrap();
    assert!(result.equals(&Unit::Int(20)));
}

#[test]
fn determinism_same_program_same_result() {
    let body = || {
        vec![
            var("t", call(name("range"), vec![int(0), int(6)])),
            Stmt::Expr(call(name("len"), vec![name("t")])),
        ]
    };
    let a = run(body()).unwrap();
    let b = run(body()).unwrap();
    assert!(a.equals(&b));
    assert!(a.equals(&Unit::Int(6)));
}

// ============================================================================
// Scoping and closures
// ============================================================================

#[test]
fn shadowing_round_trip_restores_the_outer_binding() {
    // { var x = 1; { var x = 2; a = x; } b = x; }  =>  a = 2, b = 1
    let result = run(vec![
        var("a", int(0)),
        var("b", int(0)),
        Stmt::Block(
            vec![
                var("x", int(1)),
                Stmt::Block(
                    vec![var("x", int(2)), assign("a", name("x"))],
                    pos(3),
                ),
                assign("b", name("x")),
            ],
            pos(2),
        ),
        Stmt::Expr(bin(
            BinOp::Add,
            bin(BinOp::Mul, name("b"), int(10)),
            name("a"),
        )),
    ])
    .unwrap();
    assert!(result.equals(&Unit::Int(12)));
}

fn counter_decl() -> Stmt {
    // function counter() { var n = 0; function inc() { n = n + 1; return n; } return inc; }
    func_stmt(
        "counter",
        &[],
        vec![
            var("n", int(0)),
            func_stmt(
                "inc",
                &[],
                vec![
                    assign("n", bin(BinOp::Add, name("n"), int(1))),
                    ret(name("n")),
                ],
                3,
            ),
            ret(name("inc")),
        ],
        1,
    )
}

#[test]
fn independent_counters_count_independently() {
    let result = run(vec![
        counter_decl(),
        var("c1", call(name("counter"), vec![])),
        var("c2", call(name("counter"), vec![])),
        Stmt::Expr(call(name("c1"), vec![])),
        Stmt::Expr(call(name("c1"), vec![])),
        Stmt::Expr(table(vec![
            item(call(name("c1"), vec![])),
            item(call(name("c2"), vec![])),
        ])),
    ])
    .unwrap();
    assert!(get(&result, Unit::Int(0)).equals(&Unit::Int(3)));
    assert!(get(&result, Unit::Int(1)).equals(&Unit::Int(1)));
}

#[test]
fn closure_survives_its_defining_frame() {
    // function make(k) { return function(x) { return x + k; }; }
    let result = run(vec![
        func_stmt(
            "make",
            &["k"],
            vec![ret(lambda(
                &["x"],
                vec![ret(bin(BinOp::Add, name("x"), name("k")))],
            ))],
            1,
        ),
        var("add5", call(name("make"), vec![int(5)])),
        Stmt::Expr(call(name("add5"), vec![int(37)])),
    ])
    .unwrap();
    assert!(result.equals(&Unit::Int(42)));
}

// ============================================================================
// Tables and method calls
// ============================================================================

#[test]
fn table_literal_partitions_dense_and_assoc() {
    // [10, 20, "x": 1, 30]
    let result = run(vec![Stmt::Expr(table(vec![
        item(int(10)),
        item(int(20)),
        pair(str_("x"), int(1)),
        item(int(30)),
    ]))])
    .unwrap();
    assert!(get(&result, Unit::Int(0)).equals(&Unit::Int(10)));
    assert!(get(&result, Unit::Int(1)).equals(&Unit::Int(20)));
    assert!(get(&result, Unit::Int(2)).equals(&Unit::Int(30)));
    assert!(get(&result, Unit::from("x")).equals(&Unit::Int(1)));
    assert!(call_len(&result).equals(&Unit::Int(4)));
}

fn call_len(value: &Unit) -> Unit {
    match value {
        Unit::Heap(HeapRef::Table(t)) => Unit::Int(t.read().len() as i64),
        _ => panic!("not a table"),
    }
}

#[test]
fn method_call_passes_the_receiver_first() {
    // var obj = ["double": function(self, x) { return x * 2; }]; obj.double(21)
    let result = run(vec![
        var(
            "obj",
            table(vec![pair(
                str_("double"),
                lambda(
                    &["self", "x"],
                    vec![ret(bin(BinOp::Mul, name("x"), int(2)))],
                ),
            )]),
        ),
        Stmt::Expr(Expr::Method {
            recv: Box::new(name("obj")),
            name: "double".to_string(),
            args: vec![int(21)],
            pos: pos(2),
        }),
    ])
    .unwrap();
    assert!(result.equals(&Unit::Int(42)));
}

#[test]
fn indexed_write_through_nested_tables() {
    // var t = [[1, 2]]; t[0][1] = 9; t[0][1]
    let result = run(vec![
        var("t", table(vec![item(table(vec![item(int(1)), item(int(2))]))])),
        Stmt::Assign {
            target: AssignTarget::Index {
                target: name("t"),
                indexes: vec![int(0), int(1)],
            },
            value: int(9),
            pos: pos(2),
        },
        Stmt::Expr(Expr::Index {
            target: Box::new(name("t")),
            indexes: vec![int(0), int(1)],
            pos: pos(3),
        }),
    ])
    .unwrap();
    assert!(result.equals(&Unit::Int(9)));
}

// ============================================================================
// Faults
// ============================================================================

#[test]
fn runtime_fault_names_function_and_line() {
    // function boom() { return 1 + 1.5; } boom()
    let err = run(vec![
        Stmt::Function(FnDecl {
            name: Ident::new("boom", 1),
            params: vec![],
            body: vec![Stmt::Return {
                value: Some(Expr::Binary {
                    op: BinOp::Add,
                    lhs: Box::new(Expr::Int(1, pos(2))),
                    rhs: Box::new(Expr::Float(1.5, pos(2))),
                    pos: pos(2),
                }),
                pos: pos(2),
            }],
            pos: pos(1),
        }),
        Stmt::Expr(call(name("boom"), vec![])),
    ])
    .unwrap_err();
    match err {
        RuntimeError::Faulted {
            error,
            function,
            line,
            ..
        } => {
            assert!(matches!(*error, RuntimeError::TypeError { .. }));
            assert_eq!(function, "boom");
            assert_eq!(line, 2);
        }
        other => panic!("expected a traced fault, got {other}"),
    }
}

#[test]
fn division_by_zero_is_fatal() {
    let err = run(vec![Stmt::Expr(bin(BinOp::Div, int(1), int(0)))]).unwrap_err();
    match err {
        RuntimeError::Faulted { error, .. } => {
            assert!(matches!(*error, RuntimeError::DivisionByZero))
        }
        other => panic!("expected a traced fault, got {other}"),
    }
}

// ============================================================================
// Bulk operations
// ============================================================================

#[test]
fn pmap_matches_map_for_every_size() {
    for n in [0i64, 1, 2, 7, 64] {
        let body = |op: &str| {
            vec![
                var("t", call(name("range"), vec![int(0), int(n)])),
                var(
                    "f",
                    lambda(&["x"], vec![ret(bin(BinOp::Mul, name("x"), int(3)))]),
                ),
                Stmt::Expr(call(name(op), vec![name("t"), name("f")])),
            ]
        };
        let sequential = run(body("map")).unwrap();
        let parallel = run(body("pmap")).unwrap();
        for i in 0..n {
            assert!(
                get(&parallel, Unit::Int(i)).equals(&get(&sequential, Unit::Int(i))),
                "mismatch at {i} for n={n}"
            );
        }
        assert!(call_len(&parallel).equals(&call_len(&sequential)));
    }
}

#[test]
fn pmap_callback_may_capture_a_live_local() {
    // fn go() { var k = 3; return pmap(range(0, 8), fn(x) { return x * k; }); }
    // the callback's cell is still open on go's frame when the workers run
    let result = run(vec![
        func_stmt(
            "go",
            &[],
            vec![
                var("k", int(3)),
                ret(call(
                    name("pmap"),
                    vec![
                        call(name("range"), vec![int(0), int(8)]),
                        lambda(&["x"], vec![ret(bin(BinOp::Mul, name("x"), name("k")))]),
                    ],
                )),
            ],
            1,
        ),
        Stmt::Expr(call(name("go"), vec![])),
    ])
    .unwrap();
    for i in 0..8i64 {
        assert!(get(&result, Unit::Int(i)).equals(&Unit::Int(3 * i)));
    }
}

#[test]
fn rmap_maps_the_integer_range() {
    let result = run(vec![
        var(
            "f",
            lambda(&["x"], vec![ret(bin(BinOp::Mul, name("x"), int(2)))]),
        ),
        Stmt::Expr(call(name("rmap"), vec![int(5), name("f")])),
    ])
    .unwrap();
    for (i, expect) in [0i64, 2, 4, 6, 8].iter().enumerate() {
        assert!(get(&result, Unit::Int(i as i64)).equals(&Unit::Int(*expect)));
    }
}

#[test]
fn parallel_fault_is_reported_as_such() {
    let err = run(vec![
        var("t", call(name("range"), vec![int(0), int(16)])),
        var(
            "f",
            lambda(&["x"], vec![ret(bin(BinOp::Div, int(1), int(0)))]),
        ),
        Stmt::Expr(call(name("pmap"), vec![name("t"), name("f")])),
    ])
    .unwrap_err();
    fn contains_parallel(err: &RuntimeError) -> bool {
        match err {
            RuntimeError::ParallelFault(_) => true,
            RuntimeError::Faulted { error, .. } => contains_parallel(error),
            _ => false,
        }
    }
    assert!(contains_parallel(&err), "got {err}");
}

#[test]
fn foreach_runs_for_effect_and_returns_null() {
    let result = run(vec![
        var("acc", int(0)),
        var("t", call(name("range"), vec![int(1), int(4)])),
        Stmt::Expr(call(
            name("foreach"),
            vec![
                name("t"),
                lambda(
                    &["x"],
                    vec![
                        assign("acc", bin(BinOp::Add, name("acc"), name("x"))),
                        ret(Expr::Null(pos(1))),
                    ],
                ),
            ],
        )),
        Stmt::Expr(name("acc")),
    ])
    .unwrap();
    assert!(result.equals(&Unit::Int(6)));
}

// ============================================================================
// Modules
// ============================================================================

/// A module whose top level ticks a host counter, keeps one private
/// global and exports accessors for it.
fn counting_module() -> Program {
    Program::new(vec![
        var("secret", int(7)),
        Stmt::Expr(call(name("tick"), vec![])),
        func_stmt("get_secret", &[], vec![ret(name("secret"))], 3),
        func_stmt(
            "bump",
            &[],
            vec![
                assign("secret", bin(BinOp::Add, name("secret"), int(1))),
                ret(name("secret")),
            ],
            4,
        ),
        Stmt::Expr(table(vec![
            pair(str_("get"), name("get_secret")),
            pair(str_("bump"), name("bump")),
        ])),
    ])
}

/// A module that imports `counting` at its top level and exports a
/// function delegating to it.
fn delegating_module() -> Program {
    Program::new(vec![
        var("dep", call(name("require"), vec![str_("counting")])),
        var(
            "g",
            Expr::Index {
                target: Box::new(name("dep")),
                indexes: vec![str_("get")],
                pos: pos(2),
            },
        ),
        func_stmt("delegate", &[], vec![ret(call(name("g"), vec![]))], 3),
        Stmt::Expr(table(vec![pair(str_("delegate"), name("delegate"))])),
    ])
}

fn module_fixture() -> (Vm, Arc<AtomicUsize>) {
    let ticks = Arc::new(AtomicUsize::new(0));
    let mut library = Library::core();
    let sink = ticks.clone();
    library.register_value(
        "tick",
        Unit::intrinsic(IntrinsicFn {
            name: "tick".to_string(),
            arity: 0,
            callback: Box::new(move |_, _| {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(Unit::Null)
            }),
        }),
    );
    let prelude = library.global_names();
    let loader = ProgramLoader::new(
        prelude,
        Box::new(|name| match name {
            "counting" => Some(counting_module()),
            "outer" => Some(delegating_module()),
            _ => None,
        }),
    );
    let registry = Arc::new(ModuleRegistry::new(Box::new(loader)));
    (Vm::with_registry(library, registry), ticks)
}

#[test]
fn require_executes_once_and_caches_the_object() {
    let (mut vm, ticks) = module_fixture();
    let first = vm.require("counting").unwrap();
    let second = vm.require("counting").unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
    match (&first, &second) {
        (Unit::Heap(HeapRef::Module(a)), Unit::Heap(HeapRef::Module(b))) => {
            assert!(Arc::ptr_eq(a, b));
        }
        _ => panic!("require did not produce module objects"),
    }
}

#[test]
fn relocated_functions_reach_their_module_globals() {
    let (mut vm, _ticks) = module_fixture();
    let module = vm.require("counting").unwrap();
    let get_fn = module.get_keyed(&Unit::from("get")).unwrap();
    let bump_fn = module.get_keyed(&Unit::from("bump")).unwrap();

    let initial = vm.call_function(&get_fn, &[]).unwrap();
    assert!(initial.equals(&Unit::Int(7)));
    assert!(vm.call_function(&bump_fn, &[]).unwrap().equals(&Unit::Int(8)));
    assert!(vm.call_function(&bump_fn, &[]).unwrap().equals(&Unit::Int(9)));
    // reads observe the writes through the module's global table
    assert!(vm.call_function(&get_fn, &[]).unwrap().equals(&Unit::Int(9)));
}

#[test]
fn nested_module_dependencies_relocate_transitively() {
    let (mut vm, ticks) = module_fixture();
    let module = vm.require("outer").unwrap();
    // requiring the outer module ran the dependency's top level once
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
    let delegate = module.get_keyed(&Unit::from("delegate")).unwrap();
    assert!(vm.call_function(&delegate, &[]).unwrap().equals(&Unit::Int(7)));
    // the importer shares the cached dependency object
    let dep = vm.require("counting").unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
    assert!(matches!(dep, Unit::Heap(HeapRef::Module(_))));
}

#[test]
fn missing_module_reads_as_null() {
    let (mut vm, ticks) = module_fixture();
    let result = vm.require("no.such.module").unwrap();
    assert!(matches!(result, Unit::Null));
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
}

#[test]
fn require_through_script_code_works_too() {
    let (mut vm, ticks) = module_fixture();
    let library_names = {
        let mut names = Library::core().global_names();
        names.push("tick".to_string());
        names
    };
    // var m = require("counting"); var f = m["get"]; f()
    let unit = compile(
        &Program::new(vec![
            var("m", call(name("require"), vec![str_("counting")])),
            var(
                "f",
                Expr::Index {
                    target: Box::new(name("m")),
                    indexes: vec![str_("get")],
                    pos: pos(2),
                },
            ),
            Stmt::Expr(call(name("f"), vec![])),
        ]),
        &library_names,
    )
    .unwrap();
    let result = vm.run(&unit.chunk).unwrap();
    assert!(result.equals(&Unit::Int(7)));
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Introspection
// ============================================================================

#[test]
fn vm_state_is_clean_after_a_run() {
    let library = Library::core();
    let unit = compile(
        &Program::new(vec![
            counter_decl(),
            var("c", call(name("counter"), vec![])),
            Stmt::Expr(call(name("c"), vec![])),
        ]),
        &library.global_names(),
    )
    .unwrap();
    let mut vm = Vm::new(library);
    vm.run(&unit.chunk).unwrap();
    let stats = vm.memory_stats();
    assert_eq!(stats.frame_depth, 0);
    assert_eq!(stats.env_depth, 0);
    assert_eq!(stats.stack_len, 0);
}

#[test]
fn chunk_dump_shows_mnemonics_and_lines() {
    let unit = compile(
        &Program::new(vec![var("x", int(1)), Stmt::Expr(name("x"))]),
        &[],
    )
    .unwrap();
    let dump = unit.chunk.dump();
    assert!(dump.contains("LOAD_CONST"));
    assert!(dump.contains("DECLARE_GLOBAL"));
    assert!(dump.contains("on line: 1"));
}
