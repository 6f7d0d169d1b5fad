//! End-to-end scenarios driving the dispatch loop through hand-assembled
//! `CodeObject`s: arithmetic edge cases, generator delegation, dunder
//! dispatch with `NotImplemented` fallback, `return` crossing an active
//! `finally`, exception chaining across nested handlers, and closures.

mod support;

use pyvm::bytecode::{BinaryOperator, Instruction, Label, MakeFunctionFlags, RaiseKind};
use pyvm::value::Value;
use support::asm::*;

#[test]
fn power_and_floor_mod_match_python_semantics() {
    let vm = new_vm();
    let mut b = CodeBuilder::new("<module>");

    let neg_seven = b.int_const(-7);
    let two = b.int_const(2);
    let ten = b.int_const(10);
    let neg_two = b.int_const(-2);
    let a_name = b.name("a");
    let b_name = b.name("b");
    let c_name = b.name("c");
    let d_name = b.name("d");

    b.emit(Instruction::LoadConst { idx: neg_seven });
    b.emit(Instruction::LoadConst { idx: two });
    b.emit(Instruction::BinaryOperation { op: BinaryOperator::FloorDivide, inplace: false });
    b.emit(Instruction::StoreName { idx: a_name });

    b.emit(Instruction::LoadConst { idx: neg_seven });
    b.emit(Instruction::LoadConst { idx: two });
    b.emit(Instruction::BinaryOperation { op: BinaryOperator::Modulo, inplace: false });
    b.emit(Instruction::StoreName { idx: b_name });

    b.emit(Instruction::LoadConst { idx: two });
    b.emit(Instruction::LoadConst { idx: ten });
    b.emit(Instruction::BinaryOperation { op: BinaryOperator::Power, inplace: false });
    b.emit(Instruction::StoreName { idx: c_name });

    b.emit(Instruction::LoadConst { idx: two });
    b.emit(Instruction::LoadConst { idx: neg_two });
    b.emit(Instruction::BinaryOperation { op: BinaryOperator::Power, inplace: false });
    b.emit(Instruction::StoreName { idx: d_name });

    b.emit(Instruction::LoadNone);
    b.emit(Instruction::ReturnValue);

    let (result, globals) = run_module(&vm, b.build());
    result.expect("module body should not raise");

    assert_eq!(int_const_value(&get_global(&globals, "a").unwrap()), -4);
    assert_eq!(int_const_value(&get_global(&globals, "b").unwrap()), 1);
    assert_eq!(int_const_value(&get_global(&globals, "c").unwrap()), 1024);
    assert_eq!(float_value(&get_global(&globals, "d").unwrap()), 0.25);
}

#[test]
fn yield_from_delegates_then_resumes_own_body() {
    let vm = new_vm();

    let mut gen = CodeBuilder::new("gen").generator();
    let zero = gen.int_const(0);
    let one = gen.int_const(1);
    let two = gen.int_const(2);
    let ninety_nine = gen.int_const(99);
    gen.emit(Instruction::LoadConst { idx: zero });
    gen.emit(Instruction::LoadConst { idx: one });
    gen.emit(Instruction::LoadConst { idx: two });
    gen.emit(Instruction::BuildList { size: 3, unpack: false });
    gen.emit(Instruction::GetIter);
    gen.emit(Instruction::YieldFrom);
    gen.emit(Instruction::Pop);
    gen.emit(Instruction::LoadConst { idx: ninety_nine });
    gen.emit(Instruction::YieldValue);
    gen.emit(Instruction::LoadNone);
    gen.emit(Instruction::ReturnValue);
    let gen_code = gen.build();

    let mut module = CodeBuilder::new("<module>");
    let gen_const = module.code_const(gen_code);
    let gen_func_name = module.name("gen_func");
    let g_name = module.name("g");
    module.emit(Instruction::LoadConst { idx: gen_const });
    module.emit(Instruction::MakeFunction { flags: MakeFunctionFlags::empty() });
    module.emit(Instruction::StoreName { idx: gen_func_name });
    module.emit(Instruction::LoadName { idx: gen_func_name });
    module.emit(Instruction::CallFunctionPositional { argc: 0 });
    module.emit(Instruction::StoreName { idx: g_name });
    module.emit(Instruction::LoadNone);
    module.emit(Instruction::ReturnValue);

    let (result, globals) = run_module(&vm, module.build());
    result.expect("module body should not raise");

    let g_obj = get_global(&globals, "g").expect("g should be bound");
    let Value::Generator(task) = &g_obj.value else {
        panic!("g should be a generator object");
    };

    let none = vm.ctx.none.clone();
    assert_eq!(int_const_value(&vm.send(task, none.clone()).unwrap()), 0);
    assert_eq!(int_const_value(&vm.send(task, none.clone()).unwrap()), 1);
    assert_eq!(int_const_value(&vm.send(task, none.clone()).unwrap()), 2);
    assert_eq!(int_const_value(&vm.send(task, none.clone()).unwrap()), 99);
    let err = vm.send(task, none).expect_err("generator should be exhausted");
    assert!(vm.is_instance(&err, &vm.ctx.exceptions.stop_iteration));
}

#[test]
fn binary_add_falls_back_to_reflected_method_on_not_implemented() {
    let vm = new_vm();

    // class A: def __add__(self, other): return NotImplemented
    let mut add_method = CodeBuilder::new("__add__");
    add_method.param("self");
    add_method.param("other");
    let not_implemented_name = add_method.name("NotImplemented");
    add_method.emit(Instruction::LoadGlobal { idx: not_implemented_name });
    add_method.emit(Instruction::ReturnValue);
    let add_method_code = add_method.build();

    let mut a_body = CodeBuilder::new("A");
    let add_const = a_body.code_const(add_method_code);
    let add_name = a_body.name("__add__");
    a_body.emit(Instruction::LoadConst { idx: add_const });
    a_body.emit(Instruction::MakeFunction { flags: MakeFunctionFlags::empty() });
    a_body.emit(Instruction::StoreName { idx: add_name });
    a_body.emit(Instruction::LoadNone);
    a_body.emit(Instruction::ReturnValue);
    let a_body_code = a_body.build();

    // class B(A): def __radd__(self, other): return "ok"
    let mut radd_method = CodeBuilder::new("__radd__");
    radd_method.param("self");
    radd_method.param("other");
    let ok_str = radd_method.str_const("ok");
    radd_method.emit(Instruction::LoadConst { idx: ok_str });
    radd_method.emit(Instruction::ReturnValue);
    let radd_method_code = radd_method.build();

    let mut b_body = CodeBuilder::new("B");
    let radd_const = b_body.code_const(radd_method_code);
    let radd_name = b_body.name("__radd__");
    b_body.emit(Instruction::LoadConst { idx: radd_const });
    b_body.emit(Instruction::MakeFunction { flags: MakeFunctionFlags::empty() });
    b_body.emit(Instruction::StoreName { idx: radd_name });
    b_body.emit(Instruction::LoadNone);
    b_body.emit(Instruction::ReturnValue);
    let b_body_code = b_body.build();

    let mut module = CodeBuilder::new("<module>");
    let a_body_const = module.code_const(a_body_code);
    let b_body_const = module.code_const(b_body_code);
    let a_str = module.str_const("A");
    let b_str = module.str_const("B");
    let a_name = module.name("A");
    let b_name = module.name("B");
    let a_obj_name = module.name("a_obj");
    let b_obj_name = module.name("b_obj");
    let result_name = module.name("result");

    module.emit(Instruction::LoadBuildClass);
    module.emit(Instruction::LoadConst { idx: a_body_const });
    module.emit(Instruction::MakeFunction { flags: MakeFunctionFlags::empty() });
    module.emit(Instruction::LoadConst { idx: a_str });
    module.emit(Instruction::CallFunctionPositional { argc: 2 });
    module.emit(Instruction::StoreName { idx: a_name });

    module.emit(Instruction::LoadBuildClass);
    module.emit(Instruction::LoadConst { idx: b_body_const });
    module.emit(Instruction::MakeFunction { flags: MakeFunctionFlags::empty() });
    module.emit(Instruction::LoadConst { idx: b_str });
    module.emit(Instruction::LoadName { idx: a_name });
    module.emit(Instruction::CallFunctionPositional { argc: 3 });
    module.emit(Instruction::StoreName { idx: b_name });

    module.emit(Instruction::LoadName { idx: a_name });
    module.emit(Instruction::CallFunctionPositional { argc: 0 });
    module.emit(Instruction::StoreName { idx: a_obj_name });
    module.emit(Instruction::LoadName { idx: b_name });
    module.emit(Instruction::CallFunctionPositional { argc: 0 });
    module.emit(Instruction::StoreName { idx: b_obj_name });

    module.emit(Instruction::LoadName { idx: a_obj_name });
    module.emit(Instruction::LoadName { idx: b_obj_name });
    module.emit(Instruction::BinaryOperation { op: BinaryOperator::Add, inplace: false });
    module.emit(Instruction::StoreName { idx: result_name });

    module.emit(Instruction::LoadNone);
    module.emit(Instruction::ReturnValue);

    let (result, globals) = run_module(&vm, module.build());
    result.expect("module body should not raise");

    assert_eq!(str_value(&get_global(&globals, "result").unwrap()), "ok");
}

#[test]
fn return_inside_try_runs_finally_before_leaving_the_frame() {
    let vm = new_vm();

    let mut f = CodeBuilder::new("f");
    let one = f.int_const(1);
    let ran_str = f.str_const("ran");
    let marker_name = f.name("marker");
    let setup = f.emit(Instruction::SetupFinally { handler: Label(0) });
    f.emit(Instruction::LoadConst { idx: one });
    f.emit(Instruction::ReturnValue);
    let handler = f.here();
    f.patch_jump(setup, handler);
    f.emit(Instruction::LoadConst { idx: ran_str });
    f.emit(Instruction::StoreGlobal { idx: marker_name });
    f.emit(Instruction::EndFinally);
    let f_code = f.build();

    let mut module = CodeBuilder::new("<module>");
    let f_const = module.code_const(f_code);
    let f_name = module.name("f");
    let result_name = module.name("result");
    module.emit(Instruction::LoadConst { idx: f_const });
    module.emit(Instruction::MakeFunction { flags: MakeFunctionFlags::empty() });
    module.emit(Instruction::StoreName { idx: f_name });
    module.emit(Instruction::LoadName { idx: f_name });
    module.emit(Instruction::CallFunctionPositional { argc: 0 });
    module.emit(Instruction::StoreName { idx: result_name });
    module.emit(Instruction::LoadNone);
    module.emit(Instruction::ReturnValue);

    let (result, globals) = run_module(&vm, module.build());
    result.expect("module body should not raise");

    assert_eq!(int_const_value(&get_global(&globals, "result").unwrap()), 1);
    assert_eq!(str_value(&get_global(&globals, "marker").unwrap()), "ran");
}

#[test]
fn exception_raised_from_a_handler_chains_its_context() {
    let vm = new_vm();
    let mut b = CodeBuilder::new("<module>");

    let value_error = b.name("ValueError");
    let type_error = b.name("TypeError");
    let a_str = b.str_const("a");
    let b_str = b.str_const("b");
    let captured_name = b.name("captured");

    let setup_outer = b.emit(Instruction::SetupExcept { handler: Label(0) });
    let setup_inner = b.emit(Instruction::SetupExcept { handler: Label(0) });
    b.emit(Instruction::LoadGlobal { idx: value_error });
    b.emit(Instruction::LoadConst { idx: a_str });
    b.emit(Instruction::CallFunctionPositional { argc: 1 });
    b.emit(Instruction::RaiseVarargs { kind: RaiseKind::Raise });

    let inner_handler = b.here();
    b.patch_jump(setup_inner, inner_handler);
    // stack: [value_error_instance]; unconditionally re-raise a TypeError
    // while it's still the handled exception, so it becomes __context__.
    b.emit(Instruction::Pop);
    b.emit(Instruction::LoadGlobal { idx: type_error });
    b.emit(Instruction::LoadConst { idx: b_str });
    b.emit(Instruction::CallFunctionPositional { argc: 1 });
    b.emit(Instruction::RaiseVarargs { kind: RaiseKind::Raise });

    let outer_handler = b.here();
    b.patch_jump(setup_outer, outer_handler);
    // stack: [type_error_instance]
    b.emit(Instruction::StoreGlobal { idx: captured_name });
    b.emit(Instruction::PopExceptHandler);

    b.emit(Instruction::LoadNone);
    b.emit(Instruction::ReturnValue);

    let (result, globals) = run_module(&vm, b.build());
    result.expect("module body should not raise: outer handler catches the TypeError");

    let captured = get_global(&globals, "captured").expect("captured should be bound");
    let Value::Exception(cell) = &captured.value else {
        panic!("captured should be an exception instance");
    };
    let exc = cell.borrow();
    assert_eq!(&*exc.type_name, "TypeError");
    assert_eq!(str_value(&exc.args[0]), "b");
    let context = exc.context.clone().expect("TypeError should chain a __context__");
    let Value::Exception(ctx_cell) = &context.value else {
        panic!("__context__ should be an exception instance");
    };
    let ctx = ctx_cell.borrow();
    assert_eq!(&*ctx.type_name, "ValueError");
    assert_eq!(str_value(&ctx.args[0]), "a");
}

#[test]
fn closure_mutates_captured_local_across_calls() {
    let vm = new_vm();

    let mut increment = CodeBuilder::new("increment");
    let n_free = increment.freevar("n");
    let one = increment.int_const(1);
    increment.emit(Instruction::LoadDeref { idx: n_free });
    increment.emit(Instruction::LoadConst { idx: one });
    increment.emit(Instruction::BinaryOperation { op: BinaryOperator::Add, inplace: false });
    increment.emit(Instruction::StoreDeref { idx: n_free });
    increment.emit(Instruction::LoadDeref { idx: n_free });
    increment.emit(Instruction::ReturnValue);
    let increment_code = increment.build();

    let mut make_counter = CodeBuilder::new("make_counter");
    let n_cell = make_counter.cellvar("n");
    let zero = make_counter.int_const(0);
    let increment_const = make_counter.code_const(increment_code);
    make_counter.emit(Instruction::LoadConst { idx: zero });
    make_counter.emit(Instruction::StoreDeref { idx: n_cell });
    make_counter.emit(Instruction::LoadClosure { idx: n_cell });
    make_counter.emit(Instruction::BuildTuple { size: 1, unpack: false });
    make_counter.emit(Instruction::LoadConst { idx: increment_const });
    make_counter.emit(Instruction::MakeFunction { flags: MakeFunctionFlags::CLOSURE });
    make_counter.emit(Instruction::ReturnValue);
    let make_counter_code = make_counter.build();

    let mut module = CodeBuilder::new("<module>");
    let make_counter_const = module.code_const(make_counter_code);
    let make_counter_name = module.name("make_counter");
    let counter_name = module.name("counter");
    let a_name = module.name("a");
    let b_name = module.name("b");
    let c_name = module.name("c");

    module.emit(Instruction::LoadConst { idx: make_counter_const });
    module.emit(Instruction::MakeFunction { flags: MakeFunctionFlags::empty() });
    module.emit(Instruction::StoreName { idx: make_counter_name });

    module.emit(Instruction::LoadName { idx: make_counter_name });
    module.emit(Instruction::CallFunctionPositional { argc: 0 });
    module.emit(Instruction::StoreName { idx: counter_name });

    module.emit(Instruction::LoadName { idx: counter_name });
    module.emit(Instruction::CallFunctionPositional { argc: 0 });
    module.emit(Instruction::StoreName { idx: a_name });
    module.emit(Instruction::LoadName { idx: counter_name });
    module.emit(Instruction::CallFunctionPositional { argc: 0 });
    module.emit(Instruction::StoreName { idx: b_name });
    module.emit(Instruction::LoadName { idx: counter_name });
    module.emit(Instruction::CallFunctionPositional { argc: 0 });
    module.emit(Instruction::StoreName { idx: c_name });

    module.emit(Instruction::LoadNone);
    module.emit(Instruction::ReturnValue);

    let (result, globals) = run_module(&vm, module.build());
    result.expect("module body should not raise");

    assert_eq!(int_const_value(&get_global(&globals, "a").unwrap()), 1);
    assert_eq!(int_const_value(&get_global(&globals, "b").unwrap()), 2);
    assert_eq!(int_const_value(&get_global(&globals, "c").unwrap()), 3);
}
