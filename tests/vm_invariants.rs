//! Cross-cutting invariants that must hold regardless of which bytecode
//! happens to exercise them: MRO linearization, equality/hashing, small-int
//! identity, exception chaining, finally-completion, generator close()
//! semantics, and cancellation.

mod support;

use pyvm::bytecode::{Instruction, Label, RaiseKind};
use pyvm::class::{self, PyAttributes};
use pyvm::dict::{PyDict, PySet};
use pyvm::protocol::equality::value_eq;
use pyvm::value::{is_identical, PyObject, Value};
use support::asm::*;
use std::cell::RefCell;
use std::rc::Rc;

fn class_name(obj: &pyvm::value::PyObjectRef) -> String {
    match &obj.value {
        Value::Class(c) => c.name.to_string(),
        other => panic!("expected Class, got {other:?}"),
    }
}

/// Diamond inheritance (`C(A, B)`, `A(O)`, `B(O)`) linearizes to
/// `[C, A, B, O, object]`, and a genuinely inconsistent hierarchy is
/// rejected rather than silently picking an order.
#[test]
fn mro_is_c3_linearized_for_diamond_inheritance() {
    let vm = new_vm();

    let o = class::new_class(&vm, "O", vec![], PyAttributes::new(), None).unwrap();
    let a = class::new_class(&vm, "A", vec![o.clone()], PyAttributes::new(), None).unwrap();
    let b = class::new_class(&vm, "B", vec![o.clone()], PyAttributes::new(), None).unwrap();
    let c = class::new_class(&vm, "C", vec![a.clone(), b.clone()], PyAttributes::new(), None).unwrap();

    let Value::Class(c_class) = &c.value else { panic!("not a class") };
    let names: Vec<String> = c_class.mro.iter().map(class_name).collect();
    assert_eq!(names, vec!["A", "B", "O", "object"]);

    // Inconsistent: X(A, O) where A already precedes O in C's own bases
    // order, but here we ask for O before A while A itself derives from O.
    let inconsistent = class::new_class(&vm, "X", vec![o.clone(), a.clone()], PyAttributes::new(), None);
    assert!(inconsistent.is_err(), "O before A should be rejected: A already requires O after it");
}

/// `L = [L]; L == L` terminates and is `true`; a genuine two-cycle
/// (`L1 = [L2]; L2 = [L1]`) also terminates via the same pointer-pair guard.
#[test]
fn equality_is_cycle_safe() {
    let vm = new_vm();

    let l = PyObject::new(Value::List(RefCell::new(Vec::new())), Some(vm.ctx.object_class.clone()));
    if let Value::List(items) = &l.value {
        items.borrow_mut().push(l.clone());
    }
    assert!(value_eq(&vm, &l, &l).unwrap());

    let l1 = PyObject::new(Value::List(RefCell::new(Vec::new())), Some(vm.ctx.object_class.clone()));
    let l2 = PyObject::new(Value::List(RefCell::new(Vec::new())), Some(vm.ctx.object_class.clone()));
    if let Value::List(items) = &l1.value {
        items.borrow_mut().push(l2.clone());
    }
    if let Value::List(items) = &l2.value {
        items.borrow_mut().push(l1.clone());
    }
    assert!(value_eq(&vm, &l1, &l2).unwrap(), "mutually-referential lists should compare equal");
}

/// Hashable values round-trip through both a `PySet` and a `PyDict` key.
#[test]
fn hashable_values_round_trip_through_set_and_dict() {
    let vm = new_vm();

    let one = vm.ctx.int(1.into());
    let hello = PyObject::new(Value::Str("hello".into()), Some(vm.ctx.object_class.clone()));
    let pair = PyObject::new(
        Value::Tuple(Rc::from(vec![vm.ctx.int(1.into()), vm.ctx.int(2.into())])),
        Some(vm.ctx.object_class.clone()),
    );

    let mut set = PySet::new();
    for v in [&one, &hello, &pair] {
        assert!(set.add(&vm, v.clone()).unwrap());
        assert!(set.contains(&vm, v).unwrap());
    }

    let mut dict = PyDict::new();
    let marker = vm.ctx.int(42.into());
    for v in [&one, &hello, &pair] {
        dict.insert(&vm, v.clone(), marker.clone()).unwrap();
    }
    for v in [&one, &hello, &pair] {
        let got = dict.get(&vm, v).unwrap().expect("key should be present");
        assert!(is_identical(&got, &marker));
    }
}

/// Small ints (`-5..=256`) are cached: repeated `ctx.int(n)` calls return
/// the same heap object. Outside that range no such guarantee is made.
#[test]
fn small_ints_are_interned_by_identity() {
    let vm = new_vm();

    let a = vm.ctx.int(41.into());
    let b = vm.ctx.int(41.into());
    assert!(is_identical(&a, &b));

    let neg = vm.ctx.int((-5).into());
    let neg2 = vm.ctx.int((-5).into());
    assert!(is_identical(&neg, &neg2));

    let big = vm.ctx.int(100_000.into());
    let big2 = vm.ctx.int(100_000.into());
    assert!(!is_identical(&big, &big2), "ints outside the small-int cache are fresh allocations");
}

/// `raise B from A` sets `__cause__` and suppresses the implicit
/// `__context__` display (`suppress_context = true`), distinct from the
/// implicit chaining an unguarded raise-inside-except produces.
#[test]
fn raise_from_sets_cause_and_suppresses_context() {
    let vm = new_vm();
    let mut m = CodeBuilder::new("<module>");

    let value_error = m.name("ValueError");
    let type_error = m.name("TypeError");
    let a_msg = m.str_const("a");
    let b_msg = m.str_const("b");
    let captured = m.name("captured");

    let setup_except = m.emit(Instruction::SetupExcept { handler: Label(0) });
    m.emit(Instruction::LoadGlobal { idx: value_error });
    m.emit(Instruction::LoadConst { idx: a_msg });
    m.emit(Instruction::CallFunctionPositional { argc: 1 });
    m.emit(Instruction::RaiseVarargs { kind: RaiseKind::Raise });
    m.emit(Instruction::LoadNone);
    m.emit(Instruction::ReturnValue);

    let handler = m.here();
    m.patch_jump(setup_except, handler);
    // stack: [ValueError("a")] -- this is both the soon-to-be __context__
    // (still `handling_exception`) and, explicitly, the __cause__.
    m.emit(Instruction::LoadGlobal { idx: type_error });
    m.emit(Instruction::LoadConst { idx: b_msg });
    m.emit(Instruction::CallFunctionPositional { argc: 1 });
    // stack: [ValueError("a"), TypeError("b")] -- RaiseFrom pops cause first.
    m.emit(Instruction::RaiseVarargs { kind: RaiseKind::RaiseFrom });
    m.emit(Instruction::StoreGlobal { idx: captured });
    m.emit(Instruction::LoadNone);
    m.emit(Instruction::ReturnValue);

    let code = m.build();
    let vm = vm;
    let (result, globals) = run_module(&vm, code);
    // RaiseFrom still raises: it only decorates the exception, it's the
    // surrounding `except`/handler body's job to catch it. Since nothing
    // here catches it, it propagates out of the module.
    assert!(result.is_err());
    let err = result.unwrap_err();
    assert!(vm.is_instance(&err, &vm.ctx.exceptions.type_error));
    let Value::Exception(cell) = &err.value else { panic!("not an exception") };
    let exc = cell.borrow();
    assert!(exc.suppress_context, "RaiseFrom should set suppress_context");
    let cause = exc.cause.as_ref().expect("cause should be set");
    let Value::Exception(cause_cell) = &cause.value else { panic!("cause not an exception") };
    assert_eq!(cause_cell.borrow().type_name.as_ref(), "ValueError");

    // `captured` was never reached (nothing here catches the TypeError).
    assert!(get_global(&globals, "captured").is_none());
}

/// `try/finally` runs its finally body even when the `try` completes via
/// ordinary (non-exception) fallthrough, not just via `return`.
#[test]
fn finally_runs_on_ordinary_fallthrough() {
    let mut m = CodeBuilder::new("<module>");
    let marker = m.name("marker");
    let ran = m.str_const("ran");
    let done = m.str_const("done");

    let setup = m.emit(Instruction::SetupFinally { handler: Label(0) });
    m.emit(Instruction::LoadConst { idx: done });
    m.emit(Instruction::StoreGlobal { idx: marker });
    m.emit(Instruction::PopBlock);

    // Normal completion falls straight into the cleanup code; the handler
    // label patched here is only ever jumped to on the exception path.
    let handler = m.here();
    m.patch_jump(setup, handler);
    m.emit(Instruction::LoadConst { idx: ran });
    m.emit(Instruction::StoreGlobal { idx: marker });
    m.emit(Instruction::EndFinally);
    m.emit(Instruction::LoadNone);
    m.emit(Instruction::ReturnValue);

    let code = m.build();
    let vm = new_vm();
    let (result, globals) = run_module(&vm, code);
    assert!(result.is_ok());
    assert_eq!(str_value(&get_global(&globals, "marker").unwrap()), "ran");
}

/// `close()` on an already-exhausted generator is a no-op; `send()` after
/// `close()` raises `StopIteration` rather than resuming a dead frame.
#[test]
fn closed_generator_rejects_further_sends() {
    let mut g = CodeBuilder::new("g1").generator();
    let one = g.int_const(1);
    g.emit(Instruction::LoadConst { idx: one });
    g.emit(Instruction::YieldValue);
    g.emit(Instruction::LoadNone);
    g.emit(Instruction::ReturnValue);
    let g_code = g.build();

    let mut m = CodeBuilder::new("<module>");
    let g_name = m.name("g");
    let g_const = m.code_const(g_code);
    m.emit(Instruction::LoadConst { idx: g_const });
    m.emit(Instruction::MakeFunction {
        flags: pyvm::bytecode::MakeFunctionFlags::empty(),
    });
    m.emit(Instruction::CallFunctionPositional { argc: 0 });
    m.emit(Instruction::StoreGlobal { idx: g_name });
    m.emit(Instruction::LoadNone);
    m.emit(Instruction::ReturnValue);
    let code = m.build();

    let vm = new_vm();
    let (result, globals) = run_module(&vm, code);
    assert!(result.is_ok());
    let g_obj = get_global(&globals, "g").unwrap();
    let Value::Generator(task) = &g_obj.value else { panic!("not a generator") };

    let first = pyvm::generator::send(&vm, task, vm.ctx.none.clone()).unwrap();
    assert_eq!(int_const_value(&first), 1);

    pyvm::generator::close(&vm, task).unwrap();
    let after_close = pyvm::generator::send(&vm, task, vm.ctx.none.clone());
    assert!(after_close.is_err());
    assert!(vm.is_instance(&after_close.unwrap_err(), &vm.ctx.exceptions.stop_iteration));
}

/// If a generator body catches `GeneratorExit` and yields again instead of
/// returning or propagating, `close()` reports that as a `RuntimeError`.
#[test]
fn close_raises_runtime_error_when_generator_exit_is_ignored() {
    let mut g = CodeBuilder::new("g2").generator();
    let one = g.int_const(1);
    let two = g.int_const(2);

    let setup = g.emit(Instruction::SetupExcept { handler: Label(0) });
    g.emit(Instruction::LoadConst { idx: one });
    g.emit(Instruction::YieldValue);
    g.emit(Instruction::PopBlock);
    g.emit(Instruction::LoadNone);
    g.emit(Instruction::ReturnValue);

    let handler = g.here();
    g.patch_jump(setup, handler);
    g.emit(Instruction::Pop); // discard the GeneratorExit instance
    g.emit(Instruction::LoadConst { idx: two });
    g.emit(Instruction::YieldValue); // ignores GeneratorExit, yields again
    g.emit(Instruction::LoadNone);
    g.emit(Instruction::ReturnValue);
    let g_code = g.build();

    let mut m = CodeBuilder::new("<module>");
    let g_name = m.name("g");
    let g_const = m.code_const(g_code);
    m.emit(Instruction::LoadConst { idx: g_const });
    m.emit(Instruction::MakeFunction {
        flags: pyvm::bytecode::MakeFunctionFlags::empty(),
    });
    m.emit(Instruction::CallFunctionPositional { argc: 0 });
    m.emit(Instruction::StoreGlobal { idx: g_name });
    m.emit(Instruction::LoadNone);
    m.emit(Instruction::ReturnValue);
    let code = m.build();

    let vm = new_vm();
    let (result, globals) = run_module(&vm, code);
    assert!(result.is_ok());
    let g_obj = get_global(&globals, "g").unwrap();
    let Value::Generator(task) = &g_obj.value else { panic!("not a generator") };

    let first = pyvm::generator::send(&vm, task, vm.ctx.none.clone()).unwrap();
    assert_eq!(int_const_value(&first), 1);

    let closed = pyvm::generator::close(&vm, task);
    assert!(closed.is_err());
    assert!(vm.is_instance(&closed.unwrap_err(), &vm.ctx.exceptions.runtime_error));
}

/// A tripped cancellation source unwinds the running frame like any other
/// exception: active `finally` bodies still run before it propagates out.
#[test]
fn cancellation_still_runs_finally_before_propagating() {
    let mut m = CodeBuilder::new("<module>");
    let marker = m.name("marker");
    let cancelled = m.str_const("cancelled_ran");

    let setup = m.emit(Instruction::SetupFinally { handler: Label(0) });
    let loop_top = m.emit(Instruction::Jump { target: Label(0) });
    m.patch_jump(loop_top, loop_top);

    let handler = m.here();
    m.patch_jump(setup, handler);
    m.emit(Instruction::LoadConst { idx: cancelled });
    m.emit(Instruction::StoreGlobal { idx: marker });
    m.emit(Instruction::RaiseVarargs { kind: RaiseKind::Reraise });

    let code = m.build();
    let vm = new_vm();
    vm.request_cancellation();
    let (result, globals) = run_module(&vm, code);

    assert!(result.is_err());
    let err = result.unwrap_err();
    assert!(vm.is_instance(&err, &vm.ctx.exceptions.cancelled_error));
    assert_eq!(str_value(&get_global(&globals, "marker").unwrap()), "cancelled_ran");
}
