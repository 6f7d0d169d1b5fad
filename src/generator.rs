//! Generator/coroutine tasks: a detached, suspendable `Frame` plus the
//! `send`/`throw`/`close` state machine spec.md §4.5 describes.
//!
//! Grounded on the teacher's `vm/frame.rs::ExecutionResult` (`Return`/
//! `Yield`) and `vm/coroutine.rs`'s generic `Coro` helper driving both
//! generators and coroutines through the same state machine. A
//! `GeneratorTask` owns its frame independently of whatever call stack
//! created it — that ownership, not anything in the dispatch loop itself,
//! is what makes it suspendable.

use crate::frame::{Frame, FrameExecResult};
use crate::value::{PyObjectRef, Value};
use crate::vm::{PyResult, VirtualMachine};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Running,
    Suspended,
    Closed,
}

pub struct GeneratorTask {
    pub name: Rc<str>,
    pub is_coroutine: bool,
    frame: RefCell<Option<Rc<RefCell<Frame>>>>,
    state: Cell<State>,
}

impl GeneratorTask {
    pub fn new(frame: Frame, name: Rc<str>, is_coroutine: bool) -> Self {
        GeneratorTask {
            name,
            is_coroutine,
            frame: RefCell::new(Some(Rc::new(RefCell::new(frame)))),
            state: Cell::new(State::Created),
        }
    }
}

/// `gen.send(value)` (spec.md §4.5).
pub fn send(vm: &VirtualMachine, gen: &Rc<GeneratorTask>, value: PyObjectRef) -> PyResult<PyObjectRef> {
    let prior_state = gen.state.get();
    match prior_state {
        State::Closed => return Err(vm.new_stop_iteration(None)),
        State::Running => return Err(vm.new_value_error(format!("{} is already executing", gen.name))),
        State::Created if !matches!(value.value, Value::None) => {
            return Err(vm.new_type_error("can't send non-None value to a just-started generator".to_owned()));
        }
        State::Created | State::Suspended => {}
    }

    let handle = gen.frame.borrow().clone().expect("frame present while not closed");
    gen.state.set(State::Running);
    let send_value = if prior_state == State::Suspended { Some(value) } else { None };
    let result = crate::frame::resume_frame(vm, &handle, send_value, None);
    finish(vm, gen, result)
}

/// `gen.throw(exc)`.
pub fn throw(vm: &VirtualMachine, gen: &Rc<GeneratorTask>, exc: PyObjectRef) -> PyResult<PyObjectRef> {
    match gen.state.get() {
        State::Closed => return Err(exc),
        State::Running => return Err(vm.new_value_error(format!("{} is already executing", gen.name))),
        State::Created => {
            gen.state.set(State::Closed);
            *gen.frame.borrow_mut() = None;
            return Err(exc);
        }
        State::Suspended => {}
    }

    let handle = gen.frame.borrow().clone().expect("frame present while suspended");
    gen.state.set(State::Running);
    let result = crate::frame::resume_frame(vm, &handle, None, Some(exc));
    finish(vm, gen, result)
}

/// `gen.close()`: throw `GeneratorExit`, expect the task to either
/// propagate it, swallow it and return, or raise `RuntimeError` if it
/// yields again instead (spec.md §4.5).
pub fn close(vm: &VirtualMachine, gen: &Rc<GeneratorTask>) -> PyResult<()> {
    match gen.state.get() {
        State::Closed | State::Created => {
            gen.state.set(State::Closed);
            *gen.frame.borrow_mut() = None;
            return Ok(());
        }
        State::Running => return Err(vm.new_value_error(format!("{} is already executing", gen.name))),
        State::Suspended => {}
    }

    let generator_exit = vm.new_exception(&vm.ctx.exceptions.generator_exit, String::new());
    match throw(vm, gen, generator_exit) {
        Ok(_) => Err(vm.new_runtime_error("generator ignored GeneratorExit".to_owned())),
        Err(e) => {
            if vm.is_instance(&e, &vm.ctx.exceptions.generator_exit) || vm.is_instance(&e, &vm.ctx.exceptions.stop_iteration) {
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}

fn finish(vm: &VirtualMachine, gen: &Rc<GeneratorTask>, result: PyResult<FrameExecResult>) -> PyResult<PyObjectRef> {
    match result {
        Ok(FrameExecResult::Yield(v)) => {
            gen.state.set(State::Suspended);
            Ok(v)
        }
        Ok(FrameExecResult::Return(v)) => {
            gen.state.set(State::Closed);
            *gen.frame.borrow_mut() = None;
            Err(vm.new_stop_iteration(Some(v)))
        }
        Err(e) => {
            gen.state.set(State::Closed);
            *gen.frame.borrow_mut() = None;
            Err(e)
        }
    }
}

/// The result of advancing one step of a `yield from` delegation (spec.md
/// §4.5's bullet list): either the delegate produced a value to yield, or
/// it's exhausted and delegation completes with its return/`StopIteration`
/// value.
pub enum YieldFromStep {
    Yield(PyObjectRef),
    Done(PyObjectRef),
}

/// Drive one step of delegated iteration over `iterator`, forwarding
/// `sent_value` into it when it's itself a generator/coroutine.
pub fn yield_from_step(
    vm: &VirtualMachine,
    iterator: &PyObjectRef,
    sent_value: Option<PyObjectRef>,
) -> PyResult<YieldFromStep> {
    match &iterator.value {
        Value::Generator(task) | Value::Coroutine(task) => {
            let value = sent_value.unwrap_or_else(|| vm.ctx.none.clone());
            match send(vm, task, value) {
                Ok(v) => Ok(YieldFromStep::Yield(v)),
                Err(e) if vm.is_instance(&e, &vm.ctx.exceptions.stop_iteration) => {
                    Ok(YieldFromStep::Done(stop_iteration_value(vm, &e)))
                }
                Err(e) => Err(e),
            }
        }
        Value::Iterator(state_cell) => match crate::iterator::advance(vm, &mut state_cell.borrow_mut())? {
            Some(v) => Ok(YieldFromStep::Yield(v)),
            None => Ok(YieldFromStep::Done(vm.ctx.none.clone())),
        },
        _ => {
            let next_method = crate::protocol::attr::getattr(vm, iterator, "__next__")?;
            match crate::protocol::call::call_object_const(vm, &next_method, vec![iterator.clone()]) {
                Ok(v) => Ok(YieldFromStep::Yield(v)),
                Err(e) if vm.is_instance(&e, &vm.ctx.exceptions.stop_iteration) => {
                    Ok(YieldFromStep::Done(stop_iteration_value(vm, &e)))
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn stop_iteration_value(vm: &VirtualMachine, exc: &PyObjectRef) -> PyObjectRef {
    match &exc.value {
        Value::Exception(cell) => cell.borrow().args.first().cloned().unwrap_or_else(|| vm.ctx.none.clone()),
        _ => vm.ctx.none.clone(),
    }
}
