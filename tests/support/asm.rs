//! Hand-assembly helper for building `CodeObject`s directly: there is no
//! compiler in this crate to turn source text into bytecode (spec.md §1
//! Non-goals), so integration tests build instruction streams by hand.
//! Grounded on the teacher's `jit/tests/common.rs::Function`, which does
//! the same thing for its JIT test fixtures.

use pyvm::bytecode::{CodeFlags, CodeObject, Constant, Instruction, Label};
use pyvm::value::{PyObject, PyObjectRef, Value};
use pyvm::{PyResult, VirtualMachine};
use std::rc::Rc;

pub struct CodeBuilder {
    instructions: Vec<Instruction>,
    constants: Vec<Constant>,
    names: Vec<Rc<str>>,
    varnames: Vec<Rc<str>>,
    cellvars: Vec<Rc<str>>,
    freevars: Vec<Rc<str>>,
    flags: CodeFlags,
    arg_count: u32,
    posonlyarg_count: u32,
    kwonlyarg_count: u32,
    name: Rc<str>,
    cell2arg: Vec<Option<u32>>,
}

impl CodeBuilder {
    pub fn new(name: &str) -> Self {
        CodeBuilder {
            instructions: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            flags: CodeFlags::empty(),
            arg_count: 0,
            posonlyarg_count: 0,
            kwonlyarg_count: 0,
            name: Rc::from(name),
            cell2arg: Vec::new(),
        }
    }

    pub fn generator(mut self) -> Self {
        self.flags |= CodeFlags::IS_GENERATOR;
        self
    }

    pub fn coroutine(mut self) -> Self {
        self.flags |= CodeFlags::IS_COROUTINE;
        self
    }

    /// Declare the next positional parameter, in left-to-right order.
    pub fn param(&mut self, name: &str) -> u32 {
        let idx = self.varnames.len() as u32;
        self.varnames.push(Rc::from(name));
        self.arg_count += 1;
        idx
    }

    /// A plain fast-local (not a parameter), deduped by name.
    pub fn local(&mut self, name: &str) -> u32 {
        if let Some(pos) = self.varnames.iter().position(|n| n.as_ref() == name) {
            return pos as u32;
        }
        let idx = self.varnames.len() as u32;
        self.varnames.push(Rc::from(name));
        idx
    }

    /// A variable this scope's own body closes an inner function over,
    /// addressed by `LoadDeref`/`StoreDeref`/`LoadClosure` at this index
    /// (cellvars occupy the low end of that combined index space).
    pub fn cellvar(&mut self, name: &str) -> u32 {
        let idx = self.cellvars.len() as u32;
        self.cellvars.push(Rc::from(name));
        self.cell2arg.push(None);
        idx
    }

    /// A variable captured from an enclosing scope, addressed at
    /// `cellvars.len() + freevars-so-far`.
    pub fn freevar(&mut self, name: &str) -> u32 {
        let idx = self.cellvars.len() as u32 + self.freevars.len() as u32;
        self.freevars.push(Rc::from(name));
        idx
    }

    /// An entry in the name pool used by `LoadName`/`LoadGlobal`/`LoadAttr`/
    /// `LoadMethod`/etc., deduped by name.
    pub fn name(&mut self, name: &str) -> u32 {
        if let Some(pos) = self.names.iter().position(|n| n.as_ref() == name) {
            return pos as u32;
        }
        let idx = self.names.len() as u32;
        self.names.push(Rc::from(name));
        idx
    }

    pub fn constant(&mut self, c: Constant) -> u32 {
        let idx = self.constants.len() as u32;
        self.constants.push(c);
        idx
    }

    pub fn int_const(&mut self, value: i64) -> u32 {
        self.constant(Constant::Integer(num_bigint::BigInt::from(value)))
    }

    pub fn str_const(&mut self, value: &str) -> u32 {
        self.constant(Constant::Str(Rc::from(value)))
    }

    pub fn code_const(&mut self, code: Rc<CodeObject>) -> u32 {
        self.constant(Constant::Code(code))
    }

    /// The index the next `emit` will land at, for forward-jump patching:
    /// emit a placeholder jump, note its `Label`, emit the jump's body,
    /// take `here()` again at the landing site, then `patch_jump`.
    pub fn here(&self) -> Label {
        Label(self.instructions.len() as u32)
    }

    pub fn emit(&mut self, instr: Instruction) -> Label {
        let at = self.here();
        self.instructions.push(instr);
        at
    }

    /// Rewrite a previously emitted jump-shaped instruction's target now
    /// that the landing site is known.
    pub fn patch_jump(&mut self, at: Label, target: Label) {
        let slot = &mut self.instructions[at.0 as usize];
        *slot = match slot.clone() {
            Instruction::Jump { .. } => Instruction::Jump { target },
            Instruction::JumpIfTrue { .. } => Instruction::JumpIfTrue { target },
            Instruction::JumpIfFalse { .. } => Instruction::JumpIfFalse { target },
            Instruction::JumpIfTrueOrPop { .. } => Instruction::JumpIfTrueOrPop { target },
            Instruction::JumpIfFalseOrPop { .. } => Instruction::JumpIfFalseOrPop { target },
            Instruction::ForIter { .. } => Instruction::ForIter { target },
            Instruction::SetupExcept { .. } => Instruction::SetupExcept { handler: target },
            Instruction::SetupFinally { .. } => Instruction::SetupFinally { handler: target },
            Instruction::SetupWith { .. } => Instruction::SetupWith { end: target },
            Instruction::JumpIfCompare { op, .. } => Instruction::JumpIfCompare { op, target },
            other => panic!("patch_jump: {other:?} is not a jump-shaped instruction"),
        };
    }

    pub fn build(self) -> Rc<CodeObject> {
        Rc::new(CodeObject {
            instructions: self.instructions,
            constants: self.constants,
            names: self.names,
            varnames: self.varnames,
            cellvars: self.cellvars,
            freevars: self.freevars,
            flags: self.flags,
            arg_count: self.arg_count,
            posonlyarg_count: self.posonlyarg_count,
            kwonlyarg_count: self.kwonlyarg_count,
            stack_size: 32,
            name: self.name,
            first_line: 1,
            source_path: Rc::from("<asm>"),
            cell2arg: self.cell2arg,
        })
    }
}

/// A freshly bootstrapped VM with builtins installed, ready to run a
/// module-level `CodeObject` via `run_module`.
pub fn new_vm() -> VirtualMachine {
    let vm = VirtualMachine::new();
    pyvm::builtins_core::bootstrap(&vm);
    vm
}

/// Run a module-level code object against a fresh, empty globals dict and
/// return that dict alongside the module's own return value (normally
/// `None`), so a test can read back top-level names afterward.
pub fn run_module(vm: &VirtualMachine, code: Rc<CodeObject>) -> (PyResult<PyObjectRef>, PyObjectRef) {
    let globals = PyObject::new(
        Value::Dict(std::cell::RefCell::new(pyvm::dict::PyDict::new())),
        Some(vm.ctx.object_class.clone()),
    );
    let result = vm.run_code(code, globals.clone());
    (result, globals)
}

/// Read a global by plain name back out of the dict `run_module` returned.
pub fn get_global(globals: &PyObjectRef, name: &str) -> Option<PyObjectRef> {
    let Value::Dict(d) = &globals.value else { return None };
    d.borrow().get_plain(name).ok().flatten()
}

pub fn int_const_value(obj: &PyObjectRef) -> i64 {
    match &obj.value {
        Value::Int(i) => i.try_into().expect("test int out of i64 range"),
        other => panic!("expected Int, got {other:?}"),
    }
}

pub fn str_value(obj: &PyObjectRef) -> String {
    match &obj.value {
        Value::Str(s) => s.to_string(),
        other => panic!("expected Str, got {other:?}"),
    }
}

pub fn float_value(obj: &PyObjectRef) -> f64 {
    match &obj.value {
        Value::Float(f) => *f,
        other => panic!("expected Float, got {other:?}"),
    }
}
