//! Bytecode instruction set and code-object representation.
//!
//! The parser/compiler that produces these structures is an external
//! collaborator (see `spec.md` §1); this module only defines the opaque
//! wire shape the dispatch loop (`crate::frame`) consumes. Layout and
//! opcode families are grounded on the teacher's block-stack-era
//! `bytecode/src/bytecode.rs`, extended with the superinstruction and
//! type-specialized fast-path opcodes spec.md §4.2 calls out explicitly.

use bitflags::bitflags;
use num_bigint::BigInt;
use num_complex::Complex64;
use std::fmt;
use std::rc::Rc;

/// An absolute jump target: the index of an instruction within the same
/// code object's `instructions` vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CodeFlags: u16 {
        const HAS_DEFAULTS        = 0x001;
        const HAS_KW_ONLY_DEFAULTS = 0x002;
        const IS_GENERATOR        = 0x004;
        const IS_COROUTINE        = 0x008;
        const IS_ASYNC_GENERATOR  = Self::IS_GENERATOR.bits() | Self::IS_COROUTINE.bits();
        const HAS_VARARGS         = 0x010;
        const HAS_VARKEYWORDS     = 0x020;
    }
}

/// A literal value embedded directly in an instruction stream. Nested code
/// objects (for `def`/`lambda`/class bodies) are carried the same way the
/// teacher's `Constant::Code` variant does.
#[derive(Debug, Clone)]
pub enum Constant {
    Integer(BigInt),
    Float(f64),
    Complex(Complex64),
    Boolean(bool),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Code(Rc<CodeObject>),
    Tuple(Vec<Constant>),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Equal,
    NotEqual,
    In,
    NotIn,
    Is,
    IsNot,
    ExceptionMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Power,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    Add,
    Subtract,
    Lshift,
    Rshift,
    And,
    Xor,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Invert,
    Minus,
    Plus,
}

/// Argument packaging for `MAKE_FUNCTION`: which optional trailing values
/// are present on the stack (in this order, deepest first): defaults,
/// kw-only defaults, closure cell tuple.
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MakeFunctionFlags: u8 {
        const DEFAULTS = 0x01;
        const KW_ONLY_DEFAULTS = 0x02;
        const CLOSURE = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseKind {
    /// `raise` with no operands: re-raise the currently handled exception.
    Reraise,
    /// `raise expr`.
    Raise,
    /// `raise expr from cause`.
    RaiseFrom,
}

/// A single bytecode instruction. Operand indices (`u32`) address the
/// owning `CodeObject`'s `constants`/`names`/`varnames`/cell-and-free-var
/// arrays; see `CodeObject` field docs. Naming of superinstructions and
/// fast paths is not normative (spec.md §4.2): only the *behavior* they
/// enumerate is required.
#[derive(Debug, Clone)]
pub enum Instruction {
    // --- stack manipulation ---
    Pop,
    Dup,
    DupTopTwo,
    RotTwo,
    RotThree,
    Nop,

    // --- constant / literal loads ---
    LoadConst { idx: u32 },
    LoadNone,
    LoadTrue,
    LoadFalse,
    BuildEmptyTuple,
    BuildEmptyList,
    BuildEmptyDict,

    // --- locals / globals / names ---
    LoadFast { idx: u32 },
    StoreFast { idx: u32 },
    DeleteFast { idx: u32 },
    LoadName { idx: u32 },
    StoreName { idx: u32 },
    DeleteName { idx: u32 },
    LoadGlobal { idx: u32 },
    StoreGlobal { idx: u32 },
    DeleteGlobal { idx: u32 },
    SetupAnnotations,

    // --- closures ---
    LoadClosure { idx: u32 },
    LoadDeref { idx: u32 },
    StoreDeref { idx: u32 },

    // --- attributes / items ---
    LoadAttr { idx: u32 },
    StoreAttr { idx: u32 },
    DeleteAttr { idx: u32 },
    LoadMethod { idx: u32 },
    CallMethod { argc: u32 },
    BinarySubscript,
    StoreSubscript,
    DeleteSubscript,

    // --- arithmetic / logic ---
    UnaryOperation { op: UnaryOperator },
    BinaryOperation { op: BinaryOperator, inplace: bool },

    // --- comparisons ---
    CompareOperation { op: ComparisonOperator },
    JumpIfCompare { op: ComparisonOperator, target: Label },

    // --- control flow ---
    Jump { target: Label },
    JumpIfTrue { target: Label },
    JumpIfFalse { target: Label },
    JumpIfTrueOrPop { target: Label },
    JumpIfFalseOrPop { target: Label },
    GetIter,
    ForIter { target: Label },
    Continue { target: Label },

    // --- calls / function & class creation ---
    CallFunctionPositional { argc: u32 },
    CallFunctionKeyword { argc: u32, kwnames_idx: u32 },
    CallFunctionEx { has_kwargs: bool },
    MakeFunction { flags: MakeFunctionFlags },
    LoadBuildClass,

    // --- collection construction ---
    BuildTuple { size: u32, unpack: bool },
    BuildList { size: u32, unpack: bool },
    BuildSet { size: u32, unpack: bool },
    BuildMap { size: u32, unpack: bool },
    ListAppend { depth: u32 },
    SetAdd { depth: u32 },
    MapAdd { depth: u32 },

    // --- unpacking ---
    UnpackSequence { size: u32 },
    UnpackEx { before: u32, after: u32 },

    // --- exceptions ---
    SetupExcept { handler: Label },
    SetupFinally { handler: Label },
    SetupWith { end: Label },
    PopBlock,
    PopExcept,
    PopExceptHandler,
    ClearException,
    RaiseVarargs { kind: RaiseKind },
    ExceptionMatch,
    EndFinally,
    WithCleanupStart,
    WithCleanupFinish,

    // --- async ---
    GetAwaitable,
    GetAsyncIter,
    GetAsyncNext,

    // --- yield ---
    YieldValue,
    YieldFrom,

    // --- imports ---
    ImportName { idx: u32 },
    ImportFrom { idx: u32 },
    ImportStar,

    // --- superinstructions / fused fast paths ---
    LoadFastLoadFast { a: u32, b: u32 },
    LoadFastLoadConst { fast: u32, constant: u32 },
    StoreFastLoadFast { store: u32, load: u32 },
    LoadGlobalLoadFast { global: u32, fast: u32 },
    AddConstToFast { fast: u32, constant: u32 },
    IncrementFast { idx: u32 },
    DecrementFast { idx: u32 },
    NegateFast { idx: u32 },
    AccumulateFast { idx: u32, op: BinaryOperator },
    BinaryOpIntFast { op: BinaryOperator },
    CompareIntFast { op: ComparisonOperator },
    LenFast,

    ReturnValue,
}

/// Primary container of a single compiled unit: one per function, module,
/// lambda, or class body. Consumed, not produced, by this crate (spec.md
/// §3) — the fields below are exactly the set spec.md names.
#[derive(Debug, Clone)]
pub struct CodeObject {
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    /// Name pool used by `LoadName`/`LoadGlobal`/`LoadAttr`/imports/etc.
    pub names: Vec<Rc<str>>,
    /// Local-variable names: `[0..posonlyarg_count)` positional-only,
    /// `[0..arg_count)` all positional, `[arg_count..arg_count+kwonlyarg_count)`
    /// keyword-only, then (if present) the `*args` slot, then (if present)
    /// the `**kwargs` slot, then any remaining plain locals.
    pub varnames: Vec<Rc<str>>,
    /// Variables defined in this scope that an inner scope closes over.
    pub cellvars: Vec<Rc<str>>,
    /// Variables captured from an enclosing scope.
    pub freevars: Vec<Rc<str>>,
    pub flags: CodeFlags,
    pub arg_count: u32,
    pub posonlyarg_count: u32,
    pub kwonlyarg_count: u32,
    /// Upper bound on operand-stack depth; the dispatch loop guards
    /// against overflow using this (spec.md §4.2).
    pub stack_size: u32,
    pub name: Rc<str>,
    pub first_line: u32,
    pub source_path: Rc<str>,
    /// For each cell variable, `Some(arg_slot)` if it's also a bound
    /// parameter (so frame construction must move the argument's value
    /// into the cell), else `None`.
    pub cell2arg: Vec<Option<u32>>,
}

impl CodeObject {
    pub fn varargs_slot(&self) -> Option<u32> {
        if self.flags.contains(CodeFlags::HAS_VARARGS) {
            Some(self.arg_count + self.kwonlyarg_count)
        } else {
            None
        }
    }

    pub fn varkeywords_slot(&self) -> Option<u32> {
        if self.flags.contains(CodeFlags::HAS_VARKEYWORDS) {
            let base = self.arg_count + self.kwonlyarg_count;
            Some(if self.varargs_slot().is_some() { base + 1 } else { base })
        } else {
            None
        }
    }

    /// Total number of fast-locals slots reserved for parameters
    /// (positional + kwonly + optional `*args` + optional `**kwargs`).
    pub fn total_arg_slots(&self) -> u32 {
        self.arg_count
            + self.kwonlyarg_count
            + self.flags.contains(CodeFlags::HAS_VARARGS) as u32
            + self.flags.contains(CodeFlags::HAS_VARKEYWORDS) as u32
    }
}

impl fmt::Display for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<code object {} at {:?}, line {}>",
            self.name, self.source_path, self.first_line
        )
    }
}
