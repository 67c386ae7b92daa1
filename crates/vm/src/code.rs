//! Bytecode representation: the instruction set, compiled code objects,
//! literal pools, and send-site inline caches.
//!
//! One `Instruction` per stream slot; jump operands are absolute
//! instruction indices. Every opcode with a synchronous effect declares an
//! exact (pop, push) pair in `stack_effect`; opcodes that transfer control
//! (sends, returns, raise, halt) have no local effect to declare.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::gc::{GcModule, GcPtr, Heap};
use crate::symbol::Symbol;
use crate::value::{Value, VmError};

/// Index into a literal pool.
pub type LitIdx = u16;

#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    Noop,

    // Immediate pushes
    PushInt(i64),
    MetaPushNeg1,
    MetaPush0,
    MetaPush1,
    MetaPush2,
    PushNil,
    PushTrue,
    PushFalse,
    PushUndef,
    PushSelf,
    PushContext,
    PushBlock,
    PushException,
    ClearException,

    // Literals and locals
    PushLiteral(LitIdx),
    SetLiteral(LitIdx),
    PushLocal(u16),
    SetLocal(u16),
    PushLocalDepth(u16, u16),
    SetLocalDepth(u16, u16),

    // Instance state
    PushIvar(LitIdx),
    SetIvar(LitIdx),
    PushMyField(u16),
    StoreMyField(u16),

    // Raw stack manipulation
    SwapStack,
    DupTop,
    Pop,

    // Control flow (absolute instruction indices)
    Goto(usize),
    GotoIfFalse(usize),
    GotoIfTrue(usize),
    GotoIfDefined(usize),

    // Containers and casts
    MakeArray(u16),
    CastArray,
    CastTuple,
    CastForSingleBlockArg,
    CastForMultiBlockArg,
    ShiftTuple,

    // Constants and namespaces
    PushConst(LitIdx),
    FindConst(LitIdx),
    SetConst(LitIdx),
    SetConstAt(LitIdx),
    PushCpathTop,
    OpenClass(LitIdx),
    OpenClassUnder(LitIdx),
    OpenModule(LitIdx),
    OpenModuleUnder(LitIdx),
    OpenMetaclass,
    AddMethod(LitIdx),
    AttachMethod(LitIdx),

    // Message sends
    SendMethod(LitIdx),
    SendStack(LitIdx, u16),
    SendStackWithBlock(LitIdx, u16),
    SendStackWithSplat(LitIdx, u16),
    SendSuperStackWithBlock(LitIdx, u16),
    SendSuperStackWithSplat(LitIdx, u16),
    LocateMethod,
    SetCallFlags(u8),
    CheckSerial(LitIdx, u64),

    // Fast-path operators
    MetaSendOpPlus,
    MetaSendOpMinus,
    MetaSendOpEqual,
    MetaSendOpNequal,
    MetaSendOpTequal,
    MetaSendOpLt,
    MetaSendOpGt,
    MetaSendCall(u16),

    // Returns and unwinding
    Ret,
    SoftReturn,
    RaiseExc,
    Halt,

    // Predicates and misc
    PassedArg(u16),
    PassedBlockarg(u16),
    StringAppend,
    StringDup,
    CreateBlock(LitIdx),
    KindOf,
    InstanceOf,
    IsFixnum,
    IsSymbol,
    IsNil,
    PushClass,
    Equal,
    YieldDebugger,
}

impl Instruction {
    /// Declared (pop, push) stack effect, if the opcode completes
    /// synchronously in its own context. Sends, returns, raise and halt
    /// transfer control and declare `None`.
    pub fn stack_effect(&self) -> Option<(usize, usize)> {
        use Instruction::*;
        Some(match self {
            Noop | ClearException | Goto(_) | SetCallFlags(_) | YieldDebugger => (0, 0),

            PushInt(_) | MetaPushNeg1 | MetaPush0 | MetaPush1 | MetaPush2 | PushNil
            | PushTrue | PushFalse | PushUndef | PushSelf | PushContext | PushBlock
            | PushException | PushLiteral(_) | PushLocal(_) | PushLocalDepth(_, _)
            | PushIvar(_) | PushMyField(_) | PushConst(_) | PushCpathTop | OpenModule(_)
            | PassedArg(_) | PassedBlockarg(_) | CreateBlock(_) => (0, 1),

            SetLiteral(_) | SetLocal(_) | SetLocalDepth(_, _) | SetIvar(_)
            | StoreMyField(_) | SetConst(_) | CastArray | CastTuple
            | CastForSingleBlockArg | CastForMultiBlockArg | FindConst(_) | OpenClass(_)
            | OpenModuleUnder(_) | OpenMetaclass | CheckSerial(_, _) | StringDup
            | IsFixnum | IsSymbol | IsNil | PushClass => (1, 1),

            GotoIfFalse(_) | GotoIfTrue(_) | GotoIfDefined(_) | Pop => (1, 0),

            SwapStack => (2, 2),
            DupTop => (1, 2),
            ShiftTuple => (1, 2),

            SetConstAt(_) | OpenClassUnder(_) | AddMethod(_) | AttachMethod(_)
            | StringAppend | KindOf | InstanceOf | Equal | MetaSendOpPlus
            | MetaSendOpMinus | MetaSendOpEqual | MetaSendOpNequal | MetaSendOpTequal
            | MetaSendOpLt | MetaSendOpGt => (2, 1),

            LocateMethod => (3, 1),

            MakeArray(n) => (*n as usize, 1),

            SendMethod(_) | SendStack(_, _) | SendStackWithBlock(_, _)
            | SendStackWithSplat(_, _) | SendSuperStackWithBlock(_, _)
            | SendSuperStackWithSplat(_, _) | MetaSendCall(_) | Ret | SoftReturn
            | RaiseExc | Halt => return None,
        })
    }
}

/// One entry of a literal pool.
///
/// `Value` entries hold immediates only; string literals are stored as raw
/// text and copied onto the heap each time `push_literal` reaches them, so
/// the pool itself never holds a collectable reference.
#[derive(Clone, Debug)]
pub enum Literal {
    Value(Value),
    String(String),
    Code(Rc<CompiledCode>),
    Site(Rc<SendSite>),
    /// A writable pool slot, reserved by the compiler for `set_literal`.
    /// Only immediates may be stored: the pool is not traced by the
    /// collector.
    Cell(RefCell<Value>),
}

/// Inline cache state for one call site.
#[derive(Clone, Debug)]
pub enum InlineCache {
    Empty,
    Cached {
        class: GcPtr<GcModule>,
        serial: u64,
        method: MethodEntry,
    },
}

/// A call site: the selector plus a mutable monomorphic inline cache.
///
/// The cache is valid only while `serial` matches the interpreter's global
/// method-mutation serial and `class` matches the lookup-begin class.
/// Staleness is repaired transparently at the next send.
pub struct SendSite {
    pub name: Symbol,
    pub cache: RefCell<InlineCache>,
    pub hits: Cell<u64>,
    pub misses: Cell<u64>,
}

impl SendSite {
    pub fn new(name: Symbol) -> Self {
        Self {
            name,
            cache: RefCell::new(InlineCache::Empty),
            hits: Cell::new(0),
            misses: Cell::new(0),
        }
    }
}

impl fmt::Debug for SendSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendSite")
            .field("name", &self.name)
            .field("hits", &self.hits.get())
            .field("misses", &self.misses.get())
            .finish()
    }
}

/// Method visibility. Private methods are found only by call sites with
/// the privacy flag set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

/// An executable bound in a method table.
#[derive(Clone)]
pub enum Method {
    Bytecode(Rc<CompiledCode>),
    Native(Rc<NativeFn>),
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Bytecode(code) => write!(f, "Bytecode({:?})", code.name),
            Method::Native(n) => write!(f, "Native({})", n.name),
        }
    }
}

/// A method table slot: the executable plus its visibility.
#[derive(Clone, Debug)]
pub struct MethodEntry {
    pub method: Method,
    pub visibility: Visibility,
}

impl MethodEntry {
    pub fn public(method: Method) -> Self {
        Self {
            method,
            visibility: Visibility::Public,
        }
    }

    pub fn private(method: Method) -> Self {
        Self {
            method,
            visibility: Visibility::Private,
        }
    }
}

/// A native function callable from bytecode. The interpreter hands it the
/// heap, the receiver, and already-marshalled arguments; it returns one
/// value or a host error.
pub struct NativeFn {
    pub name: String,
    pub arity: usize,
    #[allow(clippy::type_complexity)]
    pub func: Box<dyn Fn(&mut Heap, Value, &[Value]) -> Result<Value, VmError>>,
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFn")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// One exception handler window: `start..=end` are the covered instruction
/// indices, `handler` is where control lands when an exception raised
/// inside the window unwinds to this context.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerRange {
    pub start: usize,
    pub end: usize,
    pub handler: usize,
}

impl HandlerRange {
    pub fn covers(&self, ip: usize) -> bool {
        ip >= self.start && ip <= self.end
    }
}

/// An immutable unit of bytecode plus everything needed to activate it:
/// literal pool, argument metadata, declared stack depth, handler windows
/// and the lexical scope chain.
#[derive(Debug)]
pub struct CompiledCode {
    pub name: Symbol,
    pub code: Vec<Instruction>,
    pub literals: Vec<Literal>,
    /// Arguments that must be supplied.
    pub required_args: usize,
    /// Required plus optional argument slots (locals 0..total_args).
    pub total_args: usize,
    /// Local index receiving surplus arguments as an array, if declared.
    pub splat: Option<usize>,
    /// Declared maximum operand stack depth.
    pub stack_size: usize,
    pub local_count: usize,
    pub exceptions: Vec<HandlerRange>,
    /// Lexical scope chain, innermost enclosing module first.
    pub scope: Vec<GcPtr<GcModule>>,
    /// Identity serial checked by `check_serial`.
    pub serial: u64,
}

impl CompiledCode {
    pub fn new(name: Symbol) -> Self {
        Self {
            name,
            code: Vec::new(),
            literals: Vec::new(),
            required_args: 0,
            total_args: 0,
            splat: None,
            stack_size: 32,
            local_count: 0,
            exceptions: Vec::new(),
            scope: Vec::new(),
            serial: 0,
        }
    }

    /// Append an instruction, returning its index.
    pub fn emit(&mut self, instr: Instruction) -> usize {
        let at = self.code.len();
        self.code.push(instr);
        at
    }

    /// Add a literal, returning its pool index.
    pub fn add_literal(&mut self, lit: Literal) -> LitIdx {
        let idx = self.literals.len();
        self.literals.push(lit);
        idx as LitIdx
    }

    /// Add an immediate value literal.
    pub fn add_value(&mut self, value: Value) -> LitIdx {
        debug_assert!(value.is_immediate());
        self.add_literal(Literal::Value(value))
    }

    /// Add a symbol literal.
    pub fn add_symbol(&mut self, sym: Symbol) -> LitIdx {
        self.add_literal(Literal::Value(Value::Symbol(sym)))
    }

    /// Add a string literal.
    pub fn add_string(&mut self, s: &str) -> LitIdx {
        self.add_literal(Literal::String(s.to_string()))
    }

    /// Add a nested code literal (a block body or method definition).
    pub fn add_code(&mut self, code: Rc<CompiledCode>) -> LitIdx {
        self.add_literal(Literal::Code(code))
    }

    /// Add a send site for a selector.
    pub fn add_site(&mut self, name: Symbol) -> LitIdx {
        self.add_literal(Literal::Site(Rc::new(SendSite::new(name))))
    }

    /// Reserve a writable pool slot for `set_literal`.
    pub fn add_cell(&mut self) -> LitIdx {
        self.add_literal(Literal::Cell(RefCell::new(Value::Undef)))
    }

    /// Retarget a previously emitted goto-family instruction.
    pub fn patch_goto(&mut self, at: usize, target: usize) {
        match &mut self.code[at] {
            Instruction::Goto(t)
            | Instruction::GotoIfFalse(t)
            | Instruction::GotoIfTrue(t)
            | Instruction::GotoIfDefined(t) => *t = target,
            other => panic!("patch_goto on non-goto instruction {:?}", other),
        }
    }

    /// Declare an exception handler window.
    pub fn add_handler(&mut self, start: usize, end: usize, handler: usize) {
        self.exceptions.push(HandlerRange {
            start,
            end,
            handler,
        });
    }

    /// Find the innermost handler window covering an instruction index.
    pub fn find_handler(&self, ip: usize) -> Option<usize> {
        // Last declared window wins: nested windows are declared after
        // their enclosing ones.
        self.exceptions
            .iter()
            .rev()
            .find(|h| h.covers(ip))
            .map(|h| h.handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolTable;

    #[test]
    fn test_emit_and_patch() {
        let mut table = SymbolTable::new();
        let mut code = CompiledCode::new(table.intern("main"));
        let j = code.emit(Instruction::GotoIfFalse(0));
        code.emit(Instruction::PushTrue);
        let target = code.emit(Instruction::PushNil);
        code.patch_goto(j, target);
        assert_eq!(code.code[j], Instruction::GotoIfFalse(target));
    }

    #[test]
    fn test_handler_window_lookup() {
        let mut table = SymbolTable::new();
        let mut code = CompiledCode::new(table.intern("guarded"));
        code.add_handler(0, 9, 20);
        code.add_handler(3, 5, 30); // nested, declared later
        assert_eq!(code.find_handler(4), Some(30));
        assert_eq!(code.find_handler(7), Some(20));
        assert_eq!(code.find_handler(15), None);
    }

    #[test]
    fn test_stack_effects_are_declared() {
        use Instruction::*;
        assert_eq!(PushInt(47).stack_effect(), Some((0, 1)));
        assert_eq!(MakeArray(3).stack_effect(), Some((3, 1)));
        assert_eq!(MetaSendOpPlus.stack_effect(), Some((2, 1)));
        assert_eq!(ShiftTuple.stack_effect(), Some((1, 2)));
        assert_eq!(SendStack(0, 2).stack_effect(), None);
        assert_eq!(Ret.stack_effect(), None);
    }

    #[test]
    fn test_send_site_starts_empty() {
        let mut table = SymbolTable::new();
        let site = SendSite::new(table.intern("call"));
        assert!(matches!(*site.cache.borrow(), InlineCache::Empty));
        assert_eq!(site.hits.get(), 0);
    }
}
