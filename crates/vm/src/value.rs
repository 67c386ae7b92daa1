//! Tagged value representation.
//!
//! A `Value` is either an immediate (never heap-allocated, compared by bit
//! pattern) or a handle to a heap object. Handles are typed `GcPtr` indices
//! into the `Heap`; comparing two handles compares identity, not contents.
//!
//! Code objects and native functions are reference-counted rather than
//! GC-managed: bytecode is immutable and lives for the whole run, so it
//! never needs collection.

use std::fmt;
use std::rc::Rc;

use crate::code::{CompiledCode, NativeFn};
use crate::gc::{
    GcArray, GcBlockEnv, GcContext, GcException, GcInstance, GcModule, GcPtr, GcString, GcTuple,
    RawGcPtr,
};
use crate::symbol::Symbol;

#[derive(Clone)]
pub enum Value {
    // Immediates
    Nil,
    /// The "undefined" sentinel: distinct from nil, tested by `goto_if_defined`.
    /// Seeded into optional-argument locals that were not passed.
    Undef,
    Bool(bool),
    Fixnum(i64),
    Symbol(Symbol),

    // Heap references
    Tuple(GcPtr<GcTuple>),
    Array(GcPtr<GcArray>),
    Str(GcPtr<GcString>),
    Instance(GcPtr<GcInstance>),
    Module(GcPtr<GcModule>),
    Exception(GcPtr<GcException>),
    Block(GcPtr<GcBlockEnv>),
    Context(GcPtr<GcContext>),

    // Callables (Rc-managed, not collected)
    Code(Rc<CompiledCode>),
    Native(Rc<NativeFn>),
}

impl PartialEq for Value {
    /// Identity equality: bit equality for immediates, same-object for
    /// references. Structural equality is a message send, not built in.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Undef, Value::Undef) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Instance(a), Value::Instance(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => a == b,
            (Value::Block(a), Value::Block(b)) => a == b,
            (Value::Context(a), Value::Context(b)) => a == b,
            (Value::Code(a), Value::Code(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Undef => write!(f, "Undef"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Fixnum(i) => write!(f, "Fixnum({})", i),
            Value::Symbol(s) => write!(f, "{:?}", s),
            Value::Tuple(p) => write!(f, "Tuple({:?})", p),
            Value::Array(p) => write!(f, "Array({:?})", p),
            Value::Str(p) => write!(f, "Str({:?})", p),
            Value::Instance(p) => write!(f, "Instance({:?})", p),
            Value::Module(p) => write!(f, "Module({:?})", p),
            Value::Exception(p) => write!(f, "Exception({:?})", p),
            Value::Block(p) => write!(f, "Block({:?})", p),
            Value::Context(p) => write!(f, "Context({:?})", p),
            Value::Code(c) => write!(f, "Code({:?})", c.name),
            Value::Native(n) => write!(f, "Native({})", n.name),
        }
    }
}

impl Value {
    /// Nil and false are the only falsy values.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// True for values that carry no heap reference.
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            Value::Nil
                | Value::Undef
                | Value::Bool(_)
                | Value::Fixnum(_)
                | Value::Symbol(_)
                | Value::Code(_)
                | Value::Native(_)
        )
    }

    /// The GC pointer held by this value, if any.
    pub fn gc_pointer(&self) -> Option<RawGcPtr> {
        match self {
            Value::Tuple(p) => Some(p.as_raw()),
            Value::Array(p) => Some(p.as_raw()),
            Value::Str(p) => Some(p.as_raw()),
            Value::Instance(p) => Some(p.as_raw()),
            Value::Module(p) => Some(p.as_raw()),
            Value::Exception(p) => Some(p.as_raw()),
            Value::Block(p) => Some(p.as_raw()),
            Value::Context(p) => Some(p.as_raw()),
            _ => None,
        }
    }

    /// Kind name for diagnostics and type errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "NilClass",
            Value::Undef => "Undef",
            Value::Bool(true) => "TrueClass",
            Value::Bool(false) => "FalseClass",
            Value::Fixnum(_) => "Fixnum",
            Value::Symbol(_) => "Symbol",
            Value::Tuple(_) => "Tuple",
            Value::Array(_) => "Array",
            Value::Str(_) => "String",
            Value::Instance(_) => "Object",
            Value::Module(_) => "Module",
            Value::Exception(_) => "Exception",
            Value::Block(_) => "BlockEnvironment",
            Value::Context(_) => "MethodContext",
            Value::Code(_) => "CompiledCode",
            Value::Native(_) => "NativeFunction",
        }
    }
}

/// Host-side failure. Guest-level errors (argument mismatch, missing
/// methods, raised exceptions) travel as heap exceptions through the
/// unwinder instead; a `VmError` means the bytecode or the embedding broke
/// the interpreter's contract and the task aborts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("Type error: expected {expected}, got {found}")]
    TypeError { expected: String, found: String },

    #[error("Operand stack underflow")]
    StackUnderflow,

    #[error("Call depth limit exceeded")]
    StackOverflow,

    #[error("Local index {index} out of range (declared {count})")]
    LocalOutOfRange { index: usize, count: usize },

    #[error("Field index {index} out of range (object has {count})")]
    FieldOutOfRange { index: usize, count: usize },

    #[error("Instruction pointer {0} past end of bytecode")]
    InvalidIp(usize),

    #[error("Literal index {index} invalid: {reason}")]
    InvalidLiteral { index: usize, reason: String },

    #[error("Lexical variable walk hit a non-block context at depth {0}")]
    BadDepthWalk(usize),

    #[error("Fixnum overflow in primitive arithmetic")]
    FixnumOverflow,

    #[error("No active context")]
    NoActiveContext,

    #[error("Dangling heap reference")]
    DanglingPointer,

    #[error("yield_debugger executed with no debugger registered")]
    NoDebugger,

    #[error("Uncaught exception: {0}")]
    UncaughtException(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Fixnum(0).is_truthy());
        assert!(Value::Undef.is_truthy());
    }

    #[test]
    fn test_immediate_identity() {
        assert_eq!(Value::Fixnum(47), Value::Fixnum(47));
        assert_ne!(Value::Fixnum(47), Value::Fixnum(48));
        assert_ne!(Value::Nil, Value::Undef);
        assert_ne!(Value::Nil, Value::Bool(false));
    }
}
