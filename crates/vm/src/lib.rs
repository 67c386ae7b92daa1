//! Garnet Virtual Machine
//!
//! A stack-based bytecode VM for a late-bound object language:
//! - Message-send dispatch with per-site monomorphic inline caches
//! - Full blocks/closures with non-local return
//! - Heap-allocated execution contexts (first-class, GC-managed)
//! - Guest-level exception unwinding over declared handler windows
//! - Mark-and-sweep collection with explicit send-boundary safe points

pub mod code;
pub mod dispatch;
pub mod gc;
pub mod symbol;
pub mod value;
pub mod vm;

pub use code::{
    CompiledCode, HandlerRange, InlineCache, Instruction, LitIdx, Literal, Method, MethodEntry,
    NativeFn, SendSite, Visibility,
};
pub use dispatch::{Args, Message};
pub use gc::{
    GcArray, GcBlockEnv, GcConfig, GcContext, GcException, GcInstance, GcModule, GcPtr, GcStats,
    GcString, GcTuple, Heap, RawGcPtr,
};
pub use symbol::{Symbol, SymbolTable};
pub use value::{Value, VmError};
pub use vm::{CoreClasses, DebugView, Debugger, Vm, MAX_CALL_DEPTH};
