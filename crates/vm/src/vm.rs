//! The interpreter: fetch-decode-execute over execution contexts.
//!
//! One logical thread of control per task. Each step executes exactly one
//! instruction of the active context; sends and block calls suspend the
//! caller synchronously by allocating a callee context and making it
//! active. Returns, non-local returns and raises are expressed as
//! `StepResult` transitions handled by the outer loop, so intermediate
//! frames are skipped without per-frame handler cost.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::code::{
    CompiledCode, Instruction, LitIdx, Literal, Method, MethodEntry, NativeFn, SendSite,
    Visibility,
};
use crate::dispatch::{Args, Message};
use crate::gc::{GcConfig, GcContext, GcModule, GcPtr, Heap};
use crate::symbol::{Symbol, SymbolTable};
use crate::value::{Value, VmError};

/// Maximum call-chain depth before a stack-depth exception is raised.
pub const MAX_CALL_DEPTH: usize = 10000;

/// What the loop should do after one instruction.
pub(crate) enum StepResult {
    Continue,
    /// A send or block call built a new context; make it active.
    Enter(GcPtr<GcContext>),
    /// Return to the immediate sender, pushing the value there.
    Return(Value),
    /// Return from the home method of a block, skipping intermediate
    /// frames.
    NonLocalReturn {
        home: GcPtr<GcContext>,
        value: Value,
    },
    /// Install the value as the active exception and unwind.
    Raise(Value),
    /// Terminate the task.
    Halt(Value),
}

/// The core class registry, bootstrapped once per task.
pub struct CoreClasses {
    pub object: GcPtr<GcModule>,
    pub module: GcPtr<GcModule>,
    pub class: GcPtr<GcModule>,
    pub fixnum: GcPtr<GcModule>,
    pub symbol: GcPtr<GcModule>,
    pub nil_class: GcPtr<GcModule>,
    pub true_class: GcPtr<GcModule>,
    pub false_class: GcPtr<GcModule>,
    pub tuple: GcPtr<GcModule>,
    pub array: GcPtr<GcModule>,
    pub string: GcPtr<GcModule>,
    pub exception: GcPtr<GcModule>,
    pub block_env: GcPtr<GcModule>,
    pub context: GcPtr<GcModule>,
    pub compiled_code: GcPtr<GcModule>,
}

/// Pre-interned selectors for the fast-path operators and the escalation
/// hooks.
pub(crate) struct Selectors {
    pub plus: Symbol,
    pub minus: Symbol,
    pub eq: Symbol,
    pub neq: Symbol,
    pub teq: Symbol,
    pub lt: Symbol,
    pub gt: Symbol,
    pub call: Symbol,
    pub method_missing: Symbol,
}

/// Read/write view of the active context handed to a debugger at the
/// voluntary suspend point.
pub struct DebugView<'a> {
    pub ip: &'a mut usize,
    pub stack: &'a mut Vec<Value>,
    pub locals: &'a mut Vec<Value>,
}

/// External debugger attachment. `yield_debugger` blocks the task in
/// `on_yield` and resumes where it left off when it returns.
pub trait Debugger {
    fn on_yield(&mut self, view: DebugView<'_>);
}

enum MetaOp {
    Plus,
    Minus,
    Equal,
    Nequal,
    Tequal,
    Lt,
    Gt,
}

/// The virtual machine state for one task.
pub struct Vm {
    pub heap: Heap,
    pub symbols: SymbolTable,
    pub core: CoreClasses,
    pub(crate) selectors: Selectors,
    /// Every module/class ever opened; process-wide, never collected.
    pub modules: Vec<GcPtr<GcModule>>,
    pub(crate) active: Option<GcPtr<GcContext>>,
    pub current_exception: Value,
    /// Flags installed by `set_call_flags`, consumed by the next send.
    call_flags: u8,
    /// Argument count of the most recent block activation; read by
    /// `passed_blockarg`, distinct from the frame's positional count.
    pub(crate) blockargs: usize,
    /// Global method-mutation serial; bumped by every method-table
    /// mutation so stale inline caches are observable.
    pub(crate) dispatch_serial: u64,
    debugger: Option<Box<dyn Debugger>>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Self {
        let mut heap = Heap::with_config(config);
        let mut symbols = SymbolTable::new();

        let object = heap.alloc_module(symbols.intern("Object"), None, true);
        let module = heap.alloc_module(symbols.intern("Module"), Some(object), true);
        let class = heap.alloc_module(symbols.intern("Class"), Some(module), true);
        let fixnum = heap.alloc_module(symbols.intern("Fixnum"), Some(object), true);
        let symbol = heap.alloc_module(symbols.intern("Symbol"), Some(object), true);
        let nil_class = heap.alloc_module(symbols.intern("NilClass"), Some(object), true);
        let true_class = heap.alloc_module(symbols.intern("TrueClass"), Some(object), true);
        let false_class = heap.alloc_module(symbols.intern("FalseClass"), Some(object), true);
        let tuple = heap.alloc_module(symbols.intern("Tuple"), Some(object), true);
        let array = heap.alloc_module(symbols.intern("Array"), Some(object), true);
        let string = heap.alloc_module(symbols.intern("String"), Some(object), true);
        let exception = heap.alloc_module(symbols.intern("Exception"), Some(object), true);
        let block_env = heap.alloc_module(symbols.intern("BlockEnvironment"), Some(object), true);
        let context = heap.alloc_module(symbols.intern("MethodContext"), Some(object), true);
        let compiled_code = heap.alloc_module(symbols.intern("CompiledCode"), Some(object), true);

        let core = CoreClasses {
            object,
            module,
            class,
            fixnum,
            symbol,
            nil_class,
            true_class,
            false_class,
            tuple,
            array,
            string,
            exception,
            block_env,
            context,
            compiled_code,
        };

        let selectors = Selectors {
            plus: symbols.intern("+"),
            minus: symbols.intern("-"),
            eq: symbols.intern("=="),
            neq: symbols.intern("!="),
            teq: symbols.intern("==="),
            lt: symbols.intern("<"),
            gt: symbols.intern(">"),
            call: symbols.intern("call"),
            method_missing: symbols.intern("method_missing"),
        };

        let mut vm = Self {
            heap,
            symbols,
            core,
            selectors,
            modules: Vec::new(),
            active: None,
            current_exception: Value::Nil,
            call_flags: 0,
            blockargs: 0,
            dispatch_serial: 0,
            debugger: None,
        };
        vm.bootstrap();
        vm
    }

    fn bootstrap(&mut self) {
        let named = [
            self.core.object,
            self.core.module,
            self.core.class,
            self.core.fixnum,
            self.core.symbol,
            self.core.nil_class,
            self.core.true_class,
            self.core.false_class,
            self.core.tuple,
            self.core.array,
            self.core.string,
            self.core.exception,
            self.core.block_env,
            self.core.context,
            self.core.compiled_code,
        ];
        for ptr in named {
            if let Some(name) = self.heap.get_module(ptr).map(|m| m.name) {
                self.register_module(name, ptr);
            }
        }

        let standard = self.define_class("StandardError", self.core.exception);
        self.define_class("RuntimeError", standard);
        self.define_class("TypeError", standard);
        self.define_class("ArgumentError", standard);
        let name_error = self.define_class("NameError", standard);
        self.define_class("NoMethodError", name_error);
        self.define_class("LocalJumpError", standard);
        self.define_class("SystemStackError", self.core.exception);

        self.register_primitives();
    }

    /// Define a new class registered as a constant of Object.
    pub fn define_class(&mut self, name: &str, superclass: GcPtr<GcModule>) -> GcPtr<GcModule> {
        let sym = self.symbols.intern(name);
        let ptr = self.heap.alloc_module(sym, Some(superclass), true);
        self.register_module(sym, ptr);
        ptr
    }

    fn register_module(&mut self, name: Symbol, ptr: GcPtr<GcModule>) {
        self.heap.add_permanent_root(ptr.as_raw());
        self.modules.push(ptr);
        let object = self.core.object;
        if let Some(m) = self.heap.get_module_mut(object) {
            m.constants.insert(name, Value::Module(ptr));
        }
        self.dispatch_serial += 1;
    }

    /// Bind a native function into a method table.
    pub fn add_native<F>(&mut self, class: GcPtr<GcModule>, name: &str, arity: usize, f: F)
    where
        F: Fn(&mut Heap, Value, &[Value]) -> Result<Value, VmError> + 'static,
    {
        let sym = self.symbols.intern(name);
        let native = Rc::new(NativeFn {
            name: name.to_string(),
            arity,
            func: Box::new(f),
        });
        if let Some(m) = self.heap.get_module_mut(class) {
            m.methods
                .insert(sym, MethodEntry::public(Method::Native(native)));
        }
        self.dispatch_serial += 1;
    }

    /// The slow-path operator methods the fast paths fall back to, plus
    /// default identity equality on Object.
    fn register_primitives(&mut self) {
        fn fixnum_pair(recv: &Value, arg: &Value) -> Result<(i64, i64), VmError> {
            match (recv, arg) {
                (Value::Fixnum(a), Value::Fixnum(b)) => Ok((*a, *b)),
                (_, other) => Err(VmError::TypeError {
                    expected: "Fixnum".to_string(),
                    found: other.kind_name().to_string(),
                }),
            }
        }

        let fixnum = self.core.fixnum;
        self.add_native(fixnum, "+", 1, |_, recv, args| {
            let (a, b) = fixnum_pair(&recv, &args[0])?;
            a.checked_add(b)
                .map(Value::Fixnum)
                .ok_or(VmError::FixnumOverflow)
        });
        self.add_native(fixnum, "-", 1, |_, recv, args| {
            let (a, b) = fixnum_pair(&recv, &args[0])?;
            a.checked_sub(b)
                .map(Value::Fixnum)
                .ok_or(VmError::FixnumOverflow)
        });
        self.add_native(fixnum, "<", 1, |_, recv, args| {
            let (a, b) = fixnum_pair(&recv, &args[0])?;
            Ok(Value::Bool(a < b))
        });
        self.add_native(fixnum, ">", 1, |_, recv, args| {
            let (a, b) = fixnum_pair(&recv, &args[0])?;
            Ok(Value::Bool(a > b))
        });

        let object = self.core.object;
        self.add_native(object, "==", 1, |_, recv, args| {
            Ok(Value::Bool(recv == args[0]))
        });
        self.add_native(object, "!=", 1, |_, recv, args| {
            Ok(Value::Bool(recv != args[0]))
        });
        self.add_native(object, "equal?", 1, |_, recv, args| {
            Ok(Value::Bool(recv == args[0]))
        });
        self.add_native(object, "===", 1, |_, recv, args| {
            Ok(Value::Bool(recv == args[0]))
        });
    }

    pub fn set_debugger(&mut self, debugger: Box<dyn Debugger>) {
        self.debugger = Some(debugger);
    }

    pub fn dispatch_serial(&self) -> u64 {
        self.dispatch_serial
    }

    /// Run a compiled unit to completion with a fresh instance of Object
    /// as `self`.
    pub fn run_toplevel(&mut self, code: Rc<CompiledCode>) -> Result<Value, VmError> {
        let main = Value::Instance(self.heap.alloc_instance(self.core.object, 0));
        self.run_code(code, main, vec![])
    }

    /// Run a compiled unit to completion against an explicit receiver.
    pub fn run_code(
        &mut self,
        code: Rc<CompiledCode>,
        self_value: Value,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        let args: Args = args.into_iter().collect();
        let locals = self
            .bind_arguments(&code, &args)
            .map_err(|msg| VmError::UncaughtException(format!("ArgumentError: {}", msg)))?;

        let ctx = GcContext {
            code: Rc::clone(&code),
            ip: 0,
            stack: Vec::with_capacity(code.stack_size),
            locals,
            self_value,
            block: Value::Nil,
            argcount: args.len(),
            sender: None,
            env: None,
            depth: 0,
        };
        let ptr = self.heap.alloc_context(ctx);
        self.active = Some(ptr);
        let result = self.run();
        self.active = None;
        result
    }

    fn run(&mut self) -> Result<Value, VmError> {
        loop {
            match self.execute_step()? {
                StepResult::Continue => {}
                StepResult::Enter(ptr) => {
                    self.active = Some(ptr);
                }
                StepResult::Return(value) => {
                    let sender = self.ctx(self.require_active()?)?.sender;
                    match sender {
                        None => return Ok(value),
                        Some(s) => {
                            self.active = Some(s);
                            self.push_stack(s, value)?;
                        }
                    }
                }
                StepResult::NonLocalReturn { home, value } => {
                    let target = self.ctx(home)?.sender;
                    match target {
                        None => return Ok(value),
                        Some(s) => {
                            self.active = Some(s);
                            self.push_stack(s, value)?;
                        }
                    }
                }
                StepResult::Raise(exc) => self.unwind(exc)?,
                StepResult::Halt(value) => return Ok(value),
            }
        }
    }

    /// Walk the sender chain for a handler window covering the raising
    /// instruction; land there with a cleared operand stack, or terminate
    /// the task when nothing catches.
    fn unwind(&mut self, exc: Value) -> Result<(), VmError> {
        self.current_exception = exc.clone();
        let mut cursor = self.active;
        while let Some(ptr) = cursor {
            let (handler, sender) = {
                let ctx = self.ctx(ptr)?;
                // ip already advanced past the instruction that raised
                // (or past the send that the exception escaped from).
                (ctx.code.find_handler(ctx.ip.saturating_sub(1)), ctx.sender)
            };
            if let Some(handler) = handler {
                let ctx = self.ctx_mut(ptr)?;
                ctx.stack.clear();
                ctx.ip = handler;
                self.active = Some(ptr);
                return Ok(());
            }
            cursor = sender;
        }
        self.active = None;
        Err(VmError::UncaughtException(self.describe_exception(&exc)))
    }

    fn describe_exception(&self, exc: &Value) -> String {
        match exc {
            Value::Exception(ptr) => match self.heap.get_exception(*ptr) {
                Some(e) => {
                    let class_name = e
                        .class
                        .and_then(|c| self.heap.get_module(c))
                        .map(|m| self.symbols.name(m.name).to_string())
                        .unwrap_or_else(|| "Exception".to_string());
                    format!("{}: {}", class_name, e.message)
                }
                None => "Exception".to_string(),
            },
            other => format!("{:?}", other),
        }
    }

    /// Allocate and raise a guest exception of a bootstrapped class.
    pub(crate) fn raise_named(
        &mut self,
        class_name: &str,
        message: String,
    ) -> Result<StepResult, VmError> {
        let class = self.lookup_error_class(class_name);
        let exc = self.heap.alloc_exception(class, message);
        Ok(StepResult::Raise(Value::Exception(exc)))
    }

    fn lookup_error_class(&mut self, name: &str) -> Option<GcPtr<GcModule>> {
        let sym = self.symbols.intern(name);
        match self.heap.get_module(self.core.object)?.constants.get(&sym) {
            Some(Value::Module(p)) => Some(*p),
            _ => None,
        }
    }

    // --- context plumbing ---

    fn require_active(&self) -> Result<GcPtr<GcContext>, VmError> {
        self.active.ok_or(VmError::NoActiveContext)
    }

    pub(crate) fn ctx(&self, ptr: GcPtr<GcContext>) -> Result<&GcContext, VmError> {
        self.heap.get_context(ptr).ok_or(VmError::DanglingPointer)
    }

    pub(crate) fn ctx_mut(&mut self, ptr: GcPtr<GcContext>) -> Result<&mut GcContext, VmError> {
        self.heap
            .get_context_mut(ptr)
            .ok_or(VmError::DanglingPointer)
    }

    fn pop_stack(&mut self, ptr: GcPtr<GcContext>) -> Result<Value, VmError> {
        self.ctx_mut(ptr)?.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn push_stack(&mut self, ptr: GcPtr<GcContext>, value: Value) -> Result<(), VmError> {
        self.ctx_mut(ptr)?.stack.push(value);
        Ok(())
    }

    fn top_stack(&self, ptr: GcPtr<GcContext>) -> Result<Value, VmError> {
        self.ctx(ptr)?
            .stack
            .last()
            .cloned()
            .ok_or(VmError::StackUnderflow)
    }

    fn set_top(&mut self, ptr: GcPtr<GcContext>, value: Value) -> Result<(), VmError> {
        *self
            .ctx_mut(ptr)?
            .stack
            .last_mut()
            .ok_or(VmError::StackUnderflow)? = value;
        Ok(())
    }

    pub(crate) fn push_on_active(&mut self, value: Value) -> Result<(), VmError> {
        let active = self.require_active()?;
        self.push_stack(active, value)
    }

    pub(crate) fn active_depth(&self) -> Result<usize, VmError> {
        match self.active {
            Some(ptr) => Ok(self.ctx(ptr)?.depth),
            None => Ok(0),
        }
    }

    /// Innermost lexical module of a compiled unit, defaulting to Object.
    fn scope_module(&self, code: &CompiledCode) -> GcPtr<GcModule> {
        code.scope.first().copied().unwrap_or(self.core.object)
    }

    /// True if `target` is reachable from `from` over sender links.
    fn on_sender_chain(
        &self,
        from: GcPtr<GcContext>,
        target: GcPtr<GcContext>,
    ) -> Result<bool, VmError> {
        let mut cursor = Some(from);
        while let Some(ptr) = cursor {
            if ptr == target {
                return Ok(true);
            }
            cursor = self.ctx(ptr)?.sender;
        }
        Ok(false)
    }

    fn consume_call_flags(&mut self) -> bool {
        let flags = self.call_flags;
        self.call_flags = 0;
        flags & 1 != 0
    }

    /// The send-boundary safe point: refresh roots and collect if due.
    /// Called before any operand is popped, so everything live is still
    /// reachable from the active context.
    fn safe_point(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let mut roots = Vec::new();
        if let Some(active) = self.active {
            roots.push(active.as_raw());
        }
        if let Some(ptr) = self.current_exception.gc_pointer() {
            roots.push(ptr);
        }
        self.heap.set_roots(roots);
        self.heap.maybe_collect();
    }

    // --- literal pool access ---

    fn literal_symbol(&self, code: &CompiledCode, idx: LitIdx) -> Result<Symbol, VmError> {
        match code.literals.get(idx as usize) {
            Some(Literal::Value(Value::Symbol(s))) => Ok(*s),
            _ => Err(VmError::InvalidLiteral {
                index: idx as usize,
                reason: "expected a symbol literal".to_string(),
            }),
        }
    }

    fn literal_site(code: &CompiledCode, idx: LitIdx) -> Result<Rc<SendSite>, VmError> {
        match code.literals.get(idx as usize) {
            Some(Literal::Site(site)) => Ok(Rc::clone(site)),
            _ => Err(VmError::InvalidLiteral {
                index: idx as usize,
                reason: "expected a send site".to_string(),
            }),
        }
    }

    fn literal_code(code: &CompiledCode, idx: LitIdx) -> Result<Rc<CompiledCode>, VmError> {
        match code.literals.get(idx as usize) {
            Some(Literal::Code(c)) => Ok(Rc::clone(c)),
            _ => Err(VmError::InvalidLiteral {
                index: idx as usize,
                reason: "expected a code literal".to_string(),
            }),
        }
    }

    /// Follow `creation` links `depth` times from the active context.
    fn walk_creation(
        &self,
        from: GcPtr<GcContext>,
        depth: usize,
    ) -> Result<GcPtr<GcContext>, VmError> {
        let mut cursor = from;
        for step in 0..depth {
            let env = self.ctx(cursor)?.env.ok_or(VmError::BadDepthWalk(step))?;
            cursor = self
                .heap
                .get_block_env(env)
                .ok_or(VmError::DanglingPointer)?
                .creation;
        }
        Ok(cursor)
    }

    // --- sends ---

    #[allow(clippy::too_many_arguments)]
    fn do_send(
        &mut self,
        active: GcPtr<GcContext>,
        code: &CompiledCode,
        idx: LitIdx,
        argc: usize,
        has_block: bool,
        has_splat: bool,
        is_super: bool,
    ) -> Result<StepResult, VmError> {
        self.safe_point();
        let site = Self::literal_site(code, idx)?;

        let block = if has_block {
            self.pop_stack(active)?
        } else {
            Value::Nil
        };
        let splat = if has_splat {
            Some(self.pop_stack(active)?)
        } else {
            None
        };

        let mut args: Args = SmallVec::new();
        for _ in 0..argc {
            args.push(self.pop_stack(active)?);
        }
        args.reverse();

        if let Some(splat) = splat {
            match splat {
                Value::Array(ptr) => {
                    let items = self
                        .heap
                        .get_array(ptr)
                        .ok_or(VmError::DanglingPointer)?
                        .items
                        .clone();
                    args.extend(items);
                }
                Value::Nil => {}
                other => {
                    return self.raise_named(
                        "TypeError",
                        format!("splat argument must be an Array, got {}", other.kind_name()),
                    )
                }
            }
        }

        let allow_private_flag = self.consume_call_flags();
        let (receiver, lookup_from, allow_private) = if is_super {
            let receiver = self.ctx(active)?.self_value.clone();
            let scope = self.scope_module(code);
            match self.heap.get_module(scope).and_then(|m| m.superclass) {
                Some(lookup) => (receiver, Some(lookup), true),
                None => {
                    let name = self.symbols.name(site.name).to_string();
                    return self.raise_named(
                        "NoMethodError",
                        format!("super: no superclass method `{}`", name),
                    );
                }
            }
        } else {
            (self.pop_stack(active)?, None, allow_private_flag)
        };

        let msg = Message {
            name: site.name,
            receiver,
            args,
            block,
            lookup_from,
            allow_private,
        };
        self.send_message(msg, Some(&site))
    }

    fn meta_binary(
        &mut self,
        active: GcPtr<GcContext>,
        op: MetaOp,
    ) -> Result<StepResult, VmError> {
        self.safe_point();
        let v2 = self.pop_stack(active)?;
        let v1 = self.pop_stack(active)?;

        fn non_reference(v: &Value) -> bool {
            matches!(
                v,
                Value::Nil | Value::Undef | Value::Bool(_) | Value::Fixnum(_) | Value::Symbol(_)
            )
        }

        let fast = match (&op, &v1, &v2) {
            (MetaOp::Plus, Value::Fixnum(a), Value::Fixnum(b)) => {
                a.checked_add(*b).map(Value::Fixnum)
            }
            (MetaOp::Minus, Value::Fixnum(a), Value::Fixnum(b)) => {
                a.checked_sub(*b).map(Value::Fixnum)
            }
            (MetaOp::Lt, Value::Fixnum(a), Value::Fixnum(b)) => Some(Value::Bool(a < b)),
            (MetaOp::Gt, Value::Fixnum(a), Value::Fixnum(b)) => Some(Value::Bool(a > b)),
            (MetaOp::Equal, a, b) if non_reference(a) && non_reference(b) => {
                Some(Value::Bool(a == b))
            }
            // Known semantics choice: the fast path negates identity
            // equality directly, so a redefined == is not consulted even
            // though != usually means !(a == b).
            (MetaOp::Nequal, a, b) if non_reference(a) && non_reference(b) => {
                Some(Value::Bool(a != b))
            }
            (MetaOp::Tequal, Value::Fixnum(_), Value::Fixnum(_))
            | (MetaOp::Tequal, Value::Symbol(_), Value::Symbol(_)) => Some(Value::Bool(v1 == v2)),
            _ => None,
        };

        if let Some(result) = fast {
            self.push_stack(active, result)?;
            return Ok(StepResult::Continue);
        }

        let name = match op {
            MetaOp::Plus => self.selectors.plus,
            MetaOp::Minus => self.selectors.minus,
            MetaOp::Equal => self.selectors.eq,
            MetaOp::Nequal => self.selectors.neq,
            MetaOp::Tequal => self.selectors.teq,
            MetaOp::Lt => self.selectors.lt,
            MetaOp::Gt => self.selectors.gt,
        };
        let mut args: Args = SmallVec::new();
        args.push(v2);
        self.send_message(
            Message {
                name,
                receiver: v1,
                args,
                block: Value::Nil,
                lookup_from: None,
                allow_private: false,
            },
            None,
        )
    }

    /// Idempotent create-or-reopen of a class or module under an
    /// enclosing namespace.
    fn open_namespace(
        &mut self,
        active: GcPtr<GcContext>,
        enclosing: GcPtr<GcModule>,
        name: Symbol,
        super_val: Option<Value>,
        is_class: bool,
    ) -> Result<StepResult, VmError> {
        let existing = self
            .heap
            .get_module(enclosing)
            .ok_or(VmError::DanglingPointer)?
            .constants
            .get(&name)
            .cloned();

        match existing {
            Some(Value::Module(ptr)) => {
                if is_class {
                    if let Some(Value::Module(wanted)) = &super_val {
                        let current = self
                            .heap
                            .get_module(ptr)
                            .ok_or(VmError::DanglingPointer)?
                            .superclass;
                        if current != Some(*wanted) {
                            let spelled = self.symbols.name(name).to_string();
                            return self.raise_named(
                                "TypeError",
                                format!("superclass mismatch for class {}", spelled),
                            );
                        }
                    }
                }
                self.push_stack(active, Value::Module(ptr))?;
                Ok(StepResult::Continue)
            }
            Some(other) => {
                let spelled = self.symbols.name(name).to_string();
                self.raise_named(
                    "TypeError",
                    format!("{} is not a class/module ({})", spelled, other.kind_name()),
                )
            }
            None => {
                let superclass = if is_class {
                    match super_val {
                        None | Some(Value::Nil) => Some(self.core.object),
                        Some(Value::Module(s)) => Some(s),
                        Some(other) => {
                            return self.raise_named(
                                "TypeError",
                                format!("superclass must be a Class ({})", other.kind_name()),
                            )
                        }
                    }
                } else {
                    None
                };
                let ptr = self.heap.alloc_module(name, superclass, is_class);
                self.heap.add_permanent_root(ptr.as_raw());
                self.modules.push(ptr);
                self.heap
                    .get_module_mut(enclosing)
                    .ok_or(VmError::DanglingPointer)?
                    .constants
                    .insert(name, Value::Module(ptr));
                self.dispatch_serial += 1;
                self.push_stack(active, Value::Module(ptr))?;
                Ok(StepResult::Continue)
            }
        }
    }

    // --- the dispatcher ---

    pub(crate) fn execute_step(&mut self) -> Result<StepResult, VmError> {
        let active = self.require_active()?;
        let (instr, code) = {
            let ctx = self.ctx(active)?;
            if ctx.ip >= ctx.code.code.len() {
                return Err(VmError::InvalidIp(ctx.ip));
            }
            (ctx.code.code[ctx.ip].clone(), Rc::clone(&ctx.code))
        };
        self.ctx_mut(active)?.ip += 1;

        macro_rules! pop {
            () => {
                self.pop_stack(active)?
            };
        }
        macro_rules! push {
            ($v:expr) => {{
                let v = $v;
                self.push_stack(active, v)?;
            }};
        }
        macro_rules! jump {
            ($target:expr) => {
                self.ctx_mut(active)?.ip = $target
            };
        }

        match instr {
            Instruction::Noop => {}

            // --- immediate pushes ---
            Instruction::PushInt(n) => push!(Value::Fixnum(n)),
            Instruction::MetaPushNeg1 => push!(Value::Fixnum(-1)),
            Instruction::MetaPush0 => push!(Value::Fixnum(0)),
            Instruction::MetaPush1 => push!(Value::Fixnum(1)),
            Instruction::MetaPush2 => push!(Value::Fixnum(2)),
            Instruction::PushNil => push!(Value::Nil),
            Instruction::PushTrue => push!(Value::Bool(true)),
            Instruction::PushFalse => push!(Value::Bool(false)),
            Instruction::PushUndef => push!(Value::Undef),
            Instruction::PushSelf => {
                let v = self.ctx(active)?.self_value.clone();
                push!(v);
            }
            Instruction::PushContext => push!(Value::Context(active)),
            Instruction::PushBlock => {
                let v = self.ctx(active)?.block.clone();
                push!(v);
            }
            Instruction::PushException => push!(self.current_exception.clone()),
            Instruction::ClearException => self.current_exception = Value::Nil,

            // --- literals ---
            Instruction::PushLiteral(idx) => {
                let value = match code.literals.get(idx as usize) {
                    Some(Literal::Value(v)) => v.clone(),
                    Some(Literal::String(s)) => Value::Str(self.heap.alloc_string(s.clone())),
                    Some(Literal::Code(c)) => Value::Code(Rc::clone(c)),
                    Some(Literal::Cell(cell)) => cell.borrow().clone(),
                    _ => {
                        return Err(VmError::InvalidLiteral {
                            index: idx as usize,
                            reason: "not a pushable literal".to_string(),
                        })
                    }
                };
                push!(value);
            }
            // Non-popping: the stored value remains the expression result.
            Instruction::SetLiteral(idx) => {
                let value = self.top_stack(active)?;
                match code.literals.get(idx as usize) {
                    // The pool is untraced, so only immediates may land in
                    // a cell.
                    Some(Literal::Cell(cell)) if value.is_immediate() => {
                        *cell.borrow_mut() = value;
                    }
                    Some(Literal::Cell(_)) => {
                        return self.raise_named(
                            "TypeError",
                            format!("cannot cache a {} in a literal slot", value.kind_name()),
                        )
                    }
                    _ => {
                        return Err(VmError::InvalidLiteral {
                            index: idx as usize,
                            reason: "not a writable literal slot".to_string(),
                        })
                    }
                }
            }

            // --- locals ---
            Instruction::PushLocal(i) => {
                let value = {
                    let ctx = self.ctx(active)?;
                    ctx.locals
                        .get(i as usize)
                        .cloned()
                        .ok_or(VmError::LocalOutOfRange {
                            index: i as usize,
                            count: ctx.locals.len(),
                        })?
                };
                push!(value);
            }
            Instruction::SetLocal(i) => {
                let value = pop!();
                {
                    let ctx = self.ctx_mut(active)?;
                    let count = ctx.locals.len();
                    *ctx.locals
                        .get_mut(i as usize)
                        .ok_or(VmError::LocalOutOfRange {
                            index: i as usize,
                            count,
                        })? = value.clone();
                }
                push!(value);
            }
            Instruction::PushLocalDepth(depth, i) => {
                let target = self.walk_creation(active, depth as usize)?;
                let value = {
                    let ctx = self.ctx(target)?;
                    ctx.locals
                        .get(i as usize)
                        .cloned()
                        .ok_or(VmError::LocalOutOfRange {
                            index: i as usize,
                            count: ctx.locals.len(),
                        })?
                };
                push!(value);
            }
            Instruction::SetLocalDepth(depth, i) => {
                let value = pop!();
                let target = self.walk_creation(active, depth as usize)?;
                {
                    let ctx = self.ctx_mut(target)?;
                    let count = ctx.locals.len();
                    *ctx.locals
                        .get_mut(i as usize)
                        .ok_or(VmError::LocalOutOfRange {
                            index: i as usize,
                            count,
                        })? = value.clone();
                }
                push!(value);
            }

            // --- instance state ---
            Instruction::PushIvar(idx) => {
                let name = self.literal_symbol(&code, idx)?;
                let receiver = self.ctx(active)?.self_value.clone();
                let value = match receiver {
                    Value::Instance(ptr) => self
                        .heap
                        .get_instance(ptr)
                        .ok_or(VmError::DanglingPointer)?
                        .ivars
                        .get(&name)
                        .cloned()
                        .unwrap_or(Value::Nil),
                    _ => Value::Nil,
                };
                push!(value);
            }
            Instruction::SetIvar(idx) => {
                let name = self.literal_symbol(&code, idx)?;
                let value = pop!();
                let receiver = self.ctx(active)?.self_value.clone();
                match receiver {
                    Value::Instance(ptr) => {
                        self.heap
                            .get_instance_mut(ptr)
                            .ok_or(VmError::DanglingPointer)?
                            .ivars
                            .insert(name, value.clone());
                    }
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("cannot set instance variable on {}", other.kind_name()),
                        )
                    }
                }
                push!(value);
            }
            Instruction::PushMyField(i) => {
                let receiver = self.ctx(active)?.self_value.clone();
                match receiver {
                    Value::Instance(ptr) => {
                        let value = {
                            let inst =
                                self.heap.get_instance(ptr).ok_or(VmError::DanglingPointer)?;
                            inst.fields.get(i as usize).cloned().ok_or(
                                VmError::FieldOutOfRange {
                                    index: i as usize,
                                    count: inst.fields.len(),
                                },
                            )?
                        };
                        push!(value);
                    }
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("{} has no field storage", other.kind_name()),
                        )
                    }
                }
            }
            Instruction::StoreMyField(i) => {
                let value = pop!();
                let receiver = self.ctx(active)?.self_value.clone();
                match receiver {
                    Value::Instance(ptr) => {
                        let inst = self
                            .heap
                            .get_instance_mut(ptr)
                            .ok_or(VmError::DanglingPointer)?;
                        let count = inst.fields.len();
                        *inst
                            .fields
                            .get_mut(i as usize)
                            .ok_or(VmError::FieldOutOfRange {
                                index: i as usize,
                                count,
                            })? = value.clone();
                    }
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("{} has no field storage", other.kind_name()),
                        )
                    }
                }
                push!(value);
            }

            // --- raw stack manipulation ---
            Instruction::SwapStack => {
                let a = pop!();
                let b = pop!();
                push!(a);
                push!(b);
            }
            Instruction::DupTop => {
                let v = self.top_stack(active)?;
                push!(v);
            }
            Instruction::Pop => {
                pop!();
            }

            // --- control flow ---
            Instruction::Goto(target) => jump!(target),
            Instruction::GotoIfFalse(target) => {
                if !pop!().is_truthy() {
                    jump!(target);
                }
            }
            Instruction::GotoIfTrue(target) => {
                if pop!().is_truthy() {
                    jump!(target);
                }
            }
            Instruction::GotoIfDefined(target) => {
                if !matches!(pop!(), Value::Undef) {
                    jump!(target);
                }
            }

            // --- containers and casts ---
            Instruction::MakeArray(count) => {
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(pop!());
                }
                items.reverse();
                let arr = self.heap.alloc_array(items);
                push!(Value::Array(arr));
            }
            Instruction::CastArray => {
                let value = pop!();
                let result = match value {
                    Value::Array(_) => value,
                    Value::Tuple(ptr) => {
                        let fields = self
                            .heap
                            .get_tuple(ptr)
                            .ok_or(VmError::DanglingPointer)?
                            .fields
                            .clone();
                        Value::Array(self.heap.alloc_array(fields))
                    }
                    other => Value::Array(self.heap.alloc_array(vec![other])),
                };
                push!(result);
            }
            Instruction::CastTuple => {
                let value = pop!();
                let result = match value {
                    Value::Tuple(_) => value,
                    Value::Array(ptr) => {
                        let items = self
                            .heap
                            .get_array(ptr)
                            .ok_or(VmError::DanglingPointer)?
                            .items
                            .clone();
                        Value::Tuple(self.heap.alloc_tuple(items))
                    }
                    other => Value::Tuple(self.heap.alloc_tuple(vec![other])),
                };
                push!(result);
            }
            Instruction::CastForSingleBlockArg => {
                let value = pop!();
                let fields = match value {
                    Value::Tuple(ptr) => self
                        .heap
                        .get_tuple(ptr)
                        .ok_or(VmError::DanglingPointer)?
                        .fields
                        .clone(),
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("block arguments must arrive as a Tuple, got {}", other.kind_name()),
                        )
                    }
                };
                let result = match fields.len() {
                    0 => Value::Nil,
                    1 => fields.into_iter().next().unwrap_or(Value::Nil),
                    _ => Value::Array(self.heap.alloc_array(fields)),
                };
                push!(result);
            }
            Instruction::CastForMultiBlockArg => {
                let top = self.top_stack(active)?;
                let tuple_ptr = match top {
                    Value::Tuple(ptr) => ptr,
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("block arguments must arrive as a Tuple, got {}", other.kind_name()),
                        )
                    }
                };
                let single_array = {
                    let tuple = self
                        .heap
                        .get_tuple(tuple_ptr)
                        .ok_or(VmError::DanglingPointer)?;
                    match tuple.fields.as_slice() {
                        [Value::Array(a)] => Some(*a),
                        _ => None,
                    }
                };
                if let Some(arr) = single_array {
                    let items = self
                        .heap
                        .get_array(arr)
                        .ok_or(VmError::DanglingPointer)?
                        .items
                        .clone();
                    let replacement = self.heap.alloc_tuple(items);
                    self.set_top(active, Value::Tuple(replacement))?;
                }
            }
            Instruction::ShiftTuple => {
                let value = pop!();
                let ptr = match value {
                    Value::Tuple(p) => p,
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("shift_tuple needs a Tuple, got {}", other.kind_name()),
                        )
                    }
                };
                let fields = self
                    .heap
                    .get_tuple(ptr)
                    .ok_or(VmError::DanglingPointer)?
                    .fields
                    .clone();
                if fields.is_empty() {
                    push!(Value::Tuple(ptr));
                    push!(Value::Nil);
                } else {
                    let first = fields[0].clone();
                    let rest = self.heap.alloc_tuple(fields[1..].to_vec());
                    push!(Value::Tuple(rest));
                    push!(first);
                }
            }

            // --- constants and namespaces ---
            Instruction::PushConst(idx) => {
                let name = self.literal_symbol(&code, idx)?;
                let mut found = None;
                for &module in code.scope.iter() {
                    if let Some(m) = self.heap.get_module(module) {
                        if let Some(v) = m.constants.get(&name) {
                            found = Some(v.clone());
                            break;
                        }
                    }
                }
                if found.is_none() {
                    if let Some(m) = self.heap.get_module(self.core.object) {
                        found = m.constants.get(&name).cloned();
                    }
                }
                match found {
                    Some(v) => push!(v),
                    None => {
                        let spelled = self.symbols.name(name).to_string();
                        return self
                            .raise_named("NameError", format!("uninitialized constant {}", spelled));
                    }
                }
            }
            Instruction::FindConst(idx) => {
                let name = self.literal_symbol(&code, idx)?;
                let base = match pop!() {
                    Value::Module(m) => m,
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("{} is not a class/module", other.kind_name()),
                        )
                    }
                };
                let mut cursor = Some(base);
                let mut found = None;
                while let Some(ptr) = cursor {
                    let module = self.heap.get_module(ptr).ok_or(VmError::DanglingPointer)?;
                    if let Some(v) = module.constants.get(&name) {
                        found = Some(v.clone());
                        break;
                    }
                    cursor = module.superclass;
                }
                match found {
                    Some(v) => push!(v),
                    None => {
                        let spelled = self.symbols.name(name).to_string();
                        return self
                            .raise_named("NameError", format!("uninitialized constant {}", spelled));
                    }
                }
            }
            Instruction::SetConst(idx) => {
                let name = self.literal_symbol(&code, idx)?;
                let value = pop!();
                let target = self.scope_module(&code);
                self.heap
                    .get_module_mut(target)
                    .ok_or(VmError::DanglingPointer)?
                    .constants
                    .insert(name, value.clone());
                push!(value);
            }
            Instruction::SetConstAt(idx) => {
                let name = self.literal_symbol(&code, idx)?;
                let target = match pop!() {
                    Value::Module(m) => m,
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("{} is not a class/module", other.kind_name()),
                        )
                    }
                };
                let value = pop!();
                self.heap
                    .get_module_mut(target)
                    .ok_or(VmError::DanglingPointer)?
                    .constants
                    .insert(name, value.clone());
                push!(value);
            }
            Instruction::PushCpathTop => push!(Value::Module(self.core.object)),

            Instruction::OpenClass(idx) => {
                let name = self.literal_symbol(&code, idx)?;
                let super_val = pop!();
                let enclosing = self.scope_module(&code);
                return self.open_namespace(active, enclosing, name, Some(super_val), true);
            }
            Instruction::OpenClassUnder(idx) => {
                let name = self.literal_symbol(&code, idx)?;
                let super_val = pop!();
                let enclosing = match pop!() {
                    Value::Module(m) => m,
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("{} is not a class/module", other.kind_name()),
                        )
                    }
                };
                return self.open_namespace(active, enclosing, name, Some(super_val), true);
            }
            Instruction::OpenModule(idx) => {
                let name = self.literal_symbol(&code, idx)?;
                let enclosing = self.scope_module(&code);
                return self.open_namespace(active, enclosing, name, None, false);
            }
            Instruction::OpenModuleUnder(idx) => {
                let name = self.literal_symbol(&code, idx)?;
                let enclosing = match pop!() {
                    Value::Module(m) => m,
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("{} is not a class/module", other.kind_name()),
                        )
                    }
                };
                return self.open_namespace(active, enclosing, name, None, false);
            }
            Instruction::OpenMetaclass => {
                let receiver = pop!();
                match self.ensure_metaclass(&receiver) {
                    Some(meta) => push!(Value::Module(meta)),
                    None => {
                        return self.raise_named(
                            "TypeError",
                            format!("{} cannot have a metaclass", receiver.kind_name()),
                        )
                    }
                }
            }
            Instruction::AddMethod(idx) => {
                let name = self.literal_symbol(&code, idx)?;
                let target = pop!();
                let method_val = pop!();
                let module_ptr = match target {
                    Value::Module(m) => m,
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("{} is not a class/module", other.kind_name()),
                        )
                    }
                };
                let method = match &method_val {
                    Value::Code(c) => Method::Bytecode(Rc::clone(c)),
                    Value::Native(n) => Method::Native(Rc::clone(n)),
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("{} is not executable", other.kind_name()),
                        )
                    }
                };
                self.heap
                    .get_module_mut(module_ptr)
                    .ok_or(VmError::DanglingPointer)?
                    .methods
                    .insert(name, MethodEntry::public(method));
                self.dispatch_serial += 1;
                push!(method_val);
            }
            Instruction::AttachMethod(idx) => {
                let name = self.literal_symbol(&code, idx)?;
                let receiver = pop!();
                let method_val = pop!();
                let method = match &method_val {
                    Value::Code(c) => Method::Bytecode(Rc::clone(c)),
                    Value::Native(n) => Method::Native(Rc::clone(n)),
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("{} is not executable", other.kind_name()),
                        )
                    }
                };
                let meta = match self.ensure_metaclass(&receiver) {
                    Some(meta) => meta,
                    None => {
                        return self.raise_named(
                            "TypeError",
                            format!("cannot attach a method to {}", receiver.kind_name()),
                        )
                    }
                };
                self.heap
                    .get_module_mut(meta)
                    .ok_or(VmError::DanglingPointer)?
                    .methods
                    .insert(name, MethodEntry::public(method));
                self.dispatch_serial += 1;
                push!(method_val);
            }

            // --- sends ---
            Instruction::SendMethod(idx) => {
                return self.do_send(active, &code, idx, 0, false, false, false)
            }
            Instruction::SendStack(idx, argc) => {
                return self.do_send(active, &code, idx, argc as usize, false, false, false)
            }
            Instruction::SendStackWithBlock(idx, argc) => {
                return self.do_send(active, &code, idx, argc as usize, true, false, false)
            }
            Instruction::SendStackWithSplat(idx, argc) => {
                return self.do_send(active, &code, idx, argc as usize, true, true, false)
            }
            Instruction::SendSuperStackWithBlock(idx, argc) => {
                return self.do_send(active, &code, idx, argc as usize, true, false, true)
            }
            Instruction::SendSuperStackWithSplat(idx, argc) => {
                return self.do_send(active, &code, idx, argc as usize, true, true, true)
            }
            Instruction::LocateMethod => {
                let include_private = pop!().is_truthy();
                let name = match pop!() {
                    Value::Symbol(s) => s,
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("method name must be a Symbol, got {}", other.kind_name()),
                        )
                    }
                };
                let receiver = pop!();
                let start = self.dispatch_class_of(&receiver);
                let result = match self.lookup_method(start, name) {
                    Some((entry, _))
                        if include_private || entry.visibility == Visibility::Public =>
                    {
                        match entry.method {
                            Method::Bytecode(c) => Value::Code(c),
                            Method::Native(n) => Value::Native(n),
                        }
                    }
                    _ => Value::Nil,
                };
                push!(result);
            }
            Instruction::SetCallFlags(flags) => self.call_flags = flags,
            Instruction::CheckSerial(idx, serial) => {
                let name = self.literal_symbol(&code, idx)?;
                let receiver = pop!();
                let start = self.dispatch_class_of(&receiver);
                let matches = match self.lookup_method(start, name) {
                    Some((entry, _)) => match entry.method {
                        Method::Bytecode(c) => c.serial == serial,
                        Method::Native(_) => false,
                    },
                    None => false,
                };
                push!(Value::Bool(matches));
            }

            // --- fast-path operators ---
            Instruction::MetaSendOpPlus => return self.meta_binary(active, MetaOp::Plus),
            Instruction::MetaSendOpMinus => return self.meta_binary(active, MetaOp::Minus),
            Instruction::MetaSendOpEqual => return self.meta_binary(active, MetaOp::Equal),
            Instruction::MetaSendOpNequal => return self.meta_binary(active, MetaOp::Nequal),
            Instruction::MetaSendOpTequal => return self.meta_binary(active, MetaOp::Tequal),
            Instruction::MetaSendOpLt => return self.meta_binary(active, MetaOp::Lt),
            Instruction::MetaSendOpGt => return self.meta_binary(active, MetaOp::Gt),
            Instruction::MetaSendCall(argc) => {
                self.safe_point();
                let mut args: Args = SmallVec::new();
                for _ in 0..argc {
                    args.push(pop!());
                }
                args.reverse();
                let callable = pop!();
                return match callable {
                    Value::Block(env) => self.enter_block(env, args),
                    other => self.send_message(
                        Message {
                            name: self.selectors.call,
                            receiver: other,
                            args,
                            block: Value::Nil,
                            lookup_from: None,
                            allow_private: false,
                        },
                        None,
                    ),
                };
            }

            // --- returns and unwinding ---
            Instruction::Ret => {
                let value = pop!();
                let env = self.ctx(active)?.env;
                return Ok(match env {
                    Some(env_ptr) => {
                        let home = self
                            .heap
                            .get_block_env(env_ptr)
                            .ok_or(VmError::DanglingPointer)?
                            .home;
                        // A block can outlive its home method; once the
                        // home frame left the sender chain there is nothing
                        // to return from.
                        if !self.on_sender_chain(active, home)? {
                            return self.raise_named(
                                "LocalJumpError",
                                "unexpected return".to_string(),
                            );
                        }
                        StepResult::NonLocalReturn { home, value }
                    }
                    None => StepResult::Return(value),
                });
            }
            Instruction::SoftReturn => {
                let value = pop!();
                return Ok(StepResult::Return(value));
            }
            Instruction::RaiseExc => {
                let value = pop!();
                return Ok(StepResult::Raise(value));
            }
            Instruction::Halt => {
                let value = self.ctx_mut(active)?.stack.pop().unwrap_or(Value::Nil);
                return Ok(StepResult::Halt(value));
            }

            // --- predicates and misc ---
            Instruction::PassedArg(n) => {
                let argcount = self.ctx(active)?.argcount;
                push!(Value::Bool((n as usize) < argcount));
            }
            Instruction::PassedBlockarg(n) => {
                push!(Value::Bool(n as usize == self.blockargs));
            }
            Instruction::StringAppend => {
                let suffix = pop!();
                let target = pop!();
                let (sp, tp) = match (&suffix, &target) {
                    (Value::Str(s), Value::Str(t)) => (*s, *t),
                    _ => {
                        return self.raise_named(
                            "TypeError",
                            format!(
                                "cannot append {} to {}",
                                suffix.kind_name(),
                                target.kind_name()
                            ),
                        )
                    }
                };
                let data = self
                    .heap
                    .get_string(sp)
                    .ok_or(VmError::DanglingPointer)?
                    .data
                    .clone();
                self.heap
                    .get_string_mut(tp)
                    .ok_or(VmError::DanglingPointer)?
                    .data
                    .push_str(&data);
                push!(target);
            }
            Instruction::StringDup => {
                let value = pop!();
                let ptr = match value {
                    Value::Str(p) => p,
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("string_dup needs a String, got {}", other.kind_name()),
                        )
                    }
                };
                let data = self
                    .heap
                    .get_string(ptr)
                    .ok_or(VmError::DanglingPointer)?
                    .data
                    .clone();
                let copy = self.heap.alloc_string(data);
                push!(Value::Str(copy));
            }
            Instruction::CreateBlock(idx) => {
                let block_code = Self::literal_code(&code, idx)?;
                let home = match self.ctx(active)?.env {
                    Some(env_ptr) => {
                        self.heap
                            .get_block_env(env_ptr)
                            .ok_or(VmError::DanglingPointer)?
                            .home
                    }
                    None => active,
                };
                let env = self.heap.alloc_block_env(block_code, home, active);
                push!(Value::Block(env));
            }
            Instruction::KindOf => {
                let class = match pop!() {
                    Value::Module(m) => m,
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("{} is not a class/module", other.kind_name()),
                        )
                    }
                };
                let value = pop!();
                push!(Value::Bool(self.is_kind_of(&value, class)));
            }
            Instruction::InstanceOf => {
                let class = match pop!() {
                    Value::Module(m) => m,
                    other => {
                        return self.raise_named(
                            "TypeError",
                            format!("{} is not a class/module", other.kind_name()),
                        )
                    }
                };
                let value = pop!();
                push!(Value::Bool(self.class_of(&value).ptr_eq(&class)));
            }
            Instruction::IsFixnum => {
                let v = pop!();
                push!(Value::Bool(matches!(v, Value::Fixnum(_))));
            }
            Instruction::IsSymbol => {
                let v = pop!();
                push!(Value::Bool(matches!(v, Value::Symbol(_))));
            }
            Instruction::IsNil => {
                let v = pop!();
                push!(Value::Bool(matches!(v, Value::Nil)));
            }
            Instruction::PushClass => {
                let v = pop!();
                push!(Value::Module(self.class_of(&v)));
            }
            Instruction::Equal => {
                let v2 = pop!();
                let v1 = pop!();
                push!(Value::Bool(v1 == v2));
            }
            Instruction::YieldDebugger => {
                let mut debugger = self.debugger.take().ok_or(VmError::NoDebugger)?;
                {
                    let ctx = self.ctx_mut(active)?;
                    debugger.on_yield(DebugView {
                        ip: &mut ctx.ip,
                        stack: &mut ctx.stack,
                        locals: &mut ctx.locals,
                    });
                }
                self.debugger = Some(debugger);
            }
        }

        Ok(StepResult::Continue)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
