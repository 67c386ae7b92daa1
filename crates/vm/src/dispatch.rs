//! Message dispatch: class resolution, method lookup along ancestry
//! chains, inline-cache validation, callee frame construction and the
//! `method_missing` escalation path.
//!
//! A send resolves its lookup-begin class (the receiver's dispatch class,
//! or an explicit superclass for `super` forms), consults the send site's
//! monomorphic cache, walks the ancestry on a miss, and either invokes a
//! native directly or activates a new execution context for bytecode.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::code::{CompiledCode, InlineCache, Method, MethodEntry, SendSite, Visibility};
use crate::gc::{GcBlockEnv, GcContext, GcModule, GcPtr};
use crate::symbol::Symbol;
use crate::value::{Value, VmError};
use crate::vm::{StepResult, Vm, MAX_CALL_DEPTH};

/// Argument buffer for one send. Small sends stay off the Rust heap.
pub type Args = SmallVec<[Value; 8]>;

/// Everything needed to resolve and invoke one message.
pub struct Message {
    pub name: Symbol,
    pub receiver: Value,
    pub args: Args,
    pub block: Value,
    /// Lookup-begin override for `super` sends.
    pub lookup_from: Option<GcPtr<GcModule>>,
    /// Whether private methods are visible to this call site.
    pub allow_private: bool,
}

impl Vm {
    /// The class of a value, ignoring singleton methods.
    pub fn class_of(&self, value: &Value) -> GcPtr<GcModule> {
        match value {
            Value::Nil => self.core.nil_class,
            Value::Undef => self.core.object,
            Value::Bool(true) => self.core.true_class,
            Value::Bool(false) => self.core.false_class,
            Value::Fixnum(_) => self.core.fixnum,
            Value::Symbol(_) => self.core.symbol,
            Value::Tuple(_) => self.core.tuple,
            Value::Array(_) => self.core.array,
            Value::Str(_) => self.core.string,
            Value::Instance(ptr) => self
                .heap
                .get_instance(*ptr)
                .map(|i| i.class)
                .unwrap_or(self.core.object),
            Value::Module(ptr) => match self.heap.get_module(*ptr) {
                Some(m) if m.is_class => self.core.class,
                _ => self.core.module,
            },
            Value::Exception(ptr) => self
                .heap
                .get_exception(*ptr)
                .and_then(|e| e.class)
                .unwrap_or(self.core.exception),
            Value::Block(_) => self.core.block_env,
            Value::Context(_) => self.core.context,
            Value::Code(_) | Value::Native(_) => self.core.compiled_code,
        }
    }

    /// The class method lookup begins from: the receiver's metaclass when
    /// it has singleton methods, otherwise its class.
    pub fn dispatch_class_of(&self, value: &Value) -> GcPtr<GcModule> {
        match value {
            Value::Instance(ptr) => self
                .heap
                .get_instance(*ptr)
                .and_then(|i| i.metaclass)
                .unwrap_or_else(|| self.class_of(value)),
            Value::Module(ptr) => self
                .heap
                .get_module(*ptr)
                .and_then(|m| m.metaclass)
                .unwrap_or_else(|| self.class_of(value)),
            _ => self.class_of(value),
        }
    }

    /// Ancestry test against a value's real class.
    pub fn is_kind_of(&self, value: &Value, class: GcPtr<GcModule>) -> bool {
        let mut cur = Some(self.class_of(value));
        while let Some(ptr) = cur {
            if ptr.ptr_eq(&class) {
                return true;
            }
            cur = self.heap.get_module(ptr).and_then(|m| m.superclass);
        }
        false
    }

    /// Walk the ancestry chain for the first table containing `name`.
    pub fn lookup_method(
        &self,
        start: GcPtr<GcModule>,
        name: Symbol,
    ) -> Option<(MethodEntry, GcPtr<GcModule>)> {
        let mut cur = Some(start);
        while let Some(ptr) = cur {
            let module = self.heap.get_module(ptr)?;
            if let Some(entry) = module.methods.get(&name) {
                return Some((entry.clone(), ptr));
            }
            cur = module.superclass;
        }
        None
    }

    /// Resolve through the send site's inline cache. A cached entry is
    /// valid only for the same lookup-begin class and the current global
    /// method-mutation serial; anything else is a miss and the cache is
    /// refilled from a fresh walk.
    fn resolve(
        &self,
        site: Option<&SendSite>,
        start: GcPtr<GcModule>,
        name: Symbol,
    ) -> Option<MethodEntry> {
        let site = match site {
            Some(s) => s,
            None => return self.lookup_method(start, name).map(|(e, _)| e),
        };

        if let InlineCache::Cached {
            class,
            serial,
            method,
        } = &*site.cache.borrow()
        {
            if class.ptr_eq(&start) && *serial == self.dispatch_serial {
                site.hits.set(site.hits.get() + 1);
                return Some(method.clone());
            }
        }

        site.misses.set(site.misses.get() + 1);
        log::trace!("dispatch: cache miss for `{}`", self.symbols.name(name));
        let found = self.lookup_method(start, name);
        *site.cache.borrow_mut() = match &found {
            Some((entry, _)) => InlineCache::Cached {
                class: start,
                serial: self.dispatch_serial,
                method: entry.clone(),
            },
            None => InlineCache::Empty,
        };
        found.map(|(e, _)| e)
    }

    /// Resolve and invoke one message. On a miss the walk is retried for
    /// `method_missing` with the selector unshifted as a leading symbol
    /// argument; a double miss raises NoMethodError in the guest.
    pub(crate) fn send_message(
        &mut self,
        mut msg: Message,
        site: Option<&SendSite>,
    ) -> Result<StepResult, VmError> {
        let start = match msg.lookup_from {
            Some(m) => m,
            None => self.dispatch_class_of(&msg.receiver),
        };

        let mut entry = self.resolve(site, start, msg.name);
        if let Some(e) = &entry {
            if e.visibility == Visibility::Private && !msg.allow_private {
                entry = None;
            }
        }

        let entry = match entry {
            Some(e) => e,
            None => {
                // A block invoked by name behaves like meta_send_call.
                if let Value::Block(env) = msg.receiver {
                    if msg.name == self.selectors.call {
                        return self.enter_block(env, msg.args);
                    }
                }
                let mm_start = self.dispatch_class_of(&msg.receiver);
                match self.lookup_method(mm_start, self.selectors.method_missing) {
                    Some((e, _)) => {
                        msg.args.insert(0, Value::Symbol(msg.name));
                        e
                    }
                    None => {
                        let name = self.symbols.name(msg.name).to_string();
                        return self.raise_named(
                            "NoMethodError",
                            format!(
                                "undefined method `{}` for {}",
                                name,
                                msg.receiver.kind_name()
                            ),
                        );
                    }
                }
            }
        };

        match entry.method {
            Method::Native(native) => {
                if msg.args.len() != native.arity {
                    return self.raise_named(
                        "ArgumentError",
                        format!(
                            "wrong number of arguments (given {}, expected {})",
                            msg.args.len(),
                            native.arity
                        ),
                    );
                }
                match (native.func)(&mut self.heap, msg.receiver.clone(), &msg.args) {
                    Ok(value) => {
                        self.push_on_active(value)?;
                        Ok(StepResult::Continue)
                    }
                    // Type mismatch inside a primitive surfaces to the
                    // guest; anything else broke the host contract.
                    Err(VmError::TypeError { expected, found }) => self.raise_named(
                        "TypeError",
                        format!("expected {}, got {}", expected, found),
                    ),
                    Err(e) => Err(e),
                }
            }
            Method::Bytecode(code) => self.activate(code, msg.receiver, msg.args, msg.block),
        }
    }

    /// Build and enter a method context for `code`.
    fn activate(
        &mut self,
        code: Rc<CompiledCode>,
        receiver: Value,
        args: Args,
        block: Value,
    ) -> Result<StepResult, VmError> {
        let locals = match self.bind_arguments(&code, &args) {
            Ok(locals) => locals,
            Err(msg) => return self.raise_named("ArgumentError", msg),
        };

        let depth = self.active_depth()? + 1;
        if depth > MAX_CALL_DEPTH {
            return self.raise_named("SystemStackError", "stack level too deep".to_string());
        }

        let ctx = GcContext {
            code: Rc::clone(&code),
            ip: 0,
            stack: Vec::with_capacity(code.stack_size),
            locals,
            self_value: receiver,
            block,
            argcount: args.len(),
            sender: self.active,
            env: None,
            depth,
        };
        Ok(StepResult::Enter(self.heap.alloc_context(ctx)))
    }

    /// Invoke a block environment. The callee is block-flavoured: its
    /// `self` and visible block come from the home context, and its
    /// arguments arrive as a single tuple for the prologue casts to
    /// destructure.
    pub(crate) fn enter_block(
        &mut self,
        env_ptr: GcPtr<GcBlockEnv>,
        args: Args,
    ) -> Result<StepResult, VmError> {
        let env = self
            .heap
            .get_block_env(env_ptr)
            .ok_or(VmError::DanglingPointer)?
            .clone();
        let (self_value, block) = {
            let home = self
                .heap
                .get_context(env.home)
                .ok_or(VmError::DanglingPointer)?;
            (home.self_value.clone(), home.block.clone())
        };

        let depth = self.active_depth()? + 1;
        if depth > MAX_CALL_DEPTH {
            return self.raise_named("SystemStackError", "stack level too deep".to_string());
        }

        let argcount = args.len();
        self.blockargs = argcount;
        let tuple = self.heap.alloc_tuple(args.into_vec());
        let mut stack = Vec::with_capacity(env.code.stack_size.max(1));
        stack.push(Value::Tuple(tuple));

        let ctx = GcContext {
            code: Rc::clone(&env.code),
            ip: 0,
            stack,
            locals: vec![Value::Nil; env.code.local_count],
            self_value,
            block,
            argcount,
            sender: self.active,
            env: Some(env_ptr),
            depth,
        };
        Ok(StepResult::Enter(self.heap.alloc_context(ctx)))
    }

    /// Transfer arguments into a fresh locals array: required first, then
    /// optional slots (unpassed ones seeded with the undefined sentinel so
    /// default-value prologues can test them), then the splat rest-array.
    pub(crate) fn bind_arguments(
        &mut self,
        code: &CompiledCode,
        args: &Args,
    ) -> Result<Vec<Value>, String> {
        if args.len() < code.required_args {
            return Err(format!(
                "wrong number of arguments (given {}, expected {})",
                args.len(),
                code.required_args
            ));
        }
        if args.len() > code.total_args && code.splat.is_none() {
            return Err(format!(
                "wrong number of arguments (given {}, expected {})",
                args.len(),
                code.total_args
            ));
        }

        let mut locals = vec![Value::Nil; code.local_count.max(code.total_args)];
        for (i, slot) in locals.iter_mut().enumerate().take(code.total_args) {
            *slot = if i < args.len() {
                args[i].clone()
            } else {
                Value::Undef
            };
        }

        if let Some(rest) = code.splat {
            let surplus: Vec<Value> = args.iter().skip(code.total_args).cloned().collect();
            let arr = self.heap.alloc_array(surplus);
            if rest >= locals.len() {
                locals.resize(rest + 1, Value::Nil);
            }
            locals[rest] = Value::Array(arr);
        }

        Ok(locals)
    }

    /// Find or create the singleton method holder for a value. Only
    /// modules and instances can carry one.
    pub(crate) fn ensure_metaclass(&mut self, value: &Value) -> Option<GcPtr<GcModule>> {
        match value {
            Value::Module(ptr) => {
                let (existing, name, parent) = {
                    let m = self.heap.get_module(*ptr)?;
                    let parent = if m.is_class {
                        self.core.class
                    } else {
                        self.core.module
                    };
                    (m.metaclass, m.name, parent)
                };
                if let Some(meta) = existing {
                    return Some(meta);
                }
                let meta = self.heap.alloc_module(name, Some(parent), true);
                self.heap.add_permanent_root(meta.as_raw());
                self.heap.get_module_mut(*ptr)?.metaclass = Some(meta);
                Some(meta)
            }
            Value::Instance(ptr) => {
                let (existing, class) = {
                    let i = self.heap.get_instance(*ptr)?;
                    (i.metaclass, i.class)
                };
                if let Some(meta) = existing {
                    return Some(meta);
                }
                let name = self.heap.get_module(class)?.name;
                let meta = self.heap.alloc_module(name, Some(class), true);
                self.heap.get_instance_mut(*ptr)?.metaclass = Some(meta);
                Some(meta)
            }
            _ => None,
        }
    }
}
