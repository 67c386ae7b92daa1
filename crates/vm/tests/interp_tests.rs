//! End-to-end interpreter tests over hand-assembled bytecode.
//!
//! These tests verify that:
//! 1. Straight-line and branching programs compute correct results
//! 2. Message sends dispatch through the class hierarchy
//! 3. Exceptions unwind across frames to the right handler window
//! 4. Class/module definition opcodes build usable namespaces

use std::rc::Rc;

use garnet_vm::{CompiledCode, Instruction as I, Method, MethodEntry, Value, Vm, VmError};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn code(vm: &mut Vm, name: &str) -> CompiledCode {
    CompiledCode::new(vm.symbols.intern(name))
}

fn install(vm: &mut Vm, class_name: &str, method_name: &str, body: CompiledCode) {
    let object = vm.core.object;
    let class = vm.define_class(class_name, object);
    let sym = vm.symbols.intern(method_name);
    vm.heap
        .get_module_mut(class)
        .unwrap()
        .methods
        .insert(sym, MethodEntry::public(Method::Bytecode(Rc::new(body))));
    // Registering the class already bumped the dispatch serial, so any
    // stale caches are invalid.
}

fn install_on_object(vm: &mut Vm, method_name: &str, body: CompiledCode) {
    let object = vm.core.object;
    let sym = vm.symbols.intern(method_name);
    vm.heap
        .get_module_mut(object)
        .unwrap()
        .methods
        .insert(sym, MethodEntry::public(Method::Bytecode(Rc::new(body))));
}

// ============================================================================
// Loops and arithmetic
// ============================================================================

#[test]
fn test_countdown_loop() {
    init_logging();
    let mut vm = Vm::new();
    let mut main = code(&mut vm, "main");
    main.local_count = 1;
    main.emit(I::PushInt(1000));
    main.emit(I::SetLocal(0));
    main.emit(I::Pop);
    let top = main.emit(I::PushLocal(0));
    main.emit(I::MetaPush0);
    main.emit(I::MetaSendOpGt);
    let exit = main.emit(I::GotoIfFalse(0));
    main.emit(I::PushLocal(0));
    main.emit(I::MetaPush1);
    main.emit(I::MetaSendOpMinus);
    main.emit(I::SetLocal(0));
    main.emit(I::Pop);
    main.emit(I::Goto(top));
    let end = main.emit(I::PushLocal(0));
    main.emit(I::Ret);
    main.patch_goto(exit, end);

    let result = vm.run_toplevel(Rc::new(main)).unwrap();
    assert_eq!(result, Value::Fixnum(0));
}

#[test]
fn test_recursive_fibonacci() {
    init_logging();
    let mut vm = Vm::new();

    let mut fib = code(&mut vm, "fib");
    fib.required_args = 1;
    fib.total_args = 1;
    fib.local_count = 1;
    let fib_sym = vm.symbols.intern("fib");
    let site_a = fib.add_site(fib_sym);
    let site_b = fib.add_site(fib_sym);
    fib.emit(I::PushLocal(0));
    fib.emit(I::MetaPush2);
    fib.emit(I::MetaSendOpLt);
    let j = fib.emit(I::GotoIfFalse(0));
    fib.emit(I::PushLocal(0));
    fib.emit(I::Ret);
    let else_at = fib.emit(I::PushSelf);
    fib.emit(I::PushLocal(0));
    fib.emit(I::MetaPush1);
    fib.emit(I::MetaSendOpMinus);
    fib.emit(I::SendStack(site_a, 1));
    fib.emit(I::PushSelf);
    fib.emit(I::PushLocal(0));
    fib.emit(I::MetaPush2);
    fib.emit(I::MetaSendOpMinus);
    fib.emit(I::SendStack(site_b, 1));
    fib.emit(I::MetaSendOpPlus);
    fib.emit(I::Ret);
    fib.patch_goto(j, else_at);
    install_on_object(&mut vm, "fib", fib);

    let mut main = code(&mut vm, "main");
    let site = main.add_site(fib_sym);
    main.emit(I::PushSelf);
    main.emit(I::PushInt(15));
    main.emit(I::SendStack(site, 1));
    main.emit(I::Ret);

    let result = vm.run_toplevel(Rc::new(main)).unwrap();
    assert_eq!(result, Value::Fixnum(610));
}

// ============================================================================
// Objects and instance state
// ============================================================================

#[test]
fn test_counter_object_with_ivars() {
    init_logging();
    let mut vm = Vm::new();

    // inc: @n = (@n.nil? ? 0 : @n) + 1
    let mut inc = code(&mut vm, "inc");
    let n_idx = inc.add_symbol(vm.symbols.intern("@n"));
    inc.emit(I::PushIvar(n_idx));
    inc.emit(I::DupTop);
    inc.emit(I::IsNil);
    let j = inc.emit(I::GotoIfFalse(0));
    inc.emit(I::Pop);
    inc.emit(I::MetaPush0);
    let after = inc.emit(I::MetaPush1);
    inc.emit(I::MetaSendOpPlus);
    inc.emit(I::SetIvar(n_idx));
    inc.emit(I::Ret);
    inc.patch_goto(j, after);

    let mut value = code(&mut vm, "value");
    let n_idx2 = value.add_symbol(vm.symbols.intern("@n"));
    value.emit(I::PushIvar(n_idx2));
    value.emit(I::Ret);

    install(&mut vm, "Counter", "inc", inc);
    let counter = {
        let sym = vm.symbols.intern("Counter");
        match vm
            .heap
            .get_module(vm.core.object)
            .unwrap()
            .constants
            .get(&sym)
        {
            Some(Value::Module(p)) => *p,
            other => panic!("Counter not registered: {:?}", other),
        }
    };
    let sym = vm.symbols.intern("value");
    vm.heap
        .get_module_mut(counter)
        .unwrap()
        .methods
        .insert(sym, MethodEntry::public(Method::Bytecode(Rc::new(value))));

    let mut main = code(&mut vm, "main");
    let inc_site = main.add_site(vm.symbols.intern("inc"));
    let val_site = main.add_site(vm.symbols.intern("value"));
    for _ in 0..3 {
        main.emit(I::PushSelf);
        main.emit(I::SendStack(inc_site, 0));
        main.emit(I::Pop);
    }
    main.emit(I::PushSelf);
    main.emit(I::SendStack(val_site, 0));
    main.emit(I::Ret);

    let inst = vm.heap.alloc_instance(counter, 0);
    let result = vm
        .run_code(Rc::new(main), Value::Instance(inst), vec![])
        .unwrap();
    assert_eq!(result, Value::Fixnum(3));
}

// ============================================================================
// Exception handling
// ============================================================================

#[test]
fn test_nested_rescue_with_reraise() {
    init_logging();
    let mut vm = Vm::new();
    let mut main = code(&mut vm, "main");
    main.emit(I::PushInt(7));
    let raise_at = main.emit(I::RaiseExc);
    let inner = main.emit(I::PushException);
    let reraise_at = main.emit(I::RaiseExc);
    let outer = main.emit(I::PushException);
    main.emit(I::MetaPush1);
    main.emit(I::MetaSendOpPlus);
    main.emit(I::Ret);
    main.add_handler(0, reraise_at, outer);
    main.add_handler(raise_at, raise_at, inner); // inner, declared last

    let result = vm.run_toplevel(Rc::new(main)).unwrap();
    assert_eq!(result, Value::Fixnum(8));
}

#[test]
fn test_uncaught_exception_aborts_task() {
    init_logging();
    let mut vm = Vm::new();
    let mut main = code(&mut vm, "main");
    main.emit(I::PushInt(1));
    main.emit(I::RaiseExc);
    let err = vm.run_toplevel(Rc::new(main)).unwrap_err();
    assert!(matches!(err, VmError::UncaughtException(_)));
}

#[test]
fn test_handler_state_is_reset_on_entry() {
    // The operand stack is cleared before landing in a handler, whatever
    // garbage the failed region left behind.
    init_logging();
    let mut vm = Vm::new();
    let mut main = code(&mut vm, "main");
    main.emit(I::PushInt(1));
    main.emit(I::PushInt(2));
    main.emit(I::PushInt(3));
    let raise_at = main.emit(I::RaiseExc);
    let handler = main.emit(I::PushException);
    main.emit(I::Ret);
    main.add_handler(raise_at, raise_at, handler);
    // RaiseExc popped 3; the handler sees only the exception it pushes.
    let result = vm.run_toplevel(Rc::new(main)).unwrap();
    assert_eq!(result, Value::Fixnum(3));
    assert_eq!(vm.current_exception, Value::Fixnum(3));
}

// ============================================================================
// Namespaces
// ============================================================================

#[test]
fn test_module_scoped_constant() {
    init_logging();
    let mut vm = Vm::new();
    let mut main = code(&mut vm, "main");
    let m_idx = main.add_symbol(vm.symbols.intern("Config"));
    let k_idx = main.add_symbol(vm.symbols.intern("LIMIT"));
    main.emit(I::OpenModule(m_idx));
    main.emit(I::Pop);
    main.emit(I::PushInt(5));
    main.emit(I::PushCpathTop);
    main.emit(I::FindConst(m_idx));
    main.emit(I::SetConstAt(k_idx));
    main.emit(I::Pop);
    main.emit(I::PushCpathTop);
    main.emit(I::FindConst(m_idx));
    main.emit(I::FindConst(k_idx));
    main.emit(I::Ret);

    let result = vm.run_toplevel(Rc::new(main)).unwrap();
    assert_eq!(result, Value::Fixnum(5));

    // The constant lives in the module, not on Object.
    let k = vm.symbols.intern("LIMIT");
    assert!(vm
        .heap
        .get_module(vm.core.object)
        .unwrap()
        .constants
        .get(&k)
        .is_none());
}

#[test]
fn test_private_method_needs_call_flags() {
    init_logging();
    let mut vm = Vm::new();
    let mut body = code(&mut vm, "secret");
    body.emit(I::PushInt(77));
    body.emit(I::Ret);
    let object = vm.core.object;
    let sym = vm.symbols.intern("secret");
    vm.heap
        .get_module_mut(object)
        .unwrap()
        .methods
        .insert(sym, MethodEntry::private(Method::Bytecode(Rc::new(body))));

    // Ordinary send: the private entry is invisible.
    let mut main = code(&mut vm, "main");
    let site = main.add_site(sym);
    main.emit(I::PushSelf);
    main.emit(I::SendStack(site, 0));
    main.emit(I::Ret);
    assert!(vm.run_toplevel(Rc::new(main)).is_err());

    // With the privacy flag armed for the next send it resolves.
    let mut main = code(&mut vm, "main");
    let site = main.add_site(sym);
    main.emit(I::PushSelf);
    main.emit(I::SetCallFlags(1));
    main.emit(I::SendStack(site, 0));
    main.emit(I::Ret);
    assert_eq!(vm.run_toplevel(Rc::new(main)).unwrap(), Value::Fixnum(77));
}
