//! Closure and block-environment tests.
//!
//! These tests verify that:
//! 1. Blocks read and write enclosing locals through creation links
//! 2. `ret` from a block returns from the home method, skipping frames
//! 3. Blocks escape their defining activation and stay usable
//! 4. The argument-tuple prologue casts destructure call arguments
//! 5. `ret` from a block whose home frame already returned raises
//!    LocalJumpError instead of severing live frames

use std::rc::Rc;

use garnet_vm::{CompiledCode, Instruction as I, Method, MethodEntry, Value, Vm, VmError};

fn code(vm: &mut Vm, name: &str) -> CompiledCode {
    CompiledCode::new(vm.symbols.intern(name))
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

#[test]
fn test_counter_closure_mutates_captured_local() {
    let mut vm = Vm::new();

    // Block: outer_local += 1; return it.
    let mut block = code(&mut vm, "block");
    block.emit(I::Pop); // argument tuple
    block.emit(I::PushLocalDepth(1, 0));
    block.emit(I::MetaPush1);
    block.emit(I::MetaSendOpPlus);
    block.emit(I::SetLocalDepth(1, 0));
    block.emit(I::SoftReturn);

    // make_counter: local = 0; return the block.
    let mut maker = code(&mut vm, "make_counter");
    maker.local_count = 1;
    let block_idx = maker.add_code(Rc::new(block));
    maker.emit(I::MetaPush0);
    maker.emit(I::SetLocal(0));
    maker.emit(I::Pop);
    maker.emit(I::CreateBlock(block_idx));
    maker.emit(I::Ret);
    install_on_object(&mut vm, "make_counter", maker);

    let mut main = code(&mut vm, "main");
    main.local_count = 1;
    let site = main.add_site(vm.symbols.intern("make_counter"));
    main.emit(I::PushSelf);
    main.emit(I::SendStack(site, 0));
    main.emit(I::SetLocal(0));
    main.emit(I::Pop);
    main.emit(I::PushLocal(0));
    main.emit(I::MetaSendCall(0));
    main.emit(I::Pop);
    main.emit(I::PushLocal(0));
    main.emit(I::MetaSendCall(0));
    main.emit(I::Ret);

    // The captured local persists between calls: 1 then 2.
    let result = vm.run_toplevel(Rc::new(main)).unwrap();
    assert_eq!(result, Value::Fixnum(2));
}

#[test]
fn test_nested_blocks_walk_two_levels() {
    let mut vm = Vm::new();

    let mut inner = code(&mut vm, "inner");
    inner.emit(I::Pop);
    inner.emit(I::PushLocalDepth(2, 0));
    inner.emit(I::SoftReturn);

    let mut outer = code(&mut vm, "outer");
    let inner_idx = outer.add_code(Rc::new(inner));
    outer.emit(I::Pop);
    outer.emit(I::CreateBlock(inner_idx));
    outer.emit(I::MetaSendCall(0));
    outer.emit(I::SoftReturn);

    let mut method = code(&mut vm, "m");
    method.local_count = 1;
    let outer_idx = method.add_code(Rc::new(outer));
    method.emit(I::PushInt(9));
    method.emit(I::SetLocal(0));
    method.emit(I::Pop);
    method.emit(I::CreateBlock(outer_idx));
    method.emit(I::MetaSendCall(0));
    method.emit(I::Ret);

    let result = vm.run_code(Rc::new(method), Value::Nil, vec![]).unwrap();
    assert_eq!(result, Value::Fixnum(9));
}

#[test]
fn test_non_local_return_skips_intermediate_frames() {
    let mut vm = Vm::new();

    // invoke: yield; 111
    let mut invoke = code(&mut vm, "invoke");
    invoke.emit(I::PushBlock);
    invoke.emit(I::MetaSendCall(0));
    invoke.emit(I::Pop);
    invoke.emit(I::PushInt(111));
    invoke.emit(I::Ret);
    install_on_object(&mut vm, "invoke", invoke);

    // Block: return 222 (non-local, from `outer`).
    let mut block = code(&mut vm, "block");
    block.emit(I::Pop);
    block.emit(I::PushInt(222));
    block.emit(I::Ret);

    // outer: invoke { return 222 }; 333
    let mut outer = code(&mut vm, "outer");
    let block_idx = outer.add_code(Rc::new(block));
    let site = outer.add_site(vm.symbols.intern("invoke"));
    outer.emit(I::PushSelf);
    outer.emit(I::CreateBlock(block_idx));
    outer.emit(I::SendStackWithBlock(site, 0));
    outer.emit(I::Pop);
    outer.emit(I::PushInt(333));
    outer.emit(I::Ret);
    install_on_object(&mut vm, "outer", outer);

    let mut main = code(&mut vm, "main");
    let site = main.add_site(vm.symbols.intern("outer"));
    main.emit(I::PushSelf);
    main.emit(I::SendStack(site, 0));
    main.emit(I::Ret);

    // Neither invoke's 111 nor outer's 333 is reached.
    let result = vm.run_toplevel(Rc::new(main)).unwrap();
    assert_eq!(result, Value::Fixnum(222));
}

#[test]
fn test_escaped_block_ret_raises_local_jump_error() {
    let mut vm = Vm::new();

    let mut block = code(&mut vm, "block");
    block.emit(I::Pop);
    block.emit(I::PushInt(222));
    block.emit(I::Ret);

    let mut maker = code(&mut vm, "make_escape");
    let block_idx = maker.add_code(Rc::new(block));
    maker.emit(I::CreateBlock(block_idx));
    maker.emit(I::Ret);
    install_on_object(&mut vm, "make_escape", maker);

    let mut main = code(&mut vm, "main");
    let site = main.add_site(vm.symbols.intern("make_escape"));
    main.emit(I::PushSelf);
    main.emit(I::SendStack(site, 0));
    main.emit(I::MetaSendCall(0));
    main.emit(I::Ret);

    // The home frame is gone: returning through it is an error, not a
    // silent unwind.
    match vm.run_toplevel(Rc::new(main)) {
        Err(VmError::UncaughtException(msg)) => {
            assert!(msg.contains("LocalJumpError"), "got: {}", msg)
        }
        other => panic!("expected LocalJumpError, got {:?}", other),
    }
}

#[test]
fn test_escaped_block_ret_aborts_caller_and_is_rescuable() {
    let mut vm = Vm::new();

    let mut block = code(&mut vm, "block");
    block.emit(I::Pop);
    block.emit(I::PushInt(222));
    block.emit(I::Ret);

    let mut maker = code(&mut vm, "make_escape");
    let block_idx = maker.add_code(Rc::new(block));
    maker.emit(I::CreateBlock(block_idx));
    maker.emit(I::Ret);
    install_on_object(&mut vm, "make_escape", maker);

    // run_it invokes the stale block; its epilogue sets TOUCHED and
    // returns 111. Neither may happen.
    let touched_sym = vm.symbols.intern("TOUCHED");
    let mut helper = code(&mut vm, "run_it");
    helper.required_args = 1;
    helper.total_args = 1;
    helper.local_count = 1;
    let touched = helper.add_symbol(touched_sym);
    helper.emit(I::PushLocal(0));
    helper.emit(I::MetaSendCall(0));
    helper.emit(I::Pop);
    helper.emit(I::PushTrue);
    helper.emit(I::SetConst(touched));
    helper.emit(I::Pop);
    helper.emit(I::PushInt(111));
    helper.emit(I::Ret);
    install_on_object(&mut vm, "run_it", helper);

    let mut main = code(&mut vm, "main");
    main.local_count = 1;
    let make_site = main.add_site(vm.symbols.intern("make_escape"));
    let run_site = main.add_site(vm.symbols.intern("run_it"));
    main.emit(I::PushSelf);
    main.emit(I::SendStack(make_site, 0));
    main.emit(I::SetLocal(0));
    main.emit(I::Pop);
    main.emit(I::PushSelf);
    main.emit(I::PushLocal(0));
    let send_at = main.emit(I::SendStack(run_site, 1));
    main.emit(I::Ret);
    let handler = main.emit(I::PushException);
    main.emit(I::Ret);
    main.add_handler(send_at, send_at, handler);

    let exc = match vm.run_toplevel(Rc::new(main)).unwrap() {
        Value::Exception(p) => p,
        other => panic!("expected an exception, got {:?}", other),
    };
    let class = vm.heap.get_exception(exc).unwrap().class.unwrap();
    assert_eq!(
        vm.symbols.name(vm.heap.get_module(class).unwrap().name),
        "LocalJumpError"
    );
    // run_it was unwound before its epilogue ran.
    assert!(vm
        .heap
        .get_module(vm.core.object)
        .unwrap()
        .constants
        .get(&touched_sym)
        .is_none());
}

#[test]
fn test_block_sees_home_self() {
    let mut vm = Vm::new();

    // The block's self is the home method's self, not the caller's.
    let mut block = code(&mut vm, "block");
    block.emit(I::Pop);
    block.emit(I::PushSelf);
    block.emit(I::SoftReturn);

    let mut method = code(&mut vm, "m");
    let block_idx = method.add_code(Rc::new(block));
    method.emit(I::CreateBlock(block_idx));
    method.emit(I::MetaSendCall(0));
    method.emit(I::Ret);

    let result = vm
        .run_code(Rc::new(method), Value::Fixnum(31), vec![])
        .unwrap();
    assert_eq!(result, Value::Fixnum(31));
}

#[test]
fn test_multi_block_arg_flattens_single_array() {
    let mut vm = Vm::new();

    // Block |a, b| a + b, invoked with one array argument.
    let mut block = code(&mut vm, "block");
    block.emit(I::CastForMultiBlockArg);
    block.emit(I::ShiftTuple);
    block.emit(I::SwapStack);
    block.emit(I::ShiftTuple);
    block.emit(I::SwapStack);
    block.emit(I::Pop);
    block.emit(I::MetaSendOpPlus);
    block.emit(I::SoftReturn);

    let mut main = code(&mut vm, "main");
    let block_idx = main.add_code(Rc::new(block));
    main.emit(I::CreateBlock(block_idx));
    main.emit(I::PushInt(1));
    main.emit(I::PushInt(2));
    main.emit(I::MakeArray(2));
    main.emit(I::MetaSendCall(1));
    main.emit(I::Ret);

    let result = vm.run_toplevel(Rc::new(main)).unwrap();
    assert_eq!(result, Value::Fixnum(3));
}

#[test]
fn test_two_positional_block_args() {
    let mut vm = Vm::new();

    let mut block = code(&mut vm, "block");
    block.emit(I::CastForMultiBlockArg);
    block.emit(I::ShiftTuple);
    block.emit(I::SwapStack);
    block.emit(I::ShiftTuple);
    block.emit(I::SwapStack);
    block.emit(I::Pop);
    block.emit(I::MetaSendOpMinus);
    block.emit(I::SoftReturn);

    let mut main = code(&mut vm, "main");
    let block_idx = main.add_code(Rc::new(block));
    main.emit(I::CreateBlock(block_idx));
    main.emit(I::PushInt(50));
    main.emit(I::PushInt(2));
    main.emit(I::MetaSendCall(2));
    main.emit(I::Ret);

    let result = vm.run_toplevel(Rc::new(main)).unwrap();
    assert_eq!(result, Value::Fixnum(48));
}
