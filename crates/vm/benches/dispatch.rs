//! Benchmark for opcode dispatch and message-send throughput.
//!
//! Run with: cargo bench -p garnet-vm --bench dispatch
//!
//! Both workloads are hand-assembled so the numbers measure the
//! interpreter loop itself, not a compiler front end.

use std::rc::Rc;
use std::time::Instant;

use garnet_vm::{CompiledCode, Instruction as I, Method, MethodEntry, Value, Vm};

const ITERATIONS: i64 = 1_000_000;

/// Tight countdown loop: push/compare/branch/subtract per iteration,
/// all on fast paths.
fn bench_countdown() -> std::time::Duration {
    let mut vm = Vm::new();
    let mut main = CompiledCode::new(vm.symbols.intern("countdown"));
    main.local_count = 1;
    main.emit(I::PushInt(ITERATIONS));
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

    let code = Rc::new(main);
    let start = Instant::now();
    let result = vm.run_toplevel(code).unwrap();
    let elapsed = start.elapsed();
    assert_eq!(result, Value::Fixnum(0));
    elapsed
}

/// Send-heavy loop: one monomorphic bytecode-method send per iteration,
/// exercising the inline cache on every pass after the first.
fn bench_send_loop() -> std::time::Duration {
    let mut vm = Vm::new();

    let mut bump = CompiledCode::new(vm.symbols.intern("bump"));
    bump.required_args = 1;
    bump.total_args = 1;
    bump.local_count = 1;
    bump.emit(I::PushLocal(0));
    bump.emit(I::MetaPush1);
    bump.emit(I::MetaSendOpMinus);
    bump.emit(I::Ret);
    let object = vm.core.object;
    let sym = vm.symbols.intern("bump");
    vm.heap
        .get_module_mut(object)
        .unwrap()
        .methods
        .insert(sym, MethodEntry::public(Method::Bytecode(Rc::new(bump))));

    let mut main = CompiledCode::new(vm.symbols.intern("send_loop"));
    main.local_count = 1;
    let site = main.add_site(sym);
    main.emit(I::PushInt(ITERATIONS / 10));
    main.emit(I::SetLocal(0));
    main.emit(I::Pop);
    let top = main.emit(I::PushLocal(0));
    main.emit(I::MetaPush0);
    main.emit(I::MetaSendOpGt);
    let exit = main.emit(I::GotoIfFalse(0));
    main.emit(I::PushSelf);
    main.emit(I::PushLocal(0));
    main.emit(I::SendStack(site, 1));
    main.emit(I::SetLocal(0));
    main.emit(I::Pop);
    main.emit(I::Goto(top));
    let end = main.emit(I::PushLocal(0));
    main.emit(I::Ret);
    main.patch_goto(exit, end);

    let code = Rc::new(main);
    let start = Instant::now();
    let result = vm.run_toplevel(code).unwrap();
    let elapsed = start.elapsed();
    assert_eq!(result, Value::Fixnum(0));
    elapsed
}

fn main() {
    let countdown = bench_countdown();
    println!(
        "countdown: {} iterations in {:?} ({:.1} M ops/s)",
        ITERATIONS,
        countdown,
        ITERATIONS as f64 / countdown.as_secs_f64() / 1e6
    );

    let sends = ITERATIONS / 10;
    let send_loop = bench_send_loop();
    println!(
        "send loop: {} sends in {:?} ({:.1} M sends/s)",
        sends,
        send_loop,
        sends as f64 / send_loop.as_secs_f64() / 1e6
    );
}
