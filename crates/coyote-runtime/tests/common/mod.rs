//! Shared test utilities
//!
//! Provides a tiny register-machine dispatcher so interpreted closures can be
//! exercised, plus helpers for building functions, objects and coroutines.

#![allow(dead_code)]

use coyote_runtime::vm::Dispatcher;
use coyote_runtime::{FrameId, HookMask, NativeFn, Object, Proto, ThreadId, Value, Vm, VmResult};
use std::cell::RefCell;
use std::sync::{Arc, Once};

// ===== Instruction set =====
//
// One instruction per u32: opcode in the low byte, then operands A, B, C.
// Registers are numbered from the first slot above the function.

/// R[A] = B
pub const LOADI: u8 = 0;
/// R[A] = K[B]
pub const LOADK: u8 = 1;
/// R[A] = R[B]
pub const MOVE: u8 = 2;
/// R[A], ..., R[A+C-2] = R[A](R[A+1], ..., R[A+B-1]); B == 0: args up to top; C == 0: all results
pub const CALL: u8 = 3;
/// return R[A](R[A+1], ..., R[A+B-1])
pub const TAILCALL: u8 = 4;
/// return R[A], ..., R[A+B-2]; B == 0: up to top
pub const RETURN: u8 = 5;
/// mark R[A] to be closed
pub const TBC: u8 = 6;
/// yield at this instruction boundary
pub const PREEMPT: u8 = 7;

pub fn op(code: u8, a: u8, b: u8, c: u8) -> u32 {
    u32::from(code) | u32::from(a) << 8 | u32::from(b) << 16 | u32::from(c) << 24
}

fn decode(ins: u32) -> (u8, usize, usize, usize) {
    (
        (ins & 0xff) as u8,
        ((ins >> 8) & 0xff) as usize,
        ((ins >> 16) & 0xff) as usize,
        (ins >> 24) as usize,
    )
}

fn proto_of(vm: &Vm, ci: FrameId) -> Arc<Proto> {
    match vm.slot(vm.frame(ci).func) {
        Value::Closure(cl) => cl.proto.clone(),
        other => panic!("frame {} is not interpreted: {:?}", ci, other),
    }
}

/// Dispatcher for the instruction set above. Calls to interpreted closures
/// recurse into `execute`.
pub struct TestDispatcher;

impl Dispatcher for TestDispatcher {
    fn execute(&self, vm: &mut Vm, ci: FrameId) -> VmResult<()> {
        'entry: loop {
            if vm.frame(ci).saved_pc() == Some(0) {
                let top = vm.frame(ci).top;
                vm.set_stack_top(top);
                if vm.hook_mask().contains(HookMask::CALL) {
                    vm.hook_call(ci)?;
                }
            }
            loop {
                let proto = proto_of(vm, ci);
                let base = vm.frame(ci).func + 1;
                let pc = vm.frame(ci).saved_pc().unwrap_or(0);
                let (code, a, b, c) = decode(proto.code[pc]);
                vm.frame_mut(ci).set_saved_pc(pc + 1);
                match code {
                    LOADI => vm.set_slot(base + a, b as i64),
                    LOADK => vm.set_slot(base + a, proto.constants[b].clone()),
                    MOVE => {
                        let v = vm.slot(base + b).clone();
                        vm.set_slot(base + a, v);
                    }
                    CALL => {
                        let func = base + a;
                        if b != 0 {
                            vm.set_stack_top(func + b);
                        }
                        if let Some(callee) = vm.precall(func, c as i32 - 1)? {
                            self.execute(vm, callee)?;
                        }
                        if c != 0 {
                            let top = vm.frame(ci).top;
                            vm.set_stack_top(top);
                        }
                    }
                    TAILCALL => {
                        let func = base + a;
                        if b != 0 {
                            vm.set_stack_top(func + b);
                        }
                        let narg1 = vm.stack_top() - func;
                        let n = vm.pretailcall(ci, func, narg1, 0)?;
                        if n < 0 {
                            continue 'entry;
                        }
                        return vm.poscall(ci, n as usize);
                    }
                    RETURN => {
                        let first = base + a;
                        let n = if b == 0 { vm.stack_top() - first } else { b - 1 };
                        vm.set_stack_top(first + n);
                        vm.close_pending(base)?;
                        return vm.poscall(ci, n);
                    }
                    TBC => vm.new_tbc(base + a)?,
                    PREEMPT => return Err(vm.yield_k(0, None)),
                    other => panic!("bad opcode {}", other),
                }
            }
        }
    }

    fn finish_op(&self, vm: &mut Vm, ci: FrameId) -> VmResult<()> {
        let proto = proto_of(vm, ci);
        let pc = vm.frame(ci).saved_pc().unwrap_or(0);
        let (code, _, _, c) = decode(proto.code[pc - 1]);
        match code {
            CALL if c != 0 => {
                let top = vm.frame(ci).top;
                vm.set_stack_top(top);
            }
            // redo the return: the interrupted close was already taken off the list
            RETURN => vm.frame_mut(ci).set_saved_pc(pc - 1),
            _ => {}
        }
        Ok(())
    }
}

/// A VM with the test dispatcher installed.
pub fn new_vm() -> Vm {
    init_tracing();
    let mut vm = Vm::new();
    vm.set_dispatcher(Arc::new(TestDispatcher));
    vm
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Interpreted closure over `code`.
///
/// # Example
/// ```ignore
/// let f = closure("two", 0, 4, vec![op(LOADI, 0, 2, 0), op(RETURN, 0, 2, 0)], vec![]);
/// ```
pub fn closure(
    name: &str,
    num_params: usize,
    max_stack_size: usize,
    code: Vec<u32>,
    constants: Vec<Value>,
) -> Value {
    let mut proto = Proto::new(name);
    proto.num_params = num_params;
    proto.max_stack_size = max_stack_size;
    proto.code = code;
    proto.constants = constants;
    Value::closure(proto)
}

/// Object with a `__close` handler that records `tag` in the close log.
pub fn closable(tag: &str) -> Value {
    Value::object(
        Object::new(tag).with_close(Value::native_closure(log_close, vec![Value::from(tag)])),
    )
}

fn log_close(vm: &mut Vm) -> VmResult<usize> {
    let tag = vm.upvalue(0).unwrap_or_default();
    let err = vm.value_at(2);
    record(match err {
        Value::Nil => format!("{}", tag),
        err => format!("{}:{}", tag, err),
    });
    Ok(0)
}

thread_local! {
    static EVENTS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Append to this test thread's event log.
pub fn record(event: impl Into<String>) {
    EVENTS.with(|e| e.borrow_mut().push(event.into()));
}

/// Drain this test thread's event log.
pub fn take_events() -> Vec<String> {
    EVENTS.with(|e| std::mem::take(&mut *e.borrow_mut()))
}

/// A coroutine with `body` pushed and ready to resume.
pub fn coroutine(vm: &mut Vm, body: Value) -> ThreadId {
    let co = vm.new_thread().expect("thread");
    vm.push(body);
    vm.xmove(vm.main_thread(), co, 1).expect("xmove");
    co
}

/// Push `args` on `co` and resume it.
pub fn resume_with(vm: &mut Vm, co: ThreadId, args: &[Value]) -> (coyote_runtime::Status, usize) {
    for arg in args {
        vm.push_on(co, arg.clone());
    }
    vm.resume(co, args.len())
}

/// Pop the top `n` values of `co` into a vector, bottom first.
pub fn take_results(vm: &mut Vm, co: ThreadId, n: usize) -> Vec<Value> {
    let main = vm.main_thread();
    vm.xmove(co, main, n).expect("xmove");
    let values = (0..n).map(|i| vm.value_at(-(n as i32) + i as i32)).collect();
    vm.pop(n);
    values
}

/// Native function value.
pub fn native(f: NativeFn) -> Value {
    Value::native(f)
}
