//! Resume, yield, continuations and coroutine lifecycle

mod common;

use common::*;
use coyote_runtime::{
    Continuation, CoroutineStatus, DebugEvent, Hook, HookMask, KContext, Object, Status, Value,
    Vm, VmLimits, VmResult, MULTRET,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn gen(vm: &mut Vm) -> VmResult<usize> {
    vm.push("x");
    Err(vm.yield_k(1, Some(Continuation::new(gen_k, 1))))
}

fn gen_k(vm: &mut Vm, status: Status, ctx: KContext) -> VmResult<usize> {
    record(format!("k{} {:?} got {}", ctx, status, vm.value_at(-1)));
    vm.push("done");
    Ok(1)
}

fn yielder(vm: &mut Vm) -> VmResult<usize> {
    vm.push("y");
    Err(vm.coroutine_yield(1))
}

fn calls_yielder(vm: &mut Vm) -> VmResult<usize> {
    vm.push(native(yielder));
    vm.call(0, 0)?;
    Ok(0)
}

fn pair_then_three(vm: &mut Vm) -> VmResult<usize> {
    vm.push(1i64);
    vm.push(2i64);
    Err(vm.yield_k(2, Some(Continuation::new(three_k, 0))))
}

fn three_k(vm: &mut Vm, _status: Status, _ctx: KContext) -> VmResult<usize> {
    vm.push(3i64);
    Ok(1)
}

fn guard_twice(vm: &mut Vm) -> VmResult<usize> {
    record(format!("body yieldable {}", vm.is_yieldable()));
    vm.push(native(guard_once));
    let status = vm.pcall(0, 1, 0);
    record(format!("outer {:?} {}", status, vm.value_at(-1)));
    Ok(1)
}

fn guard_once(vm: &mut Vm) -> VmResult<usize> {
    record(format!("inner yieldable {}", vm.is_yieldable()));
    vm.push(native(calls_yielder));
    let status = vm.pcall(0, 1, 0);
    record(format!("inner {:?}", status));
    Ok(1)
}

fn oops(vm: &mut Vm) -> VmResult<usize> {
    Err(vm.run_error("oops"))
}

fn sum_args(vm: &mut Vm) -> VmResult<usize> {
    let total: i64 = (1..=vm.get_top() as i32)
        .filter_map(|i| vm.value_at(i).as_integer())
        .sum();
    vm.push(total);
    Ok(1)
}

fn yield_close(vm: &mut Vm) -> VmResult<usize> {
    record(format!("close:{}", vm.value_at(2)));
    Err(vm.yield_k(0, Some(Continuation::new(close_k, 0))))
}

fn close_k(_vm: &mut Vm, _status: Status, _ctx: KContext) -> VmResult<usize> {
    record("close resumed");
    Ok(0)
}

fn inner_failing(vm: &mut Vm) -> VmResult<usize> {
    vm.push(Value::object(
        Object::new("yclose").with_close(native(yield_close)),
    ));
    vm.to_close(-1)?;
    Err(vm.run_error("inner failed"))
}

fn guarded(vm: &mut Vm) -> VmResult<usize> {
    vm.push(native(inner_failing));
    let status = vm.pcall_k(0, MULTRET, 0, Some(Continuation::new(guarded_k, 0)))?;
    guarded_k(vm, status, 0)
}

fn guarded_k(vm: &mut Vm, status: Status, _ctx: KContext) -> VmResult<usize> {
    record(format!("k {:?} {}", status, vm.value_at(-1)));
    vm.push("done");
    Ok(1)
}

fn pending_close(vm: &mut Vm) -> VmResult<usize> {
    vm.push(closable("t"));
    vm.to_close(-1)?;
    Err(vm.coroutine_yield(0))
}

fn run_other(vm: &mut Vm) -> VmResult<usize> {
    let Some(Value::Thread(other)) = vm.upvalue(0) else {
        return Err(vm.run_error("missing thread"));
    };
    let (status, _) = vm.resume(other, 0);
    record(format!("inner resume {:?}", status));
    Ok(0)
}

fn observe(vm: &mut Vm) -> VmResult<usize> {
    let Some(Value::Thread(outer)) = vm.upvalue(0) else {
        return Err(vm.run_error("missing thread"));
    };
    let me = vm.current_thread();
    record(format!(
        "outer {:?}, self {:?}",
        vm.coroutine_status(outer),
        vm.coroutine_status(me)
    ));
    Ok(0)
}

fn nest(vm: &mut Vm) -> VmResult<usize> {
    let me = vm.current_thread();
    let co = vm.new_thread()?;
    vm.push(native(nest));
    vm.xmove(me, co, 1)?;
    let (status, _) = vm.resume(co, 0);
    if status != Status::Ok {
        vm.xmove(co, me, 1)?;
        return Err(vm.raise_error());
    }
    Ok(0)
}

// ============================================================================
// Resume and yield
// ============================================================================

#[test]
fn test_yield_and_continuation_round_trip() {
    let mut vm = new_vm();
    take_events();
    let co = coroutine(&mut vm, native(gen));

    assert_eq!(resume_with(&mut vm, co, &[]), (Status::Yield, 1));
    assert_eq!(take_results(&mut vm, co, 1), vec![Value::from("x")]);
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Suspended);

    assert_eq!(resume_with(&mut vm, co, &[Value::from("y")]), (Status::Ok, 1));
    assert_eq!(take_results(&mut vm, co, 1), vec![Value::from("done")]);
    assert_eq!(take_events(), vec!["k1 Yield got y"]);
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Dead);
}

#[test]
fn test_yield_pair_return_three_then_dead() {
    let mut vm = new_vm();
    let co = coroutine(&mut vm, native(pair_then_three));

    assert_eq!(resume_with(&mut vm, co, &[]), (Status::Yield, 2));
    assert_eq!(
        take_results(&mut vm, co, 2),
        vec![Value::Integer(1), Value::Integer(2)]
    );

    assert_eq!(resume_with(&mut vm, co, &[]), (Status::Ok, 1));
    assert_eq!(take_results(&mut vm, co, 1), vec![Value::Integer(3)]);
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Dead);

    assert_eq!(resume_with(&mut vm, co, &[]), (Status::ErrRun, 1));
    assert_eq!(
        take_results(&mut vm, co, 1),
        vec![Value::from("cannot resume dead coroutine")]
    );
}

#[test]
fn test_body_receives_resume_arguments() {
    let mut vm = new_vm();
    let co = coroutine(&mut vm, native(sum_args));
    let args = [Value::Integer(2), Value::Integer(3), Value::Integer(4)];
    assert_eq!(resume_with(&mut vm, co, &args), (Status::Ok, 1));
    assert_eq!(take_results(&mut vm, co, 1), vec![Value::Integer(9)]);
}

#[test]
fn test_resume_rejections() {
    let mut vm = new_vm();
    let co = coroutine(&mut vm, native(sum_args));
    assert_eq!(resume_with(&mut vm, co, &[]), (Status::Ok, 1));
    take_results(&mut vm, co, 1);

    assert_eq!(resume_with(&mut vm, co, &[]), (Status::ErrRun, 1));
    assert_eq!(
        take_results(&mut vm, co, 1),
        vec![Value::from("cannot resume dead coroutine")]
    );

    let main = vm.main_thread();
    assert_eq!(vm.resume(main, 0), (Status::ErrRun, 1));
    assert_eq!(
        vm.value_at(-1),
        Value::from("cannot resume non-suspended coroutine")
    );
}

#[test]
fn test_error_kills_coroutine() {
    let mut vm = new_vm();
    let co = coroutine(&mut vm, native(oops));
    assert_eq!(resume_with(&mut vm, co, &[]), (Status::ErrRun, 1));
    assert_eq!(take_results(&mut vm, co, 1), vec![Value::from("oops")]);
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Dead);
    assert_eq!(vm.current_thread(), vm.main_thread());

    assert_eq!(resume_with(&mut vm, co, &[]), (Status::ErrRun, 1));
}

#[test]
fn test_yield_across_native_call_fails() {
    let mut vm = new_vm();
    let co = coroutine(&mut vm, native(calls_yielder));
    assert_eq!(resume_with(&mut vm, co, &[]), (Status::ErrRun, 1));
    assert_eq!(
        take_results(&mut vm, co, 1),
        vec![Value::from("attempt to yield across a C-call boundary")]
    );
}

#[test]
fn test_yield_under_nested_pcalls_fails() {
    let mut vm = new_vm();
    take_events();
    let co = coroutine(&mut vm, native(guard_twice));

    assert_eq!(resume_with(&mut vm, co, &[]), (Status::Ok, 1));
    assert_eq!(
        take_results(&mut vm, co, 1),
        vec![Value::from("attempt to yield across a C-call boundary")]
    );
    assert_eq!(
        take_events(),
        vec![
            "body yieldable true",
            "inner yieldable false",
            "inner ErrRun",
            "outer Ok attempt to yield across a C-call boundary",
        ]
    );
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Dead);
}

#[test]
fn test_yield_from_main_fails() {
    let mut vm = new_vm();
    assert!(!vm.is_yieldable());
    vm.push(native(yielder));
    assert_eq!(vm.pcall(0, 0, 0), Status::ErrRun);
    assert_eq!(
        vm.value_at(-1),
        Value::from("attempt to yield from outside a coroutine")
    );
}

#[test]
fn test_hooks_cannot_yield() {
    let mut vm = new_vm();
    let hook: Hook = Arc::new(|vm: &mut Vm, _ev: &DebugEvent| {
        if vm.current_thread() != vm.main_thread() {
            return Err(vm.coroutine_yield(0));
        }
        Ok(())
    });
    vm.set_hook(Some(hook), HookMask::CALL, 0);
    // the new thread inherits the hook
    let co = coroutine(&mut vm, native(sum_args));
    assert_eq!(resume_with(&mut vm, co, &[]), (Status::ErrRun, 1));
    assert_eq!(
        take_results(&mut vm, co, 1),
        vec![Value::from("attempt to yield across a C-call boundary")]
    );
}

#[test]
fn test_resume_depth_is_limited() {
    init_tracing();
    let mut vm = Vm::with_limits(VmLimits {
        max_c_calls: 10,
        ..VmLimits::default()
    });
    let co = coroutine(&mut vm, native(nest));
    assert_eq!(resume_with(&mut vm, co, &[]), (Status::ErrRun, 1));
    assert_eq!(
        take_results(&mut vm, co, 1),
        vec![Value::from("C stack overflow")]
    );
    assert_eq!(vm.c_call_depth(), 0);
}

// ============================================================================
// Recovery inside coroutines
// ============================================================================

#[test]
fn test_pcall_k_recovers_through_yielding_finalizer() {
    let mut vm = new_vm();
    take_events();
    let co = coroutine(&mut vm, native(guarded));

    // the close handler yields while the error is being recovered
    assert_eq!(resume_with(&mut vm, co, &[]), (Status::Yield, 0));
    assert_eq!(take_events(), vec!["close:inner failed"]);

    assert_eq!(resume_with(&mut vm, co, &[]), (Status::Ok, 1));
    assert_eq!(take_results(&mut vm, co, 1), vec![Value::from("done")]);
    assert_eq!(
        take_events(),
        vec!["close resumed", "k ErrRun inner failed"]
    );
}

#[test]
fn test_close_suspended_coroutine_runs_finalizers() {
    let mut vm = new_vm();
    take_events();
    let co = coroutine(&mut vm, native(pending_close));
    assert_eq!(resume_with(&mut vm, co, &[]), (Status::Yield, 0));

    assert_eq!(vm.close_thread(co).unwrap(), Status::Ok);
    assert_eq!(take_events(), vec!["t"]);
    assert_eq!(vm.coroutine_status(co), CoroutineStatus::Dead);
}

#[test]
fn test_close_dead_coroutine_reports_its_error() {
    let mut vm = new_vm();
    let co = coroutine(&mut vm, native(oops));
    assert_eq!(resume_with(&mut vm, co, &[]), (Status::ErrRun, 1));
    assert_eq!(vm.close_thread(co).unwrap(), Status::ErrRun);
    assert_eq!(vm.thread(co).stack().get(1), &Value::from("oops"));
}

#[test]
fn test_resumer_is_normal_while_other_runs() {
    let mut vm = new_vm();
    take_events();
    let inner = vm.new_thread().unwrap();
    let outer = coroutine(
        &mut vm,
        Value::native_closure(run_other, vec![Value::Thread(inner)]),
    );
    vm.push(Value::native_closure(observe, vec![Value::Thread(outer)]));
    vm.xmove(vm.main_thread(), inner, 1).unwrap();

    assert_eq!(resume_with(&mut vm, outer, &[]), (Status::Ok, 0));
    assert_eq!(
        take_events(),
        vec!["outer Normal, self Running", "inner resume Ok"]
    );
}

// ============================================================================
// Interpreted frames
// ============================================================================

#[test]
fn test_interpreted_coroutine_preempted() {
    let mut vm = new_vm();
    let body = closure(
        "preempted",
        0,
        4,
        vec![
            op(LOADI, 0, 1, 0),
            op(PREEMPT, 0, 0, 0),
            op(LOADI, 1, 2, 0),
            op(RETURN, 0, 3, 0),
        ],
        vec![],
    );
    let co = coroutine(&mut vm, body);
    assert_eq!(resume_with(&mut vm, co, &[]), (Status::Yield, 0));
    assert_eq!(resume_with(&mut vm, co, &[]), (Status::Ok, 2));
    assert_eq!(
        take_results(&mut vm, co, 2),
        vec![Value::Integer(1), Value::Integer(2)]
    );
}

#[test]
fn test_interpreted_caller_of_yielding_native() {
    let mut vm = new_vm();
    let body = closure(
        "caller",
        0,
        4,
        vec![
            op(LOADK, 0, 0, 0),
            op(CALL, 0, 1, 2),
            op(RETURN, 0, 2, 0),
        ],
        vec![native(yielder)],
    );
    let co = coroutine(&mut vm, body);
    assert_eq!(resume_with(&mut vm, co, &[]), (Status::Yield, 1));
    assert_eq!(take_results(&mut vm, co, 1), vec![Value::from("y")]);

    // the resume argument becomes the call's result
    assert_eq!(resume_with(&mut vm, co, &[Value::Integer(9)]), (Status::Ok, 1));
    assert_eq!(take_results(&mut vm, co, 1), vec![Value::Integer(9)]);
}
