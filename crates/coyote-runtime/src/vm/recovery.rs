//! Protected execution and error propagation
//!
//! Errors travel as `Err(Throw)` through ordinary `?` returns. A recovery
//! point marks where an unwind stops: [`Vm::raw_run_protected`] pushes one,
//! runs a closure, and turns whatever comes back into a [`Status`]. The error
//! object itself stays on the value stack of the thread that raised it.

use super::stack::StackIndex;
use super::{ThreadId, Vm};
use crate::status::{Status, Throw, VmResult};
use crate::value::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Host callback run when an error escapes every recovery point.
/// The process is aborted right after it returns.
pub type PanicFn = Arc<dyn Fn(&mut Vm)>;

/// One active protected region of a thread.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecoveryPoint {
    pub(crate) status: Status,
}

impl Vm {
    /// Run `f` under a new recovery point of the current thread.
    ///
    /// Returns `Status::Ok` when `f` completes, otherwise the status it
    /// unwound with. The host-call counter is restored either way.
    pub fn raw_run_protected<F>(&mut self, f: F) -> Status
    where
        F: FnOnce(&mut Vm) -> VmResult<()>,
    {
        let id = self.current;
        let old_c_calls = self.thread(id).c_calls;
        self.thread_mut(id).recovery.push(RecoveryPoint { status: Status::Ok });

        let result = f(self);

        self.current = id;
        let th = self.thread_mut(id);
        let point = th.recovery.pop();
        th.c_calls = old_c_calls;
        match result {
            Ok(()) => point.map_or(Status::Ok, |p| p.status),
            Err(t) => t.status(),
        }
    }

    /// Start an unwind with `status`. The error object, if any, must already
    /// be on top of the stack.
    ///
    /// When the running thread has no recovery point the thread is reset and
    /// the error moves to its resumer (or the main thread). With no recovery
    /// point anywhere, the panic callback runs and the process aborts.
    pub fn throw(&mut self, status: Status) -> Throw {
        let id = self.current;
        if let Some(point) = self.thread_mut(id).recovery.last_mut() {
            point.status = status;
            return Throw::new(status);
        }

        let status = self.reset_thread(status);
        if status.is_error() {
            self.thread_mut(id).status = status;
        }
        let target = self
            .thread(id)
            .resumer
            .filter(|&r| self.has_recovery(r))
            .or_else(|| Some(self.main).filter(|&m| m != id && self.has_recovery(m)));

        if let Some(target) = target {
            let err = {
                let th = self.thread(id);
                th.stack.get(th.stack.top() - 1).clone()
            };
            let th = self.thread_mut(target);
            th.stack.push(err);
            if let Some(point) = th.recovery.last_mut() {
                point.status = status;
            }
            debug!(
                target: "coyote::recovery",
                from = %id,
                to = %target,
                %status,
                "error escaped thread without recovery point"
            );
            self.current = target;
            return Throw::new(status);
        }

        error!(target: "coyote::recovery", %status, "unprotected error");
        if let Some(panic) = self.panic.clone() {
            panic(self);
        }
        std::process::abort()
    }

    fn has_recovery(&self, id: ThreadId) -> bool {
        self.get_thread(id)
            .is_some_and(|t| !t.recovery.is_empty())
    }

    /// Install the callback for errors nobody catches.
    pub fn set_panic(&mut self, panic: Option<PanicFn>) -> Option<PanicFn> {
        std::mem::replace(&mut self.panic, panic)
    }

    /// Place the error object for `status` at `old_top` and make it the last value.
    pub(crate) fn set_error_obj(&mut self, status: Status, old_top: StackIndex) {
        let th = self.th();
        let obj = match status {
            Status::ErrMem => self.mem_err_msg.clone(),
            Status::ErrErr => self.err_err_msg.clone(),
            Status::Ok => Value::Nil,
            _ => {
                debug_assert!(status.is_error());
                th.stack.get(th.stack.top() - 1).clone()
            }
        };
        let th = self.th_mut();
        th.stack.set(old_top, obj);
        th.stack.set_top(old_top + 1);
    }

    /// Run the pending finalizers down to `level` until a pass completes.
    ///
    /// A failing finalizer is skipped on the next pass (it was already taken
    /// off the list) and its error becomes the status handed to the rest.
    pub(crate) fn close_protected(&mut self, level: StackIndex, mut status: Status) -> Status {
        let id = self.current;
        let old_ci = self.thread(id).frames.current_id();
        let old_allow_hook = self.thread(id).allow_hook;
        let mut attempts = 0u32;
        loop {
            let pass_status = status;
            let result = self.raw_run_protected(|vm| {
                vm.close_tbc(level, Some(pass_status), false).map(|_| ())
            });
            if result == Status::Ok {
                return status;
            }
            let th = self.thread_mut(id);
            th.frames.set_current(old_ci);
            th.allow_hook = old_allow_hook;
            status = result;
            attempts += 1;
            warn!(
                target: "coyote::recovery",
                %status,
                attempts,
                "finalizer raised while closing"
            );
            if let Some(limit) = self.limits.finalizer_retry_limit {
                if attempts >= limit {
                    let tbc = &mut self.thread_mut(id).tbc;
                    let dropped = tbc.iter().filter(|&&slot| slot >= level).count();
                    tbc.retain(|&slot| slot < level);
                    error!(
                        target: "coyote::recovery",
                        %status,
                        dropped,
                        "finalizer retry limit reached"
                    );
                    return status;
                }
            }
        }
    }

    /// Protected call of `f` with `errfunc` as message handler.
    ///
    /// On error the frame cursor and hook flag are restored, finalizers above
    /// `old_top` run, the error object lands at `old_top` and the stack is
    /// shrunk back.
    pub(crate) fn protected_call<F>(
        &mut self,
        f: F,
        old_top: StackIndex,
        errfunc: StackIndex,
    ) -> Status
    where
        F: FnOnce(&mut Vm) -> VmResult<()>,
    {
        let id = self.current;
        let th = self.thread_mut(id);
        let old_ci = th.frames.current_id();
        let old_allow_hook = th.allow_hook;
        let old_errfunc = th.errfunc;
        th.errfunc = errfunc;

        let mut status = self.raw_run_protected(f);

        if status != Status::Ok {
            let th = self.thread_mut(id);
            th.frames.set_current(old_ci);
            th.allow_hook = old_allow_hook;
            status = self.close_protected(old_top, status);
            self.set_error_obj(status, old_top);
            self.shrink_stack();
        }
        self.thread_mut(id).errfunc = old_errfunc;
        status
    }

    /// Raise the value on top of the stack as an error.
    ///
    /// The message handler, if one is installed, runs first and its result
    /// replaces the error object. Raising the preallocated memory message
    /// keeps its memory-error status.
    pub fn raise_error(&mut self) -> Throw {
        let th = self.th();
        let top = th.stack.top();
        let errfunc = th.errfunc;
        let is_mem_error = matches!(
            (th.stack.get(top - 1), &self.mem_err_msg),
            (Value::Str(raised), Value::Str(mem)) if Arc::ptr_eq(raised, mem)
        );
        if is_mem_error {
            return self.throw(Status::ErrMem);
        }

        if errfunc != 0 {
            let th = self.th_mut();
            let handler = th.stack.get(errfunc).clone();
            th.stack.open_slot(top - 1);
            th.stack.set(top - 1, handler);
            if let Err(t) = self.call_at_noyield(top - 1, 1) {
                return t;
            }
        }
        self.throw(Status::ErrRun)
    }

    /// Raise a runtime error with a string message.
    pub fn run_error(&mut self, msg: impl Into<String>) -> Throw {
        let msg = msg.into();
        debug!(target: "coyote::recovery", %msg, "runtime error");
        self.th_mut().stack.push(Value::from(msg));
        self.raise_error()
    }

    /// Enforce the host-call nesting limit.
    pub(crate) fn check_c_stack(&mut self) -> VmResult<()> {
        let depth = self.th().c_call_depth();
        let max = self.limits.max_c_calls;
        if depth == max {
            Err(self.run_error("C stack overflow"))
        } else if depth >= max / 10 * 11 {
            // error while handling stack error
            Err(self.throw(Status::ErrErr))
        } else {
            Ok(())
        }
    }

    /// Put the running thread back on its base frame, running its pending
    /// finalizers with `status`. Returns the resulting status.
    pub(crate) fn reset_thread(&mut self, status: Status) -> Status {
        let min_stack = self.limits.min_stack;
        let th = self.th_mut();
        th.frames.reset_to_base();
        th.stack.set(0, Value::Nil);
        let base = th.frames.current_mut();
        base.func = 0;
        base.status = super::frame::CallStatus::NATIVE;
        th.status = Status::Ok;
        th.errfunc = 0;

        let status = if status == Status::Yield {
            Status::Ok
        } else {
            status
        };
        let status = self.close_protected(1, status);
        if status != Status::Ok {
            self.set_error_obj(status, 1);
        } else {
            self.th_mut().stack.set_top(1);
        }

        let id = self.current;
        let th = self.th_mut();
        let top = th.stack.top();
        th.frames.current_mut().top = top + min_stack;
        // best effort: a stack that cannot shrink simply stays larger
        let _ = self.try_realloc_stack(id, top + min_stack);
        status
    }
}
