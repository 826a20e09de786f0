//! Calling functions
//!
//! Frame setup and teardown for native and interpreted callees, tail calls,
//! result adjustment, and the host-facing `call`/`pcall` family.
//!
//! ## Result counts
//!
//! A caller asks for `nresults` values: a fixed count, or [`MULTRET`] for
//! all of them. [`Vm::poscall`] moves the callee's results down to the
//! callee's function slot and pads or truncates them to that count.

use super::finalizer::{decode_nresults, has_to_close};
use super::frame::{CallFrame, CallStatus, FrameId, FrameKind, MULTRET};
use super::hook::{HookEvent, HookMask};
use super::stack::StackIndex;
use super::thread::NYCI;
use super::Vm;
use crate::status::{Status, VmResult};
use crate::value::{Continuation, NativeFn, Value};
use std::mem::size_of;
use tracing::trace;

impl Vm {
    /// Push a frame, reusing a pooled one when possible.
    fn next_frame(&mut self, frame: CallFrame) -> VmResult<FrameId> {
        let id = self.current;
        let (th, alloc) = self.thread_and_allocator(id);
        if th.frames.needs_allocation() {
            let n = th.frames.allocated();
            let unit = size_of::<CallFrame>();
            if alloc.realloc(n * unit, (n + 1) * unit).is_err() {
                return Err(self.throw(Status::ErrMem));
            }
        }
        Ok(th.frames.push(frame))
    }

    /// Replace the non-callable value at `func` with its `__call` handler,
    /// shifting the arguments up so the original value becomes the first one.
    pub(crate) fn try_func_tm(&mut self, func: StackIndex) -> VmResult<StackIndex> {
        self.check_stack(1)?;
        let callee = self.th().stack.get(func).clone();
        let Some(handler) = callee.call_handler() else {
            return Err(self.run_error(format!("attempt to call a {} value", callee.type_name())));
        };
        let stack = &mut self.th_mut().stack;
        stack.open_slot(func);
        stack.set(func, handler);
        Ok(func)
    }

    /// Prepare a call to the value at `func` with the arguments above it.
    ///
    /// Native callees run to completion here and `None` is returned.
    /// For interpreted callees a frame is set up and returned; running it is
    /// up to the caller (usually the dispatcher).
    pub fn precall(&mut self, mut func: StackIndex, nresults: i32) -> VmResult<Option<FrameId>> {
        loop {
            let callee = self.th().stack.get(func).clone();
            match callee {
                Value::LightNative(f) => {
                    self.precall_native(func, nresults, f)?;
                    return Ok(None);
                }
                Value::NativeClosure(c) => {
                    self.precall_native(func, nresults, c.func)?;
                    return Ok(None);
                }
                Value::Closure(cl) => {
                    let fsize = cl.proto.max_stack_size;
                    let nfix = cl.proto.num_params;
                    self.check_stack(fsize)?;
                    let narg = self.th().stack.top() - func - 1;
                    let id =
                        self.next_frame(CallFrame::interpreted(func, func + 1 + fsize, nresults))?;
                    let stack = &mut self.th_mut().stack;
                    for _ in narg..nfix {
                        stack.push(Value::Nil);
                    }
                    return Ok(Some(id));
                }
                _ => func = self.try_func_tm(func)?,
            }
        }
    }

    /// Run a native function in a new frame and finish the call.
    fn precall_native(&mut self, func: StackIndex, nresults: i32, f: NativeFn) -> VmResult<usize> {
        let min_stack = self.limits.min_stack;
        self.check_stack(min_stack)?;
        let top = self.th().stack.top();
        let ci = self.next_frame(CallFrame::native(func, top + min_stack, nresults))?;

        if self.th().hook_mask.contains(HookMask::CALL) {
            let narg = top - func - 1;
            self.hook(HookEvent::Call, -1, 1, narg)?;
        }

        let n = f(self)?;
        if n > self.th().frame_values() {
            return Err(self.run_error("native function returned more results than it pushed"));
        }
        self.poscall(ci, n)?;
        Ok(n)
    }

    /// Prepare a tail call from frame `ci` to the function at `func`.
    ///
    /// `narg1` counts the function plus its arguments. `delta` is how far
    /// the caller's function slot was moved up for vararg handling.
    ///
    /// Interpreted callees take over `ci` (tagged as a tail call) and `-1` is
    /// returned. Native callees run immediately and their result count is
    /// returned; the caller then finishes `ci` with those results.
    pub fn pretailcall(
        &mut self,
        ci: FrameId,
        mut func: StackIndex,
        mut narg1: usize,
        delta: usize,
    ) -> VmResult<i32> {
        loop {
            let callee = self.th().stack.get(func).clone();
            match callee {
                Value::LightNative(f) => {
                    return Ok(self.precall_native(func, MULTRET, f)? as i32);
                }
                Value::NativeClosure(c) => {
                    return Ok(self.precall_native(func, MULTRET, c.func)? as i32);
                }
                Value::Closure(cl) => {
                    let fsize = cl.proto.max_stack_size;
                    let nfix = cl.proto.num_params;
                    self.check_stack(fsize.saturating_sub(delta))?;
                    let th = self.th_mut();
                    let base = th.frames.get(ci).func - delta;
                    for i in 0..narg1 {
                        th.stack.copy(func + i, base + i);
                    }
                    while narg1 <= nfix {
                        th.stack.set(base + narg1, Value::Nil);
                        narg1 += 1;
                    }
                    let frame = th.frames.get_mut(ci);
                    frame.func = base;
                    frame.top = base + 1 + fsize;
                    frame.kind = FrameKind::Interpreted {
                        saved_pc: 0,
                        trap: false,
                        extra_args: 0,
                    };
                    frame.status.insert(CallStatus::TAIL);
                    th.stack.set_top(base + narg1);
                    return Ok(-1);
                }
                _ => {
                    func = self.try_func_tm(func)?;
                    narg1 += 1;
                }
            }
        }
    }

    /// Move `nres` results from the top of the stack to `res`, adjusted to `wanted`.
    fn move_results(&mut self, mut res: StackIndex, nres: usize, wanted: i32) -> VmResult<()> {
        let wanted = match wanted {
            0 => {
                self.th_mut().stack.set_top(res);
                return Ok(());
            }
            1 => {
                let stack = &mut self.th_mut().stack;
                if nres == 0 {
                    stack.set(res, Value::Nil);
                } else {
                    stack.copy(stack.top() - nres, res);
                }
                stack.set_top(res + 1);
                return Ok(());
            }
            MULTRET => nres,
            w if has_to_close(w) => {
                let ci = self.th().frames.current_id();
                {
                    let frame = self.th_mut().frames.get_mut(ci);
                    frame.status.insert(CallStatus::CLSRET);
                    frame.nres = nres;
                }
                res = self.close_tbc(res, None, true)?;
                self.th_mut()
                    .frames
                    .get_mut(ci)
                    .status
                    .remove(CallStatus::CLSRET);
                if !self.th().hook_mask.is_empty() {
                    self.ret_hook(ci, nres)?;
                }
                match decode_nresults(w) {
                    MULTRET => nres,
                    n => n as usize,
                }
            }
            w => w as usize,
        };

        if wanted > nres {
            self.check_stack(wanted - nres)?;
        }
        let stack = &mut self.th_mut().stack;
        let first = stack.top() - nres;
        let moved = nres.min(wanted);
        for i in 0..moved {
            stack.copy(first + i, res + i);
        }
        for i in moved..wanted {
            stack.set(res + i, Value::Nil);
        }
        stack.set_top(res + wanted);
        Ok(())
    }

    /// Finish frame `ci`, whose `nres` results are on top of the stack,
    /// and make its caller current.
    pub fn poscall(&mut self, ci: FrameId, nres: usize) -> VmResult<()> {
        let (wanted, func) = {
            let frame = self.th().frames.get(ci);
            (frame.nresults, frame.func)
        };
        if !self.th().hook_mask.is_empty() && !has_to_close(wanted) {
            self.ret_hook(ci, nres)?;
        }
        self.move_results(func, nres, wanted)?;
        let th = self.th_mut();
        debug_assert!(!th.frames.get(ci).status.intersects(
            CallStatus::HOOKED
                | CallStatus::YPCALL
                | CallStatus::FIN
                | CallStatus::TRAN
                | CallStatus::CLSRET
        ));
        th.frames.set_current(ci - 1);
        Ok(())
    }

    /// Hand an interpreted frame to the dispatcher.
    pub(crate) fn execute(&mut self, ci: FrameId) -> VmResult<()> {
        match self.dispatcher.clone() {
            Some(dispatcher) => dispatcher.execute(self, ci),
            None => Err(self.run_error("no dispatcher installed for interpreted functions")),
        }
    }

    pub(crate) fn ccall(&mut self, func: StackIndex, nresults: i32, inc: u32) -> VmResult<()> {
        self.th_mut().c_calls += inc;
        if self.th().c_call_depth() >= self.limits.max_c_calls {
            self.check_stack(0)?;
            self.check_c_stack()?;
        }
        if let Some(ci) = self.precall(func, nresults)? {
            self.th_mut().frames.get_mut(ci).status = CallStatus::FRESH;
            trace!(target: "coyote::stack", frame = ci, "entering dispatcher");
            self.execute(ci)?;
        }
        self.th_mut().c_calls -= inc;
        Ok(())
    }

    /// Call the function at `func` with the arguments above it. The callee may yield.
    pub fn call_at(&mut self, func: StackIndex, nresults: i32) -> VmResult<()> {
        self.ccall(func, nresults, 1)
    }

    /// Like [`Vm::call_at`], but the callee cannot yield.
    pub fn call_at_noyield(&mut self, func: StackIndex, nresults: i32) -> VmResult<()> {
        self.ccall(func, nresults, NYCI)
    }

    /// Make a frame with open results expose them to the caller.
    pub(crate) fn adjust_results(&mut self, nresults: i32) {
        let th = self.th_mut();
        let top = th.stack.top();
        let frame = th.frames.current_mut();
        if nresults <= MULTRET && frame.top < top {
            frame.top = top;
        }
    }

    /// Call the function below the top `nargs` values.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> VmResult<()> {
        self.call_k(nargs, nresults, None)
    }

    /// Call with a continuation: if the callee yields, the running native
    /// function is finished later by `k` instead of by returning normally.
    pub fn call_k(
        &mut self,
        nargs: usize,
        nresults: i32,
        k: Option<Continuation>,
    ) -> VmResult<()> {
        let func = self.th().stack.top() - (nargs + 1);
        match k {
            Some(k) if self.th().is_yieldable() => {
                self.th_mut().frames.current_mut().set_continuation(Some(k));
                self.call_at(func, nresults)?;
            }
            _ => self.call_at_noyield(func, nresults)?,
        }
        self.adjust_results(nresults);
        Ok(())
    }

    /// Protected call of the function below the top `nargs` values.
    ///
    /// `msgh` is the API index of a message handler, or 0 for none. On error
    /// the single error object replaces the function and its arguments.
    pub fn pcall(&mut self, nargs: usize, nresults: i32, msgh: i32) -> Status {
        self.pcall_k(nargs, nresults, msgh, None)
            .unwrap_or_else(|t| t.status())
    }

    /// Protected call with a continuation.
    ///
    /// With a continuation on a yieldable thread, the call runs unprotected
    /// and errors unwind to the enclosing resume, which recovers by calling
    /// `k` with the error status. Otherwise this is a plain protected call
    /// and never returns `Err`.
    pub fn pcall_k(
        &mut self,
        nargs: usize,
        nresults: i32,
        msgh: i32,
        k: Option<Continuation>,
    ) -> VmResult<Status> {
        let errfunc = if msgh == 0 {
            0
        } else {
            self.index_to_slot(msgh)
        };
        let func = self.th().stack.top() - (nargs + 1);

        let status = match k {
            Some(k) if self.th().is_yieldable() => {
                let th = self.th_mut();
                let allow_hook = th.allow_hook;
                let old_errfunc = th.errfunc;
                let frame = th.frames.current_mut();
                frame.kind = FrameKind::Native {
                    k: Some(k),
                    old_errfunc,
                };
                frame.funcidx = func;
                frame.status.set(CallStatus::ALLOW_HOOK, allow_hook);
                frame.status.insert(CallStatus::YPCALL);
                th.errfunc = errfunc;

                self.call_at(func, nresults)?;

                let th = self.th_mut();
                th.frames.current_mut().status.remove(CallStatus::YPCALL);
                th.errfunc = old_errfunc;
                Status::Ok
            }
            _ => self.protected_call(|vm| vm.call_at_noyield(func, nresults), func, errfunc),
        };
        self.adjust_results(nresults);
        Ok(status)
    }
}
