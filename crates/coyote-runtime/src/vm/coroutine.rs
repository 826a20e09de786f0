//! Coroutines
//!
//! A coroutine is a [`Thread`](super::Thread) driven by [`Vm::resume`].
//! Yielding unwinds the native call stack of the coroutine with
//! `Err(Throw { status: Yield })`, but its frame chain stays intact. The next
//! resume finishes the frame that yielded and then walks the saved chain
//! downward ([`Vm::unroll`]), completing each interrupted frame through its
//! continuation or, for interpreted frames, through the dispatcher.
//!
//! Errors inside a coroutine that pass through a `pcall_k` are recovered the
//! same way: the frame that made the `pcall_k` is found, its saved status
//! records the error, and unrolling resumes from there.

use super::frame::{CallStatus, FrameId, FrameKind, MULTRET};
use super::thread::CoroutineStatus;
use super::{ThreadId, Vm};
use crate::status::{Status, Throw, VmResult};
use crate::value::{Continuation, Value};
use tracing::debug;

impl Vm {
    /// Start or continue coroutine `co` with the top `nargs` values of its
    /// own stack as arguments.
    ///
    /// Returns the status and the number of values left on top of `co`'s
    /// stack: the yielded values for [`Status::Yield`], the body's results
    /// for [`Status::Ok`], or a single error object. A coroutine that fails
    /// is dead afterwards.
    pub fn resume(&mut self, co: ThreadId, nargs: usize) -> (Status, usize) {
        let from = self.current;
        if co == from || co == self.main {
            return self.resume_error(co, "cannot resume non-suspended coroutine", nargs);
        }
        {
            let th = self.thread(co);
            match th.status {
                Status::Ok if th.frames.current_id() != 0 => {
                    return self.resume_error(co, "cannot resume non-suspended coroutine", nargs);
                }
                // nothing but the arguments: no body to run
                Status::Ok if th.frame_values() == nargs => {
                    return self.resume_error(co, "cannot resume dead coroutine", nargs);
                }
                Status::Ok | Status::Yield => {}
                _ => return self.resume_error(co, "cannot resume dead coroutine", nargs),
            }
        }

        let depth = self.thread(from).c_call_depth();
        let max = self.limits.max_c_calls;
        let th = self.thread_mut(co);
        th.c_calls = depth;
        if depth >= max {
            return self.resume_error(co, "C stack overflow", nargs);
        }
        th.c_calls += 1;
        th.resumer = Some(from);
        self.current = co;
        debug!(target: "coyote::coroutine", thread = %co, from = %from, nargs, "resume");

        let status = self.raw_run_protected(|vm| vm.resume_body(nargs));
        let status = self.precover(status);

        let n = if status.is_error() {
            // dead: the error object is the only result
            self.th_mut().status = status;
            let top = self.th().stack.top();
            self.set_error_obj(status, top);
            let th = self.th_mut();
            let top = th.stack.top();
            th.frames.current_mut().top = top;
            1
        } else {
            let th = self.th();
            debug_assert_eq!(status, th.status);
            if status == Status::Yield {
                th.frames.current().nyield
            } else {
                th.frame_values()
            }
        };
        self.current = from;
        debug!(target: "coyote::coroutine", thread = %co, %status, nresults = n, "resume returned");
        (status, n)
    }

    fn resume_error(&mut self, co: ThreadId, msg: &str, nargs: usize) -> (Status, usize) {
        debug!(target: "coyote::coroutine", thread = %co, msg, "resume rejected");
        let th = self.thread_mut(co);
        let top = th.stack.top();
        th.stack.set_top(top - nargs);
        th.stack.push(Value::from(msg));
        (Status::ErrRun, 1)
    }

    fn resume_body(&mut self, nargs: usize) -> VmResult<()> {
        let th = self.th();
        let first_arg = th.stack.top() - nargs;
        if th.status == Status::Ok {
            // starting: the body sits just below the arguments
            return self.ccall(first_arg - 1, MULTRET, 0);
        }

        debug_assert_eq!(th.status, Status::Yield);
        let th = self.th_mut();
        th.status = Status::Ok;
        let ci = th.frames.current_id();
        if th.frames.current().is_interpreted() {
            // yielded at an instruction boundary: arguments are discarded
            th.frames.current_mut().status.remove(CallStatus::HOOKYIELD);
            th.stack.set_top(first_arg);
            self.execute(ci)?;
        } else {
            let k = th.frames.current().continuation();
            let n = match k {
                Some(k) => (k.func)(self, Status::Yield, k.ctx)?,
                None => nargs,
            };
            self.poscall(ci, n)?;
        }
        self.unroll()
    }

    /// Finish every frame of the running coroutine down to its base.
    fn unroll(&mut self) -> VmResult<()> {
        loop {
            let th = self.th();
            let ci = th.frames.current_id();
            if ci == 0 {
                return Ok(());
            }
            if th.frames.current().is_native() {
                self.finish_ccall(ci)?;
            } else {
                self.finish_op(ci)?;
                self.execute(ci)?;
            }
        }
    }

    /// Complete a native frame interrupted by a yield or a recovered error.
    fn finish_ccall(&mut self, ci: FrameId) -> VmResult<()> {
        let frame = self.th().frames.get(ci);
        let n = if frame.status.contains(CallStatus::CLSRET) {
            // interrupted while closing variables on return: redo the return
            frame.nres
        } else {
            let Some(k) = frame.continuation() else {
                return Err(self.run_error("attempt to continue a native call without a continuation"));
            };
            let status = if frame.status.contains(CallStatus::YPCALL) {
                self.finish_pcallk(ci)?
            } else {
                Status::Yield
            };
            self.adjust_results(MULTRET);
            (k.func)(self, status, k.ctx)?
        };
        self.poscall(ci, n)
    }

    /// Complete a `pcall_k` made by frame `ci` that was interrupted.
    ///
    /// Returns `Yield` when it was interrupted by a yield, otherwise the
    /// error status recorded when the error was recovered. In the error case
    /// the pending finalizers of the protected call run first (they may yield
    /// or raise again) and the error object replaces the called function.
    fn finish_pcallk(&mut self, ci: FrameId) -> VmResult<Status> {
        let frame = self.th().frames.get(ci);
        let (mut status, func) = (frame.recover_status, frame.funcidx);
        let allow_hook = frame.status.contains(CallStatus::ALLOW_HOOK);
        if status == Status::Ok {
            status = Status::Yield;
        } else {
            self.th_mut().allow_hook = allow_hook;
            let func = self.close_tbc(func, Some(status), true)?;
            self.set_error_obj(status, func);
            self.shrink_stack();
            self.th_mut().frames.get_mut(ci).recover_status = Status::Ok;
        }
        let th = self.th_mut();
        let frame = th.frames.get_mut(ci);
        frame.status.remove(CallStatus::YPCALL);
        if let FrameKind::Native { old_errfunc, .. } = frame.kind {
            th.errfunc = old_errfunc;
        }
        Ok(status)
    }

    /// Nearest frame with a pending `pcall_k`.
    fn find_pcall(&self) -> Option<FrameId> {
        self.th()
            .frames
            .active()
            .iter()
            .rposition(|f| f.status.contains(CallStatus::YPCALL))
    }

    /// Recover from an error inside a coroutine by continuing at the
    /// nearest `pcall_k`, for as long as there is one to catch it.
    fn precover(&mut self, mut status: Status) -> Status {
        while status.is_error() {
            let Some(ci) = self.find_pcall() else {
                break;
            };
            debug!(target: "coyote::coroutine", frame = ci, %status, "recovering at pcall");
            let th = self.th_mut();
            th.frames.set_current(ci);
            th.frames.get_mut(ci).recover_status = status;
            status = self.raw_run_protected(|vm| vm.unroll());
        }
        status
    }

    /// Suspend the running coroutine, handing the top `nresults` values to
    /// its resumer.
    ///
    /// Always returns the [`Throw`] that performs the unwind (or the error
    /// explaining why yielding is not possible here); the caller must
    /// propagate it. When resumed, the yielding native frame is finished by
    /// `k`, or with the resume arguments as its results when `k` is `None`.
    ///
    /// An interpreted frame yields only at an instruction boundary (its
    /// dispatcher preempting it), and then without values or continuation.
    pub fn yield_k(&mut self, nresults: usize, k: Option<Continuation>) -> Throw {
        if !self.th().is_yieldable() {
            let msg = if self.current != self.main {
                "attempt to yield across a C-call boundary"
            } else {
                "attempt to yield from outside a coroutine"
            };
            return self.run_error(msg);
        }
        if self.th().frames.current().is_interpreted() {
            if nresults != 0 {
                return self.run_error("hooks cannot yield values");
            }
            if k.is_some() {
                return self.run_error("hooks cannot continue after yielding");
            }
        }

        let th = self.th_mut();
        th.status = Status::Yield;
        let frame = th.frames.current_mut();
        frame.nyield = nresults;
        if frame.is_interpreted() {
            frame.status.insert(CallStatus::HOOKYIELD);
        } else {
            frame.set_continuation(k);
        }
        debug!(target: "coyote::coroutine", thread = %self.current, nresults, "yield");
        self.throw(Status::Yield)
    }

    /// [`Vm::yield_k`] without a continuation.
    pub fn coroutine_yield(&mut self, nresults: usize) -> Throw {
        self.yield_k(nresults, None)
    }

    /// Whether the running thread may yield here.
    pub fn is_yieldable(&self) -> bool {
        self.th().is_yieldable()
    }

    /// Status of `co` as seen from the running thread.
    pub fn coroutine_status(&self, co: ThreadId) -> CoroutineStatus {
        if co == self.current {
            return CoroutineStatus::Running;
        }
        let th = self.thread(co);
        match th.status {
            Status::Yield => CoroutineStatus::Suspended,
            Status::Ok if th.frames.current_id() > 0 => CoroutineStatus::Normal,
            Status::Ok if th.frame_values() == 0 => CoroutineStatus::Dead,
            Status::Ok => CoroutineStatus::Initial,
            _ => CoroutineStatus::Dead,
        }
    }

    /// Reset a suspended or dead coroutine: close its pending to-be-closed
    /// variables, drop its frames and leave it empty with status `Ok`.
    ///
    /// Returns the status the coroutine ends with. When that is an error, its
    /// error object is the only value left on the coroutine's stack.
    pub fn close_thread(&mut self, co: ThreadId) -> VmResult<Status> {
        let state = self.coroutine_status(co);
        if matches!(state, CoroutineStatus::Running | CoroutineStatus::Normal) {
            return Err(self.run_error(format!("cannot close a {} coroutine", state)));
        }
        let from = self.current;
        let depth = self.th().c_call_depth();
        let th = self.thread_mut(co);
        th.c_calls = depth;
        let prev = th.status;
        self.current = co;
        let status = self.reset_thread(prev);
        self.current = from;
        debug!(target: "coyote::coroutine", thread = %co, %status, "coroutine closed");
        Ok(status)
    }
}
