//! Debug hooks
//!
//! A hook is a host callback fired at call, return, line and count events.
//! While it runs, further hooks are disabled and the thread is non-yieldable;
//! the stack top and frame top it may disturb are restored afterwards.

use super::frame::{CallStatus, FrameId, FrameKind};
use super::Vm;
use crate::status::VmResult;
use crate::value::Value;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Host debug callback.
pub type Hook = Arc<dyn Fn(&mut Vm, &DebugEvent) -> VmResult<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Return,
    Line,
    Count,
    TailCall,
}

/// Which events a hook wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookMask(u8);

impl HookMask {
    pub const CALL: Self = Self(1 << 0);
    pub const RET: Self = Self(1 << 1);
    pub const LINE: Self = Self(1 << 2);
    pub const COUNT: Self = Self(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HookMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What a hook is told about the event that fired it.
#[derive(Clone, PartialEq, Eq)]
pub struct DebugEvent {
    pub event: HookEvent,
    /// Source line for line events, -1 otherwise
    pub line: i32,
    /// Frame the event belongs to
    pub frame: FrameId,
    /// Transferred values `(first, count)`; `first` is relative to the frame's function slot
    pub transfer: Option<(usize, usize)>,
}

impl fmt::Debug for DebugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.event, self.frame)?;
        if self.line >= 0 {
            write!(f, " line {}", self.line)?;
        }
        if let Some((first, n)) = self.transfer {
            write!(f, " transfer {}+{}", first, n)?;
        }
        Ok(())
    }
}

impl Vm {
    /// Install (or with `None`, remove) the hook of the running thread.
    ///
    /// `count` is the instruction interval for [`HookMask::COUNT`].
    pub fn set_hook(&mut self, hook: Option<Hook>, mask: HookMask, count: u32) {
        let th = self.th_mut();
        let (hook, mask) = match hook {
            Some(h) if !mask.is_empty() => (Some(h), mask),
            _ => (None, HookMask::empty()),
        };
        th.hook = hook;
        th.hook_mask = mask;
        th.base_hook_count = count;
        th.hook_count = count;
    }

    pub fn hook_mask(&self) -> HookMask {
        self.th().hook_mask
    }

    /// Fire `event` for the current frame.
    ///
    /// `ftransfer`/`ntransfer` describe values being passed in or out
    /// (arguments on call, results on return); `ntransfer == 0` means none.
    pub fn hook(
        &mut self,
        event: HookEvent,
        line: i32,
        ftransfer: usize,
        ntransfer: usize,
    ) -> VmResult<()> {
        let (hook, ci) = {
            let th = self.th();
            match &th.hook {
                Some(h) if th.allow_hook => (h.clone(), th.frames.current_id()),
                _ => return Ok(()),
            }
        };

        let min_stack = self.limits.min_stack;
        let th = self.th_mut();
        let saved_top = th.stack.top();
        let saved_ci_top = th.frames.get(ci).top;
        let mut mask = CallStatus::HOOKED;
        {
            let frame = th.frames.get_mut(ci);
            if ntransfer != 0 {
                mask.insert(CallStatus::TRAN);
                frame.transfer = (ftransfer, ntransfer);
            }
            // interpreted frames may hold live registers above `top`
            if frame.is_interpreted() && saved_top < frame.top {
                th.stack.set_top(frame.top);
            }
        }
        self.check_stack(min_stack)?;

        let th = self.th_mut();
        let top = th.stack.top();
        let frame = th.frames.get_mut(ci);
        if frame.top < top + min_stack {
            frame.top = top + min_stack;
        }
        frame.status.insert(mask);
        th.allow_hook = false;
        th.inc_nny();

        let ev = DebugEvent {
            event,
            line,
            frame: ci,
            transfer: (ntransfer != 0).then_some((ftransfer, ntransfer)),
        };
        let result = hook(self, &ev);

        let th = self.th_mut();
        th.dec_nny();
        th.allow_hook = true;
        result?;
        let frame = th.frames.get_mut(ci);
        frame.top = saved_ci_top;
        frame.status.remove(mask);
        th.stack.set_top(saved_top);
        Ok(())
    }

    /// Call event for an interpreted frame about to run its first instruction.
    ///
    /// Dispatchers call this on entry when the call mask is set.
    pub fn hook_call(&mut self, ci: FrameId) -> VmResult<()> {
        self.th_mut().old_pc = 0;
        if !self.th().hook_mask.contains(HookMask::CALL) {
            return Ok(());
        }
        let frame = self.th().frames.get(ci);
        let event = if frame.is_tail_call() {
            HookEvent::TailCall
        } else {
            HookEvent::Call
        };
        let nparams = match self.th().stack.get(frame.func) {
            Value::Closure(cl) => cl.proto.num_params,
            _ => 0,
        };
        let pc = frame.saved_pc();
        // report the hook as running at the first instruction
        self.th_mut().frames.get_mut(ci).set_saved_pc(pc.unwrap_or(0) + 1);
        let result = self.hook(event, -1, 1, nparams);
        if let Some(pc) = pc {
            self.th_mut().frames.get_mut(ci).set_saved_pc(pc);
        }
        result
    }

    /// Return event for `ci`, whose `nres` results sit on top of the stack.
    pub(crate) fn ret_hook(&mut self, ci: FrameId, nres: usize) -> VmResult<()> {
        if self.th().hook_mask.contains(HookMask::RET) {
            let th = self.th_mut();
            let first = th.stack.top() - nres;
            let frame = th.frames.get_mut(ci);
            // vararg functions keep their fixed arguments above the extras
            let delta = match (&frame.kind, th.stack.get(frame.func)) {
                (FrameKind::Interpreted { extra_args, .. }, Value::Closure(cl))
                    if cl.proto.is_vararg =>
                {
                    extra_args + cl.proto.num_params + 1
                }
                _ => 0,
            };
            frame.func += delta;
            let ftransfer = first - frame.func;
            let result = self.hook(HookEvent::Return, -1, ftransfer, nres);
            self.th_mut().frames.get_mut(ci).func -= delta;
            result?;
        }
        let th = self.th_mut();
        if ci > 0 {
            if let Some(pc) = th.frames.get(ci - 1).saved_pc() {
                th.old_pc = pc.saturating_sub(1);
            }
        }
        Ok(())
    }
}
