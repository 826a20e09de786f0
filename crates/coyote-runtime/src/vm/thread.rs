//! Per-thread execution state

use super::frame::{CallFrame, FrameChain, FrameKind};
use super::hook::{Hook, HookMask};
use super::recovery::RecoveryPoint;
use super::stack::{StackIndex, ValueStack};
use crate::status::Status;
use coyote_config::VmLimits;
use std::fmt;

/// Handle of a thread owned by a [`Vm`](super::Vm).
///
/// Arena slots are reused after [`Vm::release_thread`](super::Vm::release_thread);
/// the generation tells a stale handle apart from the slot's new owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

impl ThreadId {
    pub(crate) const MAIN: ThreadId = ThreadId {
        index: 0,
        generation: 0,
    };

    pub fn index(self) -> usize {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.generation == 0 {
            write!(f, "#{}", self.index)
        } else {
            write!(f, "#{}.{}", self.index, self.generation)
        }
    }
}

/// Lifecycle of a coroutine as seen from the running thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Body pushed but never resumed
    Initial,
    /// The thread asking
    Running,
    /// Yielded, waiting for a resume
    Suspended,
    /// Active but not running: it resumed another coroutine
    Normal,
    /// Finished or failed
    Dead,
}

impl fmt::Display for CoroutineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoroutineStatus::Initial | CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Increment that marks one non-yieldable host call: one call in the low
/// half, one level of non-yieldability in the high half.
pub(crate) const NYCI: u32 = 0x10000 | 1;

const C_CALLS_MASK: u32 = 0xffff;

pub struct Thread {
    pub(crate) status: Status,
    pub(crate) stack: ValueStack,
    pub(crate) frames: FrameChain,
    pub(crate) recovery: Vec<RecoveryPoint>,
    /// Low 16 bits: nested host calls. High bits: non-yieldable depth.
    pub(crate) c_calls: u32,
    /// Slot of the message handler, 0 for none
    pub(crate) errfunc: StackIndex,
    pub(crate) allow_hook: bool,
    pub(crate) hook: Option<Hook>,
    pub(crate) hook_mask: HookMask,
    pub(crate) base_hook_count: u32,
    pub(crate) hook_count: u32,
    /// Last pc traced by the line hook
    pub(crate) old_pc: usize,
    /// Pending to-be-closed slots, ascending
    pub(crate) tbc: Vec<StackIndex>,
    pub(crate) resumer: Option<ThreadId>,
}

impl Thread {
    /// A thread whose base frame is set up on a fresh stack.
    pub(crate) fn new(limits: &VmLimits) -> Self {
        let mut stack = ValueStack::new(limits.basic_stack_size());
        // slot 0 is the base frame's (absent) function
        stack.push(crate::value::Value::Nil);
        let base = CallFrame::native(0, 1 + limits.min_stack, 0);
        Self {
            status: Status::Ok,
            stack,
            frames: FrameChain::new(base),
            recovery: Vec::new(),
            c_calls: 0,
            errfunc: 0,
            allow_hook: true,
            hook: None,
            hook_mask: HookMask::empty(),
            base_hook_count: 0,
            hook_count: 0,
            old_pc: 0,
            tbc: Vec::new(),
            resumer: None,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn stack(&self) -> &ValueStack {
        &self.stack
    }

    pub fn frames(&self) -> &FrameChain {
        &self.frames
    }

    /// Nested host calls.
    pub(crate) fn c_call_depth(&self) -> u32 {
        self.c_calls & C_CALLS_MASK
    }

    pub(crate) fn is_yieldable(&self) -> bool {
        self.c_calls & !C_CALLS_MASK == 0
    }

    pub(crate) fn inc_nny(&mut self) {
        self.c_calls += 0x10000;
    }

    pub(crate) fn dec_nny(&mut self) {
        self.c_calls -= 0x10000;
    }

    /// Number of values in the current frame, above its function slot.
    pub(crate) fn frame_values(&self) -> usize {
        self.stack.top() - (self.frames.current().func + 1)
    }

    /// Slots actually needed: the highest of `top` and every live frame top.
    pub(crate) fn stack_in_use(&self, min_stack: usize) -> usize {
        let highest = self
            .frames
            .active()
            .iter()
            .map(|f| f.top)
            .fold(self.stack.top(), usize::max);
        (highest + 1).max(min_stack)
    }

    /// After the stack buffer moved: indices stay valid, but dispatchers
    /// caching slot state must reload it.
    pub(crate) fn mark_relocated(&mut self) {
        let limit = self.stack.size() + super::stack::EXTRA_STACK;
        debug_assert!(self.stack.top() <= limit);
        debug_assert!(self.tbc.iter().all(|&slot| slot < limit));
        for frame in self.frames.active_mut() {
            debug_assert!(frame.func < limit && frame.top <= limit);
            if let FrameKind::Interpreted { trap, .. } = &mut frame.kind {
                *trap = true;
            }
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("status", &self.status)
            .field("stack_size", &self.stack.size())
            .field("top", &self.stack.top())
            .field("depth", &self.frames.depth())
            .field("c_calls", &self.c_call_depth())
            .field("yieldable", &self.is_yieldable())
            .finish()
    }
}
