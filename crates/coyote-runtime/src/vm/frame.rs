//! Call frames and the per-thread frame chain

use super::stack::StackIndex;
use crate::status::Status;
use crate::value::Continuation;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// "As many results as the callee produces."
pub const MULTRET: i32 = -1;

/// Position of a frame in its thread's chain. Index 0 is the base frame.
pub type FrameId = usize;

/// Consecutive fresh allocations tolerated before a pool shrink is skipped.
const MAX_POOL_MISSES: usize = 10;

/// Frame status bits.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStatus(u16);

impl CallStatus {
    /// Hooks were enabled when a `pcall_k` started (restored on recovery)
    pub const ALLOW_HOOK: Self = Self(1 << 0);
    /// Native frame
    pub const NATIVE: Self = Self(1 << 1);
    /// Interpreted frame entered from the host; the dispatcher returns when it finishes
    pub const FRESH: Self = Self(1 << 2);
    /// Running a debug hook
    pub const HOOKED: Self = Self(1 << 3);
    /// Inside a yieldable protected call
    pub const YPCALL: Self = Self(1 << 4);
    /// Entered through a tail call
    pub const TAIL: Self = Self(1 << 5);
    /// Interpreted frame suspended at an instruction boundary
    pub const HOOKYIELD: Self = Self(1 << 6);
    /// Running a finalizer
    pub const FIN: Self = Self(1 << 7);
    /// Transfer info is valid
    pub const TRAN: Self = Self(1 << 8);
    /// Closing to-be-closed variables while returning
    pub const CLSRET: Self = Self(1 << 9);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other)
        } else {
            self.remove(other)
        }
    }
}

impl BitOr for CallStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CallStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CallStatus, &str); 10] = [
            (CallStatus::ALLOW_HOOK, "ALLOW_HOOK"),
            (CallStatus::NATIVE, "NATIVE"),
            (CallStatus::FRESH, "FRESH"),
            (CallStatus::HOOKED, "HOOKED"),
            (CallStatus::YPCALL, "YPCALL"),
            (CallStatus::TAIL, "TAIL"),
            (CallStatus::HOOKYIELD, "HOOKYIELD"),
            (CallStatus::FIN, "FIN"),
            (CallStatus::TRAN, "TRAN"),
            (CallStatus::CLSRET, "CLSRET"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "CallStatus({})", set.join(" | "))
    }
}

/// State that differs between native and interpreted activations.
#[derive(Debug, Clone, Copy)]
pub enum FrameKind {
    Native {
        /// Where to continue after a yield or a recovered error
        k: Option<Continuation>,
        /// Message handler to restore when a `pcall_k` finishes
        old_errfunc: StackIndex,
    },
    Interpreted {
        /// Resumption point, owned by the dispatcher
        saved_pc: usize,
        /// Set when the stack moved; the dispatcher must refresh cached state
        trap: bool,
        /// Extra arguments of a vararg function
        extra_args: usize,
    },
}

/// One activation record.
///
/// `func` is the slot holding the called function; its arguments start at
/// `func + 1`. `top` is the highest slot the activation may use.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub func: StackIndex,
    pub top: StackIndex,
    /// Results the caller wants. `MULTRET`, or encoded with pending
    /// to-be-closed variables when below `MULTRET`.
    pub nresults: i32,
    pub status: CallStatus,
    pub kind: FrameKind,
    /// Error status a recovery left for `finish_pcallk`
    pub(crate) recover_status: Status,
    /// Function slot of an ongoing `pcall_k`
    pub(crate) funcidx: StackIndex,
    /// Values passed to a yield
    pub(crate) nyield: usize,
    /// Results pending while closing variables on return
    pub(crate) nres: usize,
    /// First transferred value and count, valid while `TRAN` is set
    pub(crate) transfer: (usize, usize),
}

impl CallFrame {
    pub(crate) fn native(func: StackIndex, top: StackIndex, nresults: i32) -> Self {
        Self {
            func,
            top,
            nresults,
            status: CallStatus::NATIVE,
            kind: FrameKind::Native {
                k: None,
                old_errfunc: 0,
            },
            recover_status: Status::Ok,
            funcidx: 0,
            nyield: 0,
            nres: 0,
            transfer: (0, 0),
        }
    }

    pub(crate) fn interpreted(func: StackIndex, top: StackIndex, nresults: i32) -> Self {
        Self {
            status: CallStatus::empty(),
            kind: FrameKind::Interpreted {
                saved_pc: 0,
                trap: false,
                extra_args: 0,
            },
            ..Self::native(func, top, nresults)
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, FrameKind::Native { .. })
    }

    pub fn is_interpreted(&self) -> bool {
        !self.is_native()
    }

    pub fn is_tail_call(&self) -> bool {
        self.status.contains(CallStatus::TAIL)
    }

    pub fn is_fresh(&self) -> bool {
        self.status.contains(CallStatus::FRESH)
    }

    /// Continuation registered by `call_k`, `pcall_k` or `yield_k`.
    pub fn continuation(&self) -> Option<Continuation> {
        match self.kind {
            FrameKind::Native { k, .. } => k,
            FrameKind::Interpreted { .. } => None,
        }
    }

    pub(crate) fn set_continuation(&mut self, cont: Option<Continuation>) {
        if let FrameKind::Native { k, .. } = &mut self.kind {
            *k = cont;
        }
    }

    pub fn saved_pc(&self) -> Option<usize> {
        match self.kind {
            FrameKind::Interpreted { saved_pc, .. } => Some(saved_pc),
            FrameKind::Native { .. } => None,
        }
    }

    pub fn set_saved_pc(&mut self, pc: usize) {
        if let FrameKind::Interpreted { saved_pc, .. } = &mut self.kind {
            *saved_pc = pc;
        }
    }

    /// Read and clear the relocation flag.
    pub fn take_trap(&mut self) -> bool {
        match &mut self.kind {
            FrameKind::Interpreted { trap, .. } => std::mem::take(trap),
            FrameKind::Native { .. } => false,
        }
    }

    /// Transfer info `(first, count)` of the running hook event.
    pub fn transfer(&self) -> Option<(usize, usize)> {
        self.status.contains(CallStatus::TRAN).then_some(self.transfer)
    }
}

/// Frames of one thread: `frames[..=ci]` are live, the rest are pooled for reuse.
#[derive(Debug, Clone)]
pub struct FrameChain {
    frames: Vec<CallFrame>,
    ci: FrameId,
    misses: usize,
}

impl FrameChain {
    pub(crate) fn new(base: CallFrame) -> Self {
        Self {
            frames: vec![base],
            ci: 0,
            misses: 0,
        }
    }

    pub fn current_id(&self) -> FrameId {
        self.ci
    }

    pub fn current(&self) -> &CallFrame {
        &self.frames[self.ci]
    }

    pub(crate) fn current_mut(&mut self) -> &mut CallFrame {
        &mut self.frames[self.ci]
    }

    pub fn get(&self, id: FrameId) -> &CallFrame {
        &self.frames[id]
    }

    pub(crate) fn get_mut(&mut self, id: FrameId) -> &mut CallFrame {
        &mut self.frames[id]
    }

    /// Live frames, base first.
    pub fn active(&self) -> &[CallFrame] {
        &self.frames[..=self.ci]
    }

    pub(crate) fn active_mut(&mut self) -> &mut [CallFrame] {
        &mut self.frames[..=self.ci]
    }

    pub fn depth(&self) -> usize {
        self.ci
    }

    /// Frames held, live and pooled.
    pub fn allocated(&self) -> usize {
        self.frames.len()
    }

    /// Whether pushing needs a fresh frame.
    pub(crate) fn needs_allocation(&self) -> bool {
        self.ci + 1 == self.frames.len()
    }

    pub(crate) fn push(&mut self, frame: CallFrame) -> FrameId {
        self.ci += 1;
        if self.ci < self.frames.len() {
            self.frames[self.ci] = frame;
        } else {
            self.misses += 1;
            self.frames.push(frame);
        }
        self.ci
    }

    pub(crate) fn set_current(&mut self, id: FrameId) {
        debug_assert!(id < self.frames.len());
        self.ci = id;
    }

    /// Drop back to the base frame.
    pub(crate) fn reset_to_base(&mut self) {
        self.ci = 0;
    }

    /// Apply the in-use/allocated heuristic to the pool. Returns the new
    /// allocated count when frames were released.
    pub(crate) fn shrink(&mut self) -> Option<usize> {
        if self.misses > MAX_POOL_MISSES {
            // still growing: keep what we have this time round
            self.misses = 0;
            return None;
        }
        self.misses = 0;
        let in_use = self.ci + 1;
        if self.frames.len() > 3 * in_use {
            let keep = 2 * in_use;
            self.frames.truncate(keep);
            self.frames.shrink_to(keep);
            return Some(keep);
        }
        None
    }
}
