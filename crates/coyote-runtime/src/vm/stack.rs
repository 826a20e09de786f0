//! Value stack storage
//!
//! A thread's stack is one contiguous buffer of `size + EXTRA_STACK` slots.
//! Everything that points into it (frame bases and tops, the stack top, the
//! to-be-closed list, the message handler slot) is a [`StackIndex`], so moving
//! the buffer never invalidates a reference.
//!
//! ```text
//!  0        func      func+1 ...          top           size    size+EXTRA
//! [base fn][callee ][arg ][arg ][local ]  [free ...    ][extra slack]
//! ```
//!
//! Growth policy and overflow handling live on [`Vm`](super::Vm) because they
//! need the frame chain and the error machinery; this type only owns the slots.

use super::frame::CallFrame;
use super::{ThreadId, Vm};
use crate::alloc::{AllocError, Allocator};
use crate::status::{Status, VmResult};
use crate::value::Value;
use std::mem::size_of;
use std::ops::Range;
use tracing::{debug, trace, warn};

/// Slot position relative to the stack base.
pub type StackIndex = usize;

/// Slots kept past the usable limit so error objects and metamethod
/// arguments can always be pushed without a capacity check.
pub const EXTRA_STACK: usize = 5;

#[derive(Debug, Clone)]
pub struct ValueStack {
    slots: Vec<Value>,
    top: StackIndex,
    /// Usable slots; `slots.len() == size + EXTRA_STACK`.
    size: usize,
}

impl ValueStack {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            slots: vec![Value::Nil; size + EXTRA_STACK],
            top: 0,
            size,
        }
    }

    /// Bytes an allocator is charged for a stack of `size` usable slots.
    pub(crate) fn footprint(size: usize) -> usize {
        (size + EXTRA_STACK) * size_of::<Value>()
    }

    /// Usable slots (the stack limit).
    pub fn size(&self) -> usize {
        self.size
    }

    /// First free slot.
    pub fn top(&self) -> StackIndex {
        self.top
    }

    pub(crate) fn set_top(&mut self, top: StackIndex) {
        debug_assert!(top <= self.slots.len(), "stack top {} out of buffer", top);
        self.top = top;
    }

    /// True when more than `n` usable slots are free above `top`.
    pub fn has_room(&self, n: usize) -> bool {
        self.top + n < self.size
    }

    pub fn get(&self, idx: StackIndex) -> &Value {
        &self.slots[idx]
    }

    pub(crate) fn set(&mut self, idx: StackIndex, value: Value) {
        self.slots[idx] = value;
    }

    pub(crate) fn copy(&mut self, from: StackIndex, to: StackIndex) {
        if from != to {
            let v = self.slots[from].clone();
            self.slots[to] = v;
        }
    }

    /// Push onto the reserved area. Callers must have checked capacity;
    /// running into the end of the buffer is a bug, not a runtime error.
    pub(crate) fn push(&mut self, value: Value) {
        assert!(
            self.top < self.slots.len(),
            "value stack exhausted: push without check_stack"
        );
        self.slots[self.top] = value;
        self.top += 1;
    }

    /// Shift `[from, top)` up by one slot, leaving `from` free.
    pub(crate) fn open_slot(&mut self, from: StackIndex) {
        debug_assert!(self.top < self.slots.len());
        self.slots[from..=self.top].rotate_right(1);
        self.top += 1;
    }

    pub fn slice(&self, range: Range<StackIndex>) -> &[Value] {
        &self.slots[range]
    }

    /// Resize the usable area to `new_size`, clearing the change with `alloc`.
    ///
    /// On failure the stack is left exactly as it was.
    pub(crate) fn resize(
        &mut self,
        new_size: usize,
        alloc: &mut dyn Allocator,
    ) -> Result<(), AllocError> {
        let old_len = self.slots.len();
        let new_len = new_size + EXTRA_STACK;
        debug_assert!(self.top <= new_len);

        alloc.realloc(Self::footprint(self.size), Self::footprint(new_size))?;

        if new_len > old_len {
            if self.slots.try_reserve_exact(new_len - old_len).is_err() {
                // give the accounting back
                let _ = alloc.realloc(Self::footprint(new_size), Self::footprint(self.size));
                return Err(AllocError {
                    old_size: Self::footprint(self.size),
                    new_size: Self::footprint(new_size),
                });
            }
            self.slots.resize(new_len, Value::Nil);
        } else {
            self.slots.truncate(new_len);
            self.slots.shrink_to(new_len);
        }
        self.size = new_size;
        Ok(())
    }
}

impl Vm {
    /// Resize the stack of `id` without raising.
    pub(crate) fn try_realloc_stack(
        &mut self,
        id: ThreadId,
        new_size: usize,
    ) -> Result<(), AllocError> {
        let (th, alloc) = self.thread_and_allocator(id);
        let old_size = th.stack.size();
        th.stack.resize(new_size, alloc)?;
        th.mark_relocated();
        trace!(target: "coyote::stack", thread = %id, old_size, new_size, "stack reallocated");
        Ok(())
    }

    fn realloc_stack(&mut self, new_size: usize, raise: bool) -> VmResult<bool> {
        let id = self.current;
        match self.try_realloc_stack(id, new_size) {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(target: "coyote::stack", error = %e, "stack reallocation refused");
                if raise {
                    Err(self.throw(Status::ErrMem))
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Grow the running thread's stack so `n` more slots fit above `top`.
    ///
    /// Past the configured maximum the stack is moved to the overflow size
    /// and "stack overflow" is raised; growing again while in that state is
    /// an error in error handling. With `raise == false` failures return
    /// `Ok(false)` instead.
    pub(crate) fn grow_stack(&mut self, n: usize, raise: bool) -> VmResult<bool> {
        let max = self.limits.max_stack;
        let th = self.th();
        let size = th.stack.size();
        if size > max {
            debug_assert_eq!(size, self.limits.error_stack_size());
            if raise {
                return Err(self.throw(Status::ErrErr));
            }
            return Ok(false);
        }
        if n < max {
            let needed = th.stack.top() + n;
            let new_size = (2 * size).min(max).max(needed);
            if new_size <= max {
                return self.realloc_stack(new_size, raise);
            }
        }
        warn!(target: "coyote::stack", size, requested = n, "stack overflow");
        self.realloc_stack(self.limits.error_stack_size(), raise)?;
        if raise {
            return Err(self.run_error("stack overflow"));
        }
        Ok(false)
    }

    /// Make sure more than `n` slots are free above the top, growing if needed.
    pub fn check_stack(&mut self, n: usize) -> VmResult<()> {
        if !self.th().stack.has_room(n) {
            self.grow_stack(n, true)?;
        }
        Ok(())
    }

    /// Non-raising [`Vm::check_stack`] that also extends the current frame
    /// to cover the reserved slots. Returns whether the space is available.
    pub fn reserve_stack(&mut self, n: usize) -> bool {
        let ok = self.th().stack.has_room(n) || self.grow_stack(n, false).unwrap_or(false);
        if ok {
            let th = self.th_mut();
            let wanted = th.stack.top() + n;
            let frame = th.frames.current_mut();
            if frame.top < wanted {
                frame.top = wanted;
            }
        }
        ok
    }

    /// Claim one more slot at the top.
    pub fn inc_top(&mut self) -> VmResult<()> {
        self.check_stack(1)?;
        let stack = &mut self.th_mut().stack;
        stack.set_top(stack.top() + 1);
        Ok(())
    }

    /// Give back stack and frame-pool space the running thread no longer uses.
    ///
    /// Never raises. A stack in overflow state returns to a regular size once
    /// its live contents fit.
    pub fn shrink_stack(&mut self) {
        let id = self.current;
        let max = self.limits.max_stack;
        let th = self.th();
        let in_use = th.stack_in_use(self.limits.min_stack);
        let size = th.stack.size();
        let good_size = if in_use > max / 3 { max } else { in_use * 3 };
        if in_use <= max && size > good_size {
            let new_size = if in_use > max / 2 { max } else { in_use * 2 };
            if self.try_realloc_stack(id, new_size).is_ok() {
                debug!(target: "coyote::stack", thread = %id, size, new_size, "stack shrunk");
            }
        }
        self.shrink_frames();
    }

    fn shrink_frames(&mut self) {
        let id = self.current;
        let (th, alloc) = self.thread_and_allocator(id);
        let before = th.frames.allocated();
        if let Some(after) = th.frames.shrink() {
            let unit = size_of::<CallFrame>();
            // shrinking is always granted
            let _ = alloc.realloc(before * unit, after * unit);
        }
    }
}
