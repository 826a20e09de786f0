//! Execution-control core
//!
//! A [`Vm`] owns every thread (the main thread and all coroutines) in an
//! arena addressed by [`ThreadId`]. Each thread has its own value stack,
//! call-frame chain and recovery chain; exactly one thread runs at a time.
//!
//! - [`stack`]: value stack storage and its growth policy
//! - [`frame`]: call frames and the frame pool
//! - [`recovery`]: protected execution and error propagation
//! - [`call`]: native/interpreted calls, tail calls, result adjustment
//! - [`coroutine`]: resume, yield and unwinding across them
//! - [`finalizer`]: to-be-closed variables
//! - [`hook`]: debug hooks
//! - [`dispatch`]: the seam to the instruction interpreter
//! - [`load`]: protected chunk loading

mod call;
pub mod coroutine;
pub mod dispatch;
mod finalizer;
pub mod frame;
pub mod hook;
pub mod load;
mod recovery;
pub mod stack;
pub mod thread;

pub use dispatch::Dispatcher;
pub use frame::{CallFrame, CallStatus, FrameId, FrameKind, MULTRET};
pub use hook::{DebugEvent, Hook, HookEvent, HookMask};
pub use load::{ChunkLoader, BINARY_SIGNATURE};
pub use recovery::PanicFn;
pub use stack::{StackIndex, ValueStack, EXTRA_STACK};
pub use thread::{CoroutineStatus, Thread, ThreadId};

use crate::alloc::{AllocError, Allocator, LimitedAllocator, SystemAllocator};
use crate::status::{Status, VmResult};
use crate::value::Value;
use coyote_config::{Config, VmLimits};
use std::mem::size_of;
use std::sync::Arc;
use tracing::debug;

/// One arena entry. The generation is bumped on every release.
struct ThreadSlot {
    generation: u32,
    thread: Option<Thread>,
}

/// Virtual machine state shared by all threads
pub struct Vm {
    threads: Vec<ThreadSlot>,
    main: ThreadId,
    /// Thread currently running
    current: ThreadId,
    limits: VmLimits,
    allocator: Box<dyn Allocator>,
    /// Preallocated so reporting a memory error never allocates
    mem_err_msg: Value,
    err_err_msg: Value,
    panic: Option<PanicFn>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl Vm {
    /// Create a VM with default limits and no memory budget.
    pub fn new() -> Self {
        Self::with_limits(VmLimits::default())
    }

    /// Create a VM with the given limits and no memory budget.
    pub fn with_limits(limits: VmLimits) -> Self {
        Self::assemble(limits, Box::new(SystemAllocator))
    }

    /// Create a VM whose memory is accounted through `allocator`.
    ///
    /// Fails when the allocator refuses the main thread itself.
    pub fn with_allocator(
        limits: VmLimits,
        mut allocator: Box<dyn Allocator>,
    ) -> Result<Self, AllocError> {
        allocator.realloc(0, Self::thread_footprint(&limits))?;
        Ok(Self::assemble(limits, allocator))
    }

    /// Create a VM from resolved configuration. A configured memory limit
    /// becomes a [`LimitedAllocator`] budget.
    pub fn from_config(config: &Config) -> Result<Self, AllocError> {
        let limits = config.limits();
        let allocator: Box<dyn Allocator> = match config.memory_limit() {
            Some(limit) => Box::new(LimitedAllocator::new(limit)),
            None => Box::new(SystemAllocator),
        };
        Self::with_allocator(limits, allocator)
    }

    fn assemble(limits: VmLimits, allocator: Box<dyn Allocator>) -> Self {
        debug_assert!(limits.validate().is_ok(), "invalid limits: {:?}", limits);
        let mut main = Thread::new(&limits);
        // the main thread is never yieldable
        main.inc_nny();
        debug!(
            target: "coyote::stack",
            max_stack = limits.max_stack,
            max_c_calls = limits.max_c_calls,
            "vm created"
        );
        Self {
            threads: vec![ThreadSlot {
                generation: 0,
                thread: Some(main),
            }],
            main: ThreadId::MAIN,
            current: ThreadId::MAIN,
            limits,
            allocator,
            mem_err_msg: Value::from("not enough memory"),
            err_err_msg: Value::from("error in error handling"),
            panic: None,
            dispatcher: None,
        }
    }

    /// Bytes charged for a new thread: its basic stack and its base frame.
    fn thread_footprint(limits: &VmLimits) -> usize {
        ValueStack::footprint(limits.basic_stack_size()) + size_of::<CallFrame>()
    }

    pub fn limits(&self) -> &VmLimits {
        &self.limits
    }

    /// Install the interpreter that runs [`Value::Closure`] frames.
    pub fn set_dispatcher(&mut self, dispatcher: Arc<dyn Dispatcher>) {
        self.dispatcher = Some(dispatcher);
    }

    pub fn main_thread(&self) -> ThreadId {
        self.main
    }

    pub fn current_thread(&self) -> ThreadId {
        self.current
    }

    /// Read access to any live thread.
    ///
    /// # Panics
    ///
    /// Panics if `id` was released, including when its arena slot now
    /// belongs to a newer thread. Use [`Vm::is_live`] to check first.
    pub fn thread(&self, id: ThreadId) -> &Thread {
        self.get_thread(id).expect("released thread")
    }

    pub(crate) fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        self.get_thread_mut(id).expect("released thread")
    }

    /// The thread behind `id`, unless it was released.
    pub fn get_thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.thread.as_ref())
    }

    fn get_thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.thread.as_mut())
    }

    /// Whether `id` still names a thread of this VM.
    pub fn is_live(&self, id: ThreadId) -> bool {
        self.get_thread(id).is_some()
    }

    /// The running thread.
    pub(crate) fn th(&self) -> &Thread {
        self.thread(self.current)
    }

    pub(crate) fn th_mut(&mut self) -> &mut Thread {
        let id = self.current;
        self.thread_mut(id)
    }

    pub(crate) fn thread_and_allocator(&mut self, id: ThreadId) -> (&mut Thread, &mut dyn Allocator) {
        let th = self
            .threads
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.thread.as_mut())
            .expect("released thread");
        (th, self.allocator.as_mut())
    }

    /// Bytes currently accounted, when the allocator keeps a budget.
    pub fn memory_in_use(&self) -> Option<usize> {
        self.allocator.in_use()
    }

    // ===== Thread management =====

    /// Create a coroutine. It inherits the running thread's hook and
    /// starts with an empty stack; push its body with [`Vm::xmove`].
    pub fn new_thread(&mut self) -> VmResult<ThreadId> {
        let bytes = Self::thread_footprint(&self.limits);
        if self.allocator.realloc(0, bytes).is_err() {
            return Err(self.throw(Status::ErrMem));
        }
        let mut th = Thread::new(&self.limits);
        let parent = self.th();
        th.hook = parent.hook.clone();
        th.hook_mask = parent.hook_mask;
        th.base_hook_count = parent.base_hook_count;
        th.hook_count = parent.base_hook_count;

        let free = self.threads.iter().position(|slot| slot.thread.is_none());
        let id = match free {
            Some(index) => {
                let slot = &mut self.threads[index];
                slot.thread = Some(th);
                ThreadId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.threads.push(ThreadSlot {
                    generation: 0,
                    thread: Some(th),
                });
                ThreadId {
                    index: self.threads.len() - 1,
                    generation: 0,
                }
            }
        };
        debug!(target: "coyote::coroutine", thread = %id, "thread created");
        Ok(id)
    }

    /// Drop a thread that is neither running nor the main thread.
    /// Returns whether it was released.
    pub fn release_thread(&mut self, id: ThreadId) -> bool {
        if id == self.main || id == self.current {
            return false;
        }
        if !self.is_live(id) || self.coroutine_status(id) == CoroutineStatus::Normal {
            return false;
        }
        let slot = &mut self.threads[id.index];
        let Some(th) = slot.thread.take() else {
            return false;
        };
        slot.generation = slot.generation.wrapping_add(1);
        let bytes = ValueStack::footprint(th.stack.size())
            + th.frames.allocated() * size_of::<CallFrame>();
        let _ = self.allocator.realloc(bytes, 0);
        debug!(target: "coyote::coroutine", thread = %id, "thread released");
        true
    }

    /// Move the top `n` values of `from` onto `to`, keeping their order.
    pub fn xmove(&mut self, from: ThreadId, to: ThreadId, n: usize) -> VmResult<()> {
        if from == to || n == 0 {
            return Ok(());
        }
        if !self.thread(to).stack.has_room(n) {
            let th = self.thread(to);
            let needed = th.stack.top() + n + self.limits.min_stack;
            if needed > self.limits.max_stack || self.try_realloc_stack(to, needed).is_err() {
                return Err(self.run_error("stack overflow"));
            }
        }
        let values = {
            let th = self.thread_mut(from);
            let top = th.stack.top();
            let values = th.stack.slice(top - n..top).to_vec();
            th.stack.set_top(top - n);
            values
        };
        let th = self.thread_mut(to);
        for v in values {
            th.stack.push(v);
        }
        Ok(())
    }

    // ===== Stack API (indices relative to the running frame) =====

    /// Translate an API index into a slot: positive counts from the first
    /// argument of the running frame, negative from the top.
    pub fn index_to_slot(&self, idx: i32) -> StackIndex {
        debug_assert!(idx != 0, "index 0 is not a valid stack index");
        let th = self.th();
        if idx > 0 {
            th.frames.current().func + idx as usize
        } else {
            th.stack.top() - idx.unsigned_abs() as usize
        }
    }

    /// Push a value. At least one free slot must have been secured (every
    /// frame starts with `min_stack` of them).
    pub fn push(&mut self, value: impl Into<Value>) {
        self.th_mut().stack.push(value.into());
    }

    /// Push `value` onto another thread's stack.
    pub fn push_on(&mut self, id: ThreadId, value: impl Into<Value>) {
        self.thread_mut(id).stack.push(value.into());
    }

    /// Drop the top `n` values. Pending to-be-closed slots are not closed;
    /// use [`Vm::set_top`] for that.
    pub fn pop(&mut self, n: usize) {
        let stack = &mut self.th_mut().stack;
        stack.set_top(stack.top() - n);
    }

    /// Value at API index `idx`.
    pub fn value_at(&self, idx: i32) -> Value {
        self.th().stack.get(self.index_to_slot(idx)).clone()
    }

    /// Number of values in the running frame.
    pub fn get_top(&self) -> usize {
        self.th().frame_values()
    }

    /// Set the number of values in the running frame: `idx >= 0` is an
    /// absolute count (new slots are nil), `idx < 0` counts from the top.
    /// Removed to-be-closed slots are closed.
    pub fn set_top(&mut self, idx: i32) -> VmResult<()> {
        let th = self.th();
        let func = th.frames.current().func;
        let top = th.stack.top();
        let new_top = if idx >= 0 {
            func + 1 + idx as usize
        } else {
            top + 1 - idx.unsigned_abs() as usize
        };
        if new_top > top {
            let stack = &mut self.th_mut().stack;
            for slot in top..new_top {
                stack.set(slot, Value::Nil);
            }
        } else if finalizer::has_to_close(self.th().frames.current().nresults) {
            self.close_tbc(new_top, None, false)?;
        }
        self.th_mut().stack.set_top(new_top);
        Ok(())
    }

    pub fn stack_size(&self) -> usize {
        self.th().stack.size()
    }

    /// Slot `idx` of the running thread, by absolute position.
    pub fn slot(&self, idx: StackIndex) -> &Value {
        self.th().stack.get(idx)
    }

    pub fn set_slot(&mut self, idx: StackIndex, value: impl Into<Value>) {
        self.th_mut().stack.set(idx, value.into());
    }

    pub fn stack_top(&self) -> StackIndex {
        self.th().stack.top()
    }

    pub fn set_stack_top(&mut self, top: StackIndex) {
        self.th_mut().stack.set_top(top);
    }

    /// Upvalue `i` (0-based) of the running native closure.
    pub fn upvalue(&self, i: usize) -> Option<Value> {
        match self.slot(self.th().frames.current().func) {
            Value::NativeClosure(c) => c.upvalues.get(i).cloned(),
            Value::Closure(c) => c.upvalues.get(i).cloned(),
            _ => None,
        }
    }

    // ===== Frames =====

    pub fn current_frame_id(&self) -> FrameId {
        self.th().frames.current_id()
    }

    pub fn frame(&self, id: FrameId) -> &CallFrame {
        self.th().frames.get(id)
    }

    pub fn frame_mut(&mut self, id: FrameId) -> &mut CallFrame {
        self.th_mut().frames.get_mut(id)
    }

    /// Frame `level` calls below the running one (0 is the running frame).
    pub fn frame_at_level(&self, level: usize) -> Option<FrameId> {
        self.current_frame_id().checked_sub(level)
    }

    /// Number of host calls nested on the running thread.
    pub fn c_call_depth(&self) -> u32 {
        self.th().c_call_depth()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field(
                "threads",
                &self.threads.iter().filter(|slot| slot.thread.is_some()).count(),
            )
            .field("main", &self.main)
            .field("current", &self.current)
            .field("limits", &self.limits)
            .field("dispatcher", &self.dispatcher.is_some())
            .finish_non_exhaustive()
    }
}
