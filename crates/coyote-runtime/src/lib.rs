//! Coyote Runtime - execution-control core of an embeddable VM
//!
//! This library provides the machinery every call runs on:
//! - A growable, relocatable value stack per thread
//! - Protected execution with recovery points and message handlers
//! - Native and interpreted calls, tail calls and variable result counts
//! - Cooperative coroutines that resume across protected calls and finalizers
//!
//! Instruction decoding, parsing and garbage collection are left to the
//! embedder through the [`Dispatcher`] and [`ChunkLoader`] traits.

/// Coyote runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod alloc;
pub mod status;
pub mod value;
pub mod vm;

// Re-export commonly used types
pub use alloc::{AllocError, Allocator, LimitedAllocator, SystemAllocator};
pub use coyote_config::VmLimits;
pub use status::{Status, Throw, VmResult};
pub use value::{Closure, Continuation, KContext, NativeFn, Object, Proto, Value};
pub use vm::{
    CallStatus, ChunkLoader, CoroutineStatus, DebugEvent, Dispatcher, FrameId, Hook, HookEvent,
    HookMask, StackIndex, ThreadId, Vm, MULTRET,
};
