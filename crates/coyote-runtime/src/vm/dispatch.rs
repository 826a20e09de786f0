//! Seam to the instruction interpreter
//!
//! The core sets up and tears down frames for interpreted closures, but never
//! decodes instructions itself. A [`Dispatcher`] runs them.

use super::frame::FrameId;
use super::Vm;
use crate::status::VmResult;

/// Runs interpreted frames.
///
/// `execute` is entered with `frame` current and must return once that frame
/// has returned (through [`Vm::poscall`]). Calls it makes to other
/// interpreted closures may be run in the same invocation by re-entering its
/// own loop, as long as control comes back only after `frame` is finished.
///
/// `finish_op` completes the instruction that was interrupted in `frame`
/// when a callee yielded: it moves the callee's results into place so
/// `execute` can continue with the next instruction. It is only called
/// while unwinding a resumed coroutine.
pub trait Dispatcher {
    fn execute(&self, vm: &mut Vm, frame: FrameId) -> VmResult<()>;

    fn finish_op(&self, vm: &mut Vm, frame: FrameId) -> VmResult<()>;
}

impl Vm {
    pub(crate) fn finish_op(&mut self, ci: FrameId) -> VmResult<()> {
        match self.dispatcher.clone() {
            Some(dispatcher) => dispatcher.finish_op(self, ci),
            None => Err(self.run_error("no dispatcher installed for interpreted functions")),
        }
    }
}
