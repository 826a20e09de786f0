//! To-be-closed variables
//!
//! A slot marked to-be-closed has its `__close` handler called, last marked
//! first, when the stack unwinds past it: on return, on error recovery, or
//! when a thread is reset.

use super::frame::MULTRET;
use super::stack::StackIndex;
use super::Vm;
use crate::status::{Status, VmResult};
use crate::value::Value;

/// `nresults` encoding for a native frame with pending to-be-closed slots.
pub(crate) fn encode_nresults(n: i32) -> i32 {
    -n - 3
}

pub(crate) fn decode_nresults(n: i32) -> i32 {
    -n - 3
}

pub(crate) fn has_to_close(nresults: i32) -> bool {
    nresults < MULTRET
}

impl Vm {
    /// Mark `slot` to be closed. `nil` and `false` are accepted and ignored.
    pub fn new_tbc(&mut self, slot: StackIndex) -> VmResult<()> {
        let value = self.th().stack.get(slot).clone();
        if value.is_falsy() {
            return Ok(());
        }
        if value.close_handler().is_none() {
            return Err(self.run_error(format!(
                "variable got a non-closable value ({})",
                value.type_name()
            )));
        }
        let tbc = &mut self.th_mut().tbc;
        debug_assert!(tbc.last().map_or(true, |&last| last < slot));
        tbc.push(slot);
        Ok(())
    }

    /// Close every pending slot at or above `level`, newest first.
    ///
    /// With `Some(status)` each handler receives that status's error object;
    /// with `None` it receives nil and the stack top is left where it is.
    /// Returns `level`.
    pub(crate) fn close_tbc(
        &mut self,
        level: StackIndex,
        status: Option<Status>,
        yieldable: bool,
    ) -> VmResult<StackIndex> {
        while let Some(&slot) = self.th().tbc.last() {
            if slot < level {
                break;
            }
            self.th_mut().tbc.pop();
            self.call_close_method(slot, status, yieldable)?;
        }
        Ok(level)
    }

    fn call_close_method(
        &mut self,
        slot: StackIndex,
        status: Option<Status>,
        yieldable: bool,
    ) -> VmResult<()> {
        let obj = self.th().stack.get(slot).clone();
        let err = match status {
            None => Value::Nil,
            Some(status) => {
                self.set_error_obj(status, slot + 1);
                self.th().stack.get(slot + 1).clone()
            }
        };
        // a slot overwritten since it was marked has no handler; calling nil
        // reports the usual "attempt to call" error
        let handler = obj.close_handler().unwrap_or(Value::Nil);
        self.check_stack(3)?;
        let th = self.th_mut();
        let func = th.stack.top();
        th.stack.push(handler);
        th.stack.push(obj);
        th.stack.push(err);
        if yieldable {
            self.call_at(func, 0)
        } else {
            self.call_at_noyield(func, 0)
        }
    }

    /// Close the pending slots at or above `level` on a normal exit.
    ///
    /// Dispatchers call this before returning from a frame that marked
    /// slots. Handlers may yield; the return is then redone by `finish_op`.
    pub fn close_pending(&mut self, level: StackIndex) -> VmResult<()> {
        self.close_tbc(level, None, true).map(|_| ())
    }

    /// Mark the value at API index `idx` of the running native frame to be
    /// closed when the frame returns.
    pub fn to_close(&mut self, idx: i32) -> VmResult<()> {
        let slot = self.index_to_slot(idx);
        self.new_tbc(slot)?;
        let frame = self.th_mut().frames.current_mut();
        if !has_to_close(frame.nresults) {
            frame.nresults = encode_nresults(frame.nresults);
        }
        Ok(())
    }

    /// Close the to-be-closed value at API index `idx` now and clear the slot.
    pub fn close_slot(&mut self, idx: i32) -> VmResult<()> {
        let slot = self.index_to_slot(idx);
        self.close_tbc(slot, None, false)?;
        self.th_mut().stack.set(slot, Value::Nil);
        Ok(())
    }
}
