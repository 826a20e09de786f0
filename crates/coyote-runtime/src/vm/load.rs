//! Protected chunk loading
//!
//! Turning source text or a precompiled chunk into a closure is done by a
//! [`ChunkLoader`]. The core only checks the requested mode and runs the
//! loader under a protected, non-yieldable call.

use super::Vm;
use crate::status::{Status, Throw, VmResult};
use crate::value::Value;
use tracing::debug;

/// Leading bytes of a precompiled chunk. Only the first byte is inspected
/// to tell binary from text.
pub const BINARY_SIGNATURE: &[u8] = b"\x1bLua";

/// Parser / undumper
pub trait ChunkLoader {
    /// Build a function from `chunk`. `binary` tells which kind it is.
    ///
    /// Malformed input should be reported with [`Vm::syntax_error`].
    fn load(&self, vm: &mut Vm, chunk: &[u8], name: &str, binary: bool) -> VmResult<Value>;
}

impl Vm {
    /// Load `chunk` and push the resulting function.
    ///
    /// `mode` limits what is accepted: `"b"` binary only, `"t"` text only,
    /// `"bt"` or `None` both. On failure the error object is pushed instead
    /// and the status returned; syntax problems and mode mismatches report
    /// [`Status::ErrSyntax`].
    pub fn protected_load(
        &mut self,
        loader: &dyn ChunkLoader,
        chunk: &[u8],
        name: &str,
        mode: Option<&str>,
    ) -> Status {
        self.th_mut().inc_nny();
        let th = self.th();
        let (old_top, errfunc) = (th.stack.top(), th.errfunc);
        let status = self.protected_call(
            |vm| {
                let binary = chunk.first() == BINARY_SIGNATURE.first();
                let kind = if binary { "binary" } else { "text" };
                if let Some(mode) = mode {
                    if !mode.contains(&kind[..1]) {
                        return Err(vm.syntax_error(format!(
                            "attempt to load a {} chunk (mode is '{}')",
                            kind, mode
                        )));
                    }
                }
                let function = loader.load(vm, chunk, name, binary)?;
                vm.check_stack(1)?;
                vm.push(function);
                Ok(())
            },
            old_top,
            errfunc,
        );
        self.th_mut().dec_nny();
        debug!(target: "coyote::recovery", chunk = name, %status, "chunk loaded");
        status
    }

    /// Raise a syntax error with `msg`.
    pub fn syntax_error(&mut self, msg: impl Into<String>) -> Throw {
        self.th_mut().stack.push(Value::from(msg.into()));
        self.throw(Status::ErrSyntax)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Proto;
    use pretty_assertions::assert_eq;

    struct EchoLoader;

    impl ChunkLoader for EchoLoader {
        fn load(&self, vm: &mut Vm, chunk: &[u8], name: &str, _binary: bool) -> VmResult<Value> {
            if chunk.is_empty() {
                return Err(vm.syntax_error(format!("{}: unexpected end of chunk", name)));
            }
            Ok(Value::closure(Proto::new(name)))
        }
    }

    #[test]
    fn test_load_pushes_function() {
        let mut vm = Vm::new();
        let status = vm.protected_load(&EchoLoader, b"return 1", "=chunk", None);
        assert_eq!(status, Status::Ok);
        assert_eq!(vm.get_top(), 1);
        assert_eq!(vm.value_at(-1).type_name(), "function");
    }

    #[test]
    fn test_mode_mismatch_is_syntax_error() {
        let mut vm = Vm::new();
        let status = vm.protected_load(&EchoLoader, b"\x1bLua\x54", "=bin", Some("t"));
        assert_eq!(status, Status::ErrSyntax);
        assert_eq!(
            vm.value_at(-1),
            Value::from("attempt to load a binary chunk (mode is 't')")
        );
    }

    #[test]
    fn test_loader_error_restores_state() {
        let mut vm = Vm::new();
        let before = vm.c_call_depth();
        let status = vm.protected_load(&EchoLoader, b"", "=empty", Some("bt"));
        assert_eq!(status, Status::ErrSyntax);
        assert_eq!(vm.get_top(), 1);
        assert_eq!(vm.value_at(-1), Value::from("=empty: unexpected end of chunk"));
        assert_eq!(vm.c_call_depth(), before);
    }
}
