//! Resolved VM limits
//!
//! `VmLimits` is what the runtime consumes. Every field has a concrete value;
//! file and environment layers only ever override the defaults below.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

/// Default maximum number of value-stack slots per thread.
pub const DEFAULT_MAX_STACK: usize = 1_000_000;

/// Default number of slots granted past `max_stack` while an overflow error is handled.
pub const DEFAULT_ERROR_STACK_EXTRA: usize = 200;

/// Default number of free slots guaranteed to every native call.
pub const DEFAULT_MIN_STACK: usize = 20;

/// Default limit on nested host calls.
pub const DEFAULT_MAX_C_CALLS: u32 = 200;

/// Host-call depth lives in the low 16 bits of the thread counter, and the
/// error-handling slack above `max_c_calls` must still fit there.
const C_CALLS_CEILING: u32 = 0xffff / 11 * 10;

/// Concrete limits for one VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmLimits {
    /// Largest regular stack size, in slots.
    pub max_stack: usize,
    /// Overshoot granted above `max_stack` so an overflow can be reported.
    pub error_stack_extra: usize,
    /// Free slots guaranteed to each native call.
    pub min_stack: usize,
    /// Maximum nesting of host calls before "C stack overflow".
    pub max_c_calls: u32,
    /// How many times a failing finalizer pass is retried. `None` retries until one succeeds.
    ///
    /// When the limit is reached, pending to-be-closed variables that have
    /// not run yet are discarded without calling their finalizers, and the
    /// last error is reported. Set a limit only when losing those finalizers
    /// is preferable to running every one of them.
    pub finalizer_retry_limit: Option<u32>,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            max_stack: DEFAULT_MAX_STACK,
            error_stack_extra: DEFAULT_ERROR_STACK_EXTRA,
            min_stack: DEFAULT_MIN_STACK,
            max_c_calls: DEFAULT_MAX_C_CALLS,
            finalizer_retry_limit: None,
        }
    }
}

impl VmLimits {
    /// Size the stack is moved to while a stack overflow is being reported.
    pub fn error_stack_size(&self) -> usize {
        self.max_stack + self.error_stack_extra
    }

    /// Size of a freshly created thread stack.
    pub fn basic_stack_size(&self) -> usize {
        2 * self.min_stack
    }

    /// Check that the limits describe a usable VM.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_stack == 0 {
            return Err(invalid("limits.min_stack", "must be greater than zero"));
        }
        if self.max_stack == 0 {
            return Err(invalid("limits.max_stack", "must be greater than zero"));
        }
        if self.basic_stack_size() > self.max_stack {
            return Err(ConfigError::ValidationError(format!(
                "limits.max_stack ({}) must hold at least twice limits.min_stack ({})",
                self.max_stack, self.min_stack
            )));
        }
        if self.error_stack_extra < self.min_stack {
            return Err(invalid(
                "limits.error_stack_extra",
                &format!("must be at least limits.min_stack ({})", self.min_stack),
            ));
        }
        if self.max_c_calls < 10 {
            return Err(invalid("limits.max_c_calls", "must be at least 10"));
        }
        if self.max_c_calls > C_CALLS_CEILING {
            return Err(invalid(
                "limits.max_c_calls",
                &format!("must not exceed {}", C_CALLS_CEILING),
            ));
        }
        if self.finalizer_retry_limit == Some(0) {
            return Err(invalid(
                "limits.finalizer_retry_limit",
                "must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
