//! Thread status codes and the error propagation token

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Outcome of a protected operation, and the lifecycle status of a thread.
///
/// The numeric codes are part of the host ABI and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    /// Success; for a thread, "running or ready to start".
    Ok = 0,
    /// The thread is suspended in a yield.
    Yield = 1,
    /// Runtime error.
    ErrRun = 2,
    /// Error while loading a chunk.
    ErrSyntax = 3,
    /// Allocation failure.
    ErrMem = 4,
    /// Error while running a message handler or handling a stack error.
    ErrErr = 5,
}

impl Status {
    /// Numeric status code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Convert a numeric status code back to a `Status`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Status::Ok),
            1 => Some(Status::Yield),
            2 => Some(Status::ErrRun),
            3 => Some(Status::ErrSyntax),
            4 => Some(Status::ErrMem),
            5 => Some(Status::ErrErr),
            _ => None,
        }
    }

    /// Every code above `Yield` is an error.
    pub fn is_error(self) -> bool {
        self.code() > Status::Yield.code()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "ok",
            Status::Yield => "yield",
            Status::ErrRun => "runtime error",
            Status::ErrSyntax => "syntax error",
            Status::ErrMem => "memory error",
            Status::ErrErr => "error in error handling",
        };
        f.write_str(name)
    }
}

/// Non-local exit travelling up to the nearest recovery point.
///
/// Carries only the status. The error object itself lives on the value stack
/// of the thread that raised it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unwinding: {status}")]
pub struct Throw {
    status: Status,
}

impl Throw {
    pub(crate) fn new(status: Status) -> Self {
        Self { status }
    }

    /// Status this unwind will report at its recovery point.
    pub fn status(&self) -> Status {
        self.status
    }
}

/// Result of any operation that may unwind.
pub type VmResult<T> = Result<T, Throw>;
