//! Memory accounting for stacks and frame pools
//!
//! The core never calls the global allocator behind the embedder's back for
//! growable structures: every resize of a value stack or frame pool is first
//! cleared with an [`Allocator`]. A refusal surfaces as a memory error.

use thiserror::Error;

/// A resize the allocator refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cannot grow block from {old_size} to {new_size} bytes")]
pub struct AllocError {
    pub old_size: usize,
    pub new_size: usize,
}

/// Allocation policy consulted before a block changes size.
pub trait Allocator {
    /// Approve a block changing from `old_size` to `new_size` bytes.
    ///
    /// Shrinking (`new_size <= old_size`) must always succeed.
    fn realloc(&mut self, old_size: usize, new_size: usize) -> Result<(), AllocError>;

    /// Bytes currently accounted, if the allocator tracks them.
    fn in_use(&self) -> Option<usize> {
        None
    }
}

/// Unlimited policy. Real failures still surface through `try_reserve`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn realloc(&mut self, _old_size: usize, _new_size: usize) -> Result<(), AllocError> {
        Ok(())
    }
}

/// Byte-budget policy.
#[derive(Debug, Clone)]
pub struct LimitedAllocator {
    limit: usize,
    in_use: usize,
}

impl LimitedAllocator {
    pub fn new(limit: usize) -> Self {
        Self { limit, in_use: 0 }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Allocator for LimitedAllocator {
    fn realloc(&mut self, old_size: usize, new_size: usize) -> Result<(), AllocError> {
        let base = self.in_use.saturating_sub(old_size);
        if new_size > old_size && base + new_size > self.limit {
            return Err(AllocError { old_size, new_size });
        }
        self.in_use = base + new_size;
        Ok(())
    }

    fn in_use(&self) -> Option<usize> {
        Some(self.in_use)
    }
}
