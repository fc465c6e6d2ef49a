//! Shared helpers that sit below the kernel.

pub mod canonical_json;
pub mod idempotency;
