//! Access to memory owned by the sender of an ioctl request.
//!
//! Everything behind [`UserMemory`] is untrusted: addresses and lengths come straight from the
//! request and may point at nothing. Backends must never panic on a bad address; they report
//! [`UserMemoryError::Fault`] and leave the destination unspecified.

mod mapped;
mod user;

pub use crate::mapped::MappedUserMemory;
pub use crate::user::{DenseUserMemory, UserMemory, UserMemoryError, UserMemoryResult};
