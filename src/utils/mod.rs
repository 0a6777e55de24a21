//! Shared runtime utilities.
//!
//! Stateless helpers used by the bus loops and the binaries.

pub mod bootstrap;
pub mod retry;
pub mod shutdown;
