//! Shared building blocks for the berth workspace: the cancellable call
//! [`Context`], the error taxonomy and size-string parsing.

mod context;
mod error;
pub mod units;

pub use context::{Cancelled, Context};
pub use error::{CompoundError, ErrorKind};
