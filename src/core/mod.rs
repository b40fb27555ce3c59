//! Core traits, types, and constants.
//!
//! This module provides the foundational abstractions every other layer
//! builds on: addresses, duplex byte streams, and the shared error types.

mod addr;
mod constants;
mod error;
mod traits;

pub use addr::*;
pub use constants::*;
pub use error::*;
pub use traits::*;
