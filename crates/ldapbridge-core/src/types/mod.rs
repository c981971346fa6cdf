//! Core types for ldapbridge

mod endpoint;
mod outcome;
mod principal;

pub use endpoint::*;
pub use outcome::*;
pub use principal::*;
