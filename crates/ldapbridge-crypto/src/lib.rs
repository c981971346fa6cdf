//! Cryptography utilities for ldapbridge

pub mod hash;

pub use hash::*;
