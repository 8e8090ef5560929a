//! Command implementations.

pub mod check;
pub mod devices;
pub mod verify;
