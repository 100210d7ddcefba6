//! Core application primitives (coordinator loop)

pub mod scheduler;

pub use scheduler::*;
