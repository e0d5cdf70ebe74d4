//! Shared worker utilities.

pub mod thread;
