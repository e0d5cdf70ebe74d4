pub mod core;
pub mod keys;
pub mod vision;

pub use core::{from_fn, Chain, FnTransform, Identity, Sequential, Transform};
pub use keys::{ApplyToInput, ApplyToTensorInput};
