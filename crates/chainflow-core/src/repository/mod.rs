//! Repository trait definitions ("ports") implemented by the
//! infrastructure layer.

pub mod chain;
pub mod memory;
