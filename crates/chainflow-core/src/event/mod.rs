//! Event distribution for chain lifecycle notifications.

pub mod bus;
