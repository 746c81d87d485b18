//! STT provider implementations.

pub mod mock;
