//! TTS provider implementations.

pub mod mock;
pub mod voicevox;
