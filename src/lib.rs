//! voxloop - a real-time voice conversation orchestrator
//!
//! This crate provides the core of a voice assistant server:
//! - Conversation handler with per-client/per-group turn locking
//! - Ordered parallel TTS (synthesize concurrently, deliver in order)
//! - Single and group (round-robin) conversation flows
//! - Request/response gate for client playback confirmation
//! - Line-oriented history with naive retrieval

pub mod agent;
pub mod config;
pub mod conversation;
pub mod memory;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod utils;

pub use config::Config;
