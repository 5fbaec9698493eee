//! Core data models for the chat-drive service.
//!
//! `node` holds the canonical file/folder record stored in SQLite. `platform`
//! mirrors the subset of the messaging platform's update payload that the
//! push-ingest endpoint understands.

pub mod node;
pub mod platform;
