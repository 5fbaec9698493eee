//! Folder tree over chat-hosted file storage.
//!
//! File bytes live as attachments in a messaging-platform chat; this crate
//! keeps the folder hierarchy in SQLite and serves content back over HTTP.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
