//! Fabula - desktop client runtime for a locally-hosted story chat backend.

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod launcher;
pub mod resolver;
pub mod stream;
