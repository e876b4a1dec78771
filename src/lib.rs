//! collabd: coordination server for a collaborative code-editing workspace.
//!
//! Tracks who is present in project and file rooms, arbitrates exclusive
//! per-file edit locks, fans room events out to connected sessions, keeps
//! one sandbox container per project, and bridges terminals into it.
//! Shared state lives in a store every replica can reach.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod events;
pub mod files;
pub mod http_server;
pub mod identity;
pub mod lock;
pub mod metadata;
pub mod presence;
pub mod sandbox;
pub mod session;
pub mod state;
pub mod store;
pub mod terminal;

pub use error::{Error, Result};
