//! Kadabra LSP
//!
//! A language server client: it launches servers, keeps one session per
//! server and project, and keeps open documents in sync with them.
//!
//! # Overview
//!
//! This library provides:
//! - Connection providers for stdio and socket servers
//! - A JSON-RPC request layer with per-method timeouts and cancellation
//! - A session state machine with crash detection and restart
//! - Document synchronization with versioning and diagnostics mapping
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  open/edit/close  ┌──────────────────┐
//! │      Host       │──────────────────►│ SessionRegistry  │
//! │  (editor, CLI)  │◄──────────────────│  (per project)   │
//! └─────────────────┘     observers     └────────┬─────────┘
//!                                                │ one per definition
//!                                         ┌──────▼───────┐
//!                                         │ServerWrapper │
//!                                         └──────┬───────┘
//!                                                │ JSON-RPC
//!                                         ┌──────▼───────┐
//!                                         │   Language   │
//!                                         │    Server    │
//!                                         └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`error`] - Error types for the entire crate
//! - [`config`] - Request timeout buckets and their persisted table
//! - [`settings`] - Scoped server settings
//! - [`lsp`] - Connections, sessions and document sync

// Enforce documentation and other quality attributes
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are too strict
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod lsp;
pub mod settings;

// Re-export commonly used types at the crate root
pub use error::{Error, Result};
