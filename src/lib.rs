//! syncedit Library
//!
//! Serverless collaborative editing of plain-text documents. Peers on one
//! network find each other by document name, form a tree of TCP links and
//! replicate edits, carets and the peer count along it.

pub mod config;
pub mod document;
pub mod network;

// Re-export commonly used types
pub use config::load_config;
pub use document::{DocumentError, DocumentEvent, ReplicatedDocument, TextBuffer};
pub use network::{NetworkConfig, NetworkError, PeerId};
