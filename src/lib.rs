//! Symbridge - LSP bridge for tool-calling agents
//!
//! Exposes symbol navigation and workspace-wide renames over Language Server
//! Protocol servers as structured request/response operations. Callers supply
//! approximate, inconsistently-indexed positions; symbridge resolves the
//! symbol anyway and applies edits with per-file backups.

pub mod config;
pub mod error;
pub mod infra;
pub mod models;
pub mod services;

pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use services::{Bridge, BridgeService};
