//! LSP infrastructure
//!
//! Transport framing, JSON-RPC protocol engine, per-process client,
//! lifecycle supervisor and the extension-keyed server registry.

pub mod client;
pub mod protocol;
pub mod registry;
pub mod supervisor;
pub mod transport;

pub use client::{LspClient, Session};
pub use registry::ServerRegistry;
pub use supervisor::{InstanceState, Supervisor};
