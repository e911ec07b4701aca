//! Domain models for Symbridge
//!
//! Shared structured values exchanged with the upward dispatcher.
//! Wire-level LSP types live in `infra::lsp::protocol`.

pub mod diagnostic;
pub mod lsp;
pub mod symbol;
