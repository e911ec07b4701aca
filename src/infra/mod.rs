//! Infrastructure layer for Symbridge
//!
//! Low-level process, stream and protocol plumbing.

pub mod lsp;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Hash content for document change detection
#[inline]
pub fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}
