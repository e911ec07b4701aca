//! LSP Common Types
//!
//! Positions, ranges and workspace edits, plus path/URI conversion.
//! Single source of truth; import this module when these types are needed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Position within a document (0-indexed, LSP standard)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }

    /// Convert 1-indexed caller input to 0-indexed LSP position
    pub fn from_one_based(line: u32, column: u32) -> Self {
        Self {
            line: line.saturating_sub(1),
            character: column.saturating_sub(1),
        }
    }

    /// Convert 0-indexed LSP position to 1-indexed display position
    pub fn to_display(&self) -> (u32, u32) {
        (self.line + 1, self.character + 1)
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.line, self.character).cmp(&(other.line, other.character))
    }
}

/// Range within a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Convert a single position to a range
    pub fn point(pos: Position) -> Self {
        Self {
            start: pos,
            end: pos,
        }
    }

    pub fn contains(&self, pos: Position) -> bool {
        pos >= self.start && pos <= self.end
    }
}

/// Text edit unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEdit {
    pub range: Range,
    pub new_text: String,
}

/// Workspace-wide edit as servers return it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceEdit {
    /// URI to TextEdit[] mapping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<HashMap<String, Vec<TextEdit>>>,

    /// DocumentChange[] (TextDocumentEdit, CreateFile, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_changes: Option<serde_json::Value>,
}

impl WorkspaceEdit {
    /// Flatten either representation into per-file edit lists.
    ///
    /// Resource operations (create/rename/delete file) inside documentChanges
    /// are skipped; rename only produces text edits.
    pub fn into_file_edits(self) -> Vec<(PathBuf, Vec<TextEdit>)> {
        if let Some(changes) = self.changes {
            return changes
                .into_iter()
                .map(|(uri, edits)| (uri_to_path(&uri), edits))
                .collect();
        }

        let Some(doc_changes) = self.document_changes else {
            return Vec::new();
        };

        doc_changes
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| {
                        let text_doc = item.get("textDocument")?;
                        let uri = text_doc.get("uri")?.as_str()?;
                        let edits: Vec<TextEdit> =
                            serde_json::from_value(item.get("edits")?.clone()).ok()?;
                        Some((uri_to_path(uri), edits))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        let no_changes = self.changes.as_ref().is_none_or(|c| c.is_empty());
        let no_doc_changes = self
            .document_changes
            .as_ref()
            .and_then(|v| v.as_array())
            .is_none_or(|a| a.is_empty());
        no_changes && no_doc_changes
    }
}

/// One WorkspaceEdit entry materialized into concrete file contents.
///
/// The backup is written before the original is overwritten, on every file
/// touched, even in a multi-file rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEditPlan {
    pub file: PathBuf,
    pub backup: PathBuf,
    pub original: String,
    pub proposed: String,
    pub edit_count: usize,
}

// ============================================================================
// URI Utilities
// ============================================================================

/// Convert file path to RFC 3986 compliant file:// URI
pub fn path_to_uri(path: &Path) -> String {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };

    let path_str = abs_path.to_string_lossy();
    let encoded: String = path_str
        .chars()
        .map(|c| match c {
            '/' | '.' | '-' | '_' | '~' => c.to_string(),
            c if c.is_ascii_alphanumeric() => c.to_string(),
            c => {
                let mut buf = [0u8; 4];
                c.encode_utf8(&mut buf)
                    .bytes()
                    .map(|b| format!("%{:02X}", b))
                    .collect()
            }
        })
        .collect();

    format!("file://{encoded}")
}

/// Convert file:// URI to PathBuf with full percent-decoding
pub fn uri_to_path(uri: &str) -> PathBuf {
    let path = match uri.strip_prefix("file://") {
        Some(p) => p,
        None => {
            tracing::warn!("Invalid file URI (missing file:// prefix): {}", uri);
            return PathBuf::from(uri);
        }
    };

    // Windows: file:///C:/path -> C:/path (strip leading /)
    #[cfg(windows)]
    let path = path.strip_prefix('/').unwrap_or(path);

    PathBuf::from(percent_decode(path))
}

fn percent_decode(input: &str) -> String {
    let mut result = Vec::with_capacity(input.len());
    let mut chars = input.bytes().peekable();

    while let Some(byte) = chars.next() {
        if byte == b'%' {
            let high = chars.next().and_then(hex_value);
            let low = chars.next().and_then(hex_value);
            if let (Some(h), Some(l)) = (high, low) {
                result.push((h << 4) | l);
                continue;
            }
        }
        result.push(byte);
    }

    String::from_utf8_lossy(&result).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}
