//! Rename orchestration: preview plans, backed-up application
//!
//! The server proposes a WorkspaceEdit; this module materializes it into
//! per-file plans (original and proposed contents computed up front) and
//! applies them with a backup written before every overwrite. Application is
//! optimistic: a file that changed since its plan was computed halts the
//! apply for that file, already-written files stay written, and the report
//! carries both sides. No rollback.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::resolver;
use crate::error::{BridgeError, BridgeResult};
use crate::infra::lsp::Session;
use crate::infra::lsp::protocol::TextDocumentPositionParams;
use crate::models::lsp::{FileEditPlan, Position, TextEdit, WorkspaceEdit, path_to_uri};
use crate::models::symbol::SymbolTarget;

pub const BACKUP_SUFFIX: &str = ".symbridge.bak";

/// One successfully rewritten file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedEdit {
    pub file: PathBuf,
    pub backup: PathBuf,
    pub edit_count: usize,
}

/// The file that halted a partial apply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameFailure {
    pub file: PathBuf,
    pub reason: String,
}

/// Outcome of an apply, including partial outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameReport {
    pub applied: Vec<AppliedEdit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<RenameFailure>,
}

impl RenameReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }
}

/// Ask the server for the rename edit and materialize it into per-file
/// plans. Touches nothing on disk.
pub async fn preview(
    session: &dyn Session,
    file: &Path,
    target: &SymbolTarget,
    new_name: &str,
) -> BridgeResult<Vec<FileEditPlan>> {
    let candidate = resolver::resolve(session, file, target).await?;
    let uri = path_to_uri(file);
    let content = tokio::fs::read_to_string(file).await?;
    session.sync_document(&uri, &content).await?;

    let mut params = serde_json::to_value(TextDocumentPositionParams::new(
        &uri,
        candidate.query_position,
    ))?;
    params["newName"] = serde_json::json!(new_name);

    let response = session
        .request_value("textDocument/rename", Some(params))
        .await?;
    let edit: WorkspaceEdit = serde_json::from_value(response)
        .map_err(|e| BridgeError::Protocol(format!("Malformed WorkspaceEdit: {}", e)))?;

    if edit.is_empty() {
        return Err(BridgeError::Protocol(format!(
            "{} returned no edits for rename of '{}'",
            session.name(),
            candidate.name
        )));
    }

    let mut plans = Vec::new();
    for (path, edits) in edit.into_file_edits() {
        let original = tokio::fs::read_to_string(&path).await?;
        let proposed = apply_edits(&original, &edits)?;
        let edit_count = edits.len();
        plans.push(FileEditPlan {
            backup: backup_path(&path),
            file: path,
            original,
            proposed,
            edit_count,
        });
    }

    // Deterministic order, also for partial-failure reporting
    plans.sort_by(|a, b| a.file.cmp(&b.file));

    tracing::debug!(
        files = plans.len(),
        new_name,
        "Rename preview materialized"
    );
    Ok(plans)
}

/// Write the plans to disk, backup first on every file. Stops at the first
/// failure and reports what was already written.
pub async fn apply(plans: Vec<FileEditPlan>) -> BridgeResult<RenameReport> {
    let mut applied = Vec::new();

    for plan in plans {
        let current = match tokio::fs::read_to_string(&plan.file).await {
            Ok(c) => c,
            Err(e) => {
                return Ok(RenameReport {
                    applied,
                    failed: Some(RenameFailure {
                        file: plan.file,
                        reason: e.to_string(),
                    }),
                });
            }
        };

        if current != plan.original {
            let err = BridgeError::ConcurrentModification {
                file: plan.file.display().to_string(),
            };
            tracing::warn!(file = %plan.file.display(), "File changed since preview");
            return Ok(RenameReport {
                applied,
                failed: Some(RenameFailure {
                    file: plan.file,
                    reason: err.to_string(),
                }),
            });
        }

        if let Err(e) = write_with_backup(&plan).await {
            return Ok(RenameReport {
                applied,
                failed: Some(RenameFailure {
                    file: plan.file,
                    reason: e.to_string(),
                }),
            });
        }

        applied.push(AppliedEdit {
            file: plan.file,
            backup: plan.backup,
            edit_count: plan.edit_count,
        });
    }

    tracing::info!(files = applied.len(), "Rename applied");
    Ok(RenameReport {
        applied,
        failed: None,
    })
}

async fn write_with_backup(plan: &FileEditPlan) -> std::io::Result<()> {
    tokio::fs::write(&plan.backup, &plan.original).await?;
    tokio::fs::write(&plan.file, &plan.proposed).await?;
    Ok(())
}

fn backup_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Apply edits bottom-up so earlier edits cannot shift later offsets.
/// Positions count UTF-16 code units, LSP's default encoding.
pub(crate) fn apply_edits(content: &str, edits: &[TextEdit]) -> BridgeResult<String> {
    let mut ordered: Vec<&TextEdit> = edits.iter().collect();
    ordered.sort_by(|a, b| b.range.start.cmp(&a.range.start));

    let mut result = content.to_string();
    for edit in ordered {
        let start = byte_offset(&result, edit.range.start)?;
        let end = byte_offset(&result, edit.range.end)?;
        if start > end || end > result.len() {
            return Err(BridgeError::Protocol(format!(
                "Edit range out of bounds at {}:{}",
                edit.range.start.line, edit.range.start.character
            )));
        }
        result.replace_range(start..end, &edit.new_text);
    }
    Ok(result)
}

/// Byte offset of a UTF-16 position, clamping to line end
fn byte_offset(content: &str, position: Position) -> BridgeResult<usize> {
    let mut line_start = 0;
    let mut line_idx = 0;

    while line_idx < position.line {
        match content[line_start..].find('\n') {
            Some(nl) => {
                line_start += nl + 1;
                line_idx += 1;
            }
            None => {
                return Err(BridgeError::Protocol(format!(
                    "Edit references line {} past end of file",
                    position.line
                )));
            }
        }
    }

    let line_end = content[line_start..]
        .find('\n')
        .map(|nl| line_start + nl)
        .unwrap_or(content.len());
    let line = &content[line_start..line_end];

    let mut utf16: u32 = 0;
    for (byte_idx, c) in line.char_indices() {
        if utf16 >= position.character {
            return Ok(line_start + byte_idx);
        }
        utf16 += c.len_utf16() as u32;
    }
    Ok(line_end)
}
