//! Diagnostics gateway
//!
//! Pulls diagnostics via `textDocument/diagnostic` and normalizes them into
//! the shared model. Servers without pull support degrade to whatever they
//! last pushed via `publishDiagnostics`. An empty list is a valid answer,
//! not a failure.

use std::path::Path;

use serde_json::Value;

use crate::error::BridgeResult;
use crate::infra::lsp::Session;
use crate::infra::lsp::protocol::{DocumentDiagnosticReport, LspDiagnostic};
use crate::models::diagnostic::{Diagnostic, DiagnosticSeverity};
use crate::models::lsp::path_to_uri;

pub async fn collect(session: &dyn Session, file: &Path) -> BridgeResult<Vec<Diagnostic>> {
    let content = tokio::fs::read_to_string(file).await?;
    let uri = path_to_uri(file);
    session.sync_document(&uri, &content).await?;

    let params = serde_json::json!({ "textDocument": { "uri": uri } });
    let items = match session
        .request_value("textDocument/diagnostic", Some(params))
        .await
    {
        Ok(response) => match serde_json::from_value::<DocumentDiagnosticReport>(response) {
            Ok(DocumentDiagnosticReport::Full { items, .. }) => items,
            Ok(DocumentDiagnosticReport::Unchanged { .. }) => {
                // We never send previousResultId, so treat this like a
                // server without usable pull support.
                session.published_diagnostics(&uri).await
            }
            Err(e) => {
                tracing::debug!(error = %e, "Unparseable diagnostic report, using pushed cache");
                session.published_diagnostics(&uri).await
            }
        },
        Err(e) if e.method_not_found() => {
            tracing::debug!(server = %session.name(), "No pull diagnostics, using pushed cache");
            session.published_diagnostics(&uri).await
        }
        Err(e) => return Err(e),
    };

    Ok(items
        .into_iter()
        .map(|d| normalize(file, d))
        .collect())
}

fn normalize(file: &Path, diagnostic: LspDiagnostic) -> Diagnostic {
    Diagnostic {
        file: file.to_path_buf(),
        range: diagnostic.range,
        severity: DiagnosticSeverity::from_lsp(diagnostic.severity.map(|s| s as i64)),
        message: diagnostic.message,
        code: diagnostic.code.map(|c| match c {
            Value::String(s) => s,
            other => other.to_string(),
        }),
        source: diagnostic.source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::lsp::protocol::error_codes;
    use crate::services::testing::ScriptedSession;

    fn fixture() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.py");
        std::fs::write(&file, "x = undefined_name\n").unwrap();
        (dir, file)
    }

    fn pushed(message: &str) -> LspDiagnostic {
        serde_json::from_value(serde_json::json!({
            "range": { "start": { "line": 0, "character": 4 },
                       "end": { "line": 0, "character": 18 } },
            "severity": 2,
            "message": message
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_pull_full_report_normalized() {
        let (_dir, file) = fixture();
        let session = ScriptedSession::new().with_response(
            "textDocument/diagnostic",
            serde_json::json!({
                "kind": "full",
                "items": [
                    { "range": { "start": { "line": 0, "character": 4 },
                                 "end": { "line": 0, "character": 18 } },
                      "severity": 1,
                      "code": 2304,
                      "source": "ts",
                      "message": "Cannot find name 'undefined_name'" }
                ]
            }),
        );

        let diags = collect(&session, &file).await.unwrap();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, DiagnosticSeverity::Error);
        assert_eq!(diags[0].code.as_deref(), Some("2304"));
        assert_eq!(diags[0].display_line(), 1);
        assert_eq!(diags[0].file, file);
    }

    #[tokio::test]
    async fn test_empty_report_is_valid() {
        let (_dir, file) = fixture();
        let session = ScriptedSession::new().with_response(
            "textDocument/diagnostic",
            serde_json::json!({ "kind": "full", "items": [] }),
        );
        assert!(collect(&session, &file).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_method_not_found_falls_back_to_pushed() {
        let (_dir, file) = fixture();
        let uri = path_to_uri(&file);
        let session = ScriptedSession::new()
            .with_error(
                "textDocument/diagnostic",
                error_codes::METHOD_NOT_FOUND,
                "unhandled method",
            )
            .with_published(&uri, vec![pushed("unused variable")]);

        let diags = collect(&session, &file).await.unwrap();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, DiagnosticSeverity::Warning);
        assert_eq!(diags[0].message, "unused variable");
    }

    #[tokio::test]
    async fn test_other_server_errors_propagate() {
        let (_dir, file) = fixture();
        let session = ScriptedSession::new().with_error(
            "textDocument/diagnostic",
            error_codes::INTERNAL_ERROR,
            "boom",
        );
        assert!(collect(&session, &file).await.is_err());
    }

    #[tokio::test]
    async fn test_unchanged_report_falls_back_to_pushed() {
        let (_dir, file) = fixture();
        let uri = path_to_uri(&file);
        let session = ScriptedSession::new()
            .with_response(
                "textDocument/diagnostic",
                serde_json::json!({ "kind": "unchanged", "resultId": "r1" }),
            )
            .with_published(&uri, vec![pushed("stale warning")]);

        let diags = collect(&session, &file).await.unwrap();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "stale warning");
    }
}
