//! Name-based symbol resolution
//!
//! Callers rarely hold exact positions, so resolution starts from a lexical
//! token scan of the file, confirms each occurrence through the server's
//! definition provider, and collapses occurrences that resolve to the same
//! definition. Zero survivors is SymbolNotFound; more than one is
//! AmbiguousSymbol with every candidate attached, never an arbitrary pick.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};
use crate::infra::lsp::Session;
use crate::infra::lsp::protocol::{
    DocumentSymbol, LspLocation, SymbolInformation, TextDocumentPositionParams,
};
use crate::models::lsp::{Position, Range, path_to_uri, uri_to_path};
use crate::models::symbol::{Candidate, Location, SymbolKind, SymbolTarget};

/// Caller positions may be 0- or 1-based in the line
pub const LINE_PROBE_OFFSETS: [i64; 2] = [0, -1];
/// Characters may additionally point just past the identifier start
pub const CHAR_PROBE_OFFSETS: [i64; 3] = [0, -1, 1];

/// Resolve a symbol target to the single position queries should run at.
///
/// `Exact` bypasses the scan entirely; `Named` runs the full pipeline.
pub async fn resolve(
    session: &dyn Session,
    file: &Path,
    target: &SymbolTarget,
) -> BridgeResult<Candidate> {
    match target {
        SymbolTarget::Exact(position) => Ok(Candidate {
            name: format!("@{}:{}", position.line + 1, position.character + 1),
            query_position: *position,
            location: Location::point(file.to_path_buf(), *position),
            kind: None,
        }),
        SymbolTarget::Named { name, kind, near } => {
            resolve_named(session, file, name, *kind, *near).await
        }
    }
}

async fn resolve_named(
    session: &dyn Session,
    file: &Path,
    name: &str,
    kind: Option<SymbolKind>,
    near: Option<Position>,
) -> BridgeResult<Candidate> {
    let content = tokio::fs::read_to_string(file).await?;
    let uri = path_to_uri(file);
    session.sync_document(&uri, &content).await?;

    let occurrences = scan_occurrences(&content, name);
    if occurrences.is_empty() {
        return Err(BridgeError::SymbolNotFound {
            name: name.to_string(),
            file: file.display().to_string(),
        });
    }

    let occurrences = narrow_by_probes(occurrences, name.encode_utf16().count() as u32, near);

    // Confirm each occurrence through the definition provider and collapse
    // occurrences landing on the same definition.
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut seen: HashMap<(String, u32, u32), usize> = HashMap::new();

    for position in occurrences {
        let targets = definition_at(session, &uri, position).await?;
        for loc in targets {
            let key = (
                loc.file.display().to_string(),
                loc.range.start.line,
                loc.range.start.character,
            );
            if seen.contains_key(&key) {
                continue;
            }
            seen.insert(key, candidates.len());
            candidates.push(Candidate {
                name: name.to_string(),
                query_position: position,
                location: loc,
                kind: None,
            });
        }
    }

    if candidates.is_empty() {
        return Err(BridgeError::SymbolNotFound {
            name: name.to_string(),
            file: file.display().to_string(),
        });
    }

    attach_kinds(session, &uri, file, &mut candidates).await;

    if let Some(wanted) = kind {
        candidates.retain(|c| c.kind.is_none_or(|k| k == wanted));
        if candidates.is_empty() {
            return Err(BridgeError::SymbolNotFound {
                name: format!("{} ({})", name, wanted),
                file: file.display().to_string(),
            });
        }
    }

    if candidates.len() > 1 {
        tracing::debug!(
            name,
            count = candidates.len(),
            "Symbol is ambiguous, surfacing all candidates"
        );
        return Err(BridgeError::AmbiguousSymbol {
            name: name.to_string(),
            candidates,
        });
    }

    Ok(candidates.remove(0))
}

/// Definition targets for the resolved symbol
pub async fn definition(
    session: &dyn Session,
    file: &Path,
    target: &SymbolTarget,
) -> BridgeResult<Vec<Location>> {
    let candidate = resolve(session, file, target).await?;

    match target {
        SymbolTarget::Named { .. } => {
            // The pipeline already resolved the definition
            Ok(vec![candidate.location])
        }
        SymbolTarget::Exact(_) => {
            let uri = path_to_uri(file);
            let content = tokio::fs::read_to_string(file).await?;
            session.sync_document(&uri, &content).await?;
            let targets = definition_at(session, &uri, candidate.query_position).await?;
            if targets.is_empty() {
                return Err(BridgeError::SymbolNotFound {
                    name: candidate.name,
                    file: file.display().to_string(),
                });
            }
            Ok(targets)
        }
    }
}

/// All references to the resolved symbol
pub async fn references(
    session: &dyn Session,
    file: &Path,
    target: &SymbolTarget,
    include_declaration: bool,
) -> BridgeResult<Vec<Location>> {
    let candidate = resolve(session, file, target).await?;
    let uri = path_to_uri(file);
    let content = tokio::fs::read_to_string(file).await?;
    session.sync_document(&uri, &content).await?;

    let mut params = serde_json::to_value(TextDocumentPositionParams::new(
        &uri,
        candidate.query_position,
    ))?;
    params["context"] = serde_json::json!({ "includeDeclaration": include_declaration });

    let response = session
        .request_value("textDocument/references", Some(params))
        .await?;
    Ok(parse_locations(response))
}

async fn definition_at(
    session: &dyn Session,
    uri: &str,
    position: Position,
) -> BridgeResult<Vec<Location>> {
    let params = serde_json::to_value(TextDocumentPositionParams::new(uri, position))?;
    let response = session
        .request_value("textDocument/definition", Some(params))
        .await?;
    Ok(parse_locations(response))
}

/// Parse a definition/references response: null, Location, Location[] or
/// LocationLink[].
pub(crate) fn parse_locations(value: Value) -> Vec<Location> {
    fn one(item: &Value) -> Option<Location> {
        if let Ok(loc) = serde_json::from_value::<LspLocation>(item.clone()) {
            return Some(Location::new(uri_to_path(&loc.uri), loc.range));
        }
        // LocationLink shape (rust-analyzer definitions)
        let link = serde_json::from_value::<crate::infra::lsp::protocol::LocationLink>(
            item.clone(),
        )
        .ok()?;
        let loc = link.to_location();
        Some(Location::new(uri_to_path(&loc.uri), loc.range))
    }

    match &value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().filter_map(one).collect(),
        item => one(item).into_iter().collect(),
    }
}

/// Every whole-identifier occurrence of `name`, as 0-indexed positions with
/// UTF-16 character offsets (LSP's default encoding).
fn scan_occurrences(content: &str, name: &str) -> Vec<Position> {
    let mut positions = Vec::new();
    if name.is_empty() {
        return positions;
    }

    for (line_idx, line) in content.lines().enumerate() {
        let mut byte = 0;
        let mut utf16: u32 = 0;
        let bytes = line.as_bytes();

        while let Some(found) = line[byte..].find(name) {
            let start = byte + found;
            let end = start + name.len();

            let before_ok = start == 0 || !is_identifier_byte(bytes[start - 1]);
            let after_ok = end >= bytes.len() || !is_identifier_byte(bytes[end]);

            // UTF-16 offset of the match start
            let offset = utf16 + line[byte..start].encode_utf16().count() as u32;

            if before_ok && after_ok {
                positions.push(Position::new(line_idx as u32, offset));
            }

            // Continue the scan one character past the match start
            let step = line[start..]
                .chars()
                .next()
                .map(|c| c.len_utf8())
                .unwrap_or(1);
            utf16 = offset
                + line[start..start + step].encode_utf16().count() as u32;
            byte = start + step;
        }
    }
    positions
}

fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// When the caller supplied an approximate position, prefer occurrences one
/// of the probe positions lands on. Probes only narrow; a miss keeps the
/// full set so a sloppy hint never hides real candidates.
fn narrow_by_probes(
    occurrences: Vec<Position>,
    name_utf16_len: u32,
    near: Option<Position>,
) -> Vec<Position> {
    let Some(near) = near else {
        return occurrences;
    };

    let mut probes = Vec::new();
    for line_off in LINE_PROBE_OFFSETS {
        for char_off in CHAR_PROBE_OFFSETS {
            let line = near.line as i64 + line_off;
            let character = near.character as i64 + char_off;
            if line >= 0 && character >= 0 {
                probes.push(Position::new(line as u32, character as u32));
            }
        }
    }

    let near_matches: Vec<Position> = occurrences
        .iter()
        .copied()
        .filter(|occ| {
            let span = Range::new(
                *occ,
                Position::new(occ.line, occ.character + name_utf16_len),
            );
            probes.iter().any(|p| span.contains(*p))
        })
        .collect();

    if near_matches.is_empty() {
        occurrences
    } else {
        near_matches
    }
}

/// Attach symbol kinds from the server's document symbols. Both response
/// shapes occur in the wild; failure to fetch leaves kinds as None.
async fn attach_kinds(session: &dyn Session, uri: &str, file: &Path, candidates: &mut [Candidate]) {
    let params = serde_json::json!({ "textDocument": { "uri": uri } });
    let response = match session
        .request_value("textDocument/documentSymbol", Some(params))
        .await
    {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "documentSymbol unavailable, kinds omitted");
            return;
        }
    };

    let entries = parse_symbol_entries(response);

    for candidate in candidates.iter_mut() {
        // Prefer a declaration whose selection span covers the definition
        // (same-file case), then fall back to a name match.
        let by_span = entries.iter().find(|(entry_name, _, range)| {
            entry_name == &candidate.name
                && candidate.location.file == file
                && range.contains(candidate.location.range.start)
        });
        let matched = by_span.or_else(|| {
            entries
                .iter()
                .find(|(entry_name, _, _)| entry_name == &candidate.name)
        });
        if let Some((_, kind, _)) = matched {
            candidate.kind = Some(*kind);
        }
    }
}

fn parse_symbol_entries(response: Value) -> Vec<(String, SymbolKind, Range)> {
    fn walk(symbols: &[DocumentSymbol], out: &mut Vec<(String, SymbolKind, Range)>) {
        for sym in symbols {
            out.push((
                sym.name.clone(),
                SymbolKind::from_lsp(sym.kind as u32),
                sym.selection_range.clone(),
            ));
            if let Some(children) = &sym.children {
                walk(children, out);
            }
        }
    }

    let mut entries = Vec::new();
    if let Ok(hierarchical) = serde_json::from_value::<Vec<DocumentSymbol>>(response.clone()) {
        walk(&hierarchical, &mut entries);
    } else if let Ok(flat) = serde_json::from_value::<Vec<SymbolInformation>>(response) {
        for sym in flat {
            entries.push((
                sym.name.clone(),
                SymbolKind::from_lsp(sym.kind as u32),
                sym.location.range.clone(),
            ));
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::ScriptedSession;
    use std::path::PathBuf;

    fn write_fixture(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_scan_whole_identifiers_only() {
        let content = "data = load()\ndatabase = 1\nuse(data, database)\n";
        let hits = scan_occurrences(content, "data");
        assert_eq!(
            hits,
            vec![Position::new(0, 0), Position::new(2, 4)]
        );
    }

    #[test]
    fn test_scan_utf16_offsets() {
        // '値' is one UTF-16 unit but three UTF-8 bytes
        let content = "x = 値 + data\n";
        let hits = scan_occurrences(content, "data");
        assert_eq!(hits, vec![Position::new(0, 8)]);
    }

    #[test]
    fn test_scan_multiple_per_line() {
        let hits = scan_occurrences("x = x + x\n", "x");
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[2], Position::new(0, 8));
    }

    #[test]
    fn test_probe_narrowing_accepts_one_based_lines() {
        let occurrences = vec![Position::new(0, 4), Position::new(9, 4)];
        // Caller thinks in 1-based lines: "line 10" means index 9
        let narrowed = narrow_by_probes(occurrences.clone(), 4, Some(Position::new(10, 4)));
        assert_eq!(narrowed, vec![Position::new(9, 4)]);

        // A hint matching nothing keeps the full set
        let kept = narrow_by_probes(occurrences.clone(), 4, Some(Position::new(50, 0)));
        assert_eq!(kept, occurrences);
    }

    #[test]
    fn test_parse_locations_shapes() {
        let single = serde_json::json!({
            "uri": "file:///a.py",
            "range": { "start": { "line": 1, "character": 0 },
                       "end": { "line": 1, "character": 4 } }
        });
        assert_eq!(parse_locations(single).len(), 1);

        let links = serde_json::json!([{
            "targetUri": "file:///b.py",
            "targetRange": { "start": { "line": 0, "character": 0 },
                             "end": { "line": 3, "character": 0 } },
            "targetSelectionRange": { "start": { "line": 0, "character": 4 },
                                      "end": { "line": 0, "character": 8 } }
        }]);
        let parsed = parse_locations(links);
        assert_eq!(parsed[0].file, PathBuf::from("/b.py"));
        assert_eq!(parsed[0].range.start.character, 4);

        assert!(parse_locations(Value::Null).is_empty());
    }

    #[tokio::test]
    async fn test_single_occurrence_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_fixture(&dir, "app.py", "def process():\n    pass\n");

        let session = ScriptedSession::new().with_definition(
            Position::new(0, 4),
            serde_json::json!([{
                "uri": path_to_uri(&file),
                "range": { "start": { "line": 0, "character": 4 },
                           "end": { "line": 0, "character": 11 } }
            }]),
        );

        let candidate = resolve(&session, &file, &SymbolTarget::named("process"))
            .await
            .unwrap();
        assert_eq!(candidate.query_position, Position::new(0, 4));
        assert_eq!(candidate.location.range.start, Position::new(0, 4));
    }

    #[tokio::test]
    async fn test_missing_symbol_makes_no_lsp_calls() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_fixture(&dir, "app.py", "def process():\n    pass\n");

        let session = ScriptedSession::new();
        let err = resolve(&session, &file, &SymbolTarget::named("nonexistent"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::SymbolNotFound { .. }));
        assert!(session.requests().is_empty());
    }

    #[tokio::test]
    async fn test_distinct_definitions_are_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_fixture(
            &dir,
            "app.py",
            "value = 1\ndef scale(value):\n    return value\n",
        );
        let uri = path_to_uri(&file);

        let module_def = serde_json::json!([{
            "uri": uri,
            "range": { "start": { "line": 0, "character": 0 },
                       "end": { "line": 0, "character": 5 } }
        }]);
        let param_def = serde_json::json!([{
            "uri": uri,
            "range": { "start": { "line": 1, "character": 10 },
                       "end": { "line": 1, "character": 15 } }
        }]);

        let session = ScriptedSession::new()
            .with_definition(Position::new(0, 0), module_def)
            .with_definition(Position::new(1, 10), param_def.clone())
            .with_definition(Position::new(2, 11), param_def);

        let err = resolve(&session, &file, &SymbolTarget::named("value"))
            .await
            .unwrap_err();
        match err {
            BridgeError::AmbiguousSymbol { candidates, .. } => {
                // Three occurrences, two distinct definitions
                assert_eq!(candidates.len(), 2);
                assert_ne!(candidates[0].query_position, candidates[1].query_position);
            }
            other => panic!("expected AmbiguousSymbol, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_same_definition_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_fixture(&dir, "app.py", "total = 0\nprint(total)\n");
        let uri = path_to_uri(&file);

        let def = serde_json::json!([{
            "uri": uri,
            "range": { "start": { "line": 0, "character": 0 },
                       "end": { "line": 0, "character": 5 } }
        }]);

        let session = ScriptedSession::new()
            .with_definition(Position::new(0, 0), def.clone())
            .with_definition(Position::new(1, 6), def);

        let candidate = resolve(&session, &file, &SymbolTarget::named("total"))
            .await
            .unwrap();
        assert_eq!(candidate.location.range.start, Position::new(0, 0));
    }

    #[tokio::test]
    async fn test_kind_filter_disambiguates() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_fixture(
            &dir,
            "app.py",
            "run = True\ndef run():\n    pass\n",
        );
        let uri = path_to_uri(&file);

        let var_def = serde_json::json!([{
            "uri": uri,
            "range": { "start": { "line": 0, "character": 0 },
                       "end": { "line": 0, "character": 3 } }
        }]);
        let fn_def = serde_json::json!([{
            "uri": uri,
            "range": { "start": { "line": 1, "character": 4 },
                       "end": { "line": 1, "character": 7 } }
        }]);

        let symbols = serde_json::json!([
            { "name": "run", "kind": 13,
              "range": { "start": { "line": 0, "character": 0 },
                         "end": { "line": 0, "character": 10 } },
              "selectionRange": { "start": { "line": 0, "character": 0 },
                                  "end": { "line": 0, "character": 3 } } },
            { "name": "run", "kind": 12,
              "range": { "start": { "line": 1, "character": 0 },
                         "end": { "line": 2, "character": 8 } },
              "selectionRange": { "start": { "line": 1, "character": 4 },
                                  "end": { "line": 1, "character": 7 } } }
        ]);

        let session = ScriptedSession::new()
            .with_definition(Position::new(0, 0), var_def)
            .with_definition(Position::new(1, 4), fn_def)
            .with_document_symbols(symbols);

        let candidate = resolve(
            &session,
            &file,
            &SymbolTarget::named_with_kind("run", SymbolKind::Function),
        )
        .await
        .unwrap();
        assert_eq!(candidate.kind, Some(SymbolKind::Function));
        assert_eq!(candidate.location.range.start, Position::new(1, 4));
    }

    #[tokio::test]
    async fn test_exact_target_bypasses_scan() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_fixture(&dir, "app.py", "anything\n");

        let session = ScriptedSession::new();
        let candidate = resolve(
            &session,
            &file,
            &SymbolTarget::Exact(Position::new(4, 7)),
        )
        .await
        .unwrap();
        assert_eq!(candidate.query_position, Position::new(4, 7));
        assert!(session.requests().is_empty());
    }

    #[tokio::test]
    async fn test_references_pass_include_declaration() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_fixture(&dir, "app.py", "def f():\n    pass\n");
        let uri = path_to_uri(&file);

        let session = ScriptedSession::new()
            .with_definition(
                Position::new(0, 4),
                serde_json::json!([{
                    "uri": uri,
                    "range": { "start": { "line": 0, "character": 4 },
                               "end": { "line": 0, "character": 5 } }
                }]),
            )
            .with_references(serde_json::json!([
                { "uri": uri,
                  "range": { "start": { "line": 0, "character": 4 },
                             "end": { "line": 0, "character": 5 } } }
            ]));

        let refs = references(&session, &file, &SymbolTarget::named("f"), true)
            .await
            .unwrap();
        assert_eq!(refs.len(), 1);

        let recorded = session.requests();
        let (_, params) = recorded
            .iter()
            .find(|(m, _)| m == "textDocument/references")
            .unwrap();
        assert_eq!(
            params.as_ref().unwrap()["context"]["includeDeclaration"],
            serde_json::json!(true)
        );
    }
}
