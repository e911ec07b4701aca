//! Scripted language server for integration tests.
//!
//! Speaks real Content-Length framing over stdio and answers definition,
//! references, rename, documentSymbol and diagnostic requests from a naive
//! per-document symbol table: `def name(params):` opens a function scope,
//! zero-indent `name = ...` is a module variable, and identifiers inside a
//! function body resolve to a parameter of the same name when one exists.
//! Two identifiers are magic: a positional request on `crash_me` makes the
//! process exit without answering, to exercise disconnect handling, and one
//! on `black_hole` is swallowed silently, to park callers in flight.

use std::collections::HashMap;

use serde_json::{Value, json};
use tokio::io::{Stdin, Stdout};

use symbridge::infra::lsp::protocol::{
    Message, Request, RequestId, Response, ResponseError, error_codes,
};
use symbridge::infra::lsp::transport::{Transport, write_request, write_response};

/// Fixed id for the configuration request sent during the handshake
const CONFIG_REQUEST_ID: u64 = 9001;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let mut server = MockServer {
        documents: HashMap::new(),
    };
    let mut transport: Transport<Stdin> = Transport::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    loop {
        let message = match transport.read_message().await {
            Ok(m) => m,
            Err(_) => break,
        };

        match message {
            Message::Request(request) if request.method == "initialize" => {
                if handshake(&mut transport, &mut stdout, &request).await.is_err() {
                    break;
                }
            }
            Message::Request(request) => {
                let Some(response) = server.handle_request(&request) else {
                    continue;
                };
                if write_response(&mut stdout, &response).await.is_err() {
                    break;
                }
            }
            Message::Notification(notification) => {
                if notification.method == "exit" {
                    break;
                }
                server.handle_notification(&notification.method, notification.params);
            }
            Message::Response(_) => {}
        }
    }
}

/// Complete the initialize exchange, but first demand an answer to a
/// `workspace/configuration` request. A client that drops that reply never
/// finishes the handshake.
async fn handshake(
    transport: &mut Transport<Stdin>,
    stdout: &mut Stdout,
    request: &Request,
) -> Result<(), ()> {
    let ask = Request::new(
        CONFIG_REQUEST_ID,
        "workspace/configuration",
        Some(json!({ "items": [{ "section": "mock" }] })),
    );
    write_request(stdout, &ask).await.map_err(|_| ())?;

    loop {
        match transport.read_message().await {
            Ok(Message::Response(response))
                if matches!(response.id, Some(RequestId::Number(CONFIG_REQUEST_ID))) =>
            {
                break;
            }
            Ok(_) => {}
            Err(_) => return Err(()),
        }
    }

    let response = Response::success(request.id.clone(), initialize_result());
    write_response(stdout, &response).await.map_err(|_| ())
}

fn initialize_result() -> Value {
    json!({
        "capabilities": {
            "textDocumentSync": 1,
            "definitionProvider": true,
            "referencesProvider": true,
            "documentSymbolProvider": true,
            "renameProvider": true,
            "diagnosticProvider": { "interFileDependencies": false,
                                    "workspaceDiagnostics": false }
        },
        "serverInfo": { "name": "mock-lsp-server" }
    })
}

struct MockServer {
    documents: HashMap<String, String>,
}

impl MockServer {
    /// None means stay silent: the request is swallowed on purpose
    fn handle_request(&mut self, request: &Request) -> Option<Response> {
        if self.word_in_query(request.params.as_ref()).as_deref() == Some("black_hole") {
            return None;
        }

        let result = match request.method.as_str() {
            "shutdown" => Some(Value::Null),
            "textDocument/definition" => self.definition(request.params.as_ref()),
            "textDocument/references" => self.references(request.params.as_ref()),
            "textDocument/rename" => self.rename(request.params.as_ref()),
            "textDocument/documentSymbol" => self.document_symbols(request.params.as_ref()),
            "textDocument/diagnostic" => self.diagnostics(request.params.as_ref()),
            _ => None,
        };

        Some(match result {
            Some(value) => Response::success(request.id.clone(), value),
            None => Response::failure(
                Some(request.id.clone()),
                ResponseError {
                    code: error_codes::METHOD_NOT_FOUND,
                    message: format!("Method not found: {}", request.method),
                    data: None,
                },
            ),
        })
    }

    fn handle_notification(&mut self, method: &str, params: Option<Value>) {
        let Some(params) = params else { return };
        match method {
            "textDocument/didOpen" => {
                if let (Some(uri), Some(text)) = (
                    params["textDocument"]["uri"].as_str(),
                    params["textDocument"]["text"].as_str(),
                ) {
                    self.documents.insert(uri.to_string(), text.to_string());
                }
            }
            "textDocument/didChange" => {
                if let (Some(uri), Some(text)) = (
                    params["textDocument"]["uri"].as_str(),
                    params["contentChanges"][0]["text"].as_str(),
                ) {
                    self.documents.insert(uri.to_string(), text.to_string());
                }
            }
            _ => {}
        }
    }

    /// Identifier under the cursor of a positional request, if any
    fn word_in_query(&self, params: Option<&Value>) -> Option<String> {
        let params = params?;
        let uri = params["textDocument"]["uri"].as_str()?;
        let text = self.documents.get(uri)?;
        let line = params["position"]["line"].as_u64()? as usize;
        let character = params["position"]["character"].as_u64()? as usize;
        word_at(text.lines().nth(line)?, character)
    }

    fn query(&self, params: Option<&Value>) -> Option<(String, String, Def)> {
        let word = self.word_in_query(params)?;
        if word == "crash_me" {
            // Simulated crash mid-request: exit without a response
            std::process::exit(1);
        }
        let uri = params?["textDocument"]["uri"].as_str()?.to_string();
        let line = params?["position"]["line"].as_u64()? as usize;
        let def = definition_of(self.documents.get(&uri)?, &word, line)?;
        Some((uri, word, def))
    }

    fn definition(&self, params: Option<&Value>) -> Option<Value> {
        let (uri, word, def) = self.query(params)?;
        Some(json!([location(&uri, def.line, def.character, word.len())]))
    }

    fn references(&self, params: Option<&Value>) -> Option<Value> {
        let (uri, word, def) = self.query(params)?;
        let text = self.documents.get(&uri)?;
        let refs: Vec<Value> = occurrences(text, &word)
            .into_iter()
            .filter(|(l, _)| definition_of(text, &word, *l).as_ref() == Some(&def))
            .map(|(l, c)| location(&uri, l, c, word.len()))
            .collect();
        Some(json!(refs))
    }

    fn rename(&self, params: Option<&Value>) -> Option<Value> {
        let new_name = params?["newName"].as_str()?.to_string();
        let (uri, word, def) = self.query(params)?;
        let text = self.documents.get(&uri)?;
        let edits: Vec<Value> = occurrences(text, &word)
            .into_iter()
            .filter(|(l, _)| definition_of(text, &word, *l).as_ref() == Some(&def))
            .map(|(l, c)| {
                json!({
                    "range": range(l, c, word.len()),
                    "newText": new_name
                })
            })
            .collect();
        Some(json!({ "changes": { uri: edits } }))
    }

    fn document_symbols(&self, params: Option<&Value>) -> Option<Value> {
        let uri = params?["textDocument"]["uri"].as_str()?;
        let text = self.documents.get(uri)?;

        let mut symbols = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if let Some(rest) = line.strip_prefix("def ")
                && let Some(paren) = rest.find('(')
            {
                let name = rest[..paren].trim();
                symbols.push(symbol(name, 12, idx, 4));
            } else if !line.starts_with([' ', '\t'])
                && let Some(eq) = line.find('=')
                && let Some(name) = word_at(line, 0)
                && line[..eq].trim() == name
            {
                symbols.push(symbol(&name, 13, idx, 0));
            }
        }
        Some(json!(symbols))
    }

    /// Lines carrying a FIXME comment become warnings
    fn diagnostics(&self, params: Option<&Value>) -> Option<Value> {
        let uri = params?["textDocument"]["uri"].as_str()?;
        let text = self.documents.get(uri)?;

        let items: Vec<Value> = text
            .lines()
            .enumerate()
            .filter_map(|(idx, line)| {
                let col = line.find("# FIXME")?;
                Some(json!({
                    "range": range(idx, col, line.len() - col),
                    "severity": 2,
                    "source": "mock",
                    "message": "fixme comment"
                }))
            })
            .collect();
        Some(json!({ "kind": "full", "items": items }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Def {
    line: usize,
    character: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Identifier covering the given column
fn word_at(line: &str, character: usize) -> Option<String> {
    let chars: Vec<char> = line.chars().collect();
    if character >= chars.len() || !is_word_char(chars[character]) {
        return None;
    }
    let mut start = character;
    while start > 0 && is_word_char(chars[start - 1]) {
        start -= 1;
    }
    let mut end = character;
    while end < chars.len() && is_word_char(chars[end]) {
        end += 1;
    }
    Some(chars[start..end].iter().collect())
}

fn occurrences(text: &str, word: &str) -> Vec<(usize, usize)> {
    let mut hits = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        let mut from = 0;
        while let Some(found) = line[from..].find(word) {
            let start = from + found;
            let end = start + word.len();
            let before_ok =
                start == 0 || !line[..start].chars().last().map(is_word_char).unwrap_or(false);
            let after_ok = !line[end..].chars().next().map(is_word_char).unwrap_or(false);
            if before_ok && after_ok {
                hits.push((line_idx, start));
            }
            from = start + 1;
        }
    }
    hits
}

/// Scoping-lite: inside a function whose parameter list names the word, the
/// parameter wins; otherwise the module-level `def` or assignment does.
fn definition_of(text: &str, word: &str, occ_line: usize) -> Option<Def> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() || occ_line >= lines.len() {
        return None;
    }

    // Enclosing function scope, if any
    let mut def_line = None;
    for idx in (0..=occ_line).rev() {
        let line = lines[idx];
        if line.starts_with("def ") {
            def_line = Some(idx);
            break;
        }
        if idx < occ_line && !line.is_empty() && !line.starts_with([' ', '\t']) {
            break;
        }
    }

    if let Some(d) = def_line {
        let in_scope = d == occ_line
            || lines[d + 1..=occ_line]
                .iter()
                .all(|l| l.is_empty() || l.starts_with([' ', '\t']));
        if in_scope
            && let Some(open) = lines[d].find('(')
            && let Some(close) = lines[d].find(')')
            && lines[d][open + 1..close]
                .split(',')
                .any(|p| p.trim().split(':').next().unwrap_or("").trim() == word)
        {
            let col = open + 1 + lines[d][open + 1..close].find(word)?;
            return Some(Def {
                line: d,
                character: col,
            });
        }
    }

    // Module level: def or assignment
    for (idx, line) in lines.iter().enumerate() {
        if let Some(rest) = line.strip_prefix("def ")
            && let Some(paren) = rest.find('(')
            && rest[..paren].trim() == word
        {
            return Some(Def {
                line: idx,
                character: 4,
            });
        }
        if !line.starts_with([' ', '\t'])
            && let Some(eq) = line.find('=')
            && line[..eq].trim() == word
        {
            return Some(Def {
                line: idx,
                character: 0,
            });
        }
    }
    None
}

fn range(line: usize, character: usize, len: usize) -> Value {
    json!({
        "start": { "line": line, "character": character },
        "end": { "line": line, "character": character + len }
    })
}

fn location(uri: &str, line: usize, character: usize, len: usize) -> Value {
    json!({ "uri": uri, "range": range(line, character, len) })
}

fn symbol(name: &str, kind: u8, line: usize, character: usize) -> Value {
    json!({
        "name": name,
        "kind": kind,
        "range": range(line, 0, 80),
        "selectionRange": range(line, character, name.len())
    })
}
