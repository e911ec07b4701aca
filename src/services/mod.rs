//! Service layer: the operation surface an upward dispatcher calls into.
//!
//! Structured values in, structured values out. Serialization and output
//! formatting belong to the caller.

pub mod diagnostics;
pub mod rename;
pub mod resolver;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::BridgeConfig;
use crate::error::BridgeResult;
use crate::infra::lsp::{ServerRegistry, Session};
use crate::models::diagnostic::Diagnostic;
use crate::models::lsp::FileEditPlan;
use crate::models::symbol::{Location, SymbolTarget};

pub use rename::{AppliedEdit, RenameFailure, RenameReport};

/// Bridge operation surface
#[async_trait]
pub trait BridgeService: Send + Sync {
    async fn resolve_definition(
        &self,
        file: &Path,
        target: &SymbolTarget,
    ) -> BridgeResult<Vec<Location>>;

    async fn resolve_references(
        &self,
        file: &Path,
        target: &SymbolTarget,
        include_declaration: bool,
    ) -> BridgeResult<Vec<Location>>;

    async fn rename_preview(
        &self,
        file: &Path,
        target: &SymbolTarget,
        new_name: &str,
    ) -> BridgeResult<Vec<FileEditPlan>>;

    async fn rename_apply(
        &self,
        file: &Path,
        target: &SymbolTarget,
        new_name: &str,
    ) -> BridgeResult<RenameReport>;

    async fn get_diagnostics(&self, file: &Path) -> BridgeResult<Vec<Diagnostic>>;

    /// Restart running servers for the given extensions (all when None);
    /// returns descriptions of the instances restarted.
    async fn restart_servers(&self, extensions: Option<&[String]>) -> BridgeResult<Vec<String>>;
}

/// Default implementation backed by the server registry
pub struct Bridge {
    registry: ServerRegistry,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            registry: ServerRegistry::new(config),
        }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    async fn session_for(&self, file: &Path) -> BridgeResult<Arc<dyn Session>> {
        let client = self.registry.resolve(file).await?;
        Ok(client)
    }

    /// Stop every language server; the bridge stays usable and respawns
    /// lazily on the next call.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}

#[async_trait]
impl BridgeService for Bridge {
    async fn resolve_definition(
        &self,
        file: &Path,
        target: &SymbolTarget,
    ) -> BridgeResult<Vec<Location>> {
        let session = self.session_for(file).await?;
        resolver::definition(session.as_ref(), file, target).await
    }

    async fn resolve_references(
        &self,
        file: &Path,
        target: &SymbolTarget,
        include_declaration: bool,
    ) -> BridgeResult<Vec<Location>> {
        let session = self.session_for(file).await?;
        resolver::references(session.as_ref(), file, target, include_declaration).await
    }

    async fn rename_preview(
        &self,
        file: &Path,
        target: &SymbolTarget,
        new_name: &str,
    ) -> BridgeResult<Vec<FileEditPlan>> {
        let session = self.session_for(file).await?;
        rename::preview(session.as_ref(), file, target, new_name).await
    }

    async fn rename_apply(
        &self,
        file: &Path,
        target: &SymbolTarget,
        new_name: &str,
    ) -> BridgeResult<RenameReport> {
        let session = self.session_for(file).await?;
        let plans = rename::preview(session.as_ref(), file, target, new_name).await?;
        rename::apply(plans).await
    }

    async fn get_diagnostics(&self, file: &Path) -> BridgeResult<Vec<Diagnostic>> {
        let session = self.session_for(file).await?;
        diagnostics::collect(session.as_ref(), file).await
    }

    async fn restart_servers(&self, extensions: Option<&[String]>) -> BridgeResult<Vec<String>> {
        self.registry.restart_servers(extensions).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted `Session` for service tests: canned responses per method,
    //! definition responses per position, recorded request log.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::error::{BridgeError, BridgeResult};
    use crate::infra::lsp::Session;
    use crate::infra::lsp::protocol::LspDiagnostic;
    use crate::models::lsp::Position;

    #[derive(Default)]
    pub struct ScriptedSession {
        responses: Mutex<HashMap<String, Value>>,
        definitions: Mutex<HashMap<(u32, u32), Value>>,
        errors: Mutex<HashMap<String, (i32, String)>>,
        published: Mutex<HashMap<String, Vec<LspDiagnostic>>>,
        requests: Mutex<Vec<(String, Option<Value>)>>,
    }

    impl ScriptedSession {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_definition(self, position: Position, response: Value) -> Self {
            self.definitions
                .lock()
                .unwrap()
                .insert((position.line, position.character), response);
            self
        }

        pub fn with_references(self, response: Value) -> Self {
            self.with_response("textDocument/references", response)
        }

        pub fn with_document_symbols(self, response: Value) -> Self {
            self.with_response("textDocument/documentSymbol", response)
        }

        pub fn with_rename(self, response: Value) -> Self {
            self.with_response("textDocument/rename", response)
        }

        pub fn with_response(self, method: &str, response: Value) -> Self {
            self.responses
                .lock()
                .unwrap()
                .insert(method.to_string(), response);
            self
        }

        pub fn with_error(self, method: &str, code: i32, message: &str) -> Self {
            self.errors
                .lock()
                .unwrap()
                .insert(method.to_string(), (code, message.to_string()));
            self
        }

        pub fn with_published(self, uri: &str, diagnostics: Vec<LspDiagnostic>) -> Self {
            self.published
                .lock()
                .unwrap()
                .insert(uri.to_string(), diagnostics);
            self
        }

        pub fn requests(&self) -> Vec<(String, Option<Value>)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Session for ScriptedSession {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn request_value(
            &self,
            method: &str,
            params: Option<Value>,
        ) -> BridgeResult<Value> {
            self.requests
                .lock()
                .unwrap()
                .push((method.to_string(), params.clone()));

            if let Some((code, message)) = self.errors.lock().unwrap().get(method) {
                return Err(BridgeError::ServerError {
                    code: *code,
                    message: message.clone(),
                });
            }

            if method == "textDocument/definition" {
                let position = params
                    .as_ref()
                    .and_then(|p| p.get("position"))
                    .and_then(|p| {
                        Some((
                            p.get("line")?.as_u64()? as u32,
                            p.get("character")?.as_u64()? as u32,
                        ))
                    });
                if let Some(key) = position
                    && let Some(response) = self.definitions.lock().unwrap().get(&key)
                {
                    return Ok(response.clone());
                }
                return Ok(Value::Null);
            }

            Ok(self
                .responses
                .lock()
                .unwrap()
                .get(method)
                .cloned()
                .unwrap_or(Value::Null))
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> BridgeResult<()> {
            Ok(())
        }

        async fn sync_document(&self, _uri: &str, _content: &str) -> BridgeResult<()> {
            Ok(())
        }

        async fn published_diagnostics(&self, uri: &str) -> Vec<LspDiagnostic> {
            self.published
                .lock()
                .unwrap()
                .get(uri)
                .cloned()
                .unwrap_or_default()
        }
    }
}
