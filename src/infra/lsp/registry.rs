//! Extension-keyed server registry
//!
//! Maps a file path to the configured language server covering its extension
//! and hands back a running client, creating the supervisor lazily on first
//! use. Constructed once at startup; no ambient singleton.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;

use super::client::LspClient;
use super::supervisor::Supervisor;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};

pub struct ServerRegistry {
    config: BridgeConfig,
    // Keyed by index into config.servers; created on first resolve
    supervisors: RwLock<HashMap<usize, Arc<Supervisor>>>,
}

impl ServerRegistry {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            supervisors: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Running client for the server covering this file's extension
    pub async fn resolve(&self, path: &Path) -> BridgeResult<Arc<LspClient>> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let index = self
            .config
            .servers
            .iter()
            .position(|s| s.covers_extension(extension))
            .ok_or_else(|| BridgeError::NotConfigured {
                extension: extension.to_string(),
            })?;

        let supervisor = self.supervisor_at(index).await;
        supervisor.ensure_running().await
    }

    async fn supervisor_at(&self, index: usize) -> Arc<Supervisor> {
        {
            let supervisors = self.supervisors.read().await;
            if let Some(supervisor) = supervisors.get(&index) {
                return Arc::clone(supervisor);
            }
        }

        let mut supervisors = self.supervisors.write().await;
        Arc::clone(supervisors.entry(index).or_insert_with(|| {
            Supervisor::new(
                self.config.servers[index].clone(),
                self.config.limits.clone(),
            )
        }))
    }

    /// Restart the running servers covering the given extensions, or every
    /// running server when none are given. Returns descriptions of the
    /// instances actually restarted.
    pub async fn restart_servers(
        &self,
        extensions: Option<&[String]>,
    ) -> BridgeResult<Vec<String>> {
        if let Some(extensions) = extensions {
            for ext in extensions {
                if self.config.server_for_extension(ext).is_none() {
                    return Err(BridgeError::NotConfigured {
                        extension: ext.clone(),
                    });
                }
            }
        }

        let targets: Vec<Arc<Supervisor>> = {
            let supervisors = self.supervisors.read().await;
            supervisors
                .values()
                .filter(|s| match extensions {
                    Some(exts) => exts.iter().any(|e| s.config().covers_extension(e)),
                    None => true,
                })
                .map(Arc::clone)
                .collect()
        };

        let mut restarted = Vec::new();
        for supervisor in targets {
            if supervisor.restart().await? {
                restarted.push(supervisor.describe());
            }
        }

        tracing::info!(count = restarted.len(), "Restarted language servers");
        Ok(restarted)
    }

    /// Stop every instance and cancel restart timers
    pub async fn shutdown_all(&self) {
        let supervisors: Vec<Arc<Supervisor>> = {
            let mut map = self.supervisors.write().await;
            map.drain().map(|(_, s)| s).collect()
        };
        join_all(supervisors.iter().map(|s| s.shutdown())).await;
        tracing::info!("All language servers stopped");
    }

    #[cfg(test)]
    pub(crate) async fn supervisor_count(&self) -> usize {
        self.supervisors.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> BridgeConfig {
        toml::from_str(
            r#"
            [[server]]
            extensions = ["py", "pyi"]
            command = "/no/such/pyls"
            working_dir = "/tmp"

            [[server]]
            extensions = ["rs"]
            command = "/no/such/rls"
            working_dir = "/tmp"
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_unconfigured_extension() {
        let registry = ServerRegistry::new(config());
        let err = registry
            .resolve(&PathBuf::from("/src/main.go"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::NotConfigured { extension } if extension == "go"
        ));
    }

    #[tokio::test]
    async fn test_extensionless_path_is_unconfigured() {
        let registry = ServerRegistry::new(config());
        let err = registry
            .resolve(&PathBuf::from("/src/Makefile"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::NotConfigured { extension } if extension.is_empty()
        ));
    }

    #[tokio::test]
    async fn test_supervisors_created_lazily() {
        let registry = ServerRegistry::new(config());
        assert_eq!(registry.supervisor_count().await, 0);

        // Spawn fails (bogus command) but the supervisor itself is created
        let _ = registry.resolve(&PathBuf::from("/src/a.py")).await;
        assert_eq!(registry.supervisor_count().await, 1);

        let _ = registry.resolve(&PathBuf::from("/src/b.pyi")).await;
        assert_eq!(registry.supervisor_count().await, 1);
    }

    #[tokio::test]
    async fn test_restart_unknown_extension_rejected() {
        let registry = ServerRegistry::new(config());
        let err = registry
            .restart_servers(Some(&["go".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn test_restart_with_nothing_running_is_empty() {
        let registry = ServerRegistry::new(config());
        let restarted = registry.restart_servers(None).await.unwrap();
        assert!(restarted.is_empty());
    }
}
