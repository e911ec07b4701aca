//! Language server lifecycle supervisor
//!
//! One supervisor per configured server. Holds the instance state machine
//! (Stopped / Starting / Running / Restarting / Failed), starts processes
//! lazily on first use, observes crashes, and drives scheduled restarts.
//! Callers arriving while a start or restart is underway queue on the gate
//! and proceed against the new instance once its handshake completes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::client::LspClient;
use crate::config::{Limits, ServerConfig};
use crate::error::BridgeResult;

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Failed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

enum Inner {
    Stopped,
    Starting(Arc<Notify>),
    Running(Arc<LspClient>),
    Restarting(Arc<Notify>),
    Failed { message: String },
}

impl Inner {
    fn tag(&self) -> InstanceState {
        match self {
            Self::Stopped => InstanceState::Stopped,
            Self::Starting(_) => InstanceState::Starting,
            Self::Running(_) => InstanceState::Running,
            Self::Restarting(_) => InstanceState::Restarting,
            Self::Failed { .. } => InstanceState::Failed,
        }
    }
}

pub struct Supervisor {
    config: ServerConfig,
    limits: Limits,
    inner: RwLock<Inner>,
    consecutive_failures: AtomicU32,
    restart_timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(config: ServerConfig, limits: Limits) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            config,
            limits,
            inner: RwLock::new(Inner::Stopped),
            consecutive_failures: AtomicU32::new(0),
            restart_timer: std::sync::Mutex::new(None),
        });
        supervisor.spawn_restart_timer();
        supervisor
    }

    pub fn describe(&self) -> String {
        self.config.describe()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn state(&self) -> InstanceState {
        self.inner.read().await.tag()
    }

    /// Starts failed since the last successful handshake
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Currently running client, if any (does not start one)
    pub async fn client(&self) -> Option<Arc<LspClient>> {
        match &*self.inner.read().await {
            Inner::Running(client) if !client.is_terminated() => Some(Arc::clone(client)),
            _ => None,
        }
    }

    /// Get the running client, starting the process first if needed.
    /// Race-safe: exactly one caller performs the start, the rest queue on
    /// the gate and retry once the handshake settles.
    pub async fn ensure_running(self: &Arc<Self>) -> BridgeResult<Arc<LspClient>> {
        loop {
            // Phase 1: snapshot under the read lock, release immediately
            let (client_opt, gate_opt) = {
                let inner = self.inner.read().await;
                match &*inner {
                    Inner::Running(client) => (Some(Arc::clone(client)), None),
                    Inner::Starting(gate) | Inner::Restarting(gate) => {
                        (None, Some(Arc::clone(gate)))
                    }
                    Inner::Stopped | Inner::Failed { .. } => (None, None),
                }
            };

            // Phase 2: liveness check outside the lock
            if let Some(client) = client_opt {
                if !client.is_terminated() {
                    return Ok(client);
                }
                // Crashed instance: fall through and claim the respawn
            }

            // Phase 3: someone else is starting, queue on the gate
            if let Some(gate) = gate_opt {
                let notified = gate.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                // The starter may have settled between the snapshot and
                // enabling the waiter; only sleep if this gate is still live.
                let still_starting = {
                    let inner = self.inner.read().await;
                    match &*inner {
                        Inner::Starting(g) | Inner::Restarting(g) => Arc::ptr_eq(g, &gate),
                        _ => false,
                    }
                };
                if still_starting {
                    notified.await;
                }
                continue;
            }

            // Phase 4: claim the start
            let gate = Arc::new(Notify::new());
            {
                let mut inner = self.inner.write().await;
                match &*inner {
                    Inner::Starting(_) | Inner::Restarting(_) => continue,
                    Inner::Running(client) if !client.is_terminated() => {
                        return Ok(Arc::clone(client));
                    }
                    _ => {}
                }
                *inner = Inner::Starting(Arc::clone(&gate));
            }

            return self.start_instance(gate).await;
        }
    }

    async fn start_instance(
        self: &Arc<Self>,
        gate: Arc<Notify>,
    ) -> BridgeResult<Arc<LspClient>> {
        let result = LspClient::spawn(&self.config, &self.limits).await;

        {
            let mut inner = self.inner.write().await;
            match &result {
                Ok(client) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    *inner = Inner::Running(Arc::clone(client));
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        server = %self.config.command,
                        consecutive_failures = failures,
                        error = %e,
                        "Server start failed"
                    );
                    *inner = Inner::Failed {
                        message: e.to_string(),
                    };
                }
            }
        }
        gate.notify_waiters();

        if let Ok(client) = &result {
            self.watch_for_crash(Arc::clone(client));
        }
        result
    }

    /// Observe process death so the next use respawns instead of erroring
    fn watch_for_crash(self: &Arc<Self>, client: Arc<LspClient>) {
        let weak: Weak<Supervisor> = Arc::downgrade(self);
        tokio::spawn(async move {
            client.wait_terminated().await;
            let Some(supervisor) = weak.upgrade() else {
                return;
            };
            let mut inner = supervisor.inner.write().await;
            // Only react if this exact instance is still current; a graceful
            // restart already replaced the state before shutting it down.
            if let Inner::Running(current) = &*inner
                && Arc::ptr_eq(current, &client)
            {
                tracing::warn!(
                    server = %supervisor.config.command,
                    "Server process terminated unexpectedly"
                );
                *inner = Inner::Stopped;
            }
        });
    }

    /// Gracefully replace a running instance. Returns false when there was
    /// nothing running. In-flight requests against the old instance fail
    /// with ServerDisconnected as its streams close.
    pub async fn restart(self: &Arc<Self>) -> BridgeResult<bool> {
        let (old, gate) = {
            let mut inner = self.inner.write().await;
            match &*inner {
                Inner::Running(client) => {
                    let client = Arc::clone(client);
                    let gate = Arc::new(Notify::new());
                    *inner = Inner::Restarting(Arc::clone(&gate));
                    (client, gate)
                }
                _ => return Ok(false),
            }
        };

        tracing::info!(server = %self.config.command, "Restarting language server");
        let _ = old.shutdown().await;

        self.start_instance(gate).await?;
        Ok(true)
    }

    /// Stop the instance and cancel the restart timer
    pub async fn shutdown(&self) {
        if let Ok(mut timer) = self.restart_timer.lock()
            && let Some(handle) = timer.take()
        {
            handle.abort();
        }

        let previous = {
            let mut inner = self.inner.write().await;
            std::mem::replace(&mut *inner, Inner::Stopped)
        };
        match previous {
            Inner::Running(client) => {
                let _ = client.shutdown().await;
            }
            Inner::Starting(gate) | Inner::Restarting(gate) => {
                // Release queued callers; they will observe Stopped
                gate.notify_waiters();
            }
            _ => {}
        }
    }

    fn spawn_restart_timer(self: &Arc<Self>) {
        let Some(interval) = self.config.restart_interval() else {
            return;
        };
        let weak: Weak<Supervisor> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(supervisor) = weak.upgrade() else {
                    break;
                };
                if supervisor.state().await == InstanceState::Running {
                    tracing::info!(
                        server = %supervisor.config.command,
                        interval_secs = interval.as_secs(),
                        "Scheduled restart"
                    );
                    if let Err(e) = supervisor.restart().await {
                        tracing::warn!(
                            server = %supervisor.config.command,
                            error = %e,
                            "Scheduled restart failed"
                        );
                    }
                }
            }
        });
        if let Ok(mut timer) = self.restart_timer.lock() {
            *timer = Some(handle);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.restart_timer.lock()
            && let Some(handle) = timer.take()
        {
            handle.abort();
        }
    }
}
